#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergodesk
//!
//! A Rust library for controlling ErgoMate Classic standing desks via Bluetooth
//! Low Energy.
//!
//! The desk speaks a tiny binary protocol over a vendor GATT service: 5-byte
//! frames for up/down/stop, a 9-byte frame for moving to an absolute height,
//! and 4-digit ASCII notifications carrying the current height in millimeters.
//! The protocol was captured from the official mobile application.
//!
//! The crate has two layers:
//!
//! - [`protocol`]: pure encode/decode functions for the frames above
//! - [`DeskController`]: one desk's session. It connects, keeps the link alive
//!   with a background supervisor, reconnects transparently before commands,
//!   tracks height and motion, and fans notifications out to subscribers
//!
//! The controller talks to the radio through the [`Transport`] trait;
//! [`BleTransport`] implements it on top of `btleplug`.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library moves physical furniture. The desk reports no
//! limit switches or obstacle detection over Bluetooth, so:
//! - Keep the area above and below the desk clear while it moves
//! - Always pair timed or open-ended moves with a [`DeskController::stop`]
//! - Call [`DeskController::disconnect`] on shutdown so a moving desk is stopped
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergodesk::{DeskConfig, DeskController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let desk = DeskController::with_ble(DeskConfig::new("AA:BB:CC:DD:EE:FF")).await?;
//!     desk.connect().await?;
//!     desk.subscribe_notifications().await?;
//!
//!     // Move to 110 cm
//!     desk.move_to_height(110.0).await?;
//!
//!     desk.disconnect().await;
//!     Ok(())
//! }
//! ```

/// btleplug-backed transport and desk discovery
pub mod ble;
/// Desk controller
pub mod device;
/// Error types and handling
pub mod error;
/// Command and notification codec
pub mod protocol;
mod supervisor;
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use ble::BleTransport;
pub use device::{DeskController, Subscriber, SubscriberError, SubscriptionId};
pub use error::{DeskError, Result};
pub use transport::{DisconnectHandler, FrameHandler, Session, Transport};
pub use types::{
    CloudFeature, DeskConfig, DeskSnapshot, DeviceInfo, Direction, HeightRange, HeightReading,
    LinkState, MotionState,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Desk control GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ff00_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic commands are written to
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ff02_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic the desk notifies its height on
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);

/// Advertised name prefix of ErgoMate Classic desks
pub const DEVICE_NAME_PREFIX: &str = "BLT_";
