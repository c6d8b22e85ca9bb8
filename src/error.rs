use thiserror::Error;

use crate::types::CloudFeature;

/// Errors that can occur when working with ErgoMate desks
#[derive(Error, Debug)]
pub enum DeskError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The transport failed to open, write to, or subscribe on the link
    #[error("Transport error: {0}")]
    Transport(String),

    /// A command needed the link, the reconnect attempt failed
    #[error("Not connected to desk: {0}")]
    NotConnected(String),

    /// A notification frame could not be interpreted as a height reading
    #[error("Failed to decode notification: {0}")]
    Decode(String),

    /// Feature only reachable through the vendor cloud service
    #[error("{feature} is a cloud-relayed feature and is not supported over Bluetooth")]
    Unsupported {
        /// The feature that was requested
        feature: CloudFeature,
    },

    /// Device not found during scanning
    #[error("ErgoMate desk not found")]
    DeviceNotFound,

    /// Invalid configuration or command parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for desk operations
pub type Result<T> = std::result::Result<T, DeskError>;

impl DeskError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Transport(_) | Self::NotConnected(_) | Self::DeviceNotFound
        )
    }

    /// Check if retrying the same operation later may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Transport(_) | Self::NotConnected(_)
        )
    }

    /// Check if this error reports a cloud-only feature
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
