use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{DeskError, Result};

/// Link state of a desk controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    /// No session with the desk
    #[default]
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Session established and usable
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Last commanded movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Moving up
    Up,
    /// Moving down
    Down,
    /// Not moving, or moving toward an absolute target
    #[default]
    None,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
            Self::None => write!(f, "None"),
        }
    }
}

/// Movement state as last commanded by the controller
///
/// The desk has no motion sensor. `direction` reflects the last command
/// sent and is only meaningful while `is_moving` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotionState {
    /// Whether a movement command is believed to be executing
    pub is_moving: bool,
    /// Direction of the last movement command
    pub direction: Direction,
}

impl MotionState {
    /// Motion state for a freshly issued movement
    #[must_use]
    pub const fn moving(direction: Direction) -> Self {
        Self {
            is_moving: true,
            direction,
        }
    }

    /// Motion state of a stopped desk
    #[must_use]
    pub const fn stopped() -> Self {
        Self {
            is_moving: false,
            direction: Direction::None,
        }
    }
}

/// A height reading in centimeters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightReading {
    /// Height as reported by the desk
    pub raw: f32,
    /// Height with the configured offset applied
    pub corrected: f32,
}

impl HeightReading {
    /// Build a reading from a raw value and a calibration offset
    #[must_use]
    pub fn new(raw: f32, offset: f32) -> Self {
        Self {
            raw,
            corrected: raw + offset,
        }
    }
}

/// Movement bounds of a desk in centimeters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightRange {
    /// Lowest reachable height
    pub min_cm: f32,
    /// Highest reachable height
    pub max_cm: f32,
}

impl Default for HeightRange {
    fn default() -> Self {
        Self {
            min_cm: 65.0,
            max_cm: 130.0,
        }
    }
}

impl HeightRange {
    /// Create a new range
    #[must_use]
    pub const fn new(min_cm: f32, max_cm: f32) -> Self {
        Self { min_cm, max_cm }
    }

    /// Clamp a height into the range
    #[must_use]
    pub fn clamp(&self, height_cm: f32) -> f32 {
        height_cm.max(self.min_cm).min(self.max_cm)
    }

    /// Map a height to a 0..=100 position, 0 being the lowest point
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn position_of(&self, height_cm: f32) -> u8 {
        let span = self.max_cm - self.min_cm;
        if span <= 0.0 {
            return 0;
        }
        let position = (height_cm - self.min_cm) / span * 100.0;
        position.clamp(0.0, 100.0) as u8
    }

    /// Map a 0..=100 position back to a height
    #[must_use]
    pub fn height_for_position(&self, position: u8) -> f32 {
        let position = f32::from(position.min(100));
        self.min_cm + position / 100.0 * (self.max_cm - self.min_cm)
    }

    /// Whether a height counts as fully lowered (within 1 cm of the minimum)
    #[must_use]
    pub fn is_at_minimum(&self, height_cm: f32) -> bool {
        height_cm <= self.min_cm + 1.0
    }
}

/// Features the vendor app relays through its cloud service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudFeature {
    /// Audible beep
    Beep,
    /// Child lock engage
    Lock,
    /// Child lock release
    Unlock,
    /// Controller factory reset
    FactoryReset,
}

impl fmt::Display for CloudFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beep => write!(f, "Beep"),
            Self::Lock => write!(f, "Child lock"),
            Self::Unlock => write!(f, "Child unlock"),
            Self::FactoryReset => write!(f, "Factory reset"),
        }
    }
}

/// Per-desk controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeskConfig {
    /// Transport address of the desk, e.g. a BLE MAC address
    pub address: String,
    /// Offset added to raw readings, in centimeters
    pub height_offset_cm: f32,
    /// Movement bounds of this unit
    pub height_range: HeightRange,
    /// Supervisor health poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Delay after a failed connection attempt in milliseconds
    pub retry_backoff_ms: u64,
    /// Upper bound on closing the session during disconnect, in milliseconds
    pub disconnect_timeout_ms: u64,
    /// Discovery scan duration in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            height_offset_cm: 0.0,
            height_range: HeightRange::default(),
            poll_interval_ms: 5_000,
            retry_backoff_ms: 5_000,
            disconnect_timeout_ms: 2_000,
            scan_timeout_ms: 10_000,
        }
    }
}

impl DeskConfig {
    /// Default configuration for the desk at `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the calibration offset
    #[must_use]
    pub fn with_height_offset(mut self, offset_cm: f32) -> Self {
        self.height_offset_cm = offset_cm;
        self
    }

    /// Set the movement bounds
    #[must_use]
    pub fn with_height_range(mut self, range: HeightRange) -> Self {
        self.height_range = range;
        self
    }

    /// Check the configuration for values the controller cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::InvalidParameters`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(DeskError::InvalidParameters(
                "desk address is empty".to_string(),
            ));
        }
        if !self.height_offset_cm.is_finite() {
            return Err(DeskError::InvalidParameters(format!(
                "height offset {} is not finite",
                self.height_offset_cm
            )));
        }
        let range = self.height_range;
        if !(range.min_cm.is_finite() && range.max_cm.is_finite()) || range.min_cm >= range.max_cm
        {
            return Err(DeskError::InvalidParameters(format!(
                "height range {:.1}..{:.1} cm is empty",
                range.min_cm, range.max_cm
            )));
        }
        if self.poll_interval_ms == 0 || self.retry_backoff_ms == 0 {
            return Err(DeskError::InvalidParameters(
                "supervisor intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Supervisor poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Supervisor retry backoff
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Session close timeout
    #[must_use]
    pub const fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// A desk seen during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised name
    pub name: String,
    /// Transport address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// Consistent view of a controller's observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeskSnapshot {
    /// Transport address
    pub address: String,
    /// Link state
    pub link: LinkState,
    /// Motion state
    pub motion: MotionState,
    /// Last known height, `None` until the first reading
    pub height: Option<HeightReading>,
    /// Last known position in the configured range
    pub position: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_reading_applies_offset() {
        let reading = HeightReading::new(72.0, -1.5);
        assert!((reading.raw - 72.0).abs() < f32::EPSILON);
        assert!((reading.corrected - 70.5).abs() < 0.001);
    }

    #[test]
    fn test_position_mapping() {
        let range = HeightRange::default();

        assert_eq!(range.position_of(65.0), 0);
        assert_eq!(range.position_of(130.0), 100);
        assert_eq!(range.position_of(97.5), 50);
        assert_eq!(range.position_of(10.0), 0);
        assert_eq!(range.position_of(200.0), 100);

        assert!((range.height_for_position(0) - 65.0).abs() < 0.001);
        assert!((range.height_for_position(100) - 130.0).abs() < 0.001);
        assert!((range.height_for_position(50) - 97.5).abs() < 0.001);
        assert!((range.height_for_position(250) - 130.0).abs() < 0.001);
    }

    #[test]
    fn test_degenerate_range_position() {
        let range = HeightRange::new(80.0, 80.0);
        assert_eq!(range.position_of(90.0), 0);
    }

    #[test]
    fn test_is_at_minimum() {
        let range = HeightRange::default();
        assert!(range.is_at_minimum(65.0));
        assert!(range.is_at_minimum(66.0));
        assert!(!range.is_at_minimum(66.5));
    }

    #[test]
    fn test_motion_state_constructors() {
        let moving = MotionState::moving(Direction::Up);
        assert!(moving.is_moving);
        assert_eq!(moving.direction, Direction::Up);

        assert_eq!(MotionState::stopped(), MotionState::default());
    }

    #[test]
    fn test_config_defaults() {
        let config = DeskConfig::new("AA:BB:CC:DD:EE:FF");

        assert_eq!(config.address, "AA:BB:CC:DD:EE:FF");
        assert!(config.height_offset_cm.abs() < f32::EPSILON);
        assert_eq!(config.height_range, HeightRange::new(65.0, 130.0));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.disconnect_timeout(), Duration::from_secs(2));
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(DeskConfig::default().validate().is_err());

        let bad_offset = DeskConfig::new("desk").with_height_offset(f32::NAN);
        assert!(bad_offset.validate().is_err());

        let bad_range = DeskConfig::new("desk").with_height_range(HeightRange::new(120.0, 70.0));
        assert!(bad_range.validate().is_err());

        let mut bad_interval = DeskConfig::new("desk");
        bad_interval.poll_interval_ms = 0;
        assert!(bad_interval.validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(LinkState::Connecting.to_string(), "Connecting");
        assert_eq!(Direction::Down.to_string(), "Down");
        assert_eq!(CloudFeature::FactoryReset.to_string(), "Factory reset");
    }
}
