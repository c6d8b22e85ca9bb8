use crate::error::{DeskError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Start marker of a directional command frame
pub const HEADER: u8 = 0xA5;

/// Second byte of a directional command frame, always zero
pub const RESERVED: u8 = 0x00;

/// End marker shared by every command frame
pub const TERMINATOR: u8 = 0xFF;

/// Directional command frame size in bytes
pub const COMMAND_FRAME_SIZE: usize = 5;

/// Start marker of an absolute height frame
pub const HEIGHT_HEADER: u8 = 0xA6;

/// Command byte of an absolute height frame
///
/// This byte is not covered by the frame checksum.
pub const HEIGHT_COMMAND: u8 = 0xA8;

/// Fixed parameter byte following [`HEIGHT_COMMAND`]
pub const HEIGHT_PARAM: u8 = 0x01;

/// Absolute height frame size in bytes
pub const HEIGHT_FRAME_SIZE: usize = 9;

/// Lowest target accepted by the controller board, in millimeters
pub const MIN_TARGET_MM: u16 = 650;

/// Highest target accepted by the controller board, in millimeters
pub const MAX_TARGET_MM: u16 = 1300;

/// Size of a height notification in bytes
pub const NOTIFICATION_SIZE: usize = 4;

/// Directional commands understood by the desk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Start moving up until stopped or at the top limit
    Up = 0x20,
    /// Start moving down until stopped or at the bottom limit
    Down = 0x40,
    /// Halt any movement
    Stop = 0x00,
}

impl Command {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x20 => Some(Self::Up),
            0x40 => Some(Self::Down),
            0x00 => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Serialize a directional command
///
/// Layout: `[0xA5, 0x00, CMD, 0xFF ^ CMD, 0xFF]`.
#[must_use]
pub fn encode_command(command: Command) -> Bytes {
    let code = command as u8;
    let mut buf = BytesMut::with_capacity(COMMAND_FRAME_SIZE);

    buf.put_u8(HEADER);
    buf.put_u8(RESERVED);
    buf.put_u8(code);
    buf.put_u8(TERMINATOR ^ code);
    buf.put_u8(TERMINATOR);

    buf.freeze()
}

/// Serialize an absolute height command
///
/// The target is given in millimeters and saturates to
/// [`MIN_TARGET_MM`]..=[`MAX_TARGET_MM`] before framing.
///
/// Layout: `[0xA6, 0xA8, 0x01, HB, LB, 0x00, 0x00, CHECKSUM, 0xFF]` where the
/// checksum is the XOR of bytes 2 through 6.
#[must_use]
pub fn encode_height(target_mm: i32) -> Bytes {
    let clamped = target_mm.clamp(i32::from(MIN_TARGET_MM), i32::from(MAX_TARGET_MM));
    let [high, low] = u16::try_from(clamped).unwrap_or(MIN_TARGET_MM).to_be_bytes();

    let mut buf = BytesMut::with_capacity(HEIGHT_FRAME_SIZE);
    buf.put_u8(HEIGHT_HEADER);
    buf.put_u8(HEIGHT_COMMAND);
    buf.put_u8(HEIGHT_PARAM);
    buf.put_u8(high);
    buf.put_u8(low);
    buf.put_u8(0x00);
    buf.put_u8(0x00);
    let checksum = xor(&buf[2..7]);
    buf.put_u8(checksum);
    buf.put_u8(TERMINATOR);

    buf.freeze()
}

/// Check the framing and checksum of an outgoing command frame
///
/// Accepts both the directional and the absolute height layouts.
#[must_use]
pub fn verify_checksum(frame: &[u8]) -> bool {
    match frame.len() {
        COMMAND_FRAME_SIZE => {
            frame[0] == HEADER
                && frame[1] == RESERVED
                && frame[4] == TERMINATOR
                && frame[3] == TERMINATOR ^ frame[2]
        }
        HEIGHT_FRAME_SIZE => {
            frame[0] == HEIGHT_HEADER
                && frame[1] == HEIGHT_COMMAND
                && frame[8] == TERMINATOR
                && frame[7] == xor(&frame[2..7])
        }
        _ => false,
    }
}

/// Recover the command carried by a directional frame
#[must_use]
pub fn decode_command(frame: &[u8]) -> Option<Command> {
    if frame.len() != COMMAND_FRAME_SIZE || !verify_checksum(frame) {
        return None;
    }
    Command::from_u8(frame[2])
}

/// Recover the target carried by an absolute height frame, in millimeters
#[must_use]
pub fn decode_height_target(frame: &[u8]) -> Option<u16> {
    if frame.len() != HEIGHT_FRAME_SIZE || !verify_checksum(frame) {
        return None;
    }
    Some(u16::from_be_bytes([frame[3], frame[4]]))
}

/// Parse a height notification into millimeters
///
/// The desk reports its height as four ASCII digits, e.g. `b"0720"` for
/// 720 mm. Other notifications share the same characteristic, so a
/// failure here is expected traffic rather than a link problem.
///
/// # Errors
///
/// Returns [`DeskError::Decode`] if the frame is not exactly four ASCII digits.
pub fn parse_height(data: &[u8]) -> Result<u16> {
    if data.len() != NOTIFICATION_SIZE {
        return Err(DeskError::Decode(format!(
            "expected {NOTIFICATION_SIZE} bytes, got {}",
            data.len()
        )));
    }

    data.iter().try_fold(0u16, |acc, &byte| {
        if byte.is_ascii_digit() {
            Ok(acc * 10 + u16::from(byte - b'0'))
        } else {
            Err(DeskError::Decode(format!("non-digit byte {byte:02X}")))
        }
    })
}

/// Decode a height notification into centimeters
///
/// Returns `None` for frames that are not height readings.
#[must_use]
pub fn decode_notification(data: &[u8]) -> Option<f32> {
    parse_height(data).ok().map(mm_to_cm)
}

/// Convert a height in centimeters to whole millimeters, rounding to nearest
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn cm_to_mm(height_cm: f32) -> i32 {
    (height_cm * 10.0).round() as i32
}

/// Convert millimeters to centimeters
#[must_use]
pub fn mm_to_cm(height_mm: u16) -> f32 {
    f32::from(height_mm) / 10.0
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}
