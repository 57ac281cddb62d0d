//! The packed status record sent from executor to driver.

use crate::COM_VERSION;

/// Encoded size of a status record on the wire.
pub const STATUS_LEN: usize = 6;

/// Per-tick status record.
///
/// This is the only mechanism by which the driver learns the executor is
/// ready for more input. Layout on the wire (little-endian, packed):
///
/// ```text
/// u8 version | u16 wait | u8 repeat | u8 secondary | i8 loops
/// ```
///
/// `wait` is the total backpressure in ms-equivalents: bytes queued in the
/// receive and parse buffers plus the remaining interpreter delay. The
/// driver treats 0 as "ready for more".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub version: u8,
    pub wait: u16,
    /// REPEAT iterations pending after the current line, saturating at 255.
    pub repeat: u8,
    /// Secondary-channel state byte (see the executor's block-device states).
    pub secondary: u8,
    /// LOOP iterations remaining, saturating at 127; -1 means infinite.
    pub loops: i8,
}

impl Status {
    pub fn new(version: u8) -> Self {
        Status {
            version,
            wait: 0,
            repeat: 0,
            secondary: 0,
            loops: 0,
        }
    }

    /// Zeroed record with version 0, the driver's state before first contact.
    pub fn empty() -> Self {
        Status::new(0)
    }

    pub fn encode(&self) -> [u8; STATUS_LEN] {
        let wait = self.wait.to_le_bytes();
        [
            self.version,
            wait[0],
            wait[1],
            self.repeat,
            self.secondary,
            self.loops as u8,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Status> {
        if bytes.len() != STATUS_LEN {
            return None;
        }
        Some(Status {
            version: bytes[0],
            wait: u16::from_le_bytes([bytes[1], bytes[2]]),
            repeat: bytes[3],
            secondary: bytes[4],
            loops: bytes[5] as i8,
        })
    }

    /// Whether this record calls for action on the driver side.
    ///
    /// The LSB-xor clause guarantees forward progress is observable even
    /// while the executor stays continuously busy.
    pub fn is_actionable(&self, prev_wait: u16) -> bool {
        self.wait == 0 || self.repeat > 0 || ((prev_wait & 1) ^ (self.wait & 1)) != 0
    }

    pub fn version_ok(&self) -> bool {
        self.version == COM_VERSION
    }

    pub fn clamp_wait(value: u64) -> u16 {
        value.min(u16::MAX as u64) as u16
    }

    pub fn clamp_repeat(value: u32) -> u8 {
        value.min(255) as u8
    }

    pub fn clamp_loops(value: i32) -> i8 {
        value.clamp(-128, 127) as i8
    }
}
