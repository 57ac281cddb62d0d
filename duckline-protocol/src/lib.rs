//! # Duckline Protocol
//!
//! Wire protocol shared by the driver and executor nodes.
//!
//! ## Wire Format
//!
//! Payloads travel as raw bytes bracketed by channel markers:
//! ```text
//! SOT    | payload... | EOT       (primary channel)
//! SD_SOT | payload... | SD_EOT    (secondary channel)
//! ```
//!
//! ## Reserved bytes
//!
//! | Byte | Name   | Meaning |
//! |------|--------|---------|
//! | 0x01 | SOT    | Start of primary transmission |
//! | 0x02 | SD_SOT | Start of secondary transmission |
//! | 0x03 | SD_EOT | End of secondary transmission |
//! | 0x04 | EOT    | End of primary transmission |
//! | 0x05 | RESET  | Interpreter reset (single-byte primary payload) |
//! | 0x06 | ACK    | Secondary-channel chunk acknowledgment |
//!
//! The primary channel carries script text (driver to executor) and the
//! packed status record (executor to driver). The secondary channel carries
//! block-device commands and data in either direction.

mod frame;
mod link;
pub mod secondary;
mod status;

/// Protocol version carried in every status record. Both nodes must agree.
pub const COM_VERSION: u8 = 4;

/// Capacity of the per-channel payload buffers, shared by both nodes.
pub const BUFFER_SIZE: usize = 256;

/// Per-transaction MTU. Longer sends are split into packets of this size.
pub const PACKET_SIZE: usize = 32;

/// Maximum length of a block-device file name, NUL terminator excluded.
pub const MAX_NAME: usize = 64;

pub use frame::{frame, Channel, FrameParser, ProtocolError, ACK, EOT, RESET, SD_EOT, SD_SOT, SOT};
pub use link::{Link, LinkAddr, LinkListener, LinkReader, LinkWriter, DEFAULT_SOCKET_PATH};
pub use secondary::SdStatus;
pub use status::{Status, STATUS_LEN};
