//! Channel framing and the per-tick sliding frame parser.

use crate::BUFFER_SIZE;

/// Start of primary transmission
pub const SOT: u8 = 0x01;
/// Start of secondary transmission
pub const SD_SOT: u8 = 0x02;
/// End of secondary transmission
pub const SD_EOT: u8 = 0x03;
/// End of primary transmission
pub const EOT: u8 = 0x04;
/// Interpreter reset, sent as a single-byte primary payload
pub const RESET: u8 = 0x05;
/// Secondary-channel chunk acknowledgment
pub const ACK: u8 = 0x06;

/// Protocol error types
#[derive(Debug)]
pub enum ProtocolError {
    /// I/O error during read/write
    Io(std::io::Error),
    /// Status record payload had the wrong length
    BadStatus(usize),
    /// Status record carried an unexpected protocol version
    VersionMismatch { got: u8, want: u8 },
    /// Peer stopped making progress (unchanged backpressure after retries)
    Deadlock,
    /// Connection closed
    LinkClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
            ProtocolError::BadStatus(len) => write!(f, "Bad status record length: {}", len),
            ProtocolError::VersionMismatch { got, want } => {
                write!(f, "Protocol version mismatch: got {}, want {}", got, want)
            }
            ProtocolError::Deadlock => write!(f, "Peer stopped responding (deadlock)"),
            ProtocolError::LinkClosed => write!(f, "Link closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::LinkClosed
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// The two packet channels multiplexed on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Script text and status records
    Primary,
    /// Block-device commands and data
    Secondary,
}

impl Channel {
    /// Start-of-transmission marker for this channel
    pub fn sot(self) -> u8 {
        match self {
            Channel::Primary => SOT,
            Channel::Secondary => SD_SOT,
        }
    }

    /// End-of-transmission marker for this channel
    pub fn eot(self) -> u8 {
        match self {
            Channel::Primary => EOT,
            Channel::Secondary => SD_EOT,
        }
    }
}

/// Wrap a payload in channel framing. Payloads longer than [`BUFFER_SIZE`]
/// are truncated, matching the receiver's capacity.
pub fn frame(payload: &[u8], channel: Channel) -> Vec<u8> {
    let len = payload.len().min(BUFFER_SIZE);
    let mut out = Vec::with_capacity(len + 2);
    out.push(channel.sot());
    out.extend_from_slice(&payload[..len]);
    out.push(channel.eot());
    out
}

#[derive(Default)]
struct PayloadBuf {
    buf: Vec<u8>,
    ready: bool,
}

/// Sliding parser that turns raw link bytes back into channel payloads.
///
/// Bytes are appended with [`FrameParser::feed`] as they arrive and consumed
/// by [`FrameParser::update`] once per tick. Payload extraction follows the
/// marker scan rules:
///
/// * bytes before any start marker are discarded silently,
/// * an end marker belonging to the other channel is treated as payload,
/// * a payload that fills the buffer before its end marker arrives is
///   force-completed and delivered as-is,
/// * a chunk that would overflow the raw buffer is dropped whole, never
///   split (a partial append could cut a marker in half).
pub struct FrameParser {
    raw: Vec<u8>,
    primary: PayloadBuf,
    secondary: PayloadBuf,
    in_transmission: Option<Channel>,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            raw: Vec::with_capacity(BUFFER_SIZE),
            primary: PayloadBuf::default(),
            secondary: PayloadBuf::default(),
            in_transmission: None,
        }
    }

    fn payload(&self, channel: Channel) -> &PayloadBuf {
        match channel {
            Channel::Primary => &self.primary,
            Channel::Secondary => &self.secondary,
        }
    }

    fn payload_mut(&mut self, channel: Channel) -> &mut PayloadBuf {
        match channel {
            Channel::Primary => &mut self.primary,
            Channel::Secondary => &mut self.secondary,
        }
    }

    /// Append a chunk of raw bytes from the link.
    ///
    /// Returns `false` (and drops the entire chunk) if it would overflow
    /// the raw buffer.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.raw.len() + chunk.len() > BUFFER_SIZE {
            return false;
        }
        self.raw.extend_from_slice(chunk);
        true
    }

    /// Number of bytes sitting in the raw and payload buffers, used for the
    /// backpressure figure in the status record.
    pub fn queued_bytes(&self) -> usize {
        let pending = |p: &PayloadBuf| if p.ready { p.buf.len() } else { 0 };
        self.raw.len() + pending(&self.primary) + pending(&self.secondary)
    }

    /// Process buffered raw bytes, extracting payloads. Call once per tick.
    pub fn update(&mut self) {
        let mut i = 0;
        while i < self.raw.len() {
            match self.in_transmission {
                None => {
                    let b = self.raw[i];
                    let channel = if b == SOT {
                        Some(Channel::Primary)
                    } else if b == SD_SOT {
                        Some(Channel::Secondary)
                    } else {
                        None
                    };
                    if let Some(channel) = channel {
                        if self.payload(channel).ready {
                            // Previous frame on this channel not consumed yet;
                            // leave the rest for the next tick.
                            break;
                        }
                        self.payload_mut(channel).buf.clear();
                        self.in_transmission = Some(channel);
                    }
                    i += 1;
                }
                Some(channel) => {
                    let b = self.raw[i];
                    i += 1;
                    if b == channel.eot() {
                        self.payload_mut(channel).ready = true;
                        self.in_transmission = None;
                    } else {
                        let payload = self.payload_mut(channel);
                        payload.buf.push(b);
                        if payload.buf.len() == BUFFER_SIZE {
                            // Force-complete: deliver what we have.
                            payload.ready = true;
                            self.in_transmission = None;
                        }
                    }
                }
            }
        }
        self.raw.drain(..i);
    }

    /// True if a complete payload is waiting on the given channel.
    pub fn ready(&self, channel: Channel) -> bool {
        self.payload(channel).ready
    }

    /// Take a completed payload off the given channel.
    pub fn take(&mut self, channel: Channel) -> Option<Vec<u8>> {
        let payload = self.payload_mut(channel);
        if !payload.ready {
            return None;
        }
        payload.ready = false;
        Some(std::mem::take(&mut payload.buf))
    }

    /// Take the next completed payload, draining primary before secondary so
    /// script execution is never starved by file traffic.
    pub fn next_ready(&mut self) -> Option<(Channel, Vec<u8>)> {
        if let Some(p) = self.take(Channel::Primary) {
            return Some((Channel::Primary, p));
        }
        if let Some(p) = self.take(Channel::Secondary) {
            return Some((Channel::Secondary, p));
        }
        None
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: &[u8], channel: Channel) -> Vec<u8> {
        let mut parser = FrameParser::new();
        assert!(parser.feed(&frame(payload, channel)));
        parser.update();
        parser.take(channel).expect("payload not extracted")
    }

    #[test]
    fn test_roundtrip_primary() {
        let payload = b"STRING hello world";
        assert_eq!(roundtrip(payload, Channel::Primary), payload);
    }

    #[test]
    fn test_roundtrip_secondary() {
        let payload = [0x11, b'p', b'a', b'y', 0x00];
        assert_eq!(roundtrip(&payload, Channel::Secondary), payload);
    }

    #[test]
    fn test_roundtrip_byte_at_a_time() {
        // A frame survives any split into chunk arrivals.
        let wire = frame(b"DELAY 100", Channel::Primary);
        let mut parser = FrameParser::new();
        for b in &wire {
            assert!(parser.feed(std::slice::from_ref(b)));
            parser.update();
        }
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"DELAY 100");
    }

    #[test]
    fn test_bytes_before_sot_discarded() {
        let mut parser = FrameParser::new();
        let mut wire = vec![0x55, 0xAA, 0x00];
        wire.extend_from_slice(&frame(b"abc", Channel::Primary));
        parser.feed(&wire);
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"abc");
    }

    #[test]
    fn test_mismatched_eot_is_payload() {
        // SD_EOT inside a primary frame is an ordinary payload byte.
        let mut parser = FrameParser::new();
        parser.feed(&[SOT, b'a', SD_EOT, b'b', EOT]);
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), [b'a', SD_EOT, b'b']);
    }

    #[test]
    fn test_overflow_drops_whole_chunk() {
        let mut parser = FrameParser::new();
        let big = vec![b'x'; BUFFER_SIZE + 1];
        assert!(!parser.feed(&big));
        parser.update();
        assert!(!parser.ready(Channel::Primary));
        // The parser still works after the drop.
        parser.feed(&frame(b"ok", Channel::Primary));
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"ok");
    }

    #[test]
    fn test_force_complete_without_eot() {
        let mut parser = FrameParser::new();
        parser.feed(&[SOT]);
        parser.update();
        let fill = vec![b'y'; BUFFER_SIZE];
        // Feed in MTU-sized slices so the raw buffer never overflows.
        for chunk in fill.chunks(crate::PACKET_SIZE) {
            assert!(parser.feed(chunk));
            parser.update();
        }
        let payload = parser.take(Channel::Primary).unwrap();
        assert_eq!(payload.len(), BUFFER_SIZE);
        assert!(payload.iter().all(|&b| b == b'y'));
    }

    #[test]
    fn test_primary_drained_before_secondary() {
        let mut parser = FrameParser::new();
        let mut wire = frame(&[0x10, 0x00], Channel::Secondary);
        wire.extend_from_slice(&frame(b"STRING x", Channel::Primary));
        parser.feed(&wire);
        parser.update();
        let (channel, _) = parser.next_ready().unwrap();
        assert_eq!(channel, Channel::Primary);
        let (channel, _) = parser.next_ready().unwrap();
        assert_eq!(channel, Channel::Secondary);
        assert!(parser.next_ready().is_none());
    }

    #[test]
    fn test_interleaved_channels() {
        // A secondary frame may arrive between two primary frames.
        let mut parser = FrameParser::new();
        parser.feed(&frame(b"first", Channel::Primary));
        parser.feed(&frame(&[ACK], Channel::Secondary));
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"first");
        assert_eq!(parser.take(Channel::Secondary).unwrap(), [ACK]);
    }

    #[test]
    fn test_unconsumed_frame_blocks_next() {
        let mut parser = FrameParser::new();
        parser.feed(&frame(b"one", Channel::Primary));
        parser.feed(&frame(b"two", Channel::Primary));
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"one");
        parser.update();
        assert_eq!(parser.take(Channel::Primary).unwrap(), b"two");
    }

    #[test]
    fn test_truncates_oversize_payload() {
        let payload = vec![b'z'; BUFFER_SIZE + 40];
        let wire = frame(&payload, Channel::Primary);
        assert_eq!(wire.len(), BUFFER_SIZE + 2);
    }
}
