//! Driver-side communication state machine.
//!
//! Everything the driver knows about the executor arrives through the
//! status record. This module frames outgoing payloads, decodes incoming
//! statuses, applies the actionability rule, watches for deadlocks, and
//! tracks the secondary-channel session. [`Com::update`] returns
//! edge-triggered events for the main loop to match on.

use std::io;
use std::time::{Duration, Instant};

use duckline_protocol::secondary::{SdStatus, CMD_STOP, CMD_STOP_RUN};
use duckline_protocol::{
    frame, Channel, FrameParser, LinkWriter, ProtocolError, Status, ACK, BUFFER_SIZE, COM_VERSION,
};

/// How many unchanged-status retries before the link is declared dead.
const MAX_TRIES: u8 = 3;

/// Floor for the no-reply retry timer.
const POLL_FLOOR: Duration = Duration::from_millis(500);

/// Edge-triggered events surfaced by [`Com::update`].
#[derive(Debug)]
pub enum ComEvent {
    /// Executor finished the last work item (wait 0, nothing repeating).
    Done,
    /// Executor is repeating a command; re-send the bookmarked line.
    Repeat,
    /// Fires alongside Done, for loop-aware callers.
    Loop,
    /// Link-fatal condition; no further payloads until reconnect.
    Error(ProtocolError),
    /// Outcome of an ACK-synchronized key injection.
    KeyAck(bool),
    /// One directory entry from a LIST stream.
    SdList { name: String, size: u32 },
    /// One chunk of a READ stream.
    SdData(Vec<u8>),
    /// Per-chunk outcome of a WRITE stream.
    SdWriteAck(bool),
    /// A secondary-channel session ended in this state.
    SdEnd(SdStatus),
}

pub struct Com {
    parser: FrameParser,
    connected: bool,
    status: Status,
    react: bool,
    new_transmission: bool,
    tries: u8,
    waiting_key_ack: bool,
    request_time: Instant,

    sd_mode: SdStatus,
    sd_active: bool,
    sd_last_activity: Instant,
    sd_ack_timeout: Duration,
}

impl Com {
    pub fn new(sd_ack_timeout_ms: u64) -> Self {
        let now = Instant::now();
        Com {
            parser: FrameParser::new(),
            connected: true,
            status: Status::empty(),
            react: false,
            new_transmission: false,
            tries: 0,
            waiting_key_ack: false,
            request_time: now,
            sd_mode: SdStatus::NotPresent,
            sd_active: false,
            sd_last_activity: now,
            sd_ack_timeout: Duration::from_millis(sd_ack_timeout_ms),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn version(&self) -> u8 {
        self.status.version
    }

    pub fn com_version(&self) -> u8 {
        COM_VERSION
    }

    pub fn repeats(&self) -> u32 {
        self.status.repeat as u32
    }

    pub fn loops(&self) -> i32 {
        self.status.loops as i32
    }

    pub fn wait(&self) -> u16 {
        self.status.wait
    }

    pub fn sd_mode(&self) -> SdStatus {
        self.sd_mode
    }

    pub fn sd_active(&self) -> bool {
        self.sd_active
    }

    /// Mark the start of a secondary-channel session the console just
    /// requested, so incoming data frames dispatch correctly before the
    /// first status confirming the mode arrives.
    pub fn begin_sd_session(&mut self, mode: SdStatus) {
        self.sd_mode = mode;
        self.sd_active = mode.is_busy();
        self.sd_last_activity = Instant::now();
    }

    /// Append raw bytes from the link.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.parser.feed(chunk);
    }

    /// Send a script line or control byte on the primary channel.
    /// Returns the payload byte count actually transmitted.
    pub fn send(
        &mut self,
        writer: &mut LinkWriter,
        payload: &[u8],
        waiting_ack: bool,
    ) -> io::Result<usize> {
        self.waiting_key_ack = waiting_ack;
        let len = payload.len().min(BUFFER_SIZE);
        writer.send_bytes(&frame(&payload[..len], Channel::Primary))?;
        self.new_transmission = true;
        self.request_time = Instant::now();
        Ok(len)
    }

    /// Send a secondary-channel command or data chunk. A lone STOP or
    /// STOP_RUN also resets the local session state.
    pub fn send_sd(&mut self, writer: &mut LinkWriter, data: &[u8]) -> io::Result<usize> {
        self.waiting_key_ack = false;
        let len = data.len().min(BUFFER_SIZE);
        if len == 1 && (data[0] == CMD_STOP || data[0] == CMD_STOP_RUN) {
            self.sd_mode = SdStatus::Idle;
            self.sd_active = false;
        }
        writer.send_bytes(&frame(&data[..len], Channel::Secondary))?;
        self.new_transmission = true;
        self.request_time = Instant::now();
        Ok(len)
    }

    /// Digest one received status record.
    fn accept_status(&mut self, status: Status, events: &mut Vec<ComEvent>) {
        let prev_wait = self.status.wait;
        self.status = status;
        self.sd_mode = SdStatus::from_byte(status.secondary);
        self.react = status.is_actionable(prev_wait);
        self.new_transmission = false;
        self.request_time = Instant::now();

        // Deadlock watch: an unactionable status with an unchanged wait
        // means the last transmission may have been lost.
        if !self.react && status.wait == prev_wait {
            if self.tries >= MAX_TRIES {
                self.connected = false;
                events.push(ComEvent::Error(ProtocolError::Deadlock));
            } else {
                // Re-trigger the repeat path so the last line is re-sent.
                self.status.repeat = 1;
                self.react = true;
                self.tries += 1;
            }
        } else {
            self.tries = 0;
        }
    }

    /// Dispatch a complete secondary-channel frame by session mode.
    fn process_sd_packet(
        &mut self,
        packet: Vec<u8>,
        writer: &mut LinkWriter,
        events: &mut Vec<ComEvent>,
    ) -> io::Result<()> {
        self.sd_last_activity = Instant::now();
        match self.sd_mode {
            SdStatus::Writing => {
                if packet.as_slice() == [ACK] {
                    events.push(ComEvent::SdWriteAck(true));
                } else {
                    events.push(ComEvent::SdWriteAck(false));
                    events.push(ComEvent::SdEnd(SdStatus::Error));
                    self.sd_active = false;
                    self.send_sd(writer, &[CMD_STOP])?;
                }
            }
            SdStatus::Reading => {
                events.push(ComEvent::SdData(packet));
                if self.sd_active {
                    self.send_sd(writer, &[ACK])?;
                }
            }
            SdStatus::Listing => {
                if packet.len() >= 5 {
                    let size =
                        u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
                    let name_bytes = &packet[4..];
                    let end = name_bytes
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(name_bytes.len());
                    events.push(ComEvent::SdList {
                        name: String::from_utf8_lossy(&name_bytes[..end]).to_string(),
                        size,
                    });
                }
                if self.sd_active {
                    self.send_sd(writer, &[ACK])?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Per-tick update: parse frames, digest statuses, continue secondary
    /// streams, run the retry and timeout clocks, and dispatch events.
    pub fn update(&mut self, writer: &mut LinkWriter) -> io::Result<Vec<ComEvent>> {
        let mut events = Vec::new();
        self.parser.update();

        while let Some(payload) = self.parser.take(Channel::Primary) {
            match Status::decode(&payload) {
                Some(status) => self.accept_status(status, &mut events),
                None => {
                    // Not a status record; stray bytes are dropped.
                }
            }
        }

        if let Some(packet) = self.parser.take(Channel::Secondary) {
            self.process_sd_packet(packet, writer, &mut events)?;
        }

        // A session that fell back to a non-busy state is over.
        if self.sd_active && !self.sd_mode.is_busy() {
            self.sd_active = false;
            events.push(ComEvent::SdEnd(self.sd_mode));
        }

        // Stalled stream: no chunk within the ACK timeout. Abort so the
        // executor does not sit in a session forever.
        if self.sd_active
            && matches!(self.sd_mode, SdStatus::Reading | SdStatus::Listing)
            && self.sd_last_activity.elapsed() >= self.sd_ack_timeout
        {
            self.send_sd(writer, &[CMD_STOP])?;
            events.push(ComEvent::SdEnd(SdStatus::Error));
        }

        // No reply at all: retry with the same escalation as an unchanged
        // status, ending in a dead link.
        if self.connected && self.new_transmission {
            let poll_after = POLL_FLOOR.max(Duration::from_millis(self.status.wait as u64));
            if self.request_time.elapsed() >= poll_after {
                self.request_time = Instant::now();
                if self.tries >= MAX_TRIES {
                    self.connected = false;
                    self.new_transmission = false;
                    events.push(ComEvent::Error(ProtocolError::Deadlock));
                } else {
                    self.tries += 1;
                    events.push(ComEvent::Repeat);
                }
            }
        }

        // Edge-triggered status reactions.
        if self.react {
            self.react = false;
            if !self.status.version_ok() {
                self.connected = false;
                if self.waiting_key_ack {
                    self.waiting_key_ack = false;
                    events.push(ComEvent::KeyAck(false));
                }
                events.push(ComEvent::Error(ProtocolError::VersionMismatch {
                    got: self.status.version,
                    want: COM_VERSION,
                }));
            } else if self.status.wait > 0 {
                // Still processing; nothing to do yet.
            } else if self.status.repeat > 0 {
                events.push(ComEvent::Repeat);
            } else {
                if self.waiting_key_ack {
                    self.waiting_key_ack = false;
                    events.push(ComEvent::KeyAck(true));
                }
                events.push(ComEvent::Loop);
                events.push(ComEvent::Done);
            }
        }

        Ok(events)
    }
}
