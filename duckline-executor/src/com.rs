//! Executor-side communication state machine.
//!
//! Incoming raw bytes flow through the frame parser; outgoing traffic is
//! the status record (wrapped in primary framing) and secondary-channel
//! data frames. The status is recomputed immediately before every send so
//! the driver always sees the freshest backpressure figure.

use std::io;

use duckline_protocol::{
    frame, Channel, FrameParser, LinkWriter, Status, COM_VERSION,
};
use duckline_script::Interpreter;

pub struct Com {
    parser: FrameParser,
    /// Work-sequence bit folded into the wait LSB while busy, so the driver
    /// can observe progress across consecutive distinct work items.
    seq_bit: u16,
    last_sent_wait: u16,
}

impl Com {
    pub fn new() -> Self {
        Com {
            parser: FrameParser::new(),
            seq_bit: 0,
            last_sent_wait: 0,
        }
    }

    /// Append raw bytes from the link. Returns `false` if the chunk was
    /// dropped to protect the raw buffer.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.parser.feed(chunk)
    }

    /// Run the frame parser over buffered bytes. Call once per tick.
    pub fn update(&mut self) {
        self.parser.update();
    }

    pub fn take(&mut self, channel: Channel) -> Option<Vec<u8>> {
        self.parser.take(channel)
    }

    pub fn ready(&self, channel: Channel) -> bool {
        self.parser.ready(channel)
    }

    /// Flip the work-sequence bit. Call once per consumed work item.
    pub fn note_work(&mut self) {
        self.seq_bit ^= 1;
    }

    fn build_status(&self, interpreter: &Interpreter, secondary: u8) -> Status {
        let base = self.parser.queued_bytes() as u64 + interpreter.delay_remaining_ms();
        let mut wait = Status::clamp_wait(base);
        if wait > 0 {
            // Fold the sequence bit into the LSB without ever zeroing a
            // non-zero wait.
            if wait < 2 {
                wait = 2;
            }
            wait = (wait & !1) | self.seq_bit;
        }
        Status {
            version: COM_VERSION,
            wait,
            repeat: Status::clamp_repeat(interpreter.repeats()),
            secondary,
            loops: Status::clamp_loops(interpreter.loops()),
        }
    }

    /// Send a fresh status record, framed on the primary channel.
    pub fn send_status(
        &mut self,
        writer: &mut LinkWriter,
        interpreter: &Interpreter,
        secondary: u8,
    ) -> io::Result<Status> {
        let status = self.build_status(interpreter, secondary);
        writer.send_bytes(&frame(&status.encode(), Channel::Primary))?;
        self.last_sent_wait = status.wait;
        Ok(status)
    }

    /// The driver stops sending while it believes we are busy. Once the
    /// reported delay has drained and nothing is queued, push one status
    /// with wait 0 so it wakes up.
    pub fn maybe_wake(
        &mut self,
        writer: &mut LinkWriter,
        interpreter: &Interpreter,
        secondary: u8,
    ) -> io::Result<()> {
        if self.last_sent_wait > 0
            && self.parser.queued_bytes() == 0
            && interpreter.delay_remaining_ms() == 0
        {
            self.send_status(writer, interpreter, secondary)?;
        }
        Ok(())
    }

    /// Push secondary-channel data (file chunks, list entries, ACKs).
    pub fn send_sd_data(&mut self, writer: &mut LinkWriter, data: &[u8]) -> io::Result<()> {
        writer.send_bytes(&frame(data, Channel::Secondary))
    }
}

impl Default for Com {
    fn default() -> Self {
        Self::new()
    }
}
