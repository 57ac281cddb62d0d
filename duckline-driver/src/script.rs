//! Flash-hosted script control.
//!
//! The streamer itself lives in `duckline-script`; here its line sink is
//! the com module, so every delivered line goes over the link and the
//! REPEAT/LOOP read-backs come from the last received status record. One
//! step is taken per actionable status, never faster.

use std::io;

use duckline_protocol::{LinkWriter, RESET};
use duckline_script::{FileSource, LineSink, Streamer};

use crate::com::Com;
use crate::storage::Storage;

struct ComSink<'a> {
    com: &'a mut Com,
    writer: &'a mut LinkWriter,
}

impl LineSink for ComSink<'_> {
    fn deliver(&mut self, line: &[u8]) {
        let _ = self.com.send(self.writer, line, false);
    }

    fn repeats(&self) -> u32 {
        self.com.repeats()
    }

    fn loops(&self) -> i32 {
        self.com.loops()
    }
}

pub struct FlashScript {
    streamer: Streamer,
    source: Option<FileSource>,
    name: String,
}

impl FlashScript {
    pub fn new() -> Self {
        FlashScript {
            streamer: Streamer::new(),
            source: None,
            name: String::new(),
        }
    }

    /// Open a flash-hosted script and prime the executor with an
    /// interpreter reset. The first line goes out on the next Done.
    pub fn run(
        &mut self,
        storage: &Storage,
        name: &str,
        com: &mut Com,
        writer: &mut LinkWriter,
    ) -> io::Result<()> {
        // A busy secondary channel owns the executor; starting a stream
        // now would interleave two scripts.
        if com.sd_mode().is_busy() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "secondary channel busy",
            ));
        }
        let file = storage.open(name)?;
        self.source = Some(FileSource::new(file));
        self.streamer.start();
        self.name = name.to_string();
        com.send(writer, &[RESET], false)?;
        Ok(())
    }

    /// Advance one step; call once per actionable status. Returns `false`
    /// once the script has ended.
    pub fn step(&mut self, com: &mut Com, writer: &mut LinkWriter) -> bool {
        let source = match &mut self.source {
            Some(s) => s,
            None => return false,
        };
        let mut sink = ComSink { com, writer };
        let more = self.streamer.step(source, &mut sink);
        if !more {
            self.source = None;
            self.name.clear();
        }
        more
    }

    /// Stop the current script. An empty name stops whatever is running;
    /// a specific name only stops a matching script.
    pub fn stop(&mut self, name: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        if !name.is_empty() && name != self.name {
            return false;
        }
        self.streamer.stop();
        self.source = None;
        self.name.clear();
        true
    }

    pub fn is_running(&self) -> bool {
        self.source.is_some()
    }

    pub fn current_script(&self) -> &str {
        &self.name
    }
}

impl Default for FlashScript {
    fn default() -> Self {
        Self::new()
    }
}
