//! Topic-gated logging for the node binaries.
//!
//! Messages are filed under a [`Topic`] and the logger stamps the tag;
//! call sites never format their own prefixes. Each topic unlocks at one
//! of the `-v`/`-vv`/`-vvv` tiers.

use crate::parse_args::Verbosity;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Connection lifecycle and session events
    Link,
    /// Protocol traffic: frames, status records, secondary-channel commands
    Proto,
    /// Raw wire chunks and per-byte HID emissions
    Wire,
}

impl Topic {
    fn unlocked_at(self) -> Verbosity {
        match self {
            Topic::Link => Verbosity::Verbose,
            Topic::Proto => Verbosity::Trace,
            Topic::Wire => Verbosity::TraceWire,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Topic::Link => "link",
            Topic::Proto => "proto",
            Topic::Wire => "wire",
        }
    }
}

enum Sink {
    Stderr,
    File(BufWriter<File>),
}

/// Thread-safe logger
pub struct Logger {
    sink: Arc<Mutex<Sink>>,
    verbosity: Verbosity,
}

impl Logger {
    /// Create a new logger writing to stderr
    pub fn stderr(verbosity: Verbosity) -> Self {
        Logger {
            sink: Arc::new(Mutex::new(Sink::Stderr)),
            verbosity,
        }
    }

    /// Create a new logger writing to a file
    pub fn file(path: &str, verbosity: Verbosity) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Logger {
            sink: Arc::new(Mutex::new(Sink::File(BufWriter::new(file)))),
            verbosity,
        })
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Log under a topic; dropped unless the verbosity tier unlocks it.
    pub fn log(&self, topic: Topic, msg: &str) {
        if self.verbosity >= topic.unlocked_at() {
            self.write(&format!("[{}] {}", topic.tag(), msg));
        }
    }

    /// Unconditional output for errors and one-time notices.
    pub fn always(&self, msg: &str) {
        self.write(msg);
    }

    fn write(&self, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            match &mut *sink {
                Sink::Stderr => {
                    eprintln!("{}", line);
                }
                Sink::File(f) => {
                    let _ = writeln!(f, "{}", line);
                    let _ = f.flush();
                }
            }
        }
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger {
            sink: self.sink.clone(),
            verbosity: self.verbosity,
        }
    }
}
