//! Block-device adapter and the secondary-channel command handler.
//!
//! A host directory stands in for the block device. One session at a time
//! owns the filesystem handle: a read cannot begin while a write is active,
//! a remove fails while any handle is open, and a running script counts as
//! a session of its own.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use duckline_protocol::secondary::{
    SdStatus, CMD_LS, CMD_READ, CMD_RM, CMD_RUN, CMD_STOP, CMD_STOP_RUN, CMD_WRITE,
};
use duckline_protocol::{ACK, BUFFER_SIZE, MAX_NAME};
use duckline_script::{HidSink, Interpreter};

use crate::com::Com;
use crate::logger::{Logger, Topic};
use crate::runner::Runner;
use duckline_protocol::LinkWriter;

/// Read chunks leave headroom for the framing bytes added downstream.
const READ_CHUNK: usize = BUFFER_SIZE - 12;

/// Flush cadence for writes, one classic sector.
const SYNC_EVERY: u64 = 512;

/// Directory-backed block device with an exclusive handle.
pub struct BlockDev {
    root: Option<PathBuf>,
    status: SdStatus,
    reading: Option<File>,
    writing: Option<File>,
    listing: Option<fs::ReadDir>,
    bytes_since_sync: u64,
}

/// Extension filter for listings: only scripts are shown.
fn has_script_ext(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".txt") || lower.ends_with(".ds") || lower.ends_with(".js")
}

impl BlockDev {
    pub fn new(root: Option<PathBuf>) -> Self {
        let status = match &root {
            Some(dir) if dir.is_dir() => SdStatus::Idle,
            _ => SdStatus::NotPresent,
        };
        BlockDev {
            root,
            status,
            reading: None,
            writing: None,
            listing: None,
            bytes_since_sync: 0,
        }
    }

    pub fn available(&self) -> bool {
        self.status != SdStatus::NotPresent && self.root.is_some()
    }

    pub fn status(&self) -> SdStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SdStatus) {
        self.status = status;
    }

    fn handle_open(&self) -> bool {
        self.reading.is_some()
            || self.writing.is_some()
            || self.listing.is_some()
            || self.status == SdStatus::Executing
    }

    /// Resolve a wire path against the root. Traversal components are
    /// rejected here so no command escapes the mount.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let rel = path.trim_start_matches('/');
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return None;
        }
        Some(root.join(rel_path))
    }

    pub fn begin_list(&mut self, path: &str) -> bool {
        if self.handle_open() || !self.available() {
            return false;
        }
        let dir = match self.resolve(path) {
            Some(d) => d,
            None => {
                self.status = SdStatus::Error;
                return false;
            }
        };
        match fs::read_dir(&dir) {
            Ok(iter) => {
                self.listing = Some(iter);
                self.status = SdStatus::Listing;
                true
            }
            Err(_) => {
                self.status = SdStatus::Error;
                false
            }
        }
    }

    /// Next regular file passing the name and extension filters.
    pub fn next_file(&mut self) -> Option<(String, u32)> {
        let iter = self.listing.as_mut()?;
        for entry in iter.by_ref().flatten() {
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.len() < 4 || name.len() > MAX_NAME {
                continue;
            }
            if !has_script_ext(&name) {
                continue;
            }
            return Some((name, meta.len().min(u32::MAX as u64) as u32));
        }
        None
    }

    pub fn end_list(&mut self) {
        if self.listing.take().is_some() {
            self.status = SdStatus::Idle;
        }
    }

    pub fn begin_read(&mut self, path: &str) -> bool {
        if self.handle_open() || !self.available() {
            return false;
        }
        let target = match self.resolve(path) {
            Some(t) => t,
            None => {
                self.status = SdStatus::Error;
                return false;
            }
        };
        match File::open(&target) {
            Ok(file) => {
                self.reading = Some(file);
                self.status = SdStatus::Reading;
                true
            }
            Err(_) => {
                self.status = SdStatus::Error;
                false
            }
        }
    }

    pub fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        match &mut self.reading {
            Some(file) => file.read(buf).unwrap_or(0),
            None => 0,
        }
    }

    pub fn end_read(&mut self) {
        if self.reading.take().is_some() {
            self.status = SdStatus::Idle;
        }
    }

    pub fn begin_write(&mut self, path: &str, append: bool) -> bool {
        if self.handle_open() || !self.available() {
            return false;
        }
        let target = match self.resolve(path) {
            Some(t) => t,
            None => {
                self.status = SdStatus::Error;
                return false;
            }
        };
        let result = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(&target);
        match result {
            Ok(file) => {
                self.writing = Some(file);
                self.bytes_since_sync = 0;
                self.status = SdStatus::Writing;
                true
            }
            Err(_) => {
                self.status = SdStatus::Error;
                false
            }
        }
    }

    /// Write a chunk, flushing every [`SYNC_EVERY`] bytes. Returns the byte
    /// count written; 0 also covers the empty closing chunk.
    pub fn write_chunk(&mut self, data: &[u8]) -> usize {
        let file = match &mut self.writing {
            Some(f) => f,
            None => return 0,
        };
        if data.is_empty() {
            return 0;
        }
        match file.write(data) {
            Ok(n) => {
                self.bytes_since_sync += n as u64;
                if self.bytes_since_sync >= SYNC_EVERY {
                    let _ = file.flush();
                    let _ = file.sync_data();
                    self.bytes_since_sync = 0;
                }
                n
            }
            Err(_) => 0,
        }
    }

    pub fn end_write(&mut self) {
        if let Some(mut file) = self.writing.take() {
            let _ = file.flush();
            let _ = file.sync_data();
            self.bytes_since_sync = 0;
            self.status = SdStatus::Idle;
        }
    }

    pub fn remove_file(&mut self, path: &str) -> bool {
        if self.handle_open() || !self.available() {
            return false;
        }
        match self.resolve(path) {
            Some(target) => fs::remove_file(target).is_ok(),
            None => false,
        }
    }

    /// Open a script for execution. The handle goes to the runner; the
    /// device stays in the Executing state until [`BlockDev::finish_script`].
    pub fn open_script(&mut self, path: &str) -> Option<File> {
        if self.handle_open() || !self.available() {
            return None;
        }
        let target = self.resolve(path)?;
        match File::open(&target) {
            Ok(file) => {
                self.status = SdStatus::Executing;
                Some(file)
            }
            Err(_) => {
                self.status = SdStatus::Error;
                None
            }
        }
    }

    pub fn finish_script(&mut self) {
        if self.status == SdStatus::Executing {
            self.status = SdStatus::Idle;
        }
    }
}

/// Pull the NUL-terminated path argument out of a command payload.
fn path_arg(args: &[u8]) -> String {
    let end = args.iter().position(|&b| b == 0).unwrap_or(args.len());
    String::from_utf8_lossy(&args[..end]).to_string()
}

/// Secondary-channel command handler: dispatches command payloads against
/// the block device and drives the per-chunk ACK streams.
pub struct SdHandler {
    pub dev: BlockDev,
    pub runner: Runner,
    logger: Logger,
}

impl SdHandler {
    pub fn new(root: Option<PathBuf>, logger: Logger) -> Self {
        SdHandler {
            dev: BlockDev::new(root),
            runner: Runner::new(),
            logger,
        }
    }

    pub fn status_byte(&self) -> u8 {
        self.dev.status().byte()
    }

    /// Handle one secondary-channel payload.
    pub fn process(
        &mut self,
        payload: &[u8],
        com: &mut Com,
        writer: &mut LinkWriter,
        interpreter: &mut Interpreter,
        hid: &mut dyn HidSink,
    ) -> io::Result<()> {
        if payload.is_empty() || !self.dev.available() {
            return Ok(());
        }

        let cmd = payload[0];
        let args = &payload[1..];

        // An ACK is a response, not a command: continue the active stream.
        if cmd == ACK {
            match self.dev.status() {
                SdStatus::Listing => self.stream_list(None, com, writer)?,
                SdStatus::Reading => self.stream_read(None, com, writer)?,
                _ => {}
            }
            return Ok(());
        }

        match cmd {
            CMD_LS => {
                let path = path_arg(args);
                self.stream_list(Some(&path), com, writer)?;
            }
            CMD_READ => {
                let path = path_arg(args);
                self.stream_read(Some(&path), com, writer)?;
            }
            CMD_WRITE => self.stream_write(args, com, writer)?,
            CMD_RM => {
                let path = path_arg(args);
                if !self.dev.remove_file(&path) {
                    self.logger.log(Topic::Link, &format!("sd rm failed: {}", path));
                }
            }
            CMD_RUN => {
                let path = path_arg(args);
                if self.runner.start(&path, &mut self.dev, interpreter) {
                    self.logger.log(Topic::Link, &format!("sd running {}", path));
                } else {
                    self.logger.log(Topic::Link, &format!("sd run failed: {}", path));
                }
            }
            CMD_STOP_RUN => {
                self.runner.stop(&mut self.dev, hid);
                self.logger.log(Topic::Link, "sd run stopped");
            }
            CMD_STOP => {
                match self.dev.status() {
                    SdStatus::Reading => self.dev.end_read(),
                    SdStatus::Writing => self.dev.end_write(),
                    SdStatus::Listing => self.dev.end_list(),
                    _ => {}
                }
                self.logger.log(Topic::Link, "sd session aborted");
            }
            other => {
                self.logger
                    .log(Topic::Proto, &format!("sd unknown command 0x{:02X}", other));
            }
        }
        Ok(())
    }

    /// Send the next directory entry as `size_le32 || name`; `path` opens a
    /// new listing session. The stream ends by going back to Idle, which
    /// the driver observes in the heartbeat.
    fn stream_list(
        &mut self,
        path: Option<&str>,
        com: &mut Com,
        writer: &mut LinkWriter,
    ) -> io::Result<()> {
        if let Some(path) = path {
            let start = if path.is_empty() { "/" } else { path };
            if matches!(self.dev.status(), SdStatus::Idle | SdStatus::Error)
                && !self.dev.begin_list(start)
            {
                return Ok(());
            }
        }
        if self.dev.status() != SdStatus::Listing {
            return Ok(());
        }
        if let Some((name, size)) = self.dev.next_file() {
            let mut entry = Vec::with_capacity(4 + name.len());
            entry.extend_from_slice(&size.to_le_bytes());
            entry.extend_from_slice(name.as_bytes());
            com.send_sd_data(writer, &entry)?;
        } else {
            self.dev.end_list();
        }
        Ok(())
    }

    /// Send the next file chunk; `path` opens a new read session.
    fn stream_read(
        &mut self,
        path: Option<&str>,
        com: &mut Com,
        writer: &mut LinkWriter,
    ) -> io::Result<()> {
        if let Some(path) = path {
            if matches!(self.dev.status(), SdStatus::Idle | SdStatus::Error)
                && !self.dev.begin_read(path)
            {
                return Ok(());
            }
        }
        if self.dev.status() != SdStatus::Reading {
            return Ok(());
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.dev.read_chunk(&mut chunk);
        if n > 0 {
            com.send_sd_data(writer, &chunk[..n])?;
        } else {
            self.dev.end_read();
        }
        Ok(())
    }

    /// First frame: `append_flag || path`. Later frames: raw data, ACKed
    /// chunk by chunk; the empty chunk closes the file.
    fn stream_write(
        &mut self,
        data: &[u8],
        com: &mut Com,
        writer: &mut LinkWriter,
    ) -> io::Result<()> {
        if matches!(self.dev.status(), SdStatus::Idle | SdStatus::Error) {
            if data.len() < 3 {
                return Ok(());
            }
            let append = data[0] != 0;
            let path = path_arg(&data[1..]);
            if path.is_empty() || path.len() > MAX_NAME {
                return Ok(());
            }
            self.dev.begin_write(&path, append);
            return Ok(());
        }

        if self.dev.status() != SdStatus::Writing {
            return Ok(());
        }
        if self.dev.write_chunk(data) == 0 {
            self.dev.end_write();
        }
        com.send_sd_data(writer, &[ACK])?;
        Ok(())
    }

    /// Drive the runner one step; returns `false` when the script just
    /// finished (held keys and buttons released, device back to Idle).
    pub fn step_runner(&mut self, interpreter: &mut Interpreter, hid: &mut dyn HidSink) -> bool {
        if self.dev.status() != SdStatus::Executing {
            return true;
        }
        if self.runner.step(interpreter, hid) {
            return true;
        }
        self.runner.stop(&mut self.dev, hid);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dev(files: &[(&str, &str)]) -> (tempfile::TempDir, BlockDev) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        let dev = BlockDev::new(Some(dir.path().to_path_buf()));
        (dir, dev)
    }

    #[test]
    fn test_missing_root_is_not_present() {
        let dev = BlockDev::new(None);
        assert_eq!(dev.status(), SdStatus::NotPresent);
        assert!(!dev.available());
    }

    #[test]
    fn test_extension_filter_at_offset_zero() {
        assert!(has_script_ext("payload.txt"));
        assert!(has_script_ext("payload.TXT"));
        assert!(has_script_ext("a.ds"));
        assert!(has_script_ext("a.DS"));
        assert!(has_script_ext("mod.js"));
        assert!(!has_script_ext("payload.bin"));
        assert!(!has_script_ext("ds"));
        assert!(!has_script_ext("archive.tds"));
    }

    #[test]
    fn test_list_streams_matching_files() {
        let (_dir, mut dev) = make_dev(&[
            ("one.txt", "a"),
            ("two.ds", "bb"),
            ("skip.bin", "ccc"),
        ]);
        assert!(dev.begin_list("/"));
        assert_eq!(dev.status(), SdStatus::Listing);

        let mut seen = Vec::new();
        while let Some((name, size)) = dev.next_file() {
            seen.push((name, size));
        }
        dev.end_list();
        assert_eq!(dev.status(), SdStatus::Idle);

        seen.sort();
        assert_eq!(
            seen,
            [("one.txt".to_string(), 1), ("two.ds".to_string(), 2)]
        );
    }

    #[test]
    fn test_read_session() {
        let (_dir, mut dev) = make_dev(&[("file.txt", "hello block device")]);
        assert!(dev.begin_read("file.txt"));
        let mut buf = [0u8; 8];
        assert_eq!(dev.read_chunk(&mut buf), 8);
        assert_eq!(&buf, b"hello bl");
        dev.end_read();
        assert_eq!(dev.status(), SdStatus::Idle);
    }

    #[test]
    fn test_read_missing_file_is_error() {
        let (_dir, mut dev) = make_dev(&[]);
        assert!(!dev.begin_read("nope.txt"));
        assert_eq!(dev.status(), SdStatus::Error);
    }

    #[test]
    fn test_write_and_append() {
        let (dir, mut dev) = make_dev(&[]);
        assert!(dev.begin_write("out.txt", false));
        assert_eq!(dev.write_chunk(b"abc"), 3);
        dev.end_write();

        assert!(dev.begin_write("out.txt", true));
        assert_eq!(dev.write_chunk(b"def"), 3);
        dev.end_write();

        assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"abcdef");
    }

    #[test]
    fn test_sessions_are_exclusive() {
        let (_dir, mut dev) = make_dev(&[("a.txt", "x"), ("b.txt", "y")]);
        assert!(dev.begin_read("a.txt"));
        // No second session of any kind while the handle is open.
        assert!(!dev.begin_write("b.txt", false));
        assert!(!dev.begin_list("/"));
        assert!(!dev.remove_file("b.txt"));
        dev.end_read();
        assert!(dev.remove_file("b.txt"));
    }

    #[test]
    fn test_remove_file() {
        let (dir, mut dev) = make_dev(&[("gone.txt", "x")]);
        assert!(dev.remove_file("gone.txt"));
        assert!(!dir.path().join("gone.txt").exists());
        assert!(!dev.remove_file("gone.txt"));
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, mut dev) = make_dev(&[]);
        assert!(!dev.begin_read("../outside.txt"));
        assert!(!dev.remove_file("../../etc/passwd"));
    }

    #[test]
    fn test_handler_list_session() {
        use crate::hid::TextHid;
        use crate::logger::Logger;
        use crate::parse_args::Verbosity;
        use duckline_protocol::{Link, LinkAddr, LinkListener, SD_EOT, SD_SOT};
        use duckline_script::Interpreter;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let listener = LinkListener::bind(&LinkAddr::tcp("127.0.0.1:0")).unwrap();
        let addr = listener.addr().clone();
        let drain = std::thread::spawn(move || {
            let link = listener.accept().unwrap();
            let (mut reader, _w) = link.split().unwrap();
            let _ = reader.set_read_timeout(Some(Duration::from_millis(200)));
            let mut all = Vec::new();
            let mut buf = [0u8; 256];
            while let Ok(n) = reader.recv_chunk(&mut buf) {
                if n == 0 {
                    break;
                }
                all.extend_from_slice(&buf[..n]);
            }
            all
        });
        let link = Link::connect(&addr).unwrap();
        let (_r, mut writer) = link.split().unwrap();

        let logger = Logger::stderr(Verbosity::Quiet);
        let mut handler = SdHandler::new(Some(dir.path().to_path_buf()), logger.clone());
        let mut com = crate::com::Com::new();
        let mut interp = Interpreter::new();
        let mut hid = TextHid::new(logger);

        // LS command opens the session and streams the first entry.
        let mut payload = vec![CMD_LS];
        payload.extend_from_slice(b"/\0");
        handler
            .process(&payload, &mut com, &mut writer, &mut interp, &mut hid)
            .unwrap();
        assert_eq!(handler.dev.status(), SdStatus::Listing);

        // The peer ACKs; no entries remain, so the session closes.
        handler
            .process(&[ACK], &mut com, &mut writer, &mut interp, &mut hid)
            .unwrap();
        assert_eq!(handler.dev.status(), SdStatus::Idle);

        drop(writer);
        let wire = drain.join().unwrap();
        // One framed entry: size_le32 (1 byte file) then the name.
        let mut expected = vec![SD_SOT];
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(b"a.txt");
        expected.push(SD_EOT);
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_handler_stop_aborts_session() {
        use crate::hid::TextHid;
        use crate::logger::Logger;
        use crate::parse_args::Verbosity;
        use duckline_protocol::{Link, LinkAddr, LinkListener};
        use duckline_script::Interpreter;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "0123456789").unwrap();

        let listener = LinkListener::bind(&LinkAddr::tcp("127.0.0.1:0")).unwrap();
        let addr = listener.addr().clone();
        let drain = std::thread::spawn(move || {
            let link = listener.accept().unwrap();
            let (mut reader, _w) = link.split().unwrap();
            let _ = reader.set_read_timeout(Some(Duration::from_millis(200)));
            let mut buf = [0u8; 256];
            while let Ok(n) = reader.recv_chunk(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        });
        let link = Link::connect(&addr).unwrap();
        let (_r, mut writer) = link.split().unwrap();

        let logger = Logger::stderr(Verbosity::Quiet);
        let mut handler = SdHandler::new(Some(dir.path().to_path_buf()), logger.clone());
        let mut com = crate::com::Com::new();
        let mut interp = Interpreter::new();
        let mut hid = TextHid::new(logger);

        let mut payload = vec![CMD_READ];
        payload.extend_from_slice(b"f.txt\0");
        handler
            .process(&payload, &mut com, &mut writer, &mut interp, &mut hid)
            .unwrap();
        assert_eq!(handler.dev.status(), SdStatus::Reading);

        handler
            .process(&[CMD_STOP], &mut com, &mut writer, &mut interp, &mut hid)
            .unwrap();
        assert_eq!(handler.dev.status(), SdStatus::Idle);

        drop(writer);
        let _ = drain.join();
    }

    #[test]
    fn test_open_script_sets_executing() {
        let (_dir, mut dev) = make_dev(&[("run.txt", "STRING x\n")]);
        let file = dev.open_script("run.txt");
        assert!(file.is_some());
        assert_eq!(dev.status(), SdStatus::Executing);
        // The handle is exclusive while executing.
        assert!(!dev.begin_read("run.txt"));
        dev.finish_script();
        assert_eq!(dev.status(), SdStatus::Idle);
    }
}
