//! On-executor script runner for block-device-hosted scripts.
//!
//! The streamer and interpreter live in `duckline-script`; this module owns
//! the open file, wires the interpreter in as the streamer's line sink, and
//! makes sure nothing stays held down when a script ends.

use duckline_script::{FileSource, HidSink, Interpreter, LineSink, Streamer};

use crate::blockdev::BlockDev;

/// Arduino-style mouse button values.
const MOUSE_LEFT: u8 = 1;
const MOUSE_RIGHT: u8 = 2;
const MOUSE_MIDDLE: u8 = 4;

struct InterpreterSink<'a> {
    interpreter: &'a mut Interpreter,
    hid: &'a mut dyn HidSink,
}

impl LineSink for InterpreterSink<'_> {
    fn deliver(&mut self, line: &[u8]) {
        self.interpreter.parse(line, self.hid);
    }

    fn repeats(&self) -> u32 {
        self.interpreter.repeats()
    }

    fn loops(&self) -> i32 {
        self.interpreter.loops()
    }
}

pub struct Runner {
    streamer: Streamer,
    source: Option<FileSource>,
    name: String,
}

impl Runner {
    pub fn new() -> Self {
        Runner {
            streamer: Streamer::new(),
            source: None,
            name: String::new(),
        }
    }

    /// Open the script and reset interpreter and streamer state. Fails when
    /// the device is busy or the file cannot be opened.
    pub fn start(&mut self, path: &str, dev: &mut BlockDev, interpreter: &mut Interpreter) -> bool {
        let file = match dev.open_script(path) {
            Some(f) => f,
            None => return false,
        };
        self.source = Some(FileSource::new(file));
        self.streamer.start();
        self.name = path.to_string();
        interpreter.reset();
        true
    }

    pub fn is_running(&self) -> bool {
        self.source.is_some()
    }

    pub fn current_script(&self) -> &str {
        &self.name
    }

    /// One logical step. Returns `false` when the script has finished.
    pub fn step(&mut self, interpreter: &mut Interpreter, hid: &mut dyn HidSink) -> bool {
        let source = match &mut self.source {
            Some(s) => s,
            None => return false,
        };
        let mut sink = InterpreterSink { interpreter, hid };
        self.streamer.step(source, &mut sink)
    }

    /// Close the file and release everything the script may have left held.
    pub fn stop(&mut self, dev: &mut BlockDev, hid: &mut dyn HidSink) {
        self.streamer.stop();
        self.source = None;
        self.name.clear();

        hid.mouse_release(MOUSE_LEFT);
        hid.mouse_release(MOUSE_RIGHT);
        hid.mouse_release(MOUSE_MIDDLE);
        hid.mouse_move(0, 0);
        hid.release();

        dev.finish_script();
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckline_protocol::secondary::SdStatus;
    use duckline_script::KeyReport;
    use std::fs;

    #[derive(Default)]
    struct Capture {
        typed: Vec<u8>,
        mouse_releases: Vec<u8>,
        released: bool,
    }

    impl HidSink for Capture {
        fn type_text(&mut self, text: &[u8]) {
            self.typed.extend_from_slice(text);
        }
        fn press_char(&mut self, ch: &[u8]) {
            self.typed.extend_from_slice(ch);
        }
        fn press_key(&mut self, _key: u8) {}
        fn press_modifier(&mut self, _bit: u8) {}
        fn release(&mut self) {
            self.released = true;
        }
        fn send_report(&mut self, _report: &KeyReport) {}
        fn set_locale(&mut self, _code: &[u8]) {}
        fn set_led(&mut self, _r: u8, _g: u8, _b: u8) {}
        fn mouse_move(&mut self, _x: i32, _y: i32) {}
        fn mouse_click(&mut self, _button: u8) {}
        fn mouse_press(&mut self, _button: u8) {}
        fn mouse_release(&mut self, button: u8) {
            self.mouse_releases.push(button);
        }
        fn mouse_scroll(&mut self, _amount: i32) {}
    }

    #[test]
    fn test_run_script_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("go.txt"), "STRING ab\nREPEAT 1\n").unwrap();
        let mut dev = BlockDev::new(Some(dir.path().to_path_buf()));
        let mut interp = Interpreter::new();
        let mut hid = Capture::default();
        let mut runner = Runner::new();

        assert!(runner.start("go.txt", &mut dev, &mut interp));
        assert_eq!(dev.status(), SdStatus::Executing);

        while runner.step(&mut interp, &mut hid) {}
        runner.stop(&mut dev, &mut hid);

        assert_eq!(hid.typed, b"abab");
        assert_eq!(dev.status(), SdStatus::Idle);
        assert!(hid.released);
        assert_eq!(hid.mouse_releases, [MOUSE_LEFT, MOUSE_RIGHT, MOUSE_MIDDLE]);
    }

    #[test]
    fn test_start_fails_when_busy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "STRING a\n").unwrap();
        fs::write(dir.path().join("b.txt"), "STRING b\n").unwrap();
        let mut dev = BlockDev::new(Some(dir.path().to_path_buf()));
        let mut interp = Interpreter::new();
        let mut runner = Runner::new();

        assert!(dev.begin_read("a.txt"));
        assert!(!runner.start("b.txt", &mut dev, &mut interp));
        dev.end_read();
        assert!(runner.start("b.txt", &mut dev, &mut interp));
    }

    #[test]
    fn test_stop_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("loop.txt"), "LOOP_BEGIN 0\nSTRING x\nLOOP_END\n").unwrap();
        let mut dev = BlockDev::new(Some(dir.path().to_path_buf()));
        let mut interp = Interpreter::new();
        let mut hid = Capture::default();
        let mut runner = Runner::new();

        assert!(runner.start("loop.txt", &mut dev, &mut interp));
        for _ in 0..50 {
            assert!(runner.step(&mut interp, &mut hid));
        }
        runner.stop(&mut dev, &mut hid);
        assert!(!runner.is_running());
        assert_eq!(dev.status(), SdStatus::Idle);
        assert!(!runner.step(&mut interp, &mut hid));
    }
}
