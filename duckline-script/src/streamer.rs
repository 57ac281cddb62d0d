//! Per-tick script streamer with REPEAT and LOOP bookmarking.
//!
//! The same streamer runs on both nodes: the driver feeds lines into the
//! link (flash-hosted scripts), the executor feeds them straight into its
//! interpreter (block-device-hosted scripts). The two differences, where
//! bytes come from and where lines go, sit behind the [`ScriptSource`] and
//! [`LineSink`] seams.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use duckline_protocol::BUFFER_SIZE;

/// Byte-level access to an open script file.
pub trait ScriptSource {
    /// Next byte without consuming it; `None` at end of file.
    fn peek(&mut self) -> Option<u8>;
    /// Consume and return the next byte; `None` at end of file.
    fn read_byte(&mut self) -> Option<u8>;
    /// Absolute offset of the next unread byte.
    fn tell(&self) -> u64;
    /// Seek to an absolute offset.
    fn seek(&mut self, pos: u64) -> bool;
}

/// Where delivered lines go, with read-backs for the REPEAT and LOOP
/// counters. On the executor the read-backs come straight from the
/// interpreter; on the driver they reflect the last received status record.
pub trait LineSink {
    fn deliver(&mut self, line: &[u8]);
    /// REPEAT iterations pending after the delivered line.
    fn repeats(&self) -> u32;
    /// LOOP iterations remaining; -1 means infinite.
    fn loops(&self) -> i32;
}

/// [`ScriptSource`] over a [`File`] with one byte of lookahead.
pub struct FileSource {
    file: File,
    pos: u64,
    peeked: Option<u8>,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        FileSource {
            file,
            pos: 0,
            peeked: None,
        }
    }
}

impl ScriptSource for FileSource {
    fn peek(&mut self) -> Option<u8> {
        if self.peeked.is_none() {
            let mut byte = [0u8; 1];
            match self.file.read(&mut byte) {
                Ok(1) => self.peeked = Some(byte[0]),
                _ => return None,
            }
        }
        self.peeked
    }

    fn read_byte(&mut self) -> Option<u8> {
        let byte = match self.peeked.take() {
            Some(b) => b,
            None => {
                let mut buf = [0u8; 1];
                match self.file.read(&mut buf) {
                    Ok(1) => buf[0],
                    _ => return None,
                }
            }
        };
        self.pos += 1;
        Some(byte)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> bool {
        self.peeked = None;
        match self.file.seek(SeekFrom::Start(pos)) {
            Ok(_) => {
                self.pos = pos;
                true
            }
            Err(_) => false,
        }
    }
}

/// Infer a UTF-8 sequence width from its leading byte.
fn utf8_width(lead: u8) -> usize {
    if lead & 0x80 == 0x00 {
        1
    } else if lead & 0xE0 == 0xC0 {
        2
    } else if lead & 0xF0 == 0xE0 {
        3
    } else if lead & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

/// Deferred loop-control action for a line that just completed.
#[derive(Debug, Clone, Copy)]
enum LoopMark {
    Begin,
    End,
}

pub struct Streamer {
    buf: [u8; BUFFER_SIZE],
    read: usize,

    running: bool,
    in_fragment: bool,
    in_lstring: bool,
    in_loop: bool,
    loop_infinite: bool,
    repeat_active: bool,

    cur_pos: u64,
    last_pos: u64,
    after_repeat: u64,
    loop_pos: u64,

    pending_loop: Option<LoopMark>,
    marked_pos: u64,
}

impl Streamer {
    pub fn new() -> Self {
        Streamer {
            buf: [0; BUFFER_SIZE],
            read: 0,
            running: false,
            in_fragment: false,
            in_lstring: false,
            in_loop: false,
            loop_infinite: false,
            repeat_active: false,
            cur_pos: 0,
            last_pos: 0,
            after_repeat: 0,
            loop_pos: 0,
            pending_loop: None,
            marked_pos: 0,
        }
    }

    /// Zero all bookmarks and flags and mark the streamer running.
    /// The caller opens the file and owns the [`ScriptSource`].
    pub fn start(&mut self) {
        *self = Streamer::new();
        self.running = true;
    }

    /// Drop transient state. The caller closes the file.
    pub fn stop(&mut self) {
        self.running = false;
        self.in_fragment = false;
        self.in_lstring = false;
        self.in_loop = false;
        self.loop_infinite = false;
        self.repeat_active = false;
        self.pending_loop = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance one logical step: one line, one fragment, or one repeat
    /// re-delivery. Returns `true` while there is more work. Call once per
    /// tick; on the driver, once per actionable status.
    pub fn step<S: ScriptSource, K: LineSink>(&mut self, src: &mut S, sink: &mut K) -> bool {
        if !self.running && !self.in_loop && sink.repeats() == 0 {
            return false;
        }

        // Settle the loop action of the previously completed line now that
        // the sink's counters have caught up with it.
        if let Some(mark) = self.pending_loop.take() {
            match mark {
                LoopMark::Begin => {
                    if !self.in_lstring && !self.in_loop {
                        self.in_loop = true;
                        self.loop_pos = self.marked_pos;
                        self.loop_infinite = sink.loops() <= 0;
                    }
                }
                LoopMark::End => {
                    if !self.in_lstring && self.in_loop {
                        if sink.loops() == 0 && !self.loop_infinite {
                            self.in_loop = false;
                        } else {
                            src.seek(self.loop_pos);
                        }
                    }
                }
            }
        }

        // Re-deliver the bookmarked line while repetitions are pending.
        let pending = sink.repeats().min(255);
        if pending > 0 {
            if !self.in_fragment && !self.in_lstring {
                src.seek(self.last_pos);
            }
            self.get_line(src);
            sink.deliver(&self.buf[..self.read]);
            self.sync_lstring();
            // The executor's counter drops as soon as the line is parsed;
            // the driver sees the drop in a later status and resumes via
            // the entry check below.
            if self.repeat_active
                && sink.repeats() == 0
                && !self.in_fragment
                && !self.in_lstring
            {
                self.repeat_active = false;
                src.seek(self.after_repeat);
            }
            return true;
        }
        if self.repeat_active {
            self.repeat_active = false;
            if !self.in_fragment && !self.in_lstring {
                src.seek(self.after_repeat);
            }
        }

        if !self.running {
            return false;
        }

        if !self.in_fragment {
            self.cur_pos = src.tell();
        }

        self.get_line(src);

        if self.read == 0 {
            self.stop();
            return false;
        }

        sink.deliver(&self.buf[..self.read]);

        // A REPEAT line hands control to the repeat branch above; the seek
        // target for resuming afterwards is the position right behind it.
        if self.starts_with(b"REPEAT") {
            self.after_repeat = src.tell();
            self.in_fragment = false;
            self.repeat_active = true;
            return true;
        }

        if self.in_fragment {
            return true;
        }

        // The line is complete. It becomes the REPEAT target unless we are
        // inside an LSTRING block (raw text is not a command).
        if !self.in_lstring {
            self.last_pos = self.cur_pos;
        }
        self.sync_lstring();

        if !self.in_lstring {
            if self.starts_with(b"LOOP_BEGIN") {
                self.pending_loop = Some(LoopMark::Begin);
                self.marked_pos = src.tell();
            } else if self.starts_with(b"LOOP_END") {
                self.pending_loop = Some(LoopMark::End);
            }
        }

        true
    }

    fn starts_with(&self, prefix: &[u8]) -> bool {
        self.read >= prefix.len() && &self.buf[..prefix.len()] == prefix
    }

    /// Track LSTRING block boundaries from the delivered line. Runs during
    /// repeats too, so repeating over a block boundary stays in sync.
    fn sync_lstring(&mut self) {
        if !self.in_lstring && self.starts_with(b"LSTRING_BEGIN") {
            self.in_lstring = true;
        } else if self.in_lstring && self.starts_with(b"LSTRING_END") {
            self.in_lstring = false;
        }
    }

    /// Fill the line buffer, stopping at a newline, the buffer edge, or end
    /// of file.
    ///
    /// UTF-8 safe: the width of each character is inferred from its leading
    /// byte before reading, and a character that would not fit in the
    /// remaining space is left for the next call (`in_fragment` set).
    /// `\r` normalizes to `\n`, runs of newlines collapse into one, and end
    /// of file mid-line synthesizes a trailing `\n` so downstream always
    /// sees a complete line.
    fn get_line<S: ScriptSource>(&mut self, src: &mut S) {
        self.read = 0;
        while self.read < BUFFER_SIZE - 1 {
            let mut need = 1;
            if let Some(lead) = src.peek() {
                need = utf8_width(lead);
                if self.read + need > BUFFER_SIZE - 1 {
                    self.in_fragment = true;
                    break;
                }
            }

            let mut stop = false;
            for _ in 0..need {
                match src.read_byte() {
                    None => {
                        // End of file: close out the line.
                        self.running = false;
                        self.in_fragment = false;
                        self.buf[self.read] = b'\n';
                        self.read += 1;
                        stop = true;
                        break;
                    }
                    Some(mut byte) => {
                        if byte == b'\r' {
                            byte = b'\n';
                        }
                        self.buf[self.read] = byte;
                        self.read += 1;
                        if byte == b'\n' {
                            while src.peek() == Some(b'\n') {
                                src.read_byte();
                            }
                            self.in_fragment = false;
                            stop = true;
                            break;
                        }
                    }
                }
            }

            if stop {
                break;
            }
            self.in_fragment = true;
        }
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{HidSink, Interpreter};
    use crate::keys::KeyReport;
    use std::io::Write;

    /// In-memory script source.
    struct MemSource {
        data: Vec<u8>,
        pos: u64,
    }

    impl MemSource {
        fn new(data: &[u8]) -> Self {
            MemSource {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl ScriptSource for MemSource {
        fn peek(&mut self) -> Option<u8> {
            self.data.get(self.pos as usize).copied()
        }
        fn read_byte(&mut self) -> Option<u8> {
            let byte = self.data.get(self.pos as usize).copied()?;
            self.pos += 1;
            Some(byte)
        }
        fn tell(&self) -> u64 {
            self.pos
        }
        fn seek(&mut self, pos: u64) -> bool {
            self.pos = pos;
            true
        }
    }

    /// Sink that feeds a real interpreter and records what gets typed.
    #[derive(Default)]
    struct TypeCapture {
        typed: Vec<u8>,
        releases: usize,
    }

    impl HidSink for TypeCapture {
        fn type_text(&mut self, text: &[u8]) {
            self.typed.extend_from_slice(text);
        }
        fn press_char(&mut self, ch: &[u8]) {
            self.typed.extend_from_slice(ch);
        }
        fn press_key(&mut self, _key: u8) {}
        fn press_modifier(&mut self, _bit: u8) {}
        fn release(&mut self) {
            self.releases += 1;
        }
        fn send_report(&mut self, _report: &KeyReport) {}
        fn set_locale(&mut self, _code: &[u8]) {}
        fn set_led(&mut self, _r: u8, _g: u8, _b: u8) {}
        fn mouse_move(&mut self, _x: i32, _y: i32) {}
        fn mouse_click(&mut self, _button: u8) {}
        fn mouse_press(&mut self, _button: u8) {}
        fn mouse_release(&mut self, _button: u8) {}
        fn mouse_scroll(&mut self, _amount: i32) {}
    }

    struct InterpSink {
        interp: Interpreter,
        hid: TypeCapture,
    }

    impl InterpSink {
        fn new() -> Self {
            InterpSink {
                interp: Interpreter::new(),
                hid: TypeCapture::default(),
            }
        }
    }

    impl LineSink for InterpSink {
        fn deliver(&mut self, line: &[u8]) {
            self.interp.parse(line, &mut self.hid);
        }
        fn repeats(&self) -> u32 {
            self.interp.repeats()
        }
        fn loops(&self) -> i32 {
            self.interp.loops()
        }
    }

    fn run_script(script: &[u8]) -> InterpSink {
        run_script_capped(script, 10_000)
    }

    fn run_script_capped(script: &[u8], max_steps: usize) -> InterpSink {
        let mut src = MemSource::new(script);
        let mut sink = InterpSink::new();
        let mut streamer = Streamer::new();
        streamer.start();
        for _ in 0..max_steps {
            if !streamer.step(&mut src, &mut sink) {
                break;
            }
        }
        sink
    }

    #[test]
    fn test_plain_script() {
        let sink = run_script(b"STRING hello\nSTRING world\n");
        assert_eq!(sink.hid.typed, b"helloworld");
    }

    #[test]
    fn test_repeat_runs_line_n_plus_one_times() {
        let sink = run_script(b"STRING a\nREPEAT 3\n");
        assert_eq!(sink.hid.typed, b"aaaa");
    }

    #[test]
    fn test_repeat_zero_runs_once() {
        let sink = run_script(b"STRING a\nREPEAT 0\n");
        assert_eq!(sink.hid.typed, b"a");
    }

    #[test]
    fn test_repeat_resumes_after_block() {
        let sink = run_script(b"STRING a\nREPEAT 2\nSTRING z\n");
        assert_eq!(sink.hid.typed, b"aaaz");
    }

    #[test]
    fn test_repeat_of_multiline_lstring() {
        // REPEAT after LSTRING_END re-runs the block's last raw line? No:
        // last_pos freezes at LSTRING_BEGIN while inside the block, so the
        // repeat target is the command before the raw text was left behind.
        let sink = run_script(b"STRING x\nLSTRING_BEGIN\nraw\nLSTRING_END\nSTRING y\nREPEAT 1\n");
        assert_eq!(sink.hid.typed, b"xrawyy");
    }

    #[test]
    fn test_loop_runs_body_k_times() {
        let sink = run_script(b"LOOP_BEGIN 2\nSTRING x\nLOOP_END\n");
        assert_eq!(sink.hid.typed, b"xx");
    }

    #[test]
    fn test_loop_with_trailing_command() {
        let sink = run_script(b"LOOP_BEGIN 3\nSTRING a\nLOOP_END\nSTRING b\n");
        assert_eq!(sink.hid.typed, b"aaab");
    }

    #[test]
    fn test_loop_zero_is_infinite() {
        let sink = run_script_capped(b"LOOP_BEGIN 0\nSTRING x\nLOOP_END\n", 500);
        // Still going after 500 steps; the body ran for many of them.
        assert!(sink.hid.typed.len() > 50);
    }

    #[test]
    fn test_loop_negative_is_infinite() {
        let sink = run_script_capped(b"LOOP_BEGIN -3\nSTRING x\nLOOP_END\n", 500);
        assert!(sink.hid.typed.len() > 50);
    }

    #[test]
    fn test_nested_loop_begin_ignored() {
        let sink = run_script(b"LOOP_BEGIN 2\nLOOP_BEGIN 2\nSTRING x\nLOOP_END\nSTRING y\n");
        // The inner LOOP_BEGIN is ignored; LOOP_END closes the outer loop.
        assert_eq!(sink.hid.typed, b"xxy");
    }

    #[test]
    fn test_missing_trailing_newline() {
        let sink = run_script(b"STRING no newline");
        assert_eq!(sink.hid.typed, b"no newline");
        assert!(!sink.interp.in_string());
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let sink = run_script(b"STRING a\r\n\r\n\nSTRING b\r\n");
        assert_eq!(sink.hid.typed, b"ab");
    }

    #[test]
    fn test_long_line_fragments() {
        // A STRING line longer than the buffer is delivered in fragments
        // with in_string persisting across them.
        let payload: Vec<u8> = (0..3 * BUFFER_SIZE)
            .map(|i| b'a' + (i % 26) as u8)
            .collect();
        let mut script = b"STRING ".to_vec();
        script.extend_from_slice(&payload);
        script.push(b'\n');
        script.extend_from_slice(b"STRING end\n");

        let mut src = MemSource::new(&script);
        let mut sink = InterpSink::new();
        let mut streamer = Streamer::new();
        streamer.start();

        let mut fragments = 0;
        loop {
            let more = streamer.step(&mut src, &mut sink);
            if sink.interp.in_string() {
                fragments += 1;
            }
            if !more {
                break;
            }
        }
        assert!(fragments >= 2, "expected multiple fragments, got {}", fragments);
        let mut expected = payload.clone();
        expected.extend_from_slice(b"end");
        assert_eq!(sink.hid.typed, expected);
    }

    #[test]
    fn test_utf8_never_split_across_fills() {
        // 3-byte characters with a prefix sized so the buffer edge falls
        // mid-character; the streamer must hold the whole character back.
        let mut script = b"STRING ".to_vec();
        for _ in 0..BUFFER_SIZE {
            script.extend_from_slice("\u{20AC}".as_bytes());
        }
        script.push(b'\n');

        struct CollectSink(Vec<Vec<u8>>);
        impl LineSink for CollectSink {
            fn deliver(&mut self, line: &[u8]) {
                self.0.push(line.to_vec());
            }
            fn repeats(&self) -> u32 {
                0
            }
            fn loops(&self) -> i32 {
                0
            }
        }

        let mut src = MemSource::new(&script);
        let mut streamer = Streamer::new();
        streamer.start();
        let mut collect = CollectSink(Vec::new());
        while streamer.step(&mut src, &mut collect) {}
        let deliveries = collect.0;

        assert!(deliveries.len() >= 2);
        for chunk in &deliveries {
            let text = chunk.strip_suffix(b"\n").unwrap_or(chunk);
            let text = text.strip_prefix(b"STRING ").unwrap_or(text);
            assert!(
                std::str::from_utf8(text).is_ok(),
                "fragment split a character: {:?}",
                chunk
            );
        }
    }

    #[test]
    fn test_file_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"STRING from disk\nSTRING two\n").unwrap();
        tmp.flush().unwrap();

        let file = std::fs::File::open(tmp.path()).unwrap();
        let mut src = FileSource::new(file);
        assert_eq!(src.peek(), Some(b'S'));
        assert_eq!(src.tell(), 0);
        assert_eq!(src.read_byte(), Some(b'S'));
        assert_eq!(src.tell(), 1);
        assert!(src.seek(0));

        let mut sink = InterpSink::new();
        let mut streamer = Streamer::new();
        streamer.start();
        while streamer.step(&mut src, &mut sink) {}
        assert_eq!(sink.hid.typed, b"from disktwo");
    }

    #[test]
    fn test_repeat_with_file_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"STRING go\nREPEAT 2\n").unwrap();
        tmp.flush().unwrap();

        let file = std::fs::File::open(tmp.path()).unwrap();
        let mut src = FileSource::new(file);
        let mut sink = InterpSink::new();
        let mut streamer = Streamer::new();
        streamer.start();
        while streamer.step(&mut src, &mut sink) {}
        assert_eq!(sink.hid.typed, b"gogogo");
    }

    #[test]
    fn test_stop_mid_script() {
        let mut src = MemSource::new(b"STRING a\nSTRING b\nSTRING c\n");
        let mut sink = InterpSink::new();
        let mut streamer = Streamer::new();
        streamer.start();
        streamer.step(&mut src, &mut sink);
        streamer.stop();
        assert!(!streamer.step(&mut src, &mut sink));
        assert_eq!(sink.hid.typed, b"a");
    }
}
