//! The line interpreter: turns script text into HID actions.
//!
//! One [`Interpreter`] instance lives on the executor node. Each call to
//! [`Interpreter::parse`] handles one buffer, which may hold one line,
//! several lines, or a fragment of a long line. Continuation flags persist
//! across calls so a line split across buffer boundaries resumes in the
//! same mode.

use std::time::{Duration, Instant};

use crate::keys::{self, KeyReport};
use crate::tokenizer::{Line, Tokenizer};

/// Receiver for everything the interpreter emits. The real HID device,
/// LEDs and locale tables live behind this seam.
pub trait HidSink {
    /// Type raw text (STRING payloads and LSTRING lines).
    fn type_text(&mut self, text: &[u8]);
    /// Press one character, single- or multi-byte.
    fn press_char(&mut self, ch: &[u8]);
    /// Press a named key by usage ID.
    fn press_key(&mut self, key: u8);
    /// Press a modifier by report bit.
    fn press_modifier(&mut self, bit: u8);
    /// Release every held key and modifier.
    fn release(&mut self);
    /// Send a raw keyboard report, then release.
    fn send_report(&mut self, report: &KeyReport);
    fn set_locale(&mut self, code: &[u8]);
    fn set_led(&mut self, r: u8, g: u8, b: u8);
    fn mouse_move(&mut self, x: i32, y: i32);
    fn mouse_click(&mut self, button: u8);
    fn mouse_press(&mut self, button: u8);
    fn mouse_release(&mut self, button: u8);
    fn mouse_scroll(&mut self, amount: i32);
}

/// Parse an unsigned integer: decimal, or hex with an `0x` prefix.
/// Unrecognized bytes are skipped, empty input is 0.
fn to_int(s: &[u8]) -> u32 {
    if s.len() > 2 && s[0] == b'0' && s[1] == b'x' {
        let mut val: u32 = 0;
        for &b in &s[2..] {
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                b'A'..=b'F' => b - b'A' + 10,
                _ => continue,
            };
            val = (val << 4) | digit as u32;
        }
        val
    } else {
        let mut val: u32 = 0;
        for &b in s {
            if b.is_ascii_digit() {
                val = val.wrapping_mul(10).wrapping_add((b - b'0') as u32);
            }
        }
        val
    }
}

/// Parse a signed integer: an optional leading `-`, then [`to_int`] rules.
fn to_signed_int(s: &[u8]) -> i32 {
    if !s.is_empty() && s[0] == b'-' && s.len() > 1 {
        -(to_int(&s[1..]) as i32)
    } else {
        to_int(s) as i32
    }
}

pub struct Interpreter {
    in_string: bool,
    is_stringln: bool,
    in_lstring: bool,
    in_comment: bool,
    in_loop: bool,

    default_delay_ms: u32,
    repeat_num: u32,
    loop_num: i32,

    interpret_start: Instant,
    sleep_start: Instant,
    sleep_dur: Duration,
}

impl Interpreter {
    pub fn new() -> Self {
        let now = Instant::now();
        Interpreter {
            in_string: false,
            is_stringln: false,
            in_lstring: false,
            in_comment: false,
            in_loop: false,
            default_delay_ms: 5,
            repeat_num: 0,
            loop_num: 0,
            interpret_start: now,
            sleep_start: now,
            sleep_dur: Duration::ZERO,
        }
    }

    /// Zero all flags and counters and restore the default delay.
    pub fn reset(&mut self) {
        self.in_string = false;
        self.is_stringln = false;
        self.in_lstring = false;
        self.in_comment = false;
        self.in_loop = false;
        self.default_delay_ms = 5;
        self.repeat_num = 0;
        self.loop_num = 0;
    }

    /// REPEAT iterations still pending.
    pub fn repeats(&self) -> u32 {
        self.repeat_num
    }

    /// LOOP iterations remaining; -1 means infinite.
    pub fn loops(&self) -> i32 {
        self.loop_num
    }

    pub fn in_string(&self) -> bool {
        self.in_string
    }

    pub fn in_lstring(&self) -> bool {
        self.in_lstring
    }

    /// Milliseconds left on the current sleep deadline.
    pub fn delay_remaining_ms(&self) -> u64 {
        let finish = self.sleep_start + self.sleep_dur;
        finish
            .saturating_duration_since(Instant::now())
            .as_millis() as u64
    }

    /// Set the sleep deadline, compensated by the time already spent
    /// interpreting this line, so the wall-clock delay from line arrival
    /// matches what the script asked for.
    fn sleep(&mut self, ms: u32) {
        let offset = self.interpret_start.elapsed();
        let wanted = Duration::from_millis(ms as u64);
        if wanted > offset {
            self.sleep_start = Instant::now();
            self.sleep_dur = wanted - offset;
        }
    }

    /// Parse and execute one buffer of script text.
    pub fn parse(&mut self, buf: &[u8], sink: &mut dyn HidSink) {
        self.interpret_start = Instant::now();

        let mut tokenizer = Tokenizer::new();
        tokenizer.parse(buf);

        for index in 0..tokenizer.line_count() {
            // A pending delay must elapse before the next line of the same
            // buffer runs; across buffers the tick loop enforces it instead.
            if index > 0 {
                let remaining = self.delay_remaining_ms();
                if remaining > 0 {
                    std::thread::sleep(Duration::from_millis(remaining));
                }
            }
            if let Some(line) = tokenizer.line(index, buf) {
                self.handle_line(line, sink);
            }
        }
    }

    fn handle_line(&mut self, line: Line<'_>, sink: &mut dyn HidSink) {
        let text = line.text();
        let terminated = line.terminated();
        let cmd = line.word(0).unwrap_or(&[]);
        // Argument part of the line, after the command word and one space.
        let rest = text.get(cmd.len() + 1..).unwrap_or(&[]);

        let mut ignore_delay = false;

        // LSTRING block: every line is typed raw, terminators included.
        if self.in_lstring || cmd.starts_with(b"LSTRING_") {
            if !self.in_lstring && cmd.len() >= 13 && &cmd[8..13] == b"BEGIN" {
                ignore_delay = true;
                self.in_lstring = true;
            } else if self.in_lstring && cmd == b"LSTRING_END" {
                ignore_delay = true;
                self.in_lstring = false;
            } else if self.in_lstring {
                sink.type_text(text);
                if terminated {
                    sink.press_key(keys::keycode::ENTER);
                    sink.release();
                }
            }
        }
        // STRING / STRINGLN: type the remainder verbatim.
        else if self.in_string || cmd == b"STRING" || cmd == b"STRINGLN" {
            if self.in_string {
                sink.type_text(text);
            } else {
                self.is_stringln = cmd == b"STRINGLN";
                let offset = if self.is_stringln { 9 } else { 7 };
                if text.len() > offset {
                    sink.type_text(&text[offset..]);
                }
            }

            self.in_string = !terminated;

            if terminated && self.is_stringln {
                self.is_stringln = false;
                sink.press_key(keys::keycode::ENTER);
                sink.release();
            }
        }
        // REM: comment, may span fragments.
        else if self.in_comment || cmd == b"REM" {
            self.in_comment = !terminated;
            ignore_delay = true;
        }
        // LOCALE: switch the keyboard layout table.
        else if cmd == b"LOCALE" {
            if let Some(code) = line.word(1) {
                sink.set_locale(code);
            }
            ignore_delay = true;
        }
        // DELAY: sleep, compensated by interpretation time.
        else if cmd == b"DELAY" {
            self.sleep(to_int(rest));
            ignore_delay = true;
        }
        // DEFAULT_DELAY: implicit inter-command delay.
        else if cmd == b"DEFAULT_DELAY" {
            self.default_delay_ms = to_int(rest);
            ignore_delay = true;
        }
        // REPEAT: the epilogue decrements once on this very line, leaving N.
        else if cmd == b"REPEAT" {
            self.repeat_num = to_int(rest) + 1;
            ignore_delay = true;
        }
        // LOOP_BEGIN: a second one inside a loop is ignored.
        else if cmd == b"LOOP_BEGIN" {
            if !self.in_loop {
                self.loop_num = to_signed_int(rest);
                self.in_loop = true;
                if self.loop_num < 0 {
                    self.loop_num = -1;
                }
            }
            ignore_delay = true;
        }
        // LOOP_END: -1 is sticky (infinite).
        else if cmd == b"LOOP_END" {
            if self.in_loop {
                if self.loop_num - 1 == 0 {
                    self.loop_num -= 1;
                    self.in_loop = false;
                } else if self.loop_num <= 0 {
                    self.loop_num = -1;
                } else {
                    self.loop_num -= 1;
                }
            }
            ignore_delay = true;
        }
        // LED r g b
        else if cmd == b"LED" {
            let mut rgb = [0u8; 3];
            for (i, slot) in rgb.iter_mut().enumerate() {
                if let Some(word) = line.word(1 + i) {
                    *slot = to_int(word) as u8;
                }
            }
            sink.set_led(rgb[0], rgb[1], rgb[2]);
        }
        // Mouse actions
        else if cmd == b"M_MOVE" {
            let x = line.word(1).map(to_signed_int).unwrap_or(0);
            let y = line.word(2).map(to_signed_int).unwrap_or(0);
            sink.mouse_move(x, y);
        } else if cmd == b"M_CLICK" {
            let button = line.word(1).map(to_int).unwrap_or(0) as u8;
            sink.mouse_click(button);
        } else if cmd == b"M_PRESS" {
            let button = line.word(1).map(to_int).unwrap_or(0) as u8;
            sink.mouse_press(button);
        } else if cmd == b"M_RELEASE" {
            let button = line.word(1).map(to_int).unwrap_or(0) as u8;
            sink.mouse_release(button);
        } else if cmd == b"M_SCROLL" {
            let amount = line.word(1).map(to_signed_int).unwrap_or(0);
            sink.mouse_scroll(amount);
        }
        // KEYCODE mod k1..k6: raw report, missing keycodes zero-filled.
        else if cmd == b"KEYCODE" {
            if let Some(modifiers) = line.word(1) {
                let mut report = KeyReport {
                    modifiers: to_int(modifiers) as u8,
                    ..KeyReport::default()
                };
                for (i, key) in report.keys.iter_mut().enumerate() {
                    if let Some(word) = line.word(2 + i) {
                        *key = to_int(word) as u8;
                    }
                }
                sink.send_report(&report);
                sink.release();
            }
        }
        // Anything else: a sequence of key tokens.
        else {
            for word in line.words() {
                press_word(word, sink);
            }
            if terminated {
                sink.release();
            }
        }

        // Per-command epilogue.
        if !self.in_lstring
            && !self.is_stringln
            && !self.in_string
            && !self.in_comment
            && !ignore_delay
        {
            let delay = self.default_delay_ms;
            self.sleep(delay);
        }
        if terminated && !self.in_lstring && self.repeat_num > 0 {
            self.repeat_num -= 1;
        }
        self.interpret_start = Instant::now();
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve one token and press it: single character, then named key,
/// then modifier, then multi-byte character.
fn press_word(word: &[u8], sink: &mut dyn HidSink) {
    if word.len() == 1 {
        sink.press_char(word);
    } else if let Some(key) = keys::lookup_key(word) {
        sink.press_key(key);
    } else if let Some(bit) = keys::lookup_modifier(word) {
        sink.press_modifier(bit);
    } else {
        sink.press_char(word);
    }
}
