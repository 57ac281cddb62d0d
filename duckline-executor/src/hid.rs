//! Text rendition of the HID device.
//!
//! The executor has no USB port in this build; typed text goes to stdout
//! and key, mouse and LED events go to the logger. This is enough to watch
//! a script run and to drive the node end-to-end.

use std::io::Write;

use duckline_script::{keycode, HidSink, KeyReport};

use crate::logger::{Logger, Topic};

pub struct TextHid {
    logger: Logger,
}

impl TextHid {
    pub fn new(logger: Logger) -> Self {
        TextHid { logger }
    }

    fn emit(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

impl HidSink for TextHid {
    fn type_text(&mut self, text: &[u8]) {
        self.logger.log(
            Topic::Proto,
            &format!("hid type {:?}", String::from_utf8_lossy(text)),
        );
        self.emit(text);
    }

    fn press_char(&mut self, ch: &[u8]) {
        self.logger.log(
            Topic::Wire,
            &format!("hid char {:?}", String::from_utf8_lossy(ch)),
        );
        self.emit(ch);
    }

    fn press_key(&mut self, key: u8) {
        self.logger.log(Topic::Proto, &format!("hid key 0x{:02X}", key));
        if key == keycode::ENTER {
            self.emit(b"\n");
        }
    }

    fn press_modifier(&mut self, bit: u8) {
        self.logger
            .log(Topic::Proto, &format!("hid modifier 0x{:02X}", bit));
    }

    fn release(&mut self) {
        self.logger.log(Topic::Wire, "hid release");
    }

    fn send_report(&mut self, report: &KeyReport) {
        self.logger.log(
            Topic::Proto,
            &format!(
                "hid report mod=0x{:02X} keys={:02X?}",
                report.modifiers, report.keys
            ),
        );
    }

    fn set_locale(&mut self, code: &[u8]) {
        self.logger.log(
            Topic::Link,
            &format!("hid locale {}", String::from_utf8_lossy(code)),
        );
    }

    fn set_led(&mut self, r: u8, g: u8, b: u8) {
        self.logger
            .log(Topic::Link, &format!("hid led {} {} {}", r, g, b));
    }

    fn mouse_move(&mut self, x: i32, y: i32) {
        self.logger
            .log(Topic::Proto, &format!("hid mouse move {} {}", x, y));
    }

    fn mouse_click(&mut self, button: u8) {
        self.logger
            .log(Topic::Proto, &format!("hid mouse click {}", button));
    }

    fn mouse_press(&mut self, button: u8) {
        self.logger
            .log(Topic::Proto, &format!("hid mouse press {}", button));
    }

    fn mouse_release(&mut self, button: u8) {
        self.logger
            .log(Topic::Wire, &format!("hid mouse release {}", button));
    }

    fn mouse_scroll(&mut self, amount: i32) {
        self.logger
            .log(Topic::Proto, &format!("hid mouse scroll {}", amount));
    }
}
