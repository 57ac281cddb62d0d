//! HID usage codes and key-token resolution.
//!
//! The HID transmit layer itself lives on the other side of [`crate::HidSink`];
//! this module only knows the names a script may use and the usage IDs they
//! map to.

use crate::tokenizer::{matches_template, Case};

/// Keyboard usage IDs (USB HID usage page 0x07).
pub mod keycode {
    pub const ENTER: u8 = 0x28;
    pub const ESC: u8 = 0x29;
    pub const BACKSPACE: u8 = 0x2A;
    pub const TAB: u8 = 0x2B;
    pub const SPACE: u8 = 0x2C;
    pub const CAPSLOCK: u8 = 0x39;
    pub const F1: u8 = 0x3A;
    pub const F2: u8 = 0x3B;
    pub const F3: u8 = 0x3C;
    pub const F4: u8 = 0x3D;
    pub const F5: u8 = 0x3E;
    pub const F6: u8 = 0x3F;
    pub const F7: u8 = 0x40;
    pub const F8: u8 = 0x41;
    pub const F9: u8 = 0x42;
    pub const F10: u8 = 0x43;
    pub const F11: u8 = 0x44;
    pub const F12: u8 = 0x45;
    pub const PRINTSCREEN: u8 = 0x46;
    pub const SCROLLLOCK: u8 = 0x47;
    pub const PAUSE: u8 = 0x48;
    pub const INSERT: u8 = 0x49;
    pub const HOME: u8 = 0x4A;
    pub const PAGEUP: u8 = 0x4B;
    pub const DELETE: u8 = 0x4C;
    pub const END: u8 = 0x4D;
    pub const PAGEDOWN: u8 = 0x4E;
    pub const RIGHT: u8 = 0x4F;
    pub const LEFT: u8 = 0x50;
    pub const DOWN: u8 = 0x51;
    pub const UP: u8 = 0x52;
    pub const NUMLOCK: u8 = 0x53;
    pub const KP_ASTERISK: u8 = 0x55;
    pub const KP_MINUS: u8 = 0x56;
    pub const KP_PLUS: u8 = 0x57;
    pub const KP_ENTER: u8 = 0x58;
    pub const KP_1: u8 = 0x59;
    pub const KP_2: u8 = 0x5A;
    pub const KP_3: u8 = 0x5B;
    pub const KP_4: u8 = 0x5C;
    pub const KP_5: u8 = 0x5D;
    pub const KP_6: u8 = 0x5E;
    pub const KP_7: u8 = 0x5F;
    pub const KP_8: u8 = 0x60;
    pub const KP_9: u8 = 0x61;
    pub const KP_0: u8 = 0x62;
    pub const KP_DOT: u8 = 0x63;
    pub const MENU: u8 = 0x65;
}

/// Modifier bits of the HID report's first byte.
pub mod modifier {
    pub const LCTRL: u8 = 0x01;
    pub const LSHIFT: u8 = 0x02;
    pub const LALT: u8 = 0x04;
    pub const LMETA: u8 = 0x08;
}

/// One 8-byte boot-protocol keyboard report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyReport {
    pub modifiers: u8,
    pub reserved: u8,
    pub keys: [u8; 6],
}

const KEY_TABLE: &[(&str, u8)] = &[
    ("ENTER", keycode::ENTER),
    ("MENU", keycode::MENU),
    ("DELETE", keycode::DELETE),
    ("BACKSPACE", keycode::BACKSPACE),
    ("HOME", keycode::HOME),
    ("INSERT", keycode::INSERT),
    ("PAGEUP", keycode::PAGEUP),
    ("PAGEDOWN", keycode::PAGEDOWN),
    ("UP", keycode::UP),
    ("DOWN", keycode::DOWN),
    ("LEFT", keycode::LEFT),
    ("RIGHT", keycode::RIGHT),
    ("TAB", keycode::TAB),
    ("END", keycode::END),
    ("ESC", keycode::ESC),
    ("F1", keycode::F1),
    ("F2", keycode::F2),
    ("F3", keycode::F3),
    ("F4", keycode::F4),
    ("F5", keycode::F5),
    ("F6", keycode::F6),
    ("F7", keycode::F7),
    ("F8", keycode::F8),
    ("F9", keycode::F9),
    ("F10", keycode::F10),
    ("F11", keycode::F11),
    ("F12", keycode::F12),
    ("SPACE", keycode::SPACE),
    ("PAUSE,BREAK", keycode::PAUSE),
    ("CAPSLOCK", keycode::CAPSLOCK),
    ("NUMLOCK", keycode::NUMLOCK),
    ("PRINTSCREEN", keycode::PRINTSCREEN),
    ("SCROLLLOCK", keycode::SCROLLLOCK),
    ("NUM_0", keycode::KP_0),
    ("NUM_1", keycode::KP_1),
    ("NUM_2", keycode::KP_2),
    ("NUM_3", keycode::KP_3),
    ("NUM_4", keycode::KP_4),
    ("NUM_5", keycode::KP_5),
    ("NUM_6", keycode::KP_6),
    ("NUM_7", keycode::KP_7),
    ("NUM_8", keycode::KP_8),
    ("NUM_9", keycode::KP_9),
    ("NUM_ASTERIX", keycode::KP_ASTERISK),
    ("NUM_ENTER", keycode::KP_ENTER),
    ("NUM_MINUS", keycode::KP_MINUS),
    ("NUM_DOT", keycode::KP_DOT),
    ("NUM_PLUS", keycode::KP_PLUS),
];

const MODIFIER_TABLE: &[(&str, u8)] = &[
    ("CTRL,CONTROL", modifier::LCTRL),
    ("SHIFT", modifier::LSHIFT),
    ("ALT", modifier::LALT),
    ("WINDOWS,GUI", modifier::LMETA),
];

/// Resolve a named key token to its usage ID. Comparisons are
/// case-sensitive; `PAUSE`/`BREAK` are synonyms.
pub fn lookup_key(word: &[u8]) -> Option<u8> {
    KEY_TABLE
        .iter()
        .find(|(name, _)| matches_template(word, name, Case::Sensitive))
        .map(|&(_, code)| code)
}

/// Resolve a modifier token to its report bit.
pub fn lookup_modifier(word: &[u8]) -> Option<u8> {
    MODIFIER_TABLE
        .iter()
        .find(|(name, _)| matches_template(word, name, Case::Sensitive))
        .map(|&(_, bit)| bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys() {
        assert_eq!(lookup_key(b"ENTER"), Some(keycode::ENTER));
        assert_eq!(lookup_key(b"F12"), Some(keycode::F12));
        assert_eq!(lookup_key(b"NUM_5"), Some(keycode::KP_5));
        assert_eq!(lookup_key(b"enter"), None);
        assert_eq!(lookup_key(b"NOPE"), None);
    }

    #[test]
    fn test_pause_break_synonym() {
        assert_eq!(lookup_key(b"PAUSE"), Some(keycode::PAUSE));
        assert_eq!(lookup_key(b"BREAK"), Some(keycode::PAUSE));
    }

    #[test]
    fn test_modifiers() {
        assert_eq!(lookup_modifier(b"CTRL"), Some(modifier::LCTRL));
        assert_eq!(lookup_modifier(b"CONTROL"), Some(modifier::LCTRL));
        assert_eq!(lookup_modifier(b"GUI"), Some(modifier::LMETA));
        assert_eq!(lookup_modifier(b"WINDOWS"), Some(modifier::LMETA));
        assert_eq!(lookup_modifier(b"SHIFT"), Some(modifier::LSHIFT));
        assert_eq!(lookup_modifier(b"ENTER"), None);
    }
}
