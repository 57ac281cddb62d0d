//! # Duckline Script
//!
//! The script-side core shared by both nodes: a zero-allocation tokenizer,
//! the line interpreter that turns script lines into HID actions, and the
//! per-tick script streamer with REPEAT/LOOP bookmarking.

mod interpreter;
mod keys;
mod streamer;
mod tokenizer;

pub use interpreter::{HidSink, Interpreter};
pub use keys::{keycode, modifier, lookup_key, lookup_modifier, KeyReport};
pub use streamer::{FileSource, LineSink, ScriptSource, Streamer};
pub use tokenizer::{matches_template, Case, Line, Tokenizer, MAX_LINE_NODES, MAX_WORD_NODES};
