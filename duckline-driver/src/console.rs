//! Command console for the driver node.
//!
//! One line in, one response out. Lines come from stdin or the WebSocket
//! front end; asynchronous notifications (key ACKs, secondary-channel
//! data) are printed by the main loop as com events arrive.

use duckline_protocol::secondary::{
    SdStatus, CMD_LS, CMD_READ, CMD_RM, CMD_RUN, CMD_STOP, CMD_STOP_RUN, CMD_WRITE,
};
use duckline_protocol::{LinkWriter, PACKET_SIZE, RESET};
use duckline_script::Tokenizer;

use crate::com::Com;
use crate::logger::Logger;
use crate::script::FlashScript;
use crate::settings::Settings;
use crate::storage::Storage;

/// Nominal CPU frequency reported by `freq`.
const CPU_FREQ_MHZ: u32 = 80;

/// Nominal free-heap figure reported by `ram`.
const FREE_RAM_BYTES: u32 = 81_920;

/// Direct key injection rejects the commands that only make sense inside
/// a streamed script.
const KEY_BLACKLIST: &[&str] = &[
    "DELAY",
    "DEFAULT_DELAY",
    "REPEAT",
    "REPLAY",
    "REM",
    "LOOP_BEGIN",
    "LOOP_END",
    "LSTRING_BEGIN",
    "LSTRING_END",
];

const COMMANDS: &[&str] = &[
    "help", "version", "status", "ram", "freq", "flash_size", "mem", "settings", "set", "reset",
    "ls", "cat", "create", "remove", "rename", "write", "format", "stream", "close", "read",
    "run", "stop", "key", "key_ack", "duckparser_reset", "sd_ls", "sd_cat", "sd_rm", "sd_run",
    "sd_stop_run", "sd_stop", "sd_stream_write_begin", "sd_stream_write", "sd_status",
];

pub struct Ctx<'a> {
    pub com: &'a mut Com,
    pub writer: &'a mut LinkWriter,
    pub storage: &'a mut Storage,
    pub settings: &'a mut Settings,
    pub script: &'a mut FlashScript,
    pub logger: &'a Logger,
}

fn blacklisted(key: &str) -> bool {
    let bytes = key.as_bytes();
    KEY_BLACKLIST.iter().any(|blocked| {
        let len = blocked.len();
        if bytes.len() < len {
            return false;
        }
        if !bytes[..len].eq_ignore_ascii_case(blocked.as_bytes()) {
            return false;
        }
        matches!(bytes.get(len), None | Some(b' ') | Some(b'\r') | Some(b'\n'))
    })
}

/// Strip quoting-dialect syntax from one token.
fn unquote(word: &[u8]) -> String {
    let mut out = Vec::with_capacity(word.len());
    let mut escaped = false;
    for &byte in word {
        if escaped {
            out.push(byte);
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte != b'"' {
            out.push(byte);
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Split a console line into unquoted arguments.
fn split_args(line: &str) -> Vec<String> {
    let mut tokenizer = Tokenizer::with_quoting();
    tokenizer.parse(line.as_bytes());
    match tokenizer.line(0, line.as_bytes()) {
        Some(parsed) => parsed.words().map(unquote).collect(),
        None => Vec::new(),
    }
}

/// NUL-terminated path payload for a secondary-channel command.
fn sd_payload(cmd: u8, path: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + path.len());
    payload.push(cmd);
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    payload
}

/// Handle one console line and produce the response text.
pub fn handle_line(line: &str, ctx: &mut Ctx) -> String {
    let trimmed = line.trim_end_matches(['\r', '\n']);

    // Stream mode swallows everything except close and read.
    if ctx.storage.streaming() && trimmed != "close" && trimmed != "read" {
        let mut data = trimmed.as_bytes().to_vec();
        data.push(b'\n');
        return match ctx.storage.stream_write(&data) {
            Ok(()) => "> written data to file".to_string(),
            Err(e) => format!("ERROR: stream write failed: {}", e),
        };
    }

    // key and key_ack take the rest of the line raw, spaces included.
    for (name, waiting_ack) in [("key", false), ("key_ack", true)] {
        if let Some(rest) = strip_command(trimmed, name) {
            return handle_key(rest, waiting_ack, ctx);
        }
    }
    // Raw as well: a write chunk may contain spaces and quotes.
    if let Some(rest) = strip_command(trimmed, "sd_stream_write") {
        return handle_sd_stream_write(rest, ctx);
    }

    let args = split_args(trimmed);
    let cmd = match args.first() {
        Some(c) => c.as_str(),
        None => return String::new(),
    };
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");

    match cmd {
        "help" => {
            let mut out = String::from("commands:\n");
            for name in COMMANDS {
                out.push_str("  ");
                out.push_str(name);
                out.push('\n');
            }
            out
        }
        "version" => format!(
            "Version {} (driver protocol: {}, executor protocol: {})",
            env!("CARGO_PKG_VERSION"),
            ctx.com.com_version(),
            ctx.com.version()
        ),
        "status" => {
            if !ctx.com.connected() {
                format!(
                    "link error (driver protocol {}, executor protocol {})",
                    ctx.com.com_version(),
                    ctx.com.version()
                )
            } else if ctx.com.sd_mode().is_busy() {
                format!("[BLOCKDEV] {}...", ctx.com.sd_mode())
            } else if ctx.script.is_running() {
                format!("running {}", ctx.script.current_script())
            } else {
                "connected".to_string()
            }
        }
        "ram" => format!("{} bytes available", FREE_RAM_BYTES),
        "freq" => format!("{} MHz", CPU_FREQ_MHZ),
        "flash_size" => format!(
            "FlashChipRealSize: {}\nFlashChipSize: {}",
            ctx.storage.size(),
            ctx.storage.size()
        ),
        "mem" => format!(
            "{} byte\n{} byte used\n{} byte free",
            ctx.storage.size(),
            ctx.storage.used_bytes(),
            ctx.storage.free_bytes()
        ),
        "settings" => ctx.settings.to_display(),
        "set" => {
            if args.len() < 3 {
                return "ERROR: usage: set <name> <value>".to_string();
            }
            match ctx.settings.set(arg(1), arg(2)) {
                Ok(()) => format!("> set \"{}\" to \"{}\"", arg(1), arg(2)),
                Err(e) => format!("ERROR: {}", e),
            }
        }
        "reset" => match ctx.settings.reset() {
            Ok(()) => ctx.settings.to_display(),
            Err(e) => format!("ERROR: {}", e),
        },
        "ls" => match ctx.storage.list(arg(1)) {
            Ok(listing) => listing,
            Err(e) => format!("ERROR: {}", e),
        },
        "cat" => match ctx.storage.read(arg(1)) {
            Ok(data) => String::from_utf8_lossy(&data).to_string(),
            Err(e) => format!("ERROR: {}", e),
        },
        "create" => match ctx.storage.create(arg(1)) {
            Ok(()) => format!("> created file \"{}\"", arg(1)),
            Err(e) => format!("ERROR: {}", e),
        },
        "remove" => match ctx.storage.remove(arg(1)) {
            Ok(()) => format!("> removed file \"{}\"", arg(1)),
            Err(e) => format!("ERROR: {}", e),
        },
        "rename" => {
            if args.len() < 3 {
                return "ERROR: usage: rename <from> <to>".to_string();
            }
            match ctx.storage.rename(arg(1), arg(2)) {
                Ok(()) => format!("> renamed \"{}\" to \"{}\"", arg(1), arg(2)),
                Err(e) => format!("ERROR: {}", e),
            }
        }
        "write" => {
            if args.len() < 3 {
                return "ERROR: usage: write <file> <content>".to_string();
            }
            match ctx.storage.append(arg(1), arg(2).as_bytes()) {
                Ok(()) => format!("> wrote to file \"{}\"", arg(1)),
                Err(e) => format!("ERROR: {}", e),
            }
        }
        "format" => match ctx.storage.format() {
            Ok(()) => "formatted storage".to_string(),
            Err(e) => format!("ERROR: {}", e),
        },
        "stream" => match ctx.storage.stream_open(arg(1)) {
            Ok(()) => format!("> opened stream \"{}\"", arg(1)),
            Err(e) => format!("ERROR: {}", e),
        },
        "close" => {
            ctx.storage.stream_close();
            "> closed stream".to_string()
        }
        "read" => {
            if ctx.storage.stream_available() {
                match ctx.storage.stream_read() {
                    Ok(chunk) => String::from_utf8_lossy(&chunk).to_string(),
                    Err(e) => format!("ERROR: {}", e),
                }
            } else {
                "> END".to_string()
            }
        }
        "run" => match ctx.script.run(ctx.storage, arg(1), ctx.com, ctx.writer) {
            Ok(()) => format!("> started \"{}\"", arg(1)),
            Err(e) => format!("ERROR: {}", e),
        },
        "stop" => {
            if ctx.script.stop(arg(1)) {
                format!("> stopped {}", arg(1))
            } else {
                "> no matching script running".to_string()
            }
        }
        "duckparser_reset" => match ctx.com.send(ctx.writer, &[RESET], false) {
            Ok(_) => "> interpreter reset".to_string(),
            Err(e) => format!("ERROR: {}", e),
        },
        _ if cmd.starts_with("sd_") => handle_sd(cmd, &args, ctx),
        _ => format!("ERROR: unknown command \"{}\"", cmd),
    }
}

/// `key <line>` / `key_ack <line>`: inject one line into the interpreter.
fn handle_key(rest: &str, waiting_ack: bool, ctx: &mut Ctx) -> String {
    let key = rest.trim();
    if key.is_empty() {
        return "> empty key command".to_string();
    }
    if blacklisted(key) {
        return "> unsupported command".to_string();
    }
    let mut payload = key.as_bytes().to_vec();
    payload.extend_from_slice(b"\r\n");
    match ctx.com.send(ctx.writer, &payload, waiting_ack) {
        Ok(_) => format!("> key: {}", key),
        Err(e) => format!("ERROR: {}", e),
    }
}

/// One raw chunk of an ongoing secondary-channel write stream. An empty
/// chunk closes the file on the executor side.
fn handle_sd_stream_write(rest: &str, ctx: &mut Ctx) -> String {
    if ctx.com.sd_mode() != SdStatus::Writing {
        return "> no write session".to_string();
    }
    let data = rest.trim_end_matches(['\r', '\n']);
    if data.len() > PACKET_SIZE - 2 {
        return format!("ERROR: chunk too large (max {})", PACKET_SIZE - 2);
    }
    match ctx.com.send_sd(ctx.writer, data.as_bytes()) {
        Ok(_) => "> chunk sent".to_string(),
        Err(e) => format!("ERROR: {}", e),
    }
}

fn handle_sd(cmd: &str, args: &[String], ctx: &mut Ctx) -> String {
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");

    // Read-only and stop commands stay available; everything else is
    // rejected while a session holds the channel.
    let busy = ctx.com.sd_active() || ctx.com.sd_mode().is_busy();
    let always_allowed = matches!(cmd, "sd_stop" | "sd_stop_run" | "sd_status");
    if busy && !always_allowed {
        return "> secondary channel busy".to_string();
    }

    let result = match cmd {
        "sd_status" => {
            return format!(
                "> blockdev: {}{}",
                ctx.com.sd_mode(),
                if ctx.com.sd_active() { " (session active)" } else { "" }
            );
        }
        "sd_ls" => {
            let path = if arg(1).is_empty() { "/" } else { arg(1) };
            ctx.com.begin_sd_session(SdStatus::Listing);
            ctx.com
                .send_sd(ctx.writer, &sd_payload(CMD_LS, path))
                .map(|_| format!("> listing \"{}\"", path))
        }
        "sd_cat" => {
            if arg(1).is_empty() {
                return "ERROR: usage: sd_cat <file>".to_string();
            }
            ctx.com.begin_sd_session(SdStatus::Reading);
            ctx.com
                .send_sd(ctx.writer, &sd_payload(CMD_READ, arg(1)))
                .map(|_| format!("> reading \"{}\"", arg(1)))
        }
        "sd_rm" => {
            if arg(1).is_empty() {
                return "ERROR: usage: sd_rm <file>".to_string();
            }
            ctx.com
                .send_sd(ctx.writer, &sd_payload(CMD_RM, arg(1)))
                .map(|_| format!("> removed \"{}\"", arg(1)))
        }
        "sd_run" => {
            if arg(1).is_empty() {
                return "ERROR: usage: sd_run <file>".to_string();
            }
            ctx.com.begin_sd_session(SdStatus::Executing);
            ctx.com
                .send_sd(ctx.writer, &sd_payload(CMD_RUN, arg(1)))
                .map(|_| format!("> running \"{}\"", arg(1)))
        }
        "sd_stop_run" => ctx
            .com
            .send_sd(ctx.writer, &[CMD_STOP_RUN])
            .map(|_| "> run stopped".to_string()),
        "sd_stop" => ctx
            .com
            .send_sd(ctx.writer, &[CMD_STOP])
            .map(|_| "> session stopped".to_string()),
        "sd_stream_write_begin" => {
            if args.len() < 3 {
                return "ERROR: usage: sd_stream_write_begin <append 0|1> <file>".to_string();
            }
            let append = arg(1) != "0";
            let mut payload = vec![CMD_WRITE, append as u8];
            payload.extend_from_slice(arg(2).as_bytes());
            payload.push(0);
            ctx.com.begin_sd_session(SdStatus::Writing);
            ctx.com
                .send_sd(ctx.writer, &payload)
                .map(|_| format!("> writing \"{}\"", arg(2)))
        }
        _ => return format!("ERROR: unknown command \"{}\"", cmd),
    };

    match result {
        Ok(msg) => msg,
        Err(e) => format!("ERROR: {}", e),
    }
}

/// If `line` starts with `name` followed by a space or end of line, return
/// the rest.
fn strip_command<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(' ')
    }
}
