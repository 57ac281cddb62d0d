mod com;
mod console;
mod logger;
mod parse_args;
mod script;
mod settings;
mod storage;
mod websocket;

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use duckline_protocol::{Link, LinkAddr, SdStatus};

use com::{Com, ComEvent};
use console::Ctx;
use logger::{Logger, Topic};
use parse_args::{parse_args, Verbosity};
use script::FlashScript;
use settings::Settings;
use storage::Storage;

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error parsing arguments: {}", e);
            std::process::exit(1);
        }
    };

    // Set up logger
    let logger = match &args.log_file {
        Some(path) => match Logger::file(path, args.verbosity) {
            Ok(l) => {
                eprintln!("Logging to: {}", path);
                l
            }
            Err(e) => {
                eprintln!("Failed to open log file '{}': {}", path, e);
                std::process::exit(1);
            }
        },
        None => Logger::stderr(args.verbosity),
    };

    // Flash storage and settings
    let storage_root = args.storage.clone().unwrap_or_else(|| "./flash".to_string());
    let mut storage = match Storage::new(&storage_root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open storage '{}': {}", storage_root, e);
            std::process::exit(1);
        }
    };
    let mut settings = Settings::load(storage.root().join("settings.ini"));

    // Determine link address
    let addr = if let Some(tcp) = &args.tcp_addr {
        LinkAddr::tcp(tcp.clone())
    } else {
        let path = args
            .socket_path
            .clone()
            .unwrap_or_else(|| duckline_protocol::DEFAULT_SOCKET_PATH.to_string());
        #[cfg(unix)]
        {
            LinkAddr::unix(&path)
        }
        #[cfg(not(unix))]
        {
            eprintln!("Unix sockets not supported on this platform, use --tcp");
            std::process::exit(1);
        }
    };

    // Console input: stdin thread feeds a channel for the session loop.
    let (tx_stdin, rx_stdin): (Sender<String>, Receiver<String>) = mpsc::channel();
    let stdin_closed = Arc::new(AtomicBool::new(false));
    let stdin_closed_reader = stdin_closed.clone();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if tx_stdin.send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        stdin_closed_reader.store(true, Ordering::Relaxed);
    });

    // Optional WebSocket console
    let ws = match args.ws_port {
        Some(port) => match websocket::start(port, logger.clone()) {
            Ok(ws) => {
                eprintln!("WebSocket console on port {}", port);
                Some(ws)
            }
            Err(e) => {
                eprintln!("Failed to start WebSocket console: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let mut autorun = args.autorun.clone().or_else(|| {
        settings
            .get("autorun")
            .filter(|s| !s.is_empty())
            .map(String::from)
    });

    // Session loop - supports reconnection
    loop {
        logger.log(Topic::Link, &format!("connecting to executor at {}", addr));
        if logger.verbosity() < Verbosity::Verbose {
            eprintln!("Connecting to executor at {}...", addr);
        }

        match Link::connect(&addr) {
            Ok(link) => {
                eprintln!("Connected!");
                if let Err(e) = run_session(
                    link,
                    &logger,
                    &mut storage,
                    &mut settings,
                    &rx_stdin,
                    &stdin_closed,
                    ws.as_ref(),
                    autorun.take(),
                ) {
                    eprintln!("Session error: {}", e);
                }
                if stdin_closed.load(Ordering::Relaxed) {
                    return;
                }
                eprintln!("Disconnected from executor, reconnecting...");
            }
            Err(e) => {
                eprintln!("Failed to connect: {} (retrying in 1s)", e);
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    link: Link,
    logger: &Logger,
    storage: &mut Storage,
    settings: &mut Settings,
    rx_stdin: &Receiver<String>,
    stdin_closed: &Arc<AtomicBool>,
    ws: Option<&websocket::WsConsole>,
    autorun: Option<String>,
) -> io::Result<()> {
    let (mut reader, mut writer) = link.split()?;

    let disconnected = Arc::new(AtomicBool::new(false));
    let disconnected_reader = disconnected.clone();

    let (tx_chunks, rx_chunks): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = mpsc::channel();
    let reader_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 128];
        loop {
            match reader.recv_chunk(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx_chunks.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
        disconnected_reader.store(true, Ordering::Relaxed);
    });

    let mut com = Com::new(settings.get_u64("sd_ack_timeout", 5000));
    let mut flash_script = FlashScript::new();

    // Greeting: reset the interpreter and provoke the first status.
    com.send(&mut writer, &[duckline_protocol::RESET], false)?;

    if let Some(name) = autorun {
        logger.log(Topic::Link, &format!("autorun {}", name));
        if let Err(e) = flash_script.run(storage, &name, &mut com, &mut writer) {
            eprintln!("Autorun failed: {}", e);
        }
    }

    // Print to every active front end.
    let print = |text: &str| {
        if text.is_empty() {
            return;
        }
        println!("{}", text);
        if let Some(ws) = ws {
            let _ = ws.responses.send(text.to_string());
        }
    };

    while !disconnected.load(Ordering::Relaxed) {
        // Raw bytes into the frame parser
        while let Ok(chunk) = rx_chunks.try_recv() {
            logger.log(Topic::Wire, &format!("<- {} bytes", chunk.len()));
            com.feed(&chunk);
        }

        // Protocol events
        for event in com.update(&mut writer)? {
            match event {
                ComEvent::Done => {
                    logger.log(Topic::Proto, "<- done");
                    if flash_script.is_running() && !flash_script.step(&mut com, &mut writer) {
                        print("> script finished");
                    }
                }
                ComEvent::Repeat => {
                    logger.log(Topic::Proto, "<- repeat");
                    flash_script.step(&mut com, &mut writer);
                }
                ComEvent::Loop => {
                    logger.log(Topic::Proto, "<- loop");
                }
                ComEvent::Error(e) => {
                    print(&format!("ERROR: {}", e));
                    flash_script.stop("");
                }
                ComEvent::KeyAck(ok) => {
                    print(if ok { "KEY_ACK:OK" } else { "KEY_ACK:ERROR" });
                }
                ComEvent::SdList { name, size } => {
                    print(&format!("SD_LS:{},{}", name, size));
                }
                ComEvent::SdData(data) => {
                    print(&format!("SD_CAT:{}", String::from_utf8_lossy(&data)));
                }
                ComEvent::SdWriteAck(ok) => {
                    print(if ok { "SD_ACK:OK" } else { "SD_ACK:ERROR" });
                }
                ComEvent::SdEnd(state) => {
                    let outcome = match state {
                        SdStatus::Error => "SD_END:ERROR",
                        SdStatus::NotPresent => "SD_END:NOT_PRESENT",
                        _ => "SD_END:OK",
                    };
                    print(outcome);
                }
            }
        }

        // Console lines from stdin and WebSocket
        let mut lines: Vec<String> = Vec::new();
        while let Ok(line) = rx_stdin.try_recv() {
            lines.push(line);
        }
        if let Some(ws) = ws {
            while let Ok(line) = ws.lines.try_recv() {
                lines.push(line);
            }
        }
        for line in lines {
            let mut ctx = Ctx {
                com: &mut com,
                writer: &mut writer,
                storage: &mut *storage,
                settings: &mut *settings,
                script: &mut flash_script,
                logger,
            };
            let response = console::handle_line(&line, &mut ctx);
            print(&response);
        }

        if stdin_closed.load(Ordering::Relaxed) && ws.is_none() {
            break;
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    drop(rx_chunks);
    let _ = writer.shutdown();
    let _ = reader_thread.join();
    Ok(())
}
