mod blockdev;
mod com;
mod hid;
mod logger;
mod parse_args;
mod runner;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use duckline_protocol::{Channel, Link, LinkAddr, LinkListener, RESET};
use duckline_script::Interpreter;

use blockdev::SdHandler;
use com::Com;
use hid::TextHid;
use logger::{Logger, Topic};
use parse_args::{parse_args, Verbosity};

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

    // Determine listen address
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

    let listener = match LinkListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    eprintln!("Listening on {}", addr);
    eprintln!("Waiting for driver to connect...");

    let blockdev_root = args.blockdev.clone().map(PathBuf::from);
    let mut autorun = args.autorun.clone();

    // Main server loop - one driver at a time, reconnect forever
    loop {
        match listener.accept() {
            Ok(link) => {
                logger.log(Topic::Link, "driver connected");
                if logger.verbosity() < Verbosity::Verbose {
                    eprintln!("Driver connected");
                }
                if let Err(e) = handle_connection(
                    link,
                    &logger,
                    blockdev_root.clone(),
                    autorun.take(),
                ) {
                    eprintln!("Connection error: {}", e);
                }
                eprintln!("Driver disconnected, waiting for new connection...");
            }
            Err(e) => {
                eprintln!("Accept error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(
    link: Link,
    logger: &Logger,
    blockdev_root: Option<PathBuf>,
    autorun: Option<String>,
) -> Result<(), std::io::Error> {
    let (mut reader, mut writer) = link.split()?;

    let disconnected = Arc::new(AtomicBool::new(false));
    let disconnected_reader = disconnected.clone();

    // Reader thread: the interrupt-context half of the transport. It only
    // moves byte chunks into the channel; all parsing happens on the tick
    // loop side.
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

    let mut com = Com::new();
    let mut interpreter = Interpreter::new();
    let mut hid = TextHid::new(logger.clone());
    let mut sd = SdHandler::new(blockdev_root, logger.clone());

    if let Some(script) = autorun {
        logger.log(Topic::Link, &format!("autorun {}", script));
        if !sd.runner.start(&script, &mut sd.dev, &mut interpreter) {
            logger.always(&format!("Autorun failed: {}", script));
        }
    }

    // Tick loop
    while !disconnected.load(Ordering::Relaxed) {
        // Drain raw bytes into the frame parser
        while let Ok(chunk) = rx_chunks.try_recv() {
            logger.log(Topic::Wire, &format!("<- {} bytes", chunk.len()));
            if !com.feed(&chunk) {
                logger.log(Topic::Proto, "raw buffer overflow, chunk dropped");
            }
        }
        com.update();

        // Primary channel first, and only when no delay is pending; the
        // backlog shows up in the status wait figure meanwhile.
        if interpreter.delay_remaining_ms() == 0 {
            if let Some(payload) = com.take(Channel::Primary) {
                if payload == [RESET] {
                    logger.log(Topic::Proto, "<- RESET");
                    interpreter.reset();
                } else {
                    logger.log(
                        Topic::Proto,
                        &format!(
                            "<- line ({} bytes): {:?}",
                            payload.len(),
                            String::from_utf8_lossy(&payload)
                        ),
                    );
                    interpreter.parse(&payload, &mut hid);
                }
                com.note_work();
                com.send_status(&mut writer, &interpreter, sd.status_byte())?;
            }
        }

        // Secondary channel
        if let Some(payload) = com.take(Channel::Secondary) {
            logger.log(Topic::Proto, &format!("<- sd packet ({} bytes)", payload.len()));
            sd.process(&payload, &mut com, &mut writer, &mut interpreter, &mut hid)?;
            com.note_work();
            com.send_status(&mut writer, &interpreter, sd.status_byte())?;
        }

        // Block-device-hosted script execution, one step per tick
        if interpreter.delay_remaining_ms() == 0 && !sd.step_runner(&mut interpreter, &mut hid) {
            logger.log(Topic::Link, "script finished");
            com.send_status(&mut writer, &interpreter, sd.status_byte())?;
        }

        // Wake the driver if it is still waiting out a delay we reported
        com.maybe_wake(&mut writer, &interpreter, sd.status_byte())?;

        std::thread::sleep(Duration::from_millis(1));
    }

    drop(rx_chunks);
    let _ = reader_thread.join();
    Ok(())
}
