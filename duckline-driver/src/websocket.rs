//! WebSocket console front end.
//!
//! Serves the same console as stdin: every incoming text frame is one
//! command line, every response and notification goes back as a text
//! frame. One client at a time; a dropped client frees the slot for the
//! next connection.

use std::net::TcpListener;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

use tungstenite::protocol::Message as WsMessage;

use crate::logger::{Logger, Topic};

pub struct WsConsole {
    /// Command lines typed by the client.
    pub lines: Receiver<String>,
    /// Responses and notifications for the client.
    pub responses: Sender<String>,
}

/// Bind the port and spawn the server thread.
pub fn start(port: u16, logger: Logger) -> std::io::Result<WsConsole> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let (tx_lines, rx_lines) = mpsc::channel::<String>();
    let (tx_resp, rx_resp) = mpsc::channel::<String>();

    std::thread::spawn(move || serve(listener, tx_lines, rx_resp, logger));

    Ok(WsConsole {
        lines: rx_lines,
        responses: tx_resp,
    })
}

fn serve(
    listener: TcpListener,
    tx_lines: Sender<String>,
    rx_resp: Receiver<String>,
    logger: Logger,
) {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                logger.always(&format!("WS accept error: {}", e));
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let mut websocket = match tungstenite::accept(stream) {
            Ok(ws) => ws,
            Err(e) => {
                logger.log(Topic::Link, &format!("WS handshake failed: {}", e));
                continue;
            }
        };
        logger.log(Topic::Link, &format!("WS client connected: {}", addr));

        // Short read timeout so pending responses keep flowing.
        let _ = websocket
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(50)));

        // Drop responses queued while nobody was connected.
        while rx_resp.try_recv().is_ok() {}

        'client: loop {
            match websocket.read() {
                Ok(WsMessage::Text(text)) => {
                    if tx_lines.send(text.to_string()).is_err() {
                        return;
                    }
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = websocket.send(WsMessage::Pong(data));
                }
                Ok(WsMessage::Close(_)) => break 'client,
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break 'client,
            }

            loop {
                match rx_resp.try_recv() {
                    Ok(resp) => {
                        if websocket.send(WsMessage::Text(resp)).is_err() {
                            break 'client;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
        }

        logger.log(Topic::Link, "WS client disconnected");
    }
}
