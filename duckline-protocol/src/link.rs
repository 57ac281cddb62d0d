//! Point-to-point byte link between the driver and executor nodes.
//!
//! The physical transport on real hardware is a UART or an I2C bus; here the
//! same byte-stream semantics run over a Unix socket or TCP connection.
//! Framing is not this module's concern: it moves opaque byte chunks and
//! enforces the per-transaction MTU on the send side.

#[cfg(unix)]
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use crate::PACKET_SIZE;

/// Default socket path for Unix sockets
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/duckline.sock";

/// Where the peer node lives: a Unix socket path or a TCP endpoint.
#[derive(Debug, Clone)]
pub enum LinkAddr {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl LinkAddr {
    #[cfg(unix)]
    pub fn unix<P: Into<PathBuf>>(path: P) -> Self {
        LinkAddr::Unix(path.into())
    }

    pub fn tcp<S: Into<String>>(addr: S) -> Self {
        LinkAddr::Tcp(addr.into())
    }
}

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            LinkAddr::Unix(path) => write!(f, "{}", path.display()),
            LinkAddr::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// The live stream under a connected link. The link only ever needs four
/// operations from it (read a chunk, write a packet, set a read timeout,
/// shut down), so every one of them funnels through [`each_stream!`]
/// instead of a per-operation match ladder.
enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// Run one expression against whichever stream variant is live.
macro_rules! each_stream {
    ($stream:expr, $s:ident => $body:expr) => {
        match $stream {
            #[cfg(unix)]
            Stream::Unix($s) => $body,
            Stream::Tcp($s) => $body,
        }
    };
}

impl Stream {
    /// A second handle on the same connection, for the reader half.
    fn duplicate(&self) -> io::Result<Stream> {
        Ok(match self {
            #[cfg(unix)]
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
        })
    }
}

enum AcceptOn {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound endpoint waiting for the peer node.
pub struct LinkListener {
    accept_on: AcceptOn,
    addr: LinkAddr,
    /// Socket file to remove once the listener goes away.
    #[cfg(unix)]
    cleanup: Option<PathBuf>,
}

impl LinkListener {
    pub fn bind(addr: &LinkAddr) -> io::Result<Self> {
        match addr {
            #[cfg(unix)]
            LinkAddr::Unix(path) => {
                // A stale socket file from a previous run blocks the bind.
                let _ = fs::remove_file(path);
                Ok(LinkListener {
                    accept_on: AcceptOn::Unix(UnixListener::bind(path)?),
                    addr: addr.clone(),
                    cleanup: Some(path.clone()),
                })
            }
            LinkAddr::Tcp(spec) => {
                let listener = TcpListener::bind(spec)?;
                // Report the bound address; it differs from the request
                // when the caller asked for port 0.
                let addr = LinkAddr::Tcp(listener.local_addr()?.to_string());
                Ok(LinkListener {
                    accept_on: AcceptOn::Tcp(listener),
                    addr,
                    #[cfg(unix)]
                    cleanup: None,
                })
            }
        }
    }

    /// Wait for the peer to connect.
    pub fn accept(&self) -> io::Result<Link> {
        let stream = match &self.accept_on {
            #[cfg(unix)]
            AcceptOn::Unix(listener) => Stream::Unix(listener.accept()?.0),
            AcceptOn::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                // Nagle would batch our per-packet flushes.
                let _ = stream.set_nodelay(true);
                Stream::Tcp(stream)
            }
        };
        Ok(Link { stream })
    }

    /// The address this listener is actually bound to.
    pub fn addr(&self) -> &LinkAddr {
        &self.addr
    }
}

#[cfg(unix)]
impl Drop for LinkListener {
    fn drop(&mut self) {
        if let Some(path) = self.cleanup.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// A connected link to the remote node
pub struct Link {
    stream: Stream,
}

impl Link {
    pub fn connect(addr: &LinkAddr) -> io::Result<Self> {
        let stream = match addr {
            #[cfg(unix)]
            LinkAddr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
            LinkAddr::Tcp(spec) => {
                let stream = TcpStream::connect(spec)?;
                let _ = stream.set_nodelay(true);
                Stream::Tcp(stream)
            }
        };
        Ok(Link { stream })
    }

    /// Split into separate reader and writer halves
    pub fn split(self) -> io::Result<(LinkReader, LinkWriter)> {
        let reader = self.stream.duplicate()?;
        Ok((
            LinkReader { stream: reader },
            LinkWriter {
                stream: self.stream,
            },
        ))
    }
}

/// Reader half of a split link
pub struct LinkReader {
    stream: Stream,
}

impl LinkReader {
    /// Block until at least one byte arrives, filling `buf` with whatever is
    /// available. Returns the number of bytes read; 0 means the peer closed.
    pub fn recv_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        each_stream!(&mut self.stream, s => s.read(buf))
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        each_stream!(&self.stream, s => s.set_read_timeout(dur))
    }
}

/// Writer half of a split link
pub struct LinkWriter {
    stream: Stream,
}

impl LinkWriter {
    /// Send bytes, split into [`PACKET_SIZE`] transactions and flushed per
    /// packet, mirroring the bus's per-transaction cap.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        for packet in bytes.chunks(PACKET_SIZE) {
            each_stream!(&mut self.stream, s => {
                s.write_all(packet)?;
                s.flush()
            })?;
        }
        Ok(())
    }

    /// Shutdown the link in both directions
    pub fn shutdown(&self) -> io::Result<()> {
        each_stream!(&self.stream, s => s.shutdown(std::net::Shutdown::Both))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame, Channel, FrameParser};
    use std::thread;

    #[test]
    fn test_tcp_link_roundtrip() {
        let listener = LinkListener::bind(&LinkAddr::tcp("127.0.0.1:0")).unwrap();
        let addr = listener.addr().clone();

        let server = thread::spawn(move || {
            let link = listener.accept().unwrap();
            let (mut reader, mut writer) = link.split().unwrap();

            let mut parser = FrameParser::new();
            let mut buf = [0u8; 64];
            loop {
                let n = reader.recv_chunk(&mut buf).unwrap();
                assert!(n > 0);
                assert!(parser.feed(&buf[..n]));
                parser.update();
                if let Some(payload) = parser.take(Channel::Primary) {
                    assert_eq!(payload, b"STRING over the wire");
                    break;
                }
            }

            writer.send_bytes(&frame(b"reply", Channel::Secondary)).unwrap();
        });

        let link = Link::connect(&addr).unwrap();
        let (mut reader, mut writer) = link.split().unwrap();

        writer
            .send_bytes(&frame(b"STRING over the wire", Channel::Primary))
            .unwrap();

        let mut parser = FrameParser::new();
        let mut buf = [0u8; 64];
        loop {
            let n = reader.recv_chunk(&mut buf).unwrap();
            assert!(n > 0);
            assert!(parser.feed(&buf[..n]));
            parser.update();
            if let Some(payload) = parser.take(Channel::Secondary) {
                assert_eq!(payload, b"reply");
                break;
            }
        }

        server.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_unix_link_roundtrip() {
        let dir = std::env::temp_dir().join(format!("duckline-link-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("test.sock");
        let addr = LinkAddr::unix(&path);

        let listener = LinkListener::bind(&addr).unwrap();
        let server = thread::spawn(move || {
            let link = listener.accept().unwrap();
            let (mut reader, _writer) = link.split().unwrap();
            let mut buf = [0u8; 16];
            let n = reader.recv_chunk(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
        });

        let link = Link::connect(&addr).unwrap();
        let (_reader, mut writer) = link.split().unwrap();
        writer.send_bytes(b"ping").unwrap();

        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn test_listener_removes_socket_file() {
        let dir = std::env::temp_dir().join(format!("duckline-sock-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("cleanup.sock");

        let listener = LinkListener::bind(&LinkAddr::unix(&path)).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
