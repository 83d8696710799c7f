//! Blocking client connection: plain TCP or TLS over TCP.
//!
//! # Design
//! Every read and write takes the transfer deadline and re-arms the socket
//! timeout to the time left before the call, so a stalled peer can never hold
//! a transfer past its budget. The TLS handshake is completed inside `open`
//! rather than lazily on first write, so handshake failures are reported as
//! connect errors. Name resolution shares the connect budget: a lookup
//! that outlives it is left running on its helper thread and reported as a
//! connect timeout.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, trace};

use crate::error::{ConnectError, IoError};

/// Upper bound on how long `close` waits to flush a TLS close_notify.
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(200);

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

/// A connection to one `host:port`, owned by a single transfer.
pub struct Connection {
    stream: Option<Stream>,
    peer: String,
}

impl Connection {
    /// Resolve `host`, connect to the first address that accepts, and
    /// complete a TLS handshake when `tls` is given. `timeout` bounds the
    /// whole operation.
    pub fn open(
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
        timeout: Option<Duration>,
    ) -> Result<Self, ConnectError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let peer = format!("{host}:{port}");

        let addrs = resolve(host, port, deadline)?;
        let tcp = connect_any(&addrs, deadline)?;
        let _ = tcp.set_nodelay(true);
        debug!(peer = %peer, "tcp connected");

        let stream = match tls {
            None => Stream::Plain(tcp),
            Some(config) => Stream::Tls(Box::new(handshake(host, tcp, config, deadline)?)),
        };

        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write every byte of `bytes`, retrying partial writes until `deadline`.
    pub fn write_all(&mut self, bytes: &[u8], deadline: Option<Instant>) -> Result<(), IoError> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let mut written = 0;
        while written < bytes.len() {
            stream.tcp().set_write_timeout(time_left(deadline)?)?;
            match stream.write(&bytes[written..]) {
                Ok(0) => return Err(IoError::BrokenPipe),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        stream.tcp().set_write_timeout(time_left(deadline)?)?;
        stream.flush()?;
        trace!(bytes = written, "request written");
        Ok(())
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub fn read_some(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, IoError> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        loop {
            stream.tcp().set_read_timeout(time_left(deadline)?)?;
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Peers commonly drop TLS without close_notify; body framing
                // still catches truncation.
                Err(e)
                    if e.kind() == io::ErrorKind::UnexpectedEof
                        && matches!(stream, Stream::Tls(_)) =>
                {
                    debug!(peer = %self.peer, "TLS peer closed without close_notify");
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        match stream {
            Stream::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            Stream::Tls(mut tls) => {
                let tls = &mut *tls;
                tls.conn.send_close_notify();
                let _ = tls.sock.set_write_timeout(Some(CLOSE_NOTIFY_TIMEOUT));
                let _ = tls.conn.write_tls(&mut tls.sock);
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
        }
        debug!(peer = %self.peer, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_any(addrs: &[SocketAddr], deadline: Option<Instant>) -> Result<TcpStream, ConnectError> {
    let mut last_err = None;
    for addr in addrs {
        let attempt = match deadline {
            None => TcpStream::connect(addr),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(ConnectError::Timeout);
                }
                TcpStream::connect_timeout(addr, left)
            }
        };
        match attempt {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => connect_error(e),
        None => ConnectError::Timeout,
    })
}

fn connect_error(err: io::Error) -> ConnectError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectError::Timeout,
        io::ErrorKind::ConnectionRefused => ConnectError::Refused,
        _ => ConnectError::Io(err),
    }
}

fn handshake(
    host: &str,
    mut tcp: TcpStream,
    config: Arc<ClientConfig>,
    deadline: Option<Instant>,
) -> Result<StreamOwned<ClientConnection, TcpStream>, ConnectError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnectError::TlsHandshakeFailed(format!("invalid server name {host}: {e}")))?;
    let mut conn = ClientConnection::new(config, server_name)
        .map_err(|e| ConnectError::TlsHandshakeFailed(e.to_string()))?;

    while conn.is_handshaking() {
        let left = time_left(deadline).map_err(|_| ConnectError::Timeout)?;
        tcp.set_read_timeout(left).map_err(ConnectError::Io)?;
        tcp.set_write_timeout(left).map_err(ConnectError::Io)?;
        match conn.complete_io(&mut tcp) {
            Ok((0, 0)) if conn.is_handshaking() => {
                return Err(ConnectError::TlsHandshakeFailed(
                    "peer closed during handshake".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Err(ConnectError::Timeout);
            }
            Err(e) => return Err(ConnectError::TlsHandshakeFailed(e.to_string())),
        }
    }
    debug!(
        host,
        protocol = ?conn.protocol_version(),
        "TLS handshake complete"
    );
    Ok(StreamOwned::new(conn, tcp))
}

/// Time left before `deadline`, as a socket timeout. `None` means no limit.
/// Resolve `host:port`. The system resolver has no timeout of its own, so
/// with a deadline the lookup runs on a helper thread and is abandoned once
/// the deadline passes.
fn resolve(host: &str, port: u16, deadline: Option<Instant>) -> Result<Vec<SocketAddr>, ConnectError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let lookup = match deadline {
        None => lookup_host(host, port),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ConnectError::Timeout);
            }
            let (tx, rx) = mpsc::channel();
            let name = host.to_string();
            thread::spawn(move || {
                let _ = tx.send(lookup_host(&name, port));
            });
            match rx.recv_timeout(left) {
                Ok(lookup) => lookup,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(host, "dns lookup exceeded connect budget");
                    return Err(ConnectError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => Ok(Vec::new()),
            }
        }
    };

    match lookup {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        Ok(_) => Err(ConnectError::DnsFailed {
            host: host.to_string(),
            source: None,
        }),
        Err(e) => Err(ConnectError::DnsFailed {
            host: host.to_string(),
            source: Some(e),
        }),
    }
}

fn lookup_host(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    Ok((host, port).to_socket_addrs()?.collect())
}

fn time_left(deadline: Option<Instant>) -> Result<Option<Duration>, IoError> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(IoError::Timeout)
            } else {
                Ok(Some(left))
            }
        }
    }
}

fn not_connected() -> IoError {
    IoError::Other(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection already closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(b"pong!").unwrap();
            buf
        });

        let mut conn = Connection::open("127.0.0.1", port, None, Some(Duration::from_secs(5))).unwrap();
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        conn.write_all(b"ping!", deadline).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while received.len() < 5 {
            let n = conn.read_some(&mut buf, deadline).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"pong!");
        assert_eq!(&server.join().unwrap(), b"ping!");
    }

    #[test]
    fn read_returns_zero_at_end_of_stream() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });
        let mut conn = Connection::open("127.0.0.1", port, None, None).unwrap();
        server.join().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read_some(&mut buf, None).unwrap(), 0);
    }

    #[test]
    fn refused_connection_is_reported() {
        let (listener, port) = listener();
        drop(listener);
        let err = Connection::open("127.0.0.1", port, None, Some(Duration::from_secs(2)))
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Refused), "{err:?}");
    }

    #[test]
    fn unresolvable_host_is_a_dns_failure() {
        let err = Connection::open("host.invalid", 80, None, None)
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::DnsFailed { .. }), "{err:?}");
    }

    #[test]
    fn literal_addresses_skip_the_resolver() {
        let expired = Some(Instant::now() - Duration::from_millis(1));
        let addrs = resolve("::1", 8080, expired).unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn resolution_runs_under_a_deadline() {
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        let addrs = resolve("localhost", 80, deadline).unwrap();
        assert!(addrs.iter().all(|a| a.port() == 80));
        assert!(!addrs.is_empty());
    }

    #[test]
    fn resolution_after_deadline_is_a_timeout() {
        let expired = Some(Instant::now() - Duration::from_millis(1));
        let err = resolve("localhost", 80, expired).unwrap_err();
        assert!(matches!(err, ConnectError::Timeout), "{err:?}");
    }

    #[test]
    fn stalled_read_times_out_at_deadline() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(socket);
        });
        let mut conn = Connection::open("127.0.0.1", port, None, None).unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = conn
            .read_some(&mut buf, Some(Instant::now() + Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, IoError::Timeout), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(450));
        server.join().unwrap();
    }

    #[test]
    fn expired_deadline_fails_without_io() {
        let (listener, port) = listener();
        let mut conn = Connection::open("127.0.0.1", port, None, None).unwrap();
        let past = Some(Instant::now() - Duration::from_millis(1));
        assert!(matches!(conn.write_all(b"x", past), Err(IoError::Timeout)));
        drop(listener);
    }

    #[test]
    fn close_is_idempotent() {
        let (listener, port) = listener();
        let mut conn = Connection::open("127.0.0.1", port, None, None).unwrap();
        assert!(conn.is_open());
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        let mut buf = [0u8; 1];
        assert!(matches!(conn.read_some(&mut buf, None), Err(IoError::Other(_))));
        drop(listener);
    }

    #[test]
    fn tls_handshake_against_plain_server_fails() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf);
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        });
        let config = crate::tls::default_client_config().unwrap();
        let err = Connection::open("localhost", port, Some(config), Some(Duration::from_secs(5)))
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::TlsHandshakeFailed(_)), "{err:?}");
        server.join().unwrap();
    }
}
