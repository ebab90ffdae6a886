//! Transport: named-endpoint paired sockets with EINTR-safe close/send (§4.C).
//!
//! "Pair socket" and "endpoint" are realized concretely as a Unix domain
//! stream socket per endpoint path: the Host binds and accepts (the "reply
//! role" of §4.E), the Proxy only ever connects (§4.D step 4 — "No binding —
//! this side always connects"). A stream socket doesn't preserve message
//! boundaries on its own, so each logical frame is wrapped in a 4-byte
//! little-endian length prefix on the wire and reassembled on read.
//!
//! Socket option tuning goes through `socket2`, which wraps a cloned std
//! socket purely to set options before continuing to use the std type for
//! I/O.

use crate::error::TransportError;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const CONNECT_RETRY_WINDOW: Duration = Duration::from_millis(2000);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Strips an optional `ipc://` scheme prefix, leaving a bare filesystem path.
///
/// Endpoints are opaque strings; this binding accepts either a bare path or
/// an `ipc://`-prefixed URI so configuration carried over from an
/// nanomsg-style deployment keeps working unchanged.
pub fn endpoint_path(endpoint: &str) -> &Path {
    Path::new(endpoint.strip_prefix("ipc://").unwrap_or(endpoint))
}

fn configure_timeout(stream: &UnixStream, timeout: Option<Duration>) -> std::io::Result<()> {
    let socket = socket2::Socket::from(stream.try_clone()?);
    socket.set_read_timeout(timeout)?;
    // leak the socket2 wrapper's fd ownership back without closing it: socket2
    // would otherwise drop-close the duplicated descriptor view. `into_raw_fd`
    // on an owned clone already took ownership of a distinct fd referring to
    // the same open file description, so letting it drop here is correct and
    // closes only that duplicate, not the original `stream`.
    let _ = socket;
    Ok(())
}

struct Inner {
    stream: UnixStream,
    /// Raw bytes read off the wire that don't yet form a complete frame.
    partial: Vec<u8>,
}

impl Inner {
    fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.partial.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(self.partial[0..4].try_into().unwrap()) as usize;
        if self.partial.len() < 4 + len {
            return None;
        }
        let frame = self.partial[4..4 + len].to_vec();
        self.partial.drain(0..4 + len);
        Some(frame)
    }
}

/// One endpoint of a connected pair socket. Cheap to share across threads via
/// `Arc<PairSocket>`; all I/O is serialized internally so the sender,
/// receiver, supervisor and creator threads can each hold a clone safely.
pub struct PairSocket {
    io: Mutex<Inner>,
    /// An independent handle to the same kernel socket, used only to call
    /// `shutdown` from a thread other than the one blocked in `recv` —
    /// acquiring `io` for that purpose would deadlock against a thread
    /// parked in a blocking read.
    shutdown_handle: UnixStream,
    bound_path: Option<PathBuf>,
}

impl PairSocket {
    /// Connects to `endpoint`. Never binds — this is always the Proxy side
    /// of a session (§4.D step 4).
    /// Connects to `endpoint`, retrying briefly if nothing is listening yet.
    ///
    /// Unlike the nanomsg pair sockets this binding's wire model descends
    /// from, a Unix domain stream socket's `connect` fails synchronously if
    /// the peer hasn't bound and accepted yet. The Host only binds the
    /// message endpoint after processing `ModuleCreate` (§4.E), so the
    /// Proxy's message-socket connect (issued right after the Create
    /// handshake succeeds) can legitimately race the Host's bind. Retrying
    /// for a bounded window absorbs that race without requiring the caller
    /// to coordinate explicitly.
    pub fn connect(endpoint: &str) -> Result<Self, TransportError> {
        let path = endpoint_path(endpoint);
        let deadline = std::time::Instant::now() + CONNECT_RETRY_WINDOW;
        let stream = loop {
            match UnixStream::connect(path) {
                Ok(stream) => break stream,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::NotFound | ErrorKind::ConnectionRefused
                    ) && std::time::Instant::now() < deadline =>
                {
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(TransportError::Open {
                        endpoint: endpoint.to_string(),
                        source: e,
                    });
                }
            }
        };
        let shutdown_handle = stream.try_clone().map_err(|e| TransportError::Open {
            endpoint: endpoint.to_string(),
            source: e,
        })?;
        Ok(PairSocket {
            io: Mutex::new(Inner {
                stream,
                partial: Vec::new(),
            }),
            shutdown_handle,
            bound_path: None,
        })
    }

    /// Binds `endpoint` and accepts exactly one connection — the Host's
    /// "reply role" (§4.E). `accept_timeout` bounds how long this blocks
    /// waiting for the Proxy to connect; `None` blocks indefinitely.
    pub fn bind_and_accept(
        endpoint: &str,
        accept_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let path = endpoint_path(endpoint);
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| TransportError::Open {
            endpoint: endpoint.to_string(),
            source: e,
        })?;
        if let Some(timeout) = accept_timeout {
            listener
                .set_nonblocking(false)
                .map_err(TransportError::Io)?;
            let deadline = std::time::Instant::now() + timeout;
            loop {
                listener.set_nonblocking(true).map_err(TransportError::Io)?;
                match listener.accept() {
                    Ok((stream, _)) => return Self::from_accepted(stream, path.to_path_buf()),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if std::time::Instant::now() >= deadline {
                            return Err(TransportError::TimedOut);
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        return Err(TransportError::Open {
                            endpoint: endpoint.to_string(),
                            source: e,
                        });
                    }
                }
            }
        } else {
            let (stream, _) = listener.accept().map_err(|e| TransportError::Open {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            Self::from_accepted(stream, path.to_path_buf())
        }
    }

    fn from_accepted(stream: UnixStream, bound_path: PathBuf) -> Result<Self, TransportError> {
        let shutdown_handle = stream.try_clone().map_err(TransportError::Io)?;
        Ok(PairSocket {
            io: Mutex::new(Inner {
                stream,
                partial: Vec::new(),
            }),
            shutdown_handle,
            bound_path: Some(bound_path),
        })
    }

    /// Sets the timeout governing future blocking `recv` calls. `None`
    /// blocks indefinitely.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let guard = self.io.lock().unwrap();
        configure_timeout(&guard.stream, timeout).map_err(TransportError::Io)
    }

    /// Sends one frame. `nonblocking` toggles whether the underlying write
    /// returns `WouldBlock` instead of stalling when the socket buffer is
    /// full — the async-creator and destroy's best-effort Destroy send use
    /// `nonblocking = true`; ordinary data sends tolerate a short block.
    pub fn send(&self, bytes: &[u8], nonblocking: bool) -> Result<usize, TransportError> {
        let mut guard = self.io.lock().unwrap();
        guard
            .stream
            .set_nonblocking(nonblocking)
            .map_err(TransportError::Io)?;
        let len = bytes.len() as u32;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        match write_all_interruptible(&mut guard.stream, &frame) {
            Ok(()) => Ok(bytes.len()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Receives one frame, blocking up to the configured `set_recv_timeout`
    /// (or the `nonblocking` toggle, for a single non-blocking poll).
    pub fn recv(&self, nonblocking: bool) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.io.lock().unwrap();
        if let Some(frame) = guard.pop_frame() {
            return Ok(frame);
        }
        guard
            .stream
            .set_nonblocking(nonblocking)
            .map_err(TransportError::Io)?;
        loop {
            let mut buf = [0u8; 4096];
            match guard.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(TransportError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )));
                }
                Ok(n) => {
                    guard.partial.extend_from_slice(&buf[..n]);
                    if let Some(frame) = guard.pop_frame() {
                        return Ok(frame);
                    }
                    if nonblocking {
                        // made partial progress but no full frame yet; caller polls again
                        return Err(TransportError::WouldBlock);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(TransportError::WouldBlock),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(TransportError::TimedOut),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Closes the socket. Safe to call concurrently with a thread blocked in
    /// `recv` on the same `PairSocket` — unlike every other operation, this
    /// does not take the I/O lock, so it wakes a blocked reader rather than
    /// queuing behind it.
    pub fn close(&self) {
        let _ = self
            .shutdown_handle
            .shutdown(std::net::Shutdown::Both);
        if let Some(path) = &self.bound_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for PairSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_all_interruptible(stream: &mut UnixStream, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole frame",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn temp_endpoint(name: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn connect_and_exchange_one_frame() {
        let (_dir, endpoint) = temp_endpoint("pair.sock");
        let endpoint_for_host = endpoint.clone();
        let host = thread::spawn(move || {
            let sock = PairSocket::bind_and_accept(&endpoint_for_host, None).unwrap();
            let frame = sock.recv(false).unwrap();
            assert_eq!(frame, b"hello");
            sock.send(b"world", false).unwrap();
        });

        // give the listener a moment to bind
        thread::sleep(Duration::from_millis(50));
        let proxy = PairSocket::connect(&endpoint).unwrap();
        proxy.send(b"hello", false).unwrap();
        let reply = proxy.recv(false).unwrap();
        assert_eq!(reply, b"world");
        host.join().unwrap();
    }

    #[test]
    fn strips_ipc_scheme_prefix() {
        assert_eq!(endpoint_path("ipc:///tmp/x"), Path::new("/tmp/x"));
        assert_eq!(endpoint_path("/tmp/y"), Path::new("/tmp/y"));
    }

    #[test]
    fn recv_nonblocking_without_data_would_block() {
        let (_dir, endpoint) = temp_endpoint("pair2.sock");
        let endpoint_for_host = endpoint.clone();
        let host = thread::spawn(move || {
            let sock = PairSocket::bind_and_accept(&endpoint_for_host, None).unwrap();
            // hold the connection open without sending anything
            thread::sleep(Duration::from_millis(200));
            sock.close();
        });
        thread::sleep(Duration::from_millis(50));
        let proxy = PairSocket::connect(&endpoint).unwrap();
        assert!(matches!(proxy.recv(true), Err(TransportError::WouldBlock)));
        host.join().unwrap();
    }

    #[test]
    fn close_unblocks_a_blocked_receiver() {
        let (_dir, endpoint) = temp_endpoint("pair3.sock");
        let endpoint_for_host = endpoint.clone();
        let accepted = std::sync::Arc::new(std::sync::Barrier::new(2));
        let accepted_host = accepted.clone();
        let host = thread::spawn(move || {
            let sock = std::sync::Arc::new(
                PairSocket::bind_and_accept(&endpoint_for_host, None).unwrap(),
            );
            accepted_host.wait();
            let sock_clone = sock.clone();
            let closer = thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                sock_clone.close();
            });
            let result = sock.recv(false);
            assert!(result.is_err());
            closer.join().unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        let _proxy = PairSocket::connect(&endpoint).unwrap();
        accepted.wait();
        host.join().unwrap();
    }
}
