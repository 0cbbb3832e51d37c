//! # Transport Connection
//!
//! Purpose: Own one TCP socket to the remote store and run request/reply
//! exchanges over it using the RESP codec.
//!
//! ## Design Principles
//! 1. **Lazy Connect**: A connection holds no socket until it is first used,
//!    so the pool factory never fails.
//! 2. **Transport vs Server**: I/O failures surface as `Transport`; error
//!    replies come back classified by the codec.
//! 3. **Dirty Sockets Drain**: A read cut short by a timeout leaves the
//!    socket dirty; unread bytes are discarded before it is used again. A
//!    failed write always breaks the socket, since a partial frame cannot be
//!    taken back.
//! 4. **Pooled Scratch Buffers**: Frames are encoded into a `BytesMut`
//!    borrowed from a shared buffer pool and written in one burst.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use bytes::BytesMut;

use tkv_common::TkvResult;

use crate::config::RemoteOptions;
use crate::error::{ClientError, ClientResult};
use crate::pool::{Pool, PoolConfig, Poolable};
use crate::resp::{decode, Command, RespValue};

const SCRATCH_CAPACITY: usize = 4 * 1024;
// Buffers that grew past this are replaced instead of kept in the pool.
const SCRATCH_RETAIN_LIMIT: usize = 64 * 1024;

/// Reusable encode buffer.
pub struct ScratchBuffer(BytesMut);

impl ScratchBuffer {
    pub fn new() -> Self {
        ScratchBuffer(BytesMut::with_capacity(SCRATCH_CAPACITY))
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.0
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Poolable for ScratchBuffer {
    fn reset(&mut self) {
        if self.0.capacity() > SCRATCH_RETAIN_LIMIT {
            self.0 = BytesMut::with_capacity(SCRATCH_CAPACITY);
        } else {
            self.0.clear();
        }
    }
}

/// Builds the scratch-buffer pool shared by one client's connections.
pub fn buffer_pool(name: &str) -> Arc<Pool<ScratchBuffer>> {
    Arc::new(Pool::new(name, PoolConfig::default(), || Ok(ScratchBuffer::new())))
}

/// One socket to the remote store. Not safe for concurrent use.
pub struct Connection {
    options: Arc<RemoteOptions>,
    buffers: Arc<Pool<ScratchBuffer>>,
    reader: Option<BufReader<TcpStream>>,
    line_buf: Vec<u8>,
    broken: bool,
    dirty: bool,
    session_epoch: Option<u64>,
}

impl Connection {
    /// Creates an unconnected connection; the socket opens on first use.
    pub fn new(options: Arc<RemoteOptions>, buffers: Arc<Pool<ScratchBuffer>>) -> Self {
        Connection {
            options,
            buffers,
            reader: None,
            line_buf: Vec::with_capacity(128),
            broken: false,
            dirty: false,
            session_epoch: None,
        }
    }

    /// Opens a fresh socket, discarding any previous one.
    pub fn connect(&mut self) -> ClientResult<()> {
        self.close();
        let addr = self.options.socket_addr()?;
        let stream = match self.options.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(self.options.receive_timeout())?;
        stream.set_write_timeout(self.options.send_timeout())?;
        stream.set_nodelay(true)?;
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    /// Makes the socket usable: reconnects when missing or broken and drains
    /// leftovers of an abandoned exchange.
    ///
    /// A reconnect drops the session, so callers must log in again.
    pub fn ensure_connected(&mut self) -> ClientResult<()> {
        if self.dirty && !self.broken && self.reader.is_some() {
            match self.drain() {
                Ok(discarded) => {
                    if discarded > 0 {
                        tracing::debug!(discarded, "drained stale reply bytes");
                    }
                    self.dirty = false;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to drain connection; reconnecting");
                    self.broken = true;
                }
            }
        }
        if self.reader.is_none() || self.broken {
            self.connect()?;
        }
        Ok(())
    }

    /// Best-effort liveness check; a peer may have closed without us noticing.
    pub fn is_connected(&self) -> bool {
        match &self.reader {
            Some(reader) => !self.broken && reader.get_ref().peer_addr().is_ok(),
            None => false,
        }
    }

    /// True when an exchange was abandoned before its replies were read.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Session epoch this socket last logged in under.
    pub fn session_epoch(&self) -> Option<u64> {
        self.session_epoch
    }

    pub fn set_session_epoch(&mut self, epoch: Option<u64>) {
        self.session_epoch = epoch;
    }

    /// Sends a command and reads one reply per frame.
    pub fn execute(&mut self, command: &Command) -> ClientResult<Vec<RespValue>> {
        self.ensure_connected()?;
        self.send(command)?;
        self.receive(command.expected_replies())
    }

    /// Writes every frame of `command` in a single burst.
    pub fn send(&mut self, command: &Command) -> ClientResult<()> {
        let mut scratch = self.buffers.acquire()?;
        let buffer = scratch.bytes_mut();
        command.encode_into(buffer);

        let reader = self.reader.as_mut().ok_or_else(not_connected)?;
        self.dirty = true;
        let stream = reader.get_mut();
        let written = stream.write_all(&buffer[..]).and_then(|_| stream.flush());
        if let Err(err) = written {
            // Part of the frame may already be on the wire, timeouts included.
            self.broken = true;
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads `replies` values in send order.
    pub fn receive(&mut self, replies: usize) -> ClientResult<Vec<RespValue>> {
        let reader = self.reader.as_mut().ok_or_else(not_connected)?;
        match decode(reader, replies, &mut self.line_buf) {
            Ok(values) => {
                self.dirty = false;
                Ok(values)
            }
            // Error replies are fully consumed; the stream is still aligned.
            Err(err @ (ClientError::Server(_) | ClientError::AuthRequired(_))) => {
                self.dirty = false;
                Err(err)
            }
            Err(ClientError::Transport(err)) => {
                self.mark_read_failed(&err);
                Err(ClientError::Transport(err))
            }
            Err(err) => {
                self.broken = true;
                Err(err)
            }
        }
    }

    /// Shuts the socket down and forgets the session.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown(Shutdown::Both);
        }
        self.broken = false;
        self.dirty = false;
        self.session_epoch = None;
    }

    fn mark_read_failed(&mut self, err: &io::Error) {
        // A timed-out read leaves a live socket that may still get the late reply.
        if !is_timeout(err) {
            self.broken = true;
        }
    }

    fn drain(&mut self) -> io::Result<usize> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(0),
        };

        let mut discarded = reader.buffer().len();
        reader.consume(discarded);

        let stream = reader.get_mut();
        stream.set_nonblocking(true)?;
        let mut chunk = [0u8; 1024];
        let outcome = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
                Ok(read) => discarded += read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(discarded),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            }
        };
        stream.set_nonblocking(false)?;
        outcome
    }
}

impl Poolable for Connection {
    fn destroy(&mut self) -> TkvResult<()> {
        self.close();
        Ok(())
    }
}

fn not_connected() -> ClientError {
    ClientError::Transport(io::Error::new(io::ErrorKind::NotConnected, "connection is not open"))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::Arg;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_millis(200);

    fn options_for(listener: &TcpListener) -> Arc<RemoteOptions> {
        let port = listener.local_addr().unwrap().port();
        let mut options = RemoteOptions::new("127.0.0.1", port);
        options.receive_timeout_ms = TEST_TIMEOUT.as_millis() as u64;
        Arc::new(options)
    }

    fn ping() -> Command {
        Command::new("PING")
    }

    #[test]
    fn connects_lazily() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(options_for(&listener), buffer_pool("test-buffers"));
        assert!(!conn.is_connected());

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let args = crate::resp::decode_command(&mut reader).unwrap();
            assert_eq!(args, vec![Arg::from("PING")]);
            stream.write_all(b"+PONG\r\n").unwrap();
        });

        let values = conn.execute(&ping()).unwrap();
        assert_eq!(values, vec![RespValue::Simple("PONG".into())]);
        assert!(conn.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn refused_connect_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let options = options_for(&listener);
        drop(listener);
        let mut conn = Connection::new(options, buffer_pool("test-buffers"));
        assert!(matches!(conn.execute(&ping()), Err(ClientError::Transport(_))));
        assert!(!conn.is_connected());
    }

    #[test]
    fn late_reply_is_drained_before_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(options_for(&listener), buffer_pool("test-buffers"));

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            crate::resp::decode_command(&mut reader).unwrap();
            // Reply only after the client gave up waiting.
            thread::sleep(TEST_TIMEOUT * 2);
            stream.write_all(b"$5\r\nstale\r\n").unwrap();
            crate::resp::decode_command(&mut reader).unwrap();
            stream.write_all(b"+PONG\r\n").unwrap();
        });

        let get = Command::single("GET", ["k".into()]);
        assert!(matches!(conn.execute(&get), Err(ClientError::Transport(_))));
        assert!(conn.is_dirty());
        assert!(conn.is_connected());

        thread::sleep(TEST_TIMEOUT * 2);
        let values = conn.execute(&ping()).unwrap();
        assert_eq!(values, vec![RespValue::Simple("PONG".into())]);
        assert!(!conn.is_dirty());
        server.join().unwrap();
    }

    #[test]
    fn write_timeout_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut options = RemoteOptions::new("127.0.0.1", port);
        options.send_timeout_ms = 150;
        options.receive_timeout_ms = 3000;
        let mut conn = Connection::new(Arc::new(options), buffer_pool("test-buffers"));

        let server = thread::spawn(move || {
            let (stalled, _) = listener.accept().unwrap();
            // Not reading lets the client's socket buffers fill up.
            thread::sleep(Duration::from_millis(800));
            let discard = thread::spawn(move || {
                let _ = io::copy(&mut BufReader::new(stalled), &mut io::sink());
            });

            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let args = crate::resp::decode_command(&mut reader).unwrap();
            stream.write_all(b"+PONG\r\n").unwrap();
            discard.join().unwrap();
            args
        });

        let payload = vec![b'x'; 32 * 1024 * 1024];
        let set = Command::single("SET", ["k".into(), Arg::from(payload)]);
        assert!(matches!(conn.execute(&set), Err(ClientError::Transport(_))));
        assert!(!conn.is_connected());

        let values = conn.execute(&ping()).unwrap();
        assert_eq!(values, vec![RespValue::Simple("PONG".into())]);
        assert_eq!(server.join().unwrap(), vec![Arg::from("PING")]);
    }

    #[test]
    fn close_forgets_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(options_for(&listener), buffer_pool("test-buffers"));
        conn.set_session_epoch(Some(3));
        conn.close();
        assert_eq!(conn.session_epoch(), None);
    }
}
