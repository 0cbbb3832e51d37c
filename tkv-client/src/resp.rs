//! # RESP Framing
//!
//! Purpose: Encode commands into length-prefixed frames and parse replies,
//! with no I/O state of its own.
//!
//! ## Design Principles
//! 1. **One Frame per Logical Command**: `Batch` and `Multiple` commands hold
//!    one frame per sub-command and never merge them; the reply count equals
//!    the frame count.
//! 2. **Binary-Safe**: Arguments and bulk replies are raw bytes (`Bytes`).
//! 3. **Classify Once**: Error replies become `AuthRequired` or `Server` here,
//!    so upper layers match on variants instead of message text.
//! 4. **Drain Pipelines**: All expected replies are read even when one is an
//!    error, leaving the socket positioned at the next exchange.

use std::io::BufRead;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClientError, ClientResult};

// Upper bound for a single bulk payload; anything larger is treated as corrupt framing.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// One command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Encoded as `$-1\r\n`.
    Null,
    Bytes(Bytes),
}

impl Arg {
    /// Returns the argument bytes, `None` for `Null`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Null => None,
            Arg::Bytes(bytes) => Some(bytes),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg::Bytes(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Bytes(Bytes::from(value.to_string()))
    }
}

/// How a command maps onto frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// One frame: name followed by its arguments.
    Single,
    /// The same command repeated once per key/value entry.
    Batch,
    /// Heterogeneous commands sent as one pipelined unit.
    Multiple,
}

/// A single wire frame: the command token followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    args: Vec<Arg>,
}

impl Frame {
    fn new(name: &str, args: impl IntoIterator<Item = Arg>) -> Self {
        let mut frame = vec![Arg::from(name)];
        frame.extend(args);
        Frame { args: frame }
    }

    /// Command token plus arguments, in wire order.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    fn encode_into(&self, out: &mut BytesMut) {
        put_header(out, b'*', self.args.len() as i64);
        for arg in &self.args {
            match arg {
                Arg::Null => put_header(out, b'$', -1),
                Arg::Bytes(bytes) => {
                    put_header(out, b'$', bytes.len() as i64);
                    out.put_slice(bytes);
                    out.put_slice(b"\r\n");
                }
            }
        }
    }

    fn encoded_len(&self) -> usize {
        self.args
            .iter()
            .map(|arg| 16 + arg.as_bytes().map(<[u8]>::len).unwrap_or(0))
            .sum::<usize>()
            + 16
    }
}

/// A logical command ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    name: String,
    frames: Vec<Frame>,
}

impl Command {
    /// A command with no arguments (`PING`, `QUIT`).
    pub fn new(name: &str) -> Self {
        Self::single(name, Vec::<Arg>::new())
    }

    /// One command with positional arguments.
    pub fn single(name: &str, args: impl IntoIterator<Item = Arg>) -> Self {
        Command {
            kind: CommandKind::Single,
            name: name.to_string(),
            frames: vec![Frame::new(name, args)],
        }
    }

    /// `name key value` once per entry, e.g. one `EXPIRE` per key.
    pub fn batch(name: &str, entries: impl IntoIterator<Item = (Arg, Arg)>) -> Self {
        let frames = entries
            .into_iter()
            .map(|(key, value)| Frame::new(name, [key, value]))
            .collect();
        Command {
            kind: CommandKind::Batch,
            name: name.to_string(),
            frames,
        }
    }

    /// Several commands pipelined together; each keeps its own frames.
    pub fn multiple(commands: impl IntoIterator<Item = Command>) -> Self {
        let mut names = Vec::new();
        let mut frames = Vec::new();
        for command in commands {
            names.push(command.name);
            frames.extend(command.frames);
        }
        Command {
            kind: CommandKind::Multiple,
            name: names.join("+"),
            frames,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Command token (sub-command tokens joined by `+` for `Multiple`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Replies the server sends back: one per frame.
    pub fn expected_replies(&self) -> usize {
        self.frames.len()
    }

    /// Encodes every frame as its own chunk.
    pub fn encode(&self) -> Vec<Bytes> {
        self.frames
            .iter()
            .map(|frame| {
                let mut out = BytesMut::with_capacity(frame.encoded_len());
                frame.encode_into(&mut out);
                out.freeze()
            })
            .collect()
    }

    /// Appends all frames, back to back, to `out` for a single write.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.reserve(self.frames.iter().map(Frame::encoded_len).sum());
        for frame in &self.frames {
            frame.encode_into(out);
        }
    }
}

/// One parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`, `+PONG` and similar.
    Simple(String),
    /// An error reply nested inside an array; top-level errors become `Err`.
    Error(String),
    /// `:<n>`
    Integer(i64),
    /// `$<len>`; `None` for the null bulk string and the null array.
    Bulk(Option<Bytes>),
    /// `*<count>`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// True for the null bulk string.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Bulk(None))
    }
}

/// Reads `expected` replies in send order.
///
/// Every reply is consumed before an error reply is reported, so the stream
/// stays aligned for the next exchange.
pub fn decode<R: BufRead>(reader: &mut R, expected: usize, line_buf: &mut Vec<u8>) -> ClientResult<Vec<RespValue>> {
    let mut values = Vec::with_capacity(expected);
    let mut first_error = None;
    for _ in 0..expected {
        match read_value(reader, line_buf)? {
            RespValue::Error(text) => {
                if first_error.is_none() {
                    first_error = Some(text);
                }
            }
            value => values.push(value),
        }
    }
    match first_error {
        Some(text) => Err(ClientError::from_server_text(text)),
        None => Ok(values),
    }
}

/// Reads one reply; error replies are returned as `RespValue::Error`.
pub fn read_value<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    let (&kind, rest) = line_buf
        .split_first()
        .ok_or_else(|| ClientError::Protocol("empty reply line".into()))?;

    match kind {
        b'+' => Ok(RespValue::Simple(String::from_utf8_lossy(rest).into_owned())),
        b'-' => Ok(RespValue::Error(String::from_utf8_lossy(rest).into_owned())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_i64(rest)?;
            read_bulk(reader, len).map(RespValue::Bulk)
        }
        b'*' => {
            let count = parse_i64(rest)?;
            if count < 0 {
                return Ok(RespValue::Bulk(None));
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_value(reader, line_buf)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(ClientError::Protocol(format!("unexpected reply type byte 0x{other:02x}"))),
    }
}

/// Parses one request frame back into its arguments (command token first).
pub fn decode_command<R: BufRead>(reader: &mut R) -> ClientResult<Vec<Arg>> {
    let mut line = Vec::with_capacity(32);
    read_line(reader, &mut line)?;
    let count = match line.split_first() {
        Some((b'*', rest)) => parse_i64(rest)?,
        _ => return Err(ClientError::Protocol("request must start with '*'".into())),
    };

    let mut args = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        let len = match line.split_first() {
            Some((b'$', rest)) => parse_i64(rest)?,
            _ => return Err(ClientError::Protocol("request argument must be a bulk string".into())),
        };
        args.push(match read_bulk(reader, len)? {
            Some(bytes) => Arg::Bytes(bytes),
            None => Arg::Null,
        });
    }
    Ok(args)
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ClientResult<Option<Bytes>> {
    if len < 0 {
        return Ok(None);
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol(format!("bulk length {len} too large")));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ClientError::Protocol("bulk string missing CRLF".into()));
    }
    Ok(Some(Bytes::from(data)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        // Peer closed between exchanges: a broken pipe, not bad framing.
        return Err(ClientError::Transport(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(ClientError::Protocol("line not terminated by CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| ClientError::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(data))))
}

fn put_header(out: &mut BytesMut, prefix: u8, value: i64) {
    out.put_u8(prefix);
    if value < 0 {
        out.put_u8(b'-');
    }
    // Digits go into a stack buffer so headers never allocate.
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    let mut rest = value.unsigned_abs();
    loop {
        pos -= 1;
        digits[pos] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    out.put_slice(&digits[pos..]);
    out.put_slice(b"\r\n");
}
