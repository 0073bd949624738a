//! RESP encoding for commands and an incremental reply parser.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ClientError;

/// A reply received from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    /// Text of a status or bulk reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            Reply::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// A command as a list of binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Command {
            args: vec![name.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Append the RESP array form of this command to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(format!("*{}\r\n", self.args.len()).as_bytes());
        for arg in &self.args {
            out.put_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.put_slice(arg);
            out.put_slice(b"\r\n");
        }
    }
}

impl From<&str> for Command {
    /// Split on whitespace: `"SET k v"` becomes three arguments.
    fn from(line: &str) -> Self {
        Command {
            args: line
                .split_whitespace()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
        }
    }
}

impl From<String> for Command {
    fn from(line: String) -> Self {
        Command::from(line.as_str())
    }
}

/// Incremental reply parser. Feed it whatever arrived on the socket and pull
/// out complete replies.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buf: BytesMut,
    /// Buffered length below which the pending reply cannot be complete.
    need: usize,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete reply.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// The next complete reply, or `None` if more input is needed.
    pub fn next_reply(&mut self) -> Result<Option<Reply>, ClientError> {
        if self.buf.len() < self.need {
            return Ok(None);
        }
        match parse(&self.buf, 0)? {
            Parsed::Done(reply, used) => {
                self.buf.advance(used);
                self.need = 0;
                Ok(Some(reply))
            }
            Parsed::Need(need) => {
                self.need = need;
                Ok(None)
            }
        }
    }
}

fn line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..end], end + 2))
}

fn int(raw: &[u8]) -> Result<i64, ClientError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::Protocol(format!("bad integer {:?}", String::from_utf8_lossy(raw))))
}

/// Deepest array nesting accepted from the server.
const MAX_DEPTH: usize = 32;

enum Parsed {
    Done(Reply, usize),
    /// Incomplete; at least this many bytes are needed.
    Need(usize),
}

fn parse(buf: &[u8], depth: usize) -> Result<Parsed, ClientError> {
    let Some(&tag) = buf.first() else {
        return Ok(Parsed::Need(1));
    };
    let Some((head, mut used)) = line(&buf[1..]) else {
        return Ok(Parsed::Need(buf.len() + 1));
    };
    used += 1;

    let reply = match tag {
        b'+' => Reply::Status(String::from_utf8_lossy(head).into_owned()),
        b'-' => Reply::Error(String::from_utf8_lossy(head).into_owned()),
        b':' => Reply::Integer(int(head)?),
        b'$' => {
            let len = int(head)?;
            if len < 0 {
                Reply::Nil
            } else {
                let len = len as usize;
                if buf.len() < used + len + 2 {
                    return Ok(Parsed::Need(used + len + 2));
                }
                if &buf[used + len..used + len + 2] != b"\r\n" {
                    return Err(ClientError::Protocol("bulk string not terminated".into()));
                }
                let data = Bytes::copy_from_slice(&buf[used..used + len]);
                used += len + 2;
                Reply::Bulk(data)
            }
        }
        b'*' => {
            let count = int(head)?;
            if count < 0 {
                Reply::Nil
            } else {
                if depth >= MAX_DEPTH {
                    return Err(ClientError::Protocol(format!(
                        "arrays nested deeper than {}",
                        MAX_DEPTH
                    )));
                }
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    match parse(&buf[used..], depth + 1)? {
                        Parsed::Done(item, n) => {
                            items.push(item);
                            used += n;
                        }
                        Parsed::Need(n) => return Ok(Parsed::Need(used + n)),
                    }
                }
                Reply::Array(items)
            }
        }
        other => {
            return Err(ClientError::Protocol(format!(
                "unexpected reply type byte {:#04x}",
                other
            )))
        }
    };
    Ok(Parsed::Done(reply, used))
}
