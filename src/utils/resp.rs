//! RESP (Redis Serialization Protocol) encoder and decoder
//!
//! Commands are always sent as arrays of bulk strings. Replies are decoded
//! one value at a time from a buffered reader.

use std::io::{self, BufRead};

use tracing::debug;

/// RESP2 value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:1000\r\n)
    Integer(i64),
    /// Bulk string ($6\r\nfoobar\r\n)
    BulkString(Vec<u8>),
    /// Null bulk string or null array ($-1\r\n, *-1\r\n)
    Null,
    /// Array (*2\r\n...)
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Borrow as text (simple string or UTF-8 bulk string)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Convert into owned text, replacing invalid UTF-8
    ///
    /// Replaced text no longer matches the bytes stored on the server.
    pub fn into_text(self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => Some(match String::from_utf8(b) {
                Ok(s) => s,
                Err(e) => {
                    let text = String::from_utf8_lossy(e.as_bytes()).into_owned();
                    debug!("Invalid UTF-8 in bulk string, shown as '{}'", text);
                    text
                }
            }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Check for `+OK`
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }
}

/// Split a SCAN reply `[cursor, [key, ...]]` into its parts
///
/// Returns `None` if the reply does not have the SCAN shape.
pub fn parse_scan_reply(reply: RespValue) -> Option<(u64, Vec<String>)> {
    let RespValue::Array(mut parts) = reply else {
        return None;
    };
    if parts.len() != 2 {
        return None;
    }

    let keys = parts.pop()?;
    let cursor = match parts.pop()? {
        RespValue::BulkString(s) => std::str::from_utf8(&s).ok()?.parse::<u64>().ok()?,
        RespValue::SimpleString(s) => s.parse::<u64>().ok()?,
        RespValue::Integer(i) => u64::try_from(i).ok()?,
        _ => return None,
    };

    let keys = match keys {
        RespValue::Array(items) => items.into_iter().filter_map(RespValue::into_text).collect(),
        RespValue::Null => Vec::new(),
        _ => return None,
    };

    Some((cursor, keys))
}

/// RESP encoder with a reusable buffer
pub struct RespEncoder {
    buf: Vec<u8>,
}

impl RespEncoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Clear buffer for reuse
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encode a command as RESP array of bulk strings
    pub fn encode_command(&mut self, args: &[&[u8]]) {
        self.buf.push(b'*');
        self.write_int(args.len() as i64);
        self.buf.extend_from_slice(b"\r\n");

        for arg in args {
            self.buf.push(b'$');
            self.write_int(arg.len() as i64);
            self.buf.extend_from_slice(b"\r\n");
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(b"\r\n");
        }
    }

    /// Encode a command from string slices
    pub fn encode_command_str(&mut self, args: &[&str]) {
        let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
        self.encode_command(&byte_args);
    }

    #[inline]
    fn write_int(&mut self, value: i64) {
        let mut buffer = itoa::Buffer::new();
        self.buf.extend_from_slice(buffer.format(value).as_bytes());
    }
}

/// Streaming RESP decoder over any buffered reader
pub struct RespDecoder<R> {
    reader: R,
    line_buf: Vec<u8>,
}

impl<R: BufRead> RespDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_buf: Vec::with_capacity(128),
        }
    }

    /// Decode the next RESP value from the stream
    pub fn decode(&mut self) -> io::Result<RespValue> {
        let (type_byte, content) = self.read_header()?;

        match type_byte {
            b'+' => Ok(RespValue::SimpleString(content)),
            b'-' => Ok(RespValue::Error(content)),
            b':' => Ok(RespValue::Integer(parse_int(&content, "integer")?)),
            b'$' => {
                let len = parse_int(&content, "bulk string length")?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }

                let mut data = vec![0u8; len as usize];
                self.reader.read_exact(&mut data)?;

                let mut crlf = [0u8; 2];
                self.reader.read_exact(&mut crlf)?;
                if &crlf != b"\r\n" {
                    return Err(invalid_data("Bulk string not terminated by CRLF"));
                }

                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let count = parse_int(&content, "array length")?;
                if count < 0 {
                    return Ok(RespValue::Null);
                }

                let mut elements = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    elements.push(self.decode()?);
                }
                Ok(RespValue::Array(elements))
            }
            other => Err(invalid_data(format!(
                "Invalid RESP type byte: {:?}",
                other as char
            ))),
        }
    }

    /// Read one CRLF-terminated header line and split off its type byte
    fn read_header(&mut self) -> io::Result<(u8, String)> {
        self.line_buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.line_buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed",
            ));
        }

        let line = self
            .line_buf
            .strip_suffix(b"\r\n")
            .or_else(|| self.line_buf.strip_suffix(b"\n"))
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "Truncated RESP line"))?;

        let (&type_byte, rest) = line
            .split_first()
            .ok_or_else(|| invalid_data("Empty RESP line"))?;

        Ok((type_byte, String::from_utf8_lossy(rest).into_owned()))
    }
}

fn parse_int(content: &str, what: &str) -> io::Result<i64> {
    content
        .parse()
        .map_err(|_| invalid_data(format!("Invalid {}: {:?}", what, content)))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
