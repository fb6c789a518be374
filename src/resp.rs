// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! RESP2 framing: multibulk request parsing (with the inline-command
//! fallback) and reply serialization.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a single bulk string or multibulk count, to keep a
/// malformed header from driving a huge allocation.
const MAX_BULK_LENGTH: usize = 64 * 1024 * 1024;
const MAX_MULTIBULK_COUNT: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Simple(&'static str),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
    /// The `*-1` reply, used for an EXEC aborted by a watched-key change.
    NilArray,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK")
    }

    pub fn error(msg: impl Into<String>) -> Reply {
        Reply::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Reply {
        Reply::Bulk(data.into())
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                out.push(b'-');
                out.extend_from_slice(msg.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(out);
                }
            }
            Reply::NilArray => out.extend_from_slice(b"*-1\r\n"),
        }
    }
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Protocol error: {}", msg))
}

/// Reads one line up to CRLF (tolerating a bare LF), without the terminator.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

fn parse_length(digits: &[u8], what: &str) -> io::Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol_error(&format!("invalid {} length", what)))
}

/// Reads one command off the wire. `None` means the peer closed the
/// connection cleanly; a malformed frame is an `InvalidData` error.
pub async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<Vec<Bytes>>> {
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };
    if line.is_empty() {
        return Ok(Some(Vec::new()));
    }
    if line[0] != b'*' {
        // Inline command: whitespace-separated words on one line.
        let argv = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|w| !w.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        return Ok(Some(argv));
    }

    let count = parse_length(&line[1..], "multibulk")?;
    if count < 0 {
        return Ok(Some(Vec::new()));
    }
    let count = count as usize;
    if count > MAX_MULTIBULK_COUNT {
        return Err(protocol_error("multibulk count too large"));
    }

    let mut argv = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(header) = read_line(reader).await? else {
            return Err(protocol_error("unexpected end of stream"));
        };
        if header.first() != Some(&b'$') {
            return Err(protocol_error("expected bulk string"));
        }
        let len = parse_length(&header[1..], "bulk")?;
        if len < 0 || len as usize > MAX_BULK_LENGTH {
            return Err(protocol_error("invalid bulk length"));
        }
        let mut body = vec![0u8; len as usize + 2];
        reader.read_exact(&mut body).await?;
        if &body[len as usize..] != b"\r\n" {
            return Err(protocol_error("bulk string missing terminator"));
        }
        body.truncate(len as usize);
        argv.push(Bytes::from(body));
    }
    Ok(Some(argv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn serialized(reply: &Reply) -> Vec<u8> {
        let mut out = Vec::new();
        reply.write_to(&mut out);
        out
    }

    #[test]
    fn reply_serialization() {
        assert_eq!(serialized(&Reply::ok()), b"+OK\r\n");
        assert_eq!(serialized(&Reply::error("ERR boom")), b"-ERR boom\r\n");
        assert_eq!(serialized(&Reply::Integer(-7)), b":-7\r\n");
        assert_eq!(serialized(&Reply::bulk("hi")), b"$2\r\nhi\r\n");
        assert_eq!(serialized(&Reply::Nil), b"$-1\r\n");
        assert_eq!(serialized(&Reply::NilArray), b"*-1\r\n");
        assert_eq!(
            serialized(&Reply::Array(vec![Reply::Integer(1), Reply::Nil])),
            b"*2\r\n:1\r\n$-1\r\n"
        );
        assert_eq!(serialized(&Reply::Array(Vec::new())), b"*0\r\n");
    }

    #[tokio::test]
    async fn parse_multibulk() {
        let mut input = Cursor::new(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n".to_vec());
        let argv = read_command(&mut input).await.unwrap().unwrap();
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[0], Bytes::from_static(b"SET"));
        assert_eq!(argv[2], Bytes::from_static(b"v1"));
        assert!(read_command(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parse_inline() {
        let mut input = Cursor::new(b"PING\r\nGET  key\r\n".to_vec());
        let argv = read_command(&mut input).await.unwrap().unwrap();
        assert_eq!(argv, vec![Bytes::from_static(b"PING")]);
        let argv = read_command(&mut input).await.unwrap().unwrap();
        assert_eq!(
            argv,
            vec![Bytes::from_static(b"GET"), Bytes::from_static(b"key")]
        );
    }

    #[tokio::test]
    async fn parse_binary_safe_bulk() {
        let mut input = Cursor::new(b"*2\r\n$3\r\nGET\r\n$4\r\na\r\nb\r\n".to_vec());
        let argv = read_command(&mut input).await.unwrap().unwrap();
        assert_eq!(argv[1], Bytes::from_static(b"a\r\nb"));
    }

    #[tokio::test]
    async fn malformed_frames_error() {
        let mut input = Cursor::new(b"*1\r\n:5\r\n".to_vec());
        assert!(read_command(&mut input).await.is_err());
        let mut input = Cursor::new(b"*x\r\n".to_vec());
        assert!(read_command(&mut input).await.is_err());
    }
}
