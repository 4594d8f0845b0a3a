//! # RESP Wire Protocol
//!
//! Incremental parser for the subset of RESP used by commands: multi-bulk
//! arrays of bulk strings (the form real clients send) and, for convenience,
//! bare inline commands. Buffers accumulate across reads so a command split
//! across TCP segments parses correctly on the next call.

use bytes::{Buf, BytesMut};

/// Parse failure severe enough to close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

/// Incremental RESP request parser, one per connection.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Attempts to parse one full command from `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer holds an incomplete command (caller
    /// should read more bytes and retry), `Ok(Some(args))` with the consumed
    /// command's arguments, or `Err` on malformed input.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        if buffer.is_empty() {
            return Ok(None);
        }

        if buffer[0] == b'*' {
            Self::parse_multibulk(buffer)
        } else {
            Self::parse_inline(buffer)
        }
    }

    fn parse_multibulk(buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut cursor = 0usize;

        let (count, consumed) = match read_line(&buffer[cursor..]) {
            Some(line) => line,
            None => return Ok(None),
        };
        cursor += consumed;

        let count: i64 = parse_line_int(count, b'*')?;
        if count <= 0 {
            buffer.advance(cursor);
            return Ok(Some(Vec::new()));
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (header, header_len) = match read_line(&buffer[cursor..]) {
                Some(line) => line,
                None => return Ok(None),
            };
            if header.is_empty() || header[0] != b'$' {
                return Err(RespError::Protocol);
            }
            let len: i64 = parse_line_int(header, b'$')?;
            if len < 0 {
                return Err(RespError::Protocol);
            }
            let len = len as usize;
            cursor += header_len;

            if buffer.len() < cursor + len + 2 {
                return Ok(None);
            }
            let value = buffer[cursor..cursor + len].to_vec();
            cursor += len;

            if &buffer[cursor..cursor + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            cursor += 2;

            args.push(value);
        }

        buffer.advance(cursor);
        Ok(Some(args))
    }

    fn parse_inline(buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let (line, consumed) = match read_line(buffer) {
            Some(line) => line,
            None => return Ok(None),
        };

        let args = line
            .split(|&b| b == b' ')
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| chunk.to_vec())
            .collect();

        buffer.advance(consumed);
        Ok(Some(args))
    }
}

/// Finds a `\r\n`-terminated line at the start of `data`, returning the line
/// content (without the terminator) and the number of bytes it occupies
/// including the terminator.
fn read_line(data: &[u8]) -> Option<(&[u8], usize)> {
    let pos = data.windows(2).position(|window| window == b"\r\n")?;
    Some((&data[..pos], pos + 2))
}

fn parse_line_int(line: &[u8], prefix: u8) -> Result<i64, RespError> {
    if line.is_empty() || line[0] != prefix {
        return Err(RespError::Protocol);
    }
    std::str::from_utf8(&line[1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RespError::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_multibulk_command() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"[..]);
        let args = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn returns_none_on_incomplete_command() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        assert_eq!(parser.parse(&mut buffer).unwrap(), None);
    }

    #[test]
    fn parses_inline_command() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"PING\r\n"[..]);
        let args = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(args, vec![b"PING".to_vec()]);
    }

    #[test]
    fn rejects_malformed_bulk_length() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*1\r\n$x\r\nGET\r\n"[..]);
        assert_eq!(parser.parse(&mut buffer), Err(RespError::Protocol));
    }

    #[test]
    fn parses_sequential_commands_from_same_buffer() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        assert!(parser.parse(&mut buffer).unwrap().is_some());
        assert!(parser.parse(&mut buffer).unwrap().is_some());
        assert!(buffer.is_empty());
    }
}
