/*!
RESP2 wire decoding for the replication handshake.

Only the five RESP2 forms are needed here: the handshake replies and the
`$<size>` prefix that introduces the snapshot payload. The payload itself is
not RESP and never goes through this module.
*/

use std::io::Read;

use byteorder::ReadBytesExt;

use crate::error::{Error, Result};
use crate::to_string;

pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
// array reply
pub(crate) const STAR: u8 = b'*';
// bulk string reply
pub(crate) const DOLLAR: u8 = b'$';
// simple string reply
pub(crate) const PLUS: u8 = b'+';
// error reply
pub(crate) const MINUS: u8 = b'-';
// integer reply
pub(crate) const COLON: u8 = b':';

/// Ceiling on a single CRLF-terminated line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    /// Null bulk string (`$-1`) or null array (`*-1`).
    Null,
    Array(Vec<Resp>),
}

/// Blanket RESP decoding over any blocking byte source.
pub trait RespDecode: Read {
    fn decode_resp(&mut self) -> Result<Resp> {
        loop {
            let prefix = self.read_u8()?;
            // masters may send bare newlines to keep the link alive while a
            // dump is being prepared
            if prefix == LF {
                continue;
            }
            return match prefix {
                PLUS => Ok(Resp::Simple(self.decode_line()?)),
                MINUS => Ok(Resp::Error(self.decode_line()?)),
                COLON => self.decode_int().map(Resp::Int),
                DOLLAR => self.decode_bulk(),
                STAR => self.decode_array(),
                other => Err(Error::Protocol(format!("unexpected reply type 0x{:02X}", other))),
            };
        }
    }

    /// Reads one CRLF-terminated line, without the terminator.
    fn decode_line(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == CR {
                break;
            }
            if bytes.len() >= MAX_LINE_LENGTH {
                return Err(Error::LineTooLong { max: MAX_LINE_LENGTH });
            }
            bytes.push(byte);
        }
        if self.read_u8()? != LF {
            return Err(Error::Protocol("expected LF after CR".to_string()));
        }
        Ok(to_string(bytes))
    }

    fn decode_int(&mut self) -> Result<i64> {
        let line = self.decode_line()?;
        line.parse::<i64>()
            .map_err(|_| Error::Protocol(format!("invalid integer '{}'", line)))
    }

    fn decode_bulk(&mut self) -> Result<Resp> {
        let length = self.decode_int()?;
        if length < 0 {
            return Ok(Resp::Null);
        }
        let mut buf = vec![0; length as usize];
        self.read_exact(&mut buf)?;
        let mut end = [0; 2];
        self.read_exact(&mut end)?;
        if end != [CR, LF] {
            return Err(Error::Protocol("bulk string not terminated by CRLF".to_string()));
        }
        Ok(Resp::Bulk(buf))
    }

    fn decode_array(&mut self) -> Result<Resp> {
        let count = self.decode_int()?;
        if count < 0 {
            return Ok(Resp::Null);
        }
        let mut elements = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            elements.push(self.decode_resp()?);
        }
        Ok(Resp::Array(elements))
    }
}

impl<R: Read + ?Sized> RespDecode for R {}
