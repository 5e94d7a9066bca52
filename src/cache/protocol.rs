//! Memcached-style text protocol parser
//!
//! Commands are line based (`\r\n` terminated). Storage commands are followed
//! by a data block of the announced length plus its own `\r\n`.

use crate::common::validate_key;
use bytes::{Buf, BytesMut};
use tracing::debug;

/// Longest command line accepted before the buffer is discarded
pub const MAX_LINE_LEN: usize = 2048;

/// Largest value accepted by `set`/`add`
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        noreply: bool,
    },
    Add {
        key: Vec<u8>,
        value: Vec<u8>,
        noreply: bool,
    },
    /// `get` and `gets`; a `*` inside a key asks for a prefix scan
    Get {
        keys: Vec<Vec<u8>>,
    },
    Delete {
        key: Vec<u8>,
        noreply: bool,
    },
    Incr {
        key: Vec<u8>,
        delta: u64,
        noreply: bool,
    },
    Decr {
        key: Vec<u8>,
        delta: u64,
        noreply: bool,
    },
    Version,
    Stats,
    Quit,
}

impl Command {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Add { .. }
                | Command::Delete { .. }
                | Command::Incr { .. }
                | Command::Decr { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    BadFormat,
    BadDataChunk,
    TooLarge,
    Unknown(String),
}

impl ParseError {
    pub fn reply(&self) -> Vec<u8> {
        match self {
            ParseError::BadFormat => b"CLIENT_ERROR bad command line format\r\n".to_vec(),
            ParseError::BadDataChunk => b"CLIENT_ERROR bad data chunk\r\n".to_vec(),
            ParseError::TooLarge => b"SERVER_ERROR object too large for cache\r\n".to_vec(),
            ParseError::Unknown(cmd) => format!("ERROR unknown command:{}\r\n", cmd).into_bytes(),
        }
    }
}

/// Per-session command parser.
///
/// Tracks the data block of a rejected storage command so it is discarded
/// instead of being read as commands.
#[derive(Debug, Default)]
pub struct Parser {
    swallow: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one command from the front of `buf`.
    ///
    /// `None` means more bytes are needed. On a parse error the offending
    /// input is consumed so the session can continue.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Option<Result<Command, ParseError>> {
        if self.swallow > 0 {
            let n = self.swallow.min(buf.len());
            buf.advance(n);
            self.swallow -= n;
            if self.swallow > 0 {
                return None;
            }
        }

        let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
            if buf.len() > MAX_LINE_LEN {
                buf.clear();
                return Some(Err(ParseError::BadFormat));
            }
            return None;
        };

        let line_len = newline + 1;
        let line = buf[..newline].strip_suffix(b"\r").unwrap_or(&buf[..newline]);
        let tokens: Vec<Vec<u8>> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_vec())
            .collect();

        let Some(name) = tokens.first() else {
            buf.advance(line_len);
            return Some(Err(ParseError::Unknown(String::new())));
        };

        match name.as_slice() {
            b"set" | b"add" => self.parse_storage(buf, line_len, &tokens),
            other => {
                let parsed = parse_simple(other, &tokens);
                buf.advance(line_len);
                Some(parsed)
            }
        }
    }

    fn parse_storage(
        &mut self,
        buf: &mut BytesMut,
        line_len: usize,
        tokens: &[Vec<u8>],
    ) -> Option<Result<Command, ParseError>> {
        let header = match storage_header(tokens) {
            Ok(header) => header,
            Err(e) => {
                buf.advance(line_len);
                // the client still sends the block it announced
                if let Some(bytes) = announced_bytes(tokens) {
                    self.swallow = bytes.saturating_add(2);
                }
                return Some(Err(e));
            }
        };

        if buf.len() < line_len + header.bytes + 2 {
            return None;
        }

        let data_end = line_len + header.bytes;
        if &buf[data_end..data_end + 2] != b"\r\n" {
            // skip the rest of the mis-sized block
            match buf[data_end..].iter().position(|b| *b == b'\n') {
                Some(pos) => buf.advance(data_end + pos + 1),
                None => buf.clear(),
            }
            return Some(Err(ParseError::BadDataChunk));
        }

        let value = buf[line_len..data_end].to_vec();
        buf.advance(data_end + 2);

        let key = tokens[1].clone();
        let noreply = header.noreply;
        Some(Ok(if tokens[0].as_slice() == b"add" {
            Command::Add {
                key,
                value,
                noreply,
            }
        } else {
            Command::Set {
                key,
                value,
                noreply,
            }
        }))
    }
}

/// Data block length of a well-shaped storage line, even if rejected
fn announced_bytes(tokens: &[Vec<u8>]) -> Option<usize> {
    if tokens.len() != 5 && tokens.len() != 6 {
        return None;
    }
    number(&tokens[4]).ok()
}

struct StorageHeader {
    bytes: usize,
    noreply: bool,
}

fn storage_header(tokens: &[Vec<u8>]) -> Result<StorageHeader, ParseError> {
    if tokens.len() != 5 && tokens.len() != 6 {
        return Err(ParseError::BadFormat);
    }
    validate_key(&tokens[1]).map_err(|_| ParseError::BadFormat)?;
    let flags: u32 = number(&tokens[2])?;
    let exptime: i64 = number(&tokens[3])?;
    let bytes: usize = number(&tokens[4])?;
    if bytes > MAX_VALUE_LEN {
        return Err(ParseError::TooLarge);
    }
    if flags != 0 || exptime != 0 {
        debug!("ignoring flags={} exptime={}", flags, exptime);
    }
    Ok(StorageHeader {
        bytes,
        noreply: noreply(tokens, 5)?,
    })
}

fn parse_simple(name: &[u8], tokens: &[Vec<u8>]) -> Result<Command, ParseError> {
    match name {
        b"get" | b"gets" => {
            if tokens.len() < 2 {
                return Err(ParseError::BadFormat);
            }
            for key in &tokens[1..] {
                validate_key(key).map_err(|_| ParseError::BadFormat)?;
            }
            Ok(Command::Get {
                keys: tokens[1..].to_vec(),
            })
        }
        b"delete" => {
            if tokens.len() != 2 && tokens.len() != 3 {
                return Err(ParseError::BadFormat);
            }
            validate_key(&tokens[1]).map_err(|_| ParseError::BadFormat)?;
            Ok(Command::Delete {
                key: tokens[1].clone(),
                noreply: noreply(tokens, 2)?,
            })
        }
        b"incr" | b"decr" => {
            if tokens.len() != 3 && tokens.len() != 4 {
                return Err(ParseError::BadFormat);
            }
            validate_key(&tokens[1]).map_err(|_| ParseError::BadFormat)?;
            let key = tokens[1].clone();
            let delta = number(&tokens[2])?;
            let noreply = noreply(tokens, 3)?;
            Ok(if name == b"incr" {
                Command::Incr {
                    key,
                    delta,
                    noreply,
                }
            } else {
                Command::Decr {
                    key,
                    delta,
                    noreply,
                }
            })
        }
        b"version" => Ok(Command::Version),
        b"stats" => Ok(Command::Stats),
        b"quit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn number<T: std::str::FromStr>(token: &[u8]) -> Result<T, ParseError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::BadFormat)
}

/// Optional trailing `noreply` at `index`
fn noreply(tokens: &[Vec<u8>], index: usize) -> Result<bool, ParseError> {
    match tokens.get(index) {
        None => Ok(false),
        Some(t) if t.as_slice() == b"noreply" => Ok(true),
        Some(_) => Err(ParseError::BadFormat),
    }
}
