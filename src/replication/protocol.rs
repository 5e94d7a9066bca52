//! Replication wire protocol
//!
//! Format: [cmd:2][body_len:4][body:N], little-endian, `body_len` excludes the
//! header.
//!
//! - `Ping`: empty body
//! - `SyncRequest`: [last_seq:8][last_key:*]
//! - `SyncResponse`: [method:1][binlog_len:4][binlog:binlog_len][value:*]

use crate::binlog::BinlogEntry;
use crate::common::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 6;

/// Upper bound on a single frame body
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Frame command codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping = 0x0001,
    SyncRequest = 0x0101,
    SyncResponse = 0x0102,
}

impl TryFrom<u16> for MessageKind {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Self::Ping),
            0x0101 => Ok(Self::SyncRequest),
            0x0102 => Ok(Self::SyncResponse),
            _ => Err(Error::Protocol(format!("unknown command: {:#06x}", value))),
        }
    }
}

/// How the replica should treat a streamed entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    /// Heartbeat carrying the cursor
    Noop = 0,
    /// Incremental replay
    Sync = 1,
    /// Full copy
    Copy = 2,
}

impl TryFrom<u8> for SyncMethod {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Sync),
            2 => Ok(Self::Copy),
            _ => Err(Error::Protocol(format!("unknown sync method: {}", value))),
        }
    }
}

impl std::fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMethod::Noop => write!(f, "noop"),
            SyncMethod::Sync => write!(f, "sync"),
            SyncMethod::Copy => write!(f, "copy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping,
    SyncRequest {
        seq: u64,
        key: Vec<u8>,
    },
    SyncResponse {
        method: SyncMethod,
        entry: BinlogEntry,
        value: Vec<u8>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping => MessageKind::Ping,
            Message::SyncRequest { .. } => MessageKind::SyncRequest,
            Message::SyncResponse { .. } => MessageKind::SyncResponse,
        }
    }

    pub fn response(method: SyncMethod, entry: BinlogEntry, value: Vec<u8>) -> Self {
        Message::SyncResponse {
            method,
            entry,
            value,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Ping => 0,
            Message::SyncRequest { key, .. } => 8 + key.len(),
            Message::SyncResponse { entry, value, .. } => 1 + 4 + entry.encoded_len() + value.len(),
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Message::Ping => {}
            Message::SyncRequest { seq, key } => {
                dst.put_u64_le(*seq);
                dst.put_slice(key);
            }
            Message::SyncResponse {
                method,
                entry,
                value,
            } => {
                let binlog = entry.encode();
                dst.put_u8(*method as u8);
                dst.put_u32_le(binlog.len() as u32);
                dst.put_slice(&binlog);
                dst.put_slice(value);
            }
        }
    }

    fn decode_body(kind: MessageKind, mut body: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::Ping => Ok(Message::Ping),
            MessageKind::SyncRequest => {
                if body.len() < 8 {
                    return Err(Error::Protocol("sync request too short".into()));
                }
                let seq = body.get_u64_le();
                Ok(Message::SyncRequest {
                    seq,
                    key: body.to_vec(),
                })
            }
            MessageKind::SyncResponse => {
                if body.len() < 5 {
                    return Err(Error::Protocol("sync response too short".into()));
                }
                let method = SyncMethod::try_from(body.get_u8())?;
                let binlog_len = body.get_u32_le() as usize;
                if body.len() < binlog_len {
                    return Err(Error::Protocol(format!(
                        "binlog length {} exceeds body ({} bytes left)",
                        binlog_len,
                        body.len()
                    )));
                }
                let entry = BinlogEntry::decode(&body[..binlog_len])?;
                Ok(Message::SyncResponse {
                    method,
                    entry,
                    value: body[binlog_len..].to_vec(),
                })
            }
        }
    }
}

/// Frame codec for replication streams
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplicationCodec;

impl Decoder for ReplicationCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let cmd = u16::from_le_bytes([src[0], src[1]]);
        let body_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(Error::Protocol(format!("frame too large: {} bytes", body_len)));
        }
        let kind = MessageKind::try_from(cmd)?;

        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len);
        Message::decode_body(kind, &body).map(Some)
    }
}

impl Encoder<Message> for ReplicationCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body_len = item.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(Error::Protocol(format!("frame too large: {} bytes", body_len)));
        }
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u16_le(item.kind() as u16);
        dst.put_u32_le(body_len as u32);
        item.encode_body(dst);
        Ok(())
    }
}
