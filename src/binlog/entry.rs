//! Binlog entry format
//!
//! `[SEQ:8 little-endian][CMD:1][KEY:n]`. The key length is implied by the
//! containing record, so the header is a fixed 9 bytes.

use crate::common::{display_key, Error, Result};

pub const HEADER_LEN: usize = 9;

/// Operation recorded by a binlog entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinlogCommand {
    None = 0,
    Set = 1,
    Del = 2,
    /// Start of a full copy
    Begin = 7,
    /// End of a full copy
    End = 8,
}

impl TryFrom<u8> for BinlogCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Set),
            2 => Ok(Self::Del),
            7 => Ok(Self::Begin),
            8 => Ok(Self::End),
            _ => Err(Error::Corrupted(format!("unknown binlog command: {}", value))),
        }
    }
}

impl std::fmt::Display for BinlogCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinlogCommand::None => write!(f, "none"),
            BinlogCommand::Set => write!(f, "set"),
            BinlogCommand::Del => write!(f, "del"),
            BinlogCommand::Begin => write!(f, "begin"),
            BinlogCommand::End => write!(f, "end"),
        }
    }
}

/// Immutable record of one committed mutation (or a copy marker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEntry {
    seq: u64,
    cmd: BinlogCommand,
    key: Vec<u8>,
}

impl BinlogEntry {
    pub fn new(seq: u64, cmd: BinlogCommand, key: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            cmd,
            key: key.into(),
        }
    }

    /// Entry without a key (`NONE`, `BEGIN`, `END`)
    pub fn marker(seq: u64, cmd: BinlogCommand) -> Self {
        Self::new(seq, cmd, Vec::new())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cmd(&self) -> BinlogCommand {
        self.cmd
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.key.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.key);
    }

    /// Decode a stored or received entry.
    ///
    /// Buffers shorter than the header are corruption, never "absent".
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Corrupted(format!(
                "binlog entry too short: {} bytes",
                buf.len()
            )));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[..8]);
        Ok(Self {
            seq: u64::from_le_bytes(seq),
            cmd: BinlogCommand::try_from(buf[8])?,
            key: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl std::fmt::Display for BinlogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.seq, self.cmd, display_key(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let entry = BinlogEntry::new(0x0102, BinlogCommand::Del, b"kab".to_vec());
        let buf = entry.encode();
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..8], &0x0102u64.to_le_bytes());
        assert_eq!(buf[8], 2);
        assert_eq!(&buf[9..], b"kab");
        assert_eq!(BinlogEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn test_short_buffer_is_corruption() {
        let err = BinlogEntry::decode(&[0u8; 8]).unwrap_err();
        assert!(err.is_corruption());
        assert!(BinlogEntry::decode(&[]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_marker_has_empty_key() {
        let end = BinlogEntry::marker(42, BinlogCommand::End);
        let decoded = BinlogEntry::decode(&end.encode()).unwrap();
        assert_eq!(decoded.seq(), 42);
        assert_eq!(decoded.cmd(), BinlogCommand::End);
        assert!(decoded.key().is_empty());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = BinlogEntry::marker(1, BinlogCommand::None).encode();
        buf[8] = 99;
        assert!(BinlogEntry::decode(&buf).is_err());
    }

    #[test]
    fn test_display() {
        let entry = BinlogEntry::new(7, BinlogCommand::Set, b"kname".to_vec());
        assert_eq!(entry.to_string(), "7 set kname");
    }
}
