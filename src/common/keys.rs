//! Key namespaces inside the storage engine
//!
//! The first byte of every engine key selects its namespace. Binlog keys sort
//! before metadata, which sorts before application data.

/// `0x01 || seq (big-endian)`
pub const BINLOG_PREFIX: u8 = 0x01;

/// Node-local bookkeeping (replica cursor)
pub const META_PREFIX: u8 = 0x02;

/// `'k' || user key`
pub const KV_PREFIX: u8 = b'k';

/// Where a slave keeps its replay cursor
pub const SLAVE_STATUS_KEY: &[u8] = b"\x02slave.status";

pub fn encode_kv_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + 1);
    key.push(KV_PREFIX);
    key.extend_from_slice(user_key);
    key
}

/// Strip the application prefix; `None` for keys in other namespaces
pub fn decode_kv_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&KV_PREFIX, rest)) => Some(rest),
        _ => None,
    }
}

pub fn is_kv_key(key: &[u8]) -> bool {
    key.first() == Some(&KV_PREFIX)
}

/// Big-endian so that byte order equals sequence order
pub fn encode_binlog_key(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(BINLOG_PREFIX);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Sequence of a binlog key; `None` for anything else
pub fn decode_binlog_key(key: &[u8]) -> Option<u64> {
    if key.len() != 9 || key[0] != BINLOG_PREFIX {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&key[1..]);
    Some(u64::from_be_bytes(seq))
}
