//! Utility functions for tinykv

/// Render a key for log output: printable ASCII as-is, anything else as hex
pub fn display_key(key: &[u8]) -> String {
    if !key.is_empty() && key.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(key).into_owned()
    } else {
        format!("0x{}", hex::encode(key))
    }
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Validate a client key (non-empty, bounded, no whitespace or control chars)
pub fn validate_key(key: &[u8]) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::Protocol("key cannot be empty".into()));
    }

    if key.len() > 250 {
        return Err(crate::Error::Protocol("key too long (max 250 bytes)".into()));
    }

    if key.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(crate::Error::Protocol("key contains invalid characters".into()));
    }

    Ok(())
}
