use anyhow::{anyhow, Result};
use bytes::Bytes;

/// Decode a UTF-8 string from a [`Bytes`] value.
pub fn string_from_bytes(bytes: Bytes) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| anyhow!("invalid UTF-8 payload: {}", e))
}
