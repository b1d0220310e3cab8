//! Line codec for shuffled key-value pairs.
//!
//! Intermediate fragments are plain text: one pair per line, key and value
//! base64-encoded (URL-safe alphabet) and separated by a single space. Keys
//! and values may contain arbitrary bytes, so they are never written raw.

use anyhow::{anyhow, Error, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::Bytes;

use crate::KeyValue;

/// Encode one pair as a codec line, without the trailing newline.
pub fn encode_pair(kv: &KeyValue) -> String {
    format!("{} {}", URL_SAFE.encode(&kv.key), URL_SAFE.encode(&kv.value))
}

/// Encode a batch of pairs into one fragment body.
pub fn encode_pairs<'a, I>(pairs: I) -> Bytes
where
    I: IntoIterator<Item = &'a KeyValue>,
{
    let mut out = String::new();
    for kv in pairs {
        out.push_str(&encode_pair(kv));
        out.push('\n');
    }
    Bytes::from(out)
}

/// Decode a single codec line back into a pair.
pub fn decode_line(line: &str) -> Result<KeyValue> {
    let (key, value) = line
        .split_once(' ')
        .ok_or_else(|| anyhow!("malformed codec line: {:?}", line))?;
    Ok(KeyValue {
        key: Bytes::from(URL_SAFE.decode(key).map_err(Error::from)?),
        value: Bytes::from(URL_SAFE.decode(value).map_err(Error::from)?),
    })
}

/// Decode a whole fragment body. Empty lines are skipped.
pub fn decode_pairs(data: &[u8]) -> Result<Vec<KeyValue>> {
    let text = std::str::from_utf8(data).map_err(|e| anyhow!("fragment is not UTF-8: {}", e))?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(decode_line)
        .collect()
}
