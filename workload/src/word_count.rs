//! A MapReduce-compatible application that counts how often each word
//! appears across the inputs.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use common::utils::string_from_bytes;
use common::{KeyValue, MapOutput};

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let text = string_from_bytes(kv.value)?;
    let words: Vec<String> = text
        .split_whitespace()
        .map(|word| word.to_string())
        .collect();

    let iter = words.into_iter().map(|word| {
        Ok(KeyValue {
            key: Bytes::from(word),
            value: Bytes::from("1"),
        })
    });
    Ok(Box::new(iter))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let mut count = 0u64;
    for value in values {
        count += String::from_utf8(value.to_vec())?.parse::<u64>()?;
    }

    let mut out = BytesMut::with_capacity(key.len() + 24);
    let word = String::from_utf8(key.to_vec())?;
    out.put(format!("{} {}\n", word, count).as_bytes());
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_words_and_sums_counts() {
        let kv = KeyValue::new(Bytes::from("input.txt"), Bytes::from("the quick the\n"));
        let emitted: Vec<KeyValue> = map(kv, Bytes::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].key, Bytes::from("the"));

        let values: Vec<Bytes> = vec![Bytes::from("1"), Bytes::from("1"), Bytes::from("3")];
        let out = reduce(
            Bytes::from("the"),
            Box::new(values.into_iter()),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(&out[..], b"the 5\n");
    }
}
