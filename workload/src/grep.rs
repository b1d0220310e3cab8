//! A MapReduce-compatible application that finds lines containing a fixed
//! pattern. The pattern arrives through the job's auxiliary bytes.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use common::utils::string_from_bytes;
use common::{KeyValue, MapOutput};

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let pattern = string_from_bytes(aux)?;
    let text = string_from_bytes(kv.value)?;

    let matches: Vec<String> = text
        .lines()
        .filter(|line| line.contains(&pattern))
        .map(|line| line.to_string())
        .collect();

    let iter = matches.into_iter().map(|line| {
        Ok(KeyValue {
            key: Bytes::from(line),
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
    let occurrences = values.count();

    let mut out = BytesMut::with_capacity(key.len() + 16);
    out.put(key.as_ref());
    out.put(format!("\t{}\n", occurrences).as_bytes());
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_matching_lines() {
        let kv = KeyValue::new(
            Bytes::from("log"),
            Bytes::from("error: disk\nok\nerror: net\n"),
        );
        let emitted: Vec<KeyValue> = map(kv, Bytes::from("error"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].key, Bytes::from("error: net"));
    }
}
