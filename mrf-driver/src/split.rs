//! Input splitting and map-bin packing.
//!
//! Splitting is pure metadata: the filesystem is only asked for names and
//! sizes, never for data. Packing is first-fit with monotonic progression,
//! so the concatenation of all bins preserves split order.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::fs::FileSystem;

/// A contiguous byte range of a single input object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplit {
    /// Path of the input object.
    pub filename: String,

    /// First byte of the range.
    pub offset: u64,

    /// Number of bytes in the range.
    pub length: u64,
}

impl InputSplit {
    /// Byte offset just past the end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Enumerate the inputs and cut each into `split_size`-byte ranges. The last
/// split of an input carries the remainder; empty inputs produce no splits.
pub async fn input_splits(
    fs: &Arc<dyn FileSystem>,
    inputs: &[String],
    split_size: u64,
) -> Result<Vec<InputSplit>> {
    let mut splits = Vec::new();
    for input in inputs {
        let files = fs
            .list(input)
            .await
            .with_context(|| format!("failed to enumerate input {:?}", input))?;
        for file in files {
            let mut offset = 0;
            while offset < file.size {
                let length = split_size.min(file.size - offset);
                splits.push(InputSplit {
                    filename: file.name.clone(),
                    offset,
                    length,
                });
                offset += length;
            }
        }
    }
    debug!("produced {} input splits", splits.len());
    Ok(splits)
}

/// Pack splits into map bins of at most `bin_size` bytes, first-fit in input
/// order. A split larger than `bin_size` gets a bin of its own; splits are
/// never fragmented here.
pub fn pack_splits(splits: Vec<InputSplit>, bin_size: u64) -> Vec<Vec<InputSplit>> {
    let mut bins: Vec<Vec<InputSplit>> = Vec::new();
    let mut current: Vec<InputSplit> = Vec::new();
    let mut current_bytes = 0u64;

    for split in splits {
        if !current.is_empty() && current_bytes + split.length > bin_size {
            bins.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += split.length;
        current.push(split);
    }
    if !current.is_empty() {
        bins.push(current);
    }
    bins
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use common::fs::LocalFileSystem;

    fn split(len: u64) -> InputSplit {
        InputSplit {
            filename: "in".to_string(),
            offset: 0,
            length: len,
        }
    }

    fn lengths(bins: &[Vec<InputSplit>]) -> Vec<Vec<u64>> {
        bins.iter()
            .map(|bin| bin.iter().map(|s| s.length).collect())
            .collect()
    }

    #[tokio::test]
    async fn splits_cover_inputs_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);

        let big = dir.path().join("big.txt").to_string_lossy().into_owned();
        let small = dir.path().join("small.txt").to_string_lossy().into_owned();
        let empty = dir.path().join("empty.txt").to_string_lossy().into_owned();
        fs.write(&big, Bytes::from(vec![b'x'; 2500])).await.unwrap();
        fs.write(&small, Bytes::from(vec![b'y'; 100])).await.unwrap();
        fs.write(&empty, Bytes::new()).await.unwrap();

        let inputs = vec![big.clone(), small.clone(), empty];
        let splits = input_splits(&fs, &inputs, 1000).await.unwrap();

        // 2500 -> [1000, 1000, 500], 100 -> [100], 0 -> nothing
        assert_eq!(splits.len(), 4);
        assert_eq!(splits[0].offset, 0);
        assert_eq!(splits[1].offset, 1000);
        assert_eq!(splits[2].offset, 2000);
        assert_eq!(splits[2].length, 500);
        assert_eq!(splits[3].filename, small);
        assert_eq!(splits[3].length, 100);

        // contiguous, non-overlapping cover of the first input
        for pair in splits[..3].windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let inputs = vec!["/definitely/not/here".to_string()];
        assert!(input_splits(&fs, &inputs, 1000).await.is_err());
    }

    #[test]
    fn packs_first_fit() {
        let splits = vec![split(400), split(400), split(400), split(400)];
        let bins = pack_splits(splits, 1000);
        assert_eq!(lengths(&bins), vec![vec![400, 400], vec![400, 400]]);
    }

    #[test]
    fn oversize_split_gets_its_own_bin() {
        let splits = vec![split(1500), split(200)];
        let bins = pack_splits(splits, 1000);
        assert_eq!(lengths(&bins), vec![vec![1500], vec![200]]);
    }

    #[test]
    fn packing_preserves_order_and_coverage() {
        let splits: Vec<InputSplit> = [700u64, 400, 100, 100, 900, 50]
            .iter()
            .map(|&l| split(l))
            .collect();
        let bins = pack_splits(splits.clone(), 1000);

        let flattened: Vec<InputSplit> = bins.iter().flatten().cloned().collect();
        assert_eq!(flattened, splits);

        for bin in &bins {
            if bin.len() >= 2 {
                assert!(bin.iter().map(|s| s.length).sum::<u64>() <= 1000);
            }
        }
    }

    #[test]
    fn no_bins_from_no_splits() {
        assert!(pack_splits(Vec::new(), 1000).is_empty());
    }
}
