//! End-to-end runs of the driver against a local working directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use common::{KeyValue, MapOutput, Workload};
use mrf_driver::{Backend, Config, Driver, Job};

fn word_count() -> Workload {
    fn map_fn(kv: KeyValue, _aux: Bytes) -> MapOutput {
        let text = String::from_utf8(kv.value.to_vec())?;
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        Ok(Box::new(words.into_iter().map(|word| {
            Ok(KeyValue::new(Bytes::from(word), Bytes::from("1")))
        })))
    }
    fn reduce_fn(
        key: Bytes,
        values: Box<dyn Iterator<Item = Bytes> + '_>,
        _aux: Bytes,
    ) -> Result<Bytes> {
        let mut count = 0u64;
        for value in values {
            count += String::from_utf8(value.to_vec())?.parse::<u64>()?;
        }
        Ok(Bytes::from(format!(
            "{} {}\n",
            String::from_utf8_lossy(&key),
            count
        )))
    }
    Workload { map_fn, reduce_fn }
}

/// Second-stage workload: re-aggregates `word N` lines produced by the
/// word-count stage.
fn sum_counts() -> Workload {
    fn map_fn(kv: KeyValue, _aux: Bytes) -> MapOutput {
        let text = String::from_utf8(kv.value.to_vec())?;
        let pairs: Vec<(String, String)> = text
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(w, n)| (w.to_string(), n.to_string()))
            .collect();
        Ok(Box::new(pairs.into_iter().map(|(word, count)| {
            Ok(KeyValue::new(Bytes::from(word), Bytes::from(count)))
        })))
    }
    fn reduce_fn(
        key: Bytes,
        values: Box<dyn Iterator<Item = Bytes> + '_>,
        _aux: Bytes,
    ) -> Result<Bytes> {
        let mut total = 0u64;
        for value in values {
            total += String::from_utf8(value.to_vec())?.parse::<u64>()?;
        }
        Ok(Bytes::from(format!(
            "{} {}\n",
            String::from_utf8_lossy(&key),
            total
        )))
    }
    Workload { map_fn, reduce_fn }
}

fn failing_map() -> Workload {
    fn map_fn(_kv: KeyValue, _aux: Bytes) -> MapOutput {
        anyhow::bail!("this map always fails")
    }
    fn reduce_fn(
        _key: Bytes,
        _values: Box<dyn Iterator<Item = Bytes> + '_>,
        _aux: Bytes,
    ) -> Result<Bytes> {
        Ok(Bytes::new())
    }
    Workload { map_fn, reduce_fn }
}

fn test_config(working_location: &str, inputs: Vec<String>) -> Config {
    Config {
        inputs,
        split_size: 1024,
        map_bin_size: 1024,
        reduce_bin_size: 64 * 1024 * 1024,
        max_concurrency: 4,
        working_location: working_location.to_string(),
        cleanup: true,
        backend: Backend::Local,
        ..Config::default()
    }
}

#[tokio::test]
async fn empty_inputs_dispatch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("w");
    let config = test_config(&out.to_string_lossy(), Vec::new());

    let driver = Driver::from_parts(vec![Job::new(word_count())], config);
    driver.run().await.unwrap();

    // the driver bailed before touching the filesystem
    assert!(!out.exists());
}

#[tokio::test]
async fn single_small_input_produces_output_0() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    // a handful of bytes, well under the split size
    let body = "apple banana apple cherry banana apple\n".repeat(2);
    std::fs::write(&input, &body).unwrap();

    let out = dir.path().join("w").to_string_lossy().into_owned();
    let config = test_config(&out, vec![input.to_string_lossy().into_owned()]);

    let done_calls = Arc::new(AtomicUsize::new(0));
    let observed = done_calls.clone();
    let job = Job::new(word_count()).on_done(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    let driver = Driver::from_parts(vec![job], config);
    let job_handle = driver.jobs()[0].clone();
    driver.run().await.unwrap();

    let output = std::fs::read_to_string(format!("{}/output-0", out)).unwrap();
    assert_eq!(output, "apple 6\nbanana 4\ncherry 2\n");

    // one reducer only, and intermediates were cleaned up
    let leftovers: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["output-0"]);

    assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    assert!(job_handle.bytes_read() >= body.len() as u64);
    assert!(job_handle.bytes_written() > 0);
}

#[tokio::test]
async fn two_stage_chain_rewires_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "x y x\nz x y\n").unwrap();

    let out = dir.path().join("w").to_string_lossy().into_owned();
    let config = test_config(&out, vec![input.to_string_lossy().into_owned()]);

    let driver = Driver::from_parts(
        vec![Job::new(word_count()), Job::new(sum_counts())],
        config,
    );
    let stage0 = driver.jobs()[0].clone();
    let stage1 = driver.jobs()[1].clone();
    driver.run().await.unwrap();

    assert_eq!(stage0.output_path(), format!("{}/job0", out));
    assert_eq!(stage1.output_path(), format!("{}/job1", out));

    let first = std::fs::read_to_string(format!("{}/job0/output-0", out)).unwrap();
    assert_eq!(first, "x 3\ny 2\nz 1\n");

    // stage 1 consumed stage 0's output-* files and re-aggregated them
    let second = std::fs::read_to_string(format!("{}/job1/output-0", out)).unwrap();
    assert_eq!(second, "x 3\ny 2\nz 1\n");
}

#[tokio::test]
async fn task_errors_do_not_fail_the_run_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "some words\n").unwrap();
    let out = dir.path().join("w").to_string_lossy().into_owned();

    let config = test_config(&out, vec![input.to_string_lossy().into_owned()]);
    let driver = Driver::from_parts(vec![Job::new(failing_map())], config);
    driver.run().await.unwrap();

    // the reduce phase still drained and wrote its (empty) output
    assert!(std::path::Path::new(&format!("{}/output-0", out)).exists());
}

#[tokio::test]
async fn fail_fast_surfaces_task_errors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "some words\n").unwrap();
    let out = dir.path().join("w").to_string_lossy().into_owned();

    let mut config = test_config(&out, vec![input.to_string_lossy().into_owned()]);
    config.fail_fast = true;

    let driver = Driver::from_parts(vec![Job::new(failing_map())], config);
    assert!(driver.run().await.is_err());
}
