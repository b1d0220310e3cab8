//! A user job and the task bodies that execute it.
//!
//! The driver owns jobs; executors call back into [`Job::run_mapper`] and
//! [`Job::run_reducer`], locally or from inside a cloud function. All
//! mutable state is either set once before the phases run or accumulated
//! atomically across concurrent tasks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use common::cache::CacheSystem;
use common::fs::FileSystem;
use common::{codec, default_partition, KeyValue, PartitionFn, Workload};

use crate::executor::{TaskCounters, TaskError};
use crate::split::InputSplit;

/// How far past a split boundary the mapper will look for the end of the
/// record straddling it.
const RECORD_PROBE: u64 = 64 * 1024;
const MAX_RECORD: u64 = 16 * 1024 * 1024;

/// Per-run state, installed by the driver before any phase starts.
pub(crate) struct RunContext {
    pub fs: Arc<dyn FileSystem>,
    pub cache: Option<Arc<dyn CacheSystem>>,
    pub output_path: String,
    pub runtime_id: String,
    pub cleanup: bool,
}

/// A user-defined MapReduce computation plus its execution state.
pub struct Job {
    workload: Workload,
    partition_fn: PartitionFn,
    aux: Bytes,
    intermediate_bins: AtomicU32,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    ctx: RwLock<Option<Arc<RunContext>>>,
    on_done: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Job {
    pub fn new(workload: Workload) -> Self {
        Self {
            workload,
            partition_fn: default_partition,
            aux: Bytes::new(),
            intermediate_bins: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            ctx: RwLock::new(None),
            on_done: None,
        }
    }

    /// Replace the default `ihash`-based partitioner.
    pub fn with_partitioner(mut self, partition_fn: PartitionFn) -> Self {
        self.partition_fn = partition_fn;
        self
    }

    /// Auxiliary bytes handed to every map and reduce invocation.
    pub fn with_aux(mut self, aux: Bytes) -> Self {
        self.aux = aux;
        self
    }

    /// Hook invoked once after this job's reduce phase completes.
    pub fn on_done(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn intermediate_bins(&self) -> u32 {
        self.intermediate_bins.load(Ordering::Relaxed)
    }

    /// Output path of the current run. Empty before the driver prepares
    /// the job.
    pub fn output_path(&self) -> String {
        self.ctx
            .read()
            .unwrap()
            .as_ref()
            .map(|ctx| ctx.output_path.clone())
            .unwrap_or_default()
    }

    /// Runtime id of the driver this job is running under. Empty before
    /// the driver prepares the job.
    pub(crate) fn runtime_id(&self) -> String {
        self.ctx
            .read()
            .unwrap()
            .as_ref()
            .map(|ctx| ctx.runtime_id.clone())
            .unwrap_or_default()
    }

    pub(crate) fn add_counters(&self, counters: TaskCounters) {
        self.bytes_read.fetch_add(counters.bytes_read, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(counters.bytes_written, Ordering::Relaxed);
    }

    pub(crate) fn prepare(&self, ctx: RunContext) {
        *self.ctx.write().unwrap() = Some(Arc::new(ctx));
    }

    pub(crate) fn set_intermediate_bins(&self, bins: u32) {
        self.intermediate_bins.store(bins, Ordering::Relaxed);
    }

    fn context(&self) -> Arc<RunContext> {
        self.ctx
            .read()
            .unwrap()
            .clone()
            .expect("job used before the driver prepared it")
    }

    fn intermediate_name(&self, ctx: &RunContext, map_bin: u32, reduce_bin: u32) -> String {
        ctx.fs.join(
            &ctx.output_path,
            &format!(
                "intermediate-{}-m{}-r{}",
                ctx.runtime_id, map_bin, reduce_bin
            ),
        )
    }

    fn intermediate_pattern(&self, ctx: &RunContext, reduce_bin: Option<u32>) -> String {
        let tail = match reduce_bin {
            Some(bin) => format!("intermediate-{}-m*-r{}", ctx.runtime_id, bin),
            None => format!("intermediate-{}-*", ctx.runtime_id),
        };
        ctx.fs.join(&ctx.output_path, &tail)
    }

    /// Read one split, adjusted to record boundaries: a split that does not
    /// begin a record skips its partial head (the previous split owns it),
    /// and a split whose tail is cut mid-record reads forward to finish it.
    async fn read_split(&self, fs: &Arc<dyn FileSystem>, split: &InputSplit) -> anyhow::Result<(Bytes, u64)> {
        let mut read_bytes = 0u64;
        let data = fs
            .read_range(&split.filename, split.offset, split.length)
            .await?;
        read_bytes += data.len() as u64;

        let mut buf = BytesMut::from(&data[..]);
        if !buf.is_empty() && buf.last() != Some(&b'\n') {
            let mut probe_offset = split.offset + data.len() as u64;
            let mut probed = 0u64;
            loop {
                let chunk = fs
                    .read_range(&split.filename, probe_offset, RECORD_PROBE)
                    .await?;
                if chunk.is_empty() {
                    break;
                }
                read_bytes += chunk.len() as u64;
                match chunk.iter().position(|&b| b == b'\n') {
                    Some(idx) => {
                        buf.extend_from_slice(&chunk[..=idx]);
                        break;
                    }
                    None => {
                        buf.extend_from_slice(&chunk);
                        probe_offset += chunk.len() as u64;
                        probed += chunk.len() as u64;
                        if probed > MAX_RECORD {
                            warn!("record at {}:{} exceeds {} bytes, truncating", split.filename, split.offset, MAX_RECORD);
                            break;
                        }
                    }
                }
            }
        }

        if split.offset > 0 {
            let before = fs
                .read_range(&split.filename, split.offset - 1, 1)
                .await?;
            read_bytes += before.len() as u64;
            if before.first() != Some(&b'\n') {
                // the head of this range belongs to the previous split
                match buf.iter().position(|&b| b == b'\n') {
                    Some(idx) => {
                        let _ = buf.split_to(idx + 1);
                    }
                    None => buf.clear(),
                }
            }
        }

        Ok((buf.freeze(), read_bytes))
    }

    /// Map task body: read every split in the bin, run the user map
    /// function, partition the emitted pairs and write one fragment per
    /// non-empty partition.
    pub(crate) async fn run_mapper(
        &self,
        bin_id: u32,
        bin: &[InputSplit],
    ) -> Result<TaskCounters, TaskError> {
        let ctx = self.context();
        let bins = self.intermediate_bins().max(1);
        let mut counters = TaskCounters::default();
        let mut partitions: Vec<Vec<KeyValue>> = vec![Vec::new(); bins as usize];

        for split in bin {
            let (data, read_bytes) = self
                .read_split(&ctx.fs, split)
                .await
                .map_err(TaskError::InputRead)?;
            counters.bytes_read += read_bytes;

            let record = KeyValue::new(Bytes::from(split.filename.clone()), data);
            let emitted = (self.workload.map_fn)(record, self.aux.clone())
                .map_err(TaskError::UserMap)?;
            for kv in emitted {
                let kv = kv.map_err(TaskError::UserMap)?;
                let partition = (self.partition_fn)(&kv.key, bins);
                partitions[(partition % bins) as usize].push(kv);
            }
        }

        for (partition, pairs) in partitions.iter().enumerate() {
            if pairs.is_empty() {
                continue;
            }
            let body = codec::encode_pairs(pairs);
            counters.bytes_written += body.len() as u64;
            let name = self.intermediate_name(&ctx, bin_id, partition as u32);
            self.write_intermediate(&ctx, &name, body)
                .await
                .map_err(TaskError::IntermediateWrite)?;
        }

        debug!("map bin {} done ({} splits)", bin_id, bin.len());
        self.add_counters(counters);
        Ok(counters)
    }

    /// Reduce task body: gather every fragment shuffled to this bin, group
    /// pairs by key in sorted order, run the user reduce function per key
    /// and write `output-<binID>`.
    pub(crate) async fn run_reducer(&self, bin_id: u32) -> Result<TaskCounters, TaskError> {
        let ctx = self.context();
        let mut counters = TaskCounters::default();
        let pattern = self.intermediate_pattern(&ctx, Some(bin_id));

        let fragments = self
            .list_intermediates(&ctx, &pattern)
            .await
            .map_err(TaskError::IntermediateRead)?;

        let mut groups: BTreeMap<Vec<u8>, Vec<Bytes>> = BTreeMap::new();
        for name in fragments {
            let body = self
                .read_intermediate(&ctx, &name)
                .await
                .map_err(TaskError::IntermediateRead)?;
            counters.bytes_read += body.len() as u64;
            for kv in codec::decode_pairs(&body).map_err(TaskError::IntermediateRead)? {
                groups.entry(kv.key.to_vec()).or_default().push(kv.value);
            }
        }

        let mut out = BytesMut::new();
        for (key, values) in groups {
            let reduced = (self.workload.reduce_fn)(
                Bytes::from(key),
                Box::new(values.into_iter()),
                self.aux.clone(),
            )
            .map_err(TaskError::UserReduce)?;
            out.extend_from_slice(&reduced);
        }

        let output_name = ctx
            .fs
            .join(&ctx.output_path, &format!("output-{}", bin_id));
        counters.bytes_written += out.len() as u64;
        ctx.fs
            .write(&output_name, out.freeze())
            .await
            .map_err(TaskError::OutputWrite)?;

        debug!("reduce bin {} done", bin_id);
        self.add_counters(counters);
        Ok(counters)
    }

    async fn write_intermediate(
        &self,
        ctx: &RunContext,
        name: &str,
        body: Bytes,
    ) -> anyhow::Result<()> {
        match &ctx.cache {
            Some(cache) => cache.put(name, body).await,
            None => ctx.fs.write(name, body).await,
        }
    }

    async fn list_intermediates(
        &self,
        ctx: &RunContext,
        pattern: &str,
    ) -> anyhow::Result<Vec<String>> {
        match &ctx.cache {
            Some(cache) => cache.list(pattern).await,
            None => Ok(ctx
                .fs
                .list(pattern)
                .await?
                .into_iter()
                .map(|f| f.name)
                .collect()),
        }
    }

    async fn read_intermediate(&self, ctx: &RunContext, name: &str) -> anyhow::Result<Bytes> {
        if let Some(cache) = &ctx.cache {
            if let Some(body) = cache.get(name).await? {
                return Ok(body);
            }
        }
        ctx.fs.read(name).await
    }

    /// Runs once after the reduce phase: delete intermediate data when
    /// configured, then fire the user hook. Cleanup failures are logged,
    /// never fatal.
    pub(crate) async fn done(&self) {
        let ctx = self.context();
        if ctx.cleanup {
            if let Some(cache) = &ctx.cache {
                if let Err(e) = cache.clear().await {
                    warn!("failed to clear intermediate cache: {}", e);
                }
            }
            let pattern = self.intermediate_pattern(&ctx, None);
            match ctx.fs.list(&pattern).await {
                Ok(files) => {
                    for file in files {
                        if let Err(e) = ctx.fs.delete(&file.name).await {
                            warn!("failed to delete {}: {}", file.name, e);
                        }
                    }
                }
                Err(e) => warn!("failed to list intermediate data: {}", e),
            }
        }

        if let Some(hook) = &self.on_done {
            hook();
        }
    }
}
