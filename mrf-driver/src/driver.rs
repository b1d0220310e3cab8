//! The driver: plans a job's tasks, schedules them onto an executor and
//! chains multi-stage pipelines.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytesize::ByteSize;
use clap::Parser;
use rand::Rng;
use tracing::{debug, error, info, warn};

use common::cache::new_cache_system;
use common::fs::{infer_filesystem, FileSystem};

use crate::args::Args;
use crate::config::{Backend, Config};
use crate::executor::{Executor, LocalExecutor, TaskError, TaskPayload, TaskPhase, TaskResponse};
use crate::job::{Job, RunContext};
use crate::lambda::LambdaExecutor;
use crate::phase::{run_phase, Task};
use crate::split::{input_splits, pack_splits};
use crate::whisk::WhiskExecutor;

/// Exit code for the invariant violation of a cloud worker falling back
/// into the driver loop.
const WORKER_REENTRY_EXIT: i32 = -10;

const RUNTIME_ID_LEN: usize = 10;
const RUNTIME_ID_LETTERS: &[u8] = b"abcdef0123456789-_";

/// A fresh identifier for this driver instance, used to name remote
/// resources without colliding with concurrent drivers.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..RUNTIME_ID_LEN)
        .map(|_| RUNTIME_ID_LETTERS[rng.gen_range(0..RUNTIME_ID_LETTERS.len())] as char)
        .collect()
}

fn running_in_lambda() -> bool {
    std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some()
}

fn running_in_whisk() -> bool {
    std::env::var_os("__OW_ACTION_NAME").is_some() || std::env::var_os("__OW_API_HOST").is_some()
}

fn build_executor(backend: Backend, function_name: &str) -> Arc<dyn Executor> {
    match backend {
        Backend::Local => Arc::new(LocalExecutor),
        Backend::Lambda => Arc::new(LambdaExecutor::new(function_name.to_string())),
        Backend::Whisk => Arc::new(WhiskExecutor::new(function_name.to_string())),
    }
}

/// Controls the execution of one or more MapReduce jobs.
pub struct Driver {
    jobs: Vec<Arc<Job>>,
    config: Config,
    executor: Arc<dyn Executor>,
    runtime_id: String,
}

impl Driver {
    /// Create a driver for a single job, loading the layered configuration.
    pub fn new(job: Job) -> Self {
        Self::from_parts(vec![job], Config::load())
    }

    /// Create a driver that chains multiple jobs: the outputs of stage `i`
    /// become the inputs of stage `i + 1`.
    pub fn new_multi_stage(jobs: Vec<Job>) -> Self {
        Self::from_parts(jobs, Config::load())
    }

    /// Assemble a driver from explicit parts. Mostly useful for embedding
    /// and tests; `new` is the common path.
    pub fn from_parts(jobs: Vec<Job>, mut config: Config) -> Self {
        config.normalize();
        debug!("loaded config: {:?}", config);
        let executor = build_executor(config.backend, &config.function_name);
        Self {
            jobs: jobs.into_iter().map(Arc::new).collect(),
            config,
            executor,
            runtime_id: random_name(),
        }
    }

    pub fn with_split_size(mut self, bytes: u64) -> Self {
        self.config.split_size = bytes;
        self.config.normalize();
        self
    }

    pub fn with_map_bin_size(mut self, bytes: u64) -> Self {
        self.config.map_bin_size = bytes;
        self.config.normalize();
        self
    }

    pub fn with_reduce_bin_size(mut self, bytes: u64) -> Self {
        self.config.reduce_bin_size = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, tasks: usize) -> Self {
        self.config.max_concurrency = tasks;
        self.config.normalize();
        self
    }

    /// Sets the location (and thereby the filesystem backend) the driver
    /// writes under.
    pub fn with_working_location(mut self, location: impl Into<String>) -> Self {
        self.config.working_location = location.into();
        self
    }

    /// Append job inputs (files, directories or globs).
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self.executor = build_executor(backend, &self.config.function_name);
        self
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    async fn run_map_phase(
        &self,
        job: &Arc<Job>,
        job_index: usize,
        fs: &Arc<dyn FileSystem>,
        inputs: &[String],
    ) -> Result<Vec<TaskError>> {
        let splits = input_splits(fs, inputs, self.config.split_size).await?;
        if splits.is_empty() {
            warn!("no input splits");
            job.set_intermediate_bins(0);
            return Ok(Vec::new());
        }
        debug!("number of job input splits: {}", splits.len());

        let total_bytes: u64 = splits.iter().map(|s| s.length).sum();
        let intermediate_bins = total_bytes.div_ceil(self.config.reduce_bin_size).max(1);
        job.set_intermediate_bins(intermediate_bins as u32);

        let bins = pack_splits(splits, self.config.map_bin_size);
        debug!("number of job input bins: {}", bins.len());

        let tasks = bins
            .into_iter()
            .enumerate()
            .map(|(bin_id, bin)| Task::Map {
                bin_id: bin_id as u32,
                bin,
            })
            .collect();
        Ok(run_phase(
            "map",
            job.clone(),
            job_index,
            tasks,
            self.executor.clone(),
            self.config.max_concurrency,
        )
        .await)
    }

    async fn run_reduce_phase(&self, job: &Arc<Job>, job_index: usize) -> Vec<TaskError> {
        let tasks = (0..job.intermediate_bins())
            .map(|bin_id| Task::Reduce { bin_id })
            .collect();
        run_phase(
            "reduce",
            job.clone(),
            job_index,
            tasks,
            self.executor.clone(),
            self.config.max_concurrency,
        )
        .await
    }

    fn detect_cloud_executor(&self) -> Option<Arc<dyn Executor>> {
        if running_in_lambda() {
            debug!(">>>running on AWS Lambda>>>");
            return Some(Arc::new(LambdaExecutor::new(
                self.config.function_name.clone(),
            )));
        }
        if running_in_whisk() {
            debug!(">>>running on OpenWhisk>>>");
            return Some(Arc::new(WhiskExecutor::new(
                self.config.function_name.clone(),
            )));
        }
        None
    }

    /// Run the submitted jobs to completion.
    pub async fn run(self) -> Result<()> {
        Arc::new(self).run_jobs().await
    }

    async fn run_jobs(self: Arc<Self>) -> Result<()> {
        // A process inside a cloud-function environment is a worker, never
        // an orchestrator. Hand off; `start` holds the process for its
        // whole lifetime, so a return here is an invariant violation.
        if let Some(worker) = self.detect_cloud_executor() {
            let platform = worker
                .platform()
                .expect("cloud executors carry a platform capability");
            let outcome = platform.start(self.clone()).await;
            warn!("running on FaaS runtime and returned, this is bad! ({:?})", outcome);
            std::process::exit(WORKER_REENTRY_EXIT);
        }

        if let Some(platform) = self.executor.platform() {
            platform.deploy().await?;
        }

        if self.config.inputs.is_empty() {
            error!("no inputs!");
            return Ok(());
        }

        let cache = new_cache_system(self.config.cache);
        let mut inputs = self.config.inputs.clone();
        let stages = self.jobs.len();

        for (job_index, job) in self.jobs.iter().enumerate() {
            let fs = infer_filesystem(&inputs[0]);
            info!("starting job{} ({}/{})", job_index, job_index + 1, stages);

            let job_working_location = if stages > 1 {
                fs.join(&self.config.working_location, &format!("job{}", job_index))
            } else {
                self.config.working_location.clone()
            };

            job.prepare(RunContext {
                fs: fs.clone(),
                cache: cache.clone(),
                output_path: job_working_location.clone(),
                runtime_id: self.runtime_id.clone(),
                cleanup: self.config.cleanup,
            });

            let map_errors = self
                .run_map_phase(job, job_index, &fs, &inputs)
                .await?;
            let reduce_errors = self.run_reduce_phase(job, job_index).await;

            // Set inputs of the next job to the outputs of the current one.
            inputs = vec![fs.join(&job_working_location, "output-*")];

            info!(
                "job {} - total bytes read:\t{}",
                job_index,
                ByteSize(job.bytes_read())
            );
            info!(
                "job {} - total bytes written:\t{}",
                job_index,
                ByteSize(job.bytes_written())
            );

            job.done().await;

            if self.config.fail_fast && (!map_errors.is_empty() || !reduce_errors.is_empty()) {
                anyhow::bail!(
                    "job {}: {} map task(s) and {} reduce task(s) failed",
                    job_index,
                    map_errors.len(),
                    reduce_errors.len()
                );
            }
        }
        Ok(())
    }

    /// Reconstruct and execute one task on behalf of a remote invocation.
    /// Called from inside the cloud-function request loop.
    pub(crate) async fn execute_task(&self, payload: TaskPayload) -> TaskResponse {
        let Some(job) = self.jobs.get(payload.job_index) else {
            return TaskResponse::from_result(Err(TaskError::Transport(anyhow::anyhow!(
                "unknown job index {}",
                payload.job_index
            ))));
        };

        job.prepare(RunContext {
            fs: infer_filesystem(&payload.output_path),
            cache: None,
            output_path: payload.output_path.clone(),
            runtime_id: payload.runtime_id.clone(),
            cleanup: false,
        });
        job.set_intermediate_bins(payload.intermediate_bins);

        let result = match payload.phase {
            TaskPhase::Map => job.run_mapper(payload.bin_id, &payload.splits).await,
            TaskPhase::Reduce => job.run_reducer(payload.bin_id).await,
        };
        TaskResponse::from_result(result)
    }

    /// CLI entry point: applies flags, handles `--undeploy`, runs the jobs
    /// and reports wall-clock time.
    pub async fn main(mut self) {
        let args = Args::parse();
        init_logging(args.verbose || self.config.verbose);

        if args.undeploy {
            let backend = args.backend.unwrap_or(self.config.backend);
            let executor = build_executor(backend, &self.config.function_name);
            match executor.platform() {
                Some(platform) => {
                    if let Err(e) = platform.undeploy().await {
                        error!("{}", e);
                        std::process::exit(1);
                    }
                }
                None => error!("backend {} has no deploy lifecycle", backend),
            }
            return;
        }

        if let Some(backend) = args.backend {
            self.config.backend = backend;
            self.executor = build_executor(backend, &self.config.function_name);
        }
        if let Some(out) = args.out {
            self.config.working_location = out;
        }
        self.config.inputs.extend(args.inputs);
        let memprofile = args.memprofile;

        let started = Instant::now();
        if let Err(e) = self.run().await {
            error!("driver failed: {:#}", e);
        }
        println!("Job Execution Time: {:?}", started.elapsed());

        if let Some(path) = memprofile {
            write_memory_profile(&path);
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // A second driver in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}

/// Best-effort peak-memory report. The kernel already tracks the
/// high-water mark, so this is a snapshot of `/proc/self/status`.
fn write_memory_profile(path: &str) {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => {
            let report: String = status
                .lines()
                .filter(|line| line.starts_with("Vm"))
                .fold(String::new(), |mut acc, line| {
                    acc.push_str(line);
                    acc.push('\n');
                    acc
                });
            if let Err(e) = std::fs::write(path, report) {
                error!("could not write memory profile: {}", e);
            }
        }
        Err(e) => warn!("memory profile unavailable on this platform: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_id_has_the_documented_shape() {
        for _ in 0..100 {
            let id = random_name();
            assert_eq!(id.len(), 10);
            assert!(id
                .bytes()
                .all(|b| RUNTIME_ID_LETTERS.contains(&b)));
        }
    }

    #[test]
    fn runtime_ids_are_distinct_across_drivers() {
        let a = random_name();
        let b = random_name();
        assert_ne!(a, b);
    }
}
