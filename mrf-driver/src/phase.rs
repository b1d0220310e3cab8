//! Drives one phase (map or reduce) of one job.
//!
//! Tasks run on their own tokio tasks, gated by a semaphore so at most
//! `concurrency` are in flight. The semaphore is acquired *before* spawning,
//! which keeps very large bin counts from materializing as task storms. The
//! phase always drains: individual task failures are logged and collected,
//! never aborted on.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::executor::{Executor, TaskError};
use crate::job::Job;
use crate::split::InputSplit;

/// One schedulable unit of a phase.
pub(crate) enum Task {
    Map { bin_id: u32, bin: Vec<InputSplit> },
    Reduce { bin_id: u32 },
}

fn phase_bar(label: &str, total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{prefix:>6} [{bar:40}] {pos}/{len}")
            .expect("static progress template")
            .progress_chars("=> "),
    );
    bar.set_prefix(label.to_string());
    bar
}

/// Run every task to completion and return the errors seen along the way.
pub(crate) async fn run_phase(
    label: &str,
    job: Arc<Job>,
    job_index: usize,
    tasks: Vec<Task>,
    executor: Arc<dyn Executor>,
    concurrency: usize,
) -> Vec<TaskError> {
    let bar = phase_bar(label, tasks.len() as u64);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    for task in tasks {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("phase semaphore closed");
        let job = job.clone();
        let executor = executor.clone();
        let bar = bar.clone();
        let label = label.to_string();

        in_flight.spawn(async move {
            let _permit = permit;
            let (bin_id, result) = match task {
                Task::Map { bin_id, bin } => (
                    bin_id,
                    executor.run_mapper(&job, job_index, bin_id, &bin).await,
                ),
                Task::Reduce { bin_id } => {
                    (bin_id, executor.run_reducer(&job, job_index, bin_id).await)
                }
            };
            bar.inc(1);
            match result {
                Ok(()) => None,
                Err(e) => {
                    error!("error when running {} task {}: {}", label, bin_id, e);
                    Some(e)
                }
            }
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(Some(e)) => errors.push(e),
            Ok(None) => {}
            Err(join_error) => {
                error!("{} task aborted: {}", label, join_error);
                errors.push(TaskError::Transport(anyhow::anyhow!(join_error)));
            }
        }
    }
    bar.finish();
    errors
}
