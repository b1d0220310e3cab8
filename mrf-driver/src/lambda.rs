//! AWS Lambda executor.
//!
//! The driver binary and the deployed function are the same program. On the
//! driver side, tasks are serialized and pushed through `Invoke`; inside
//! Lambda the process detects its environment and enters [`Platform::start`]
//! instead, serving tasks until the runtime shuts it down. Provisioning the
//! function (packaging, IAM) happens out of band; `deploy` only verifies
//! that the function is reachable.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use lambda_runtime::{service_fn, LambdaEvent};
use tokio::sync::OnceCell;
use tracing::info;

use crate::driver::Driver;
use crate::executor::{
    Executor, Platform, PlatformError, TaskError, TaskPayload, TaskPhase, TaskResponse,
};
use crate::job::Job;
use crate::split::InputSplit;

pub struct LambdaExecutor {
    function_name: String,
    client: OnceCell<aws_sdk_lambda::Client>,
}

impl LambdaExecutor {
    pub fn new(function_name: String) -> Self {
        Self {
            function_name,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_lambda::Client {
        self.client
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_lambda::Client::new(&config)
            })
            .await
    }

    async fn invoke(&self, payload: &TaskPayload) -> Result<TaskResponse, TaskError> {
        let body = serde_json::to_vec(payload).map_err(|e| TaskError::Transport(e.into()))?;
        let output = self
            .client()
            .await
            .invoke()
            .function_name(&self.function_name)
            .payload(Blob::new(body))
            .send()
            .await
            .map_err(|e| TaskError::Transport(anyhow!("lambda invoke failed: {}", e)))?;

        if let Some(function_error) = output.function_error() {
            return Err(TaskError::Transport(anyhow!(
                "lambda function error: {}",
                function_error
            )));
        }
        let payload = output
            .payload()
            .ok_or_else(|| TaskError::Transport(anyhow!("lambda returned no payload")))?;
        serde_json::from_slice(payload.as_ref())
            .map_err(|e| TaskError::Transport(anyhow!("undecodable lambda response: {}", e)))
    }
}

#[async_trait]
impl Executor for LambdaExecutor {
    async fn run_mapper(
        &self,
        job: &Arc<Job>,
        job_index: usize,
        bin_id: u32,
        bin: &[InputSplit],
    ) -> Result<(), TaskError> {
        let payload = TaskPayload {
            job_index,
            phase: TaskPhase::Map,
            bin_id,
            splits: bin.to_vec(),
            output_path: job.output_path(),
            intermediate_bins: job.intermediate_bins(),
            runtime_id: job.runtime_id(),
        };
        self.invoke(&payload).await?.into_result(job)
    }

    async fn run_reducer(
        &self,
        job: &Arc<Job>,
        job_index: usize,
        bin_id: u32,
    ) -> Result<(), TaskError> {
        let payload = TaskPayload {
            job_index,
            phase: TaskPhase::Reduce,
            bin_id,
            splits: Vec::new(),
            output_path: job.output_path(),
            intermediate_bins: job.intermediate_bins(),
            runtime_id: job.runtime_id(),
        };
        self.invoke(&payload).await?.into_result(job)
    }

    fn platform(&self) -> Option<&dyn Platform> {
        Some(self)
    }
}

#[async_trait]
impl Platform for LambdaExecutor {
    async fn deploy(&self) -> Result<(), PlatformError> {
        self.client()
            .await
            .get_function()
            .function_name(&self.function_name)
            .send()
            .await
            .map_err(|e| {
                PlatformError::Deploy(anyhow!(
                    "lambda function {:?} is not deployed: {}",
                    self.function_name,
                    e
                ))
            })?;
        info!("lambda function {} is deployed", self.function_name);
        Ok(())
    }

    async fn undeploy(&self) -> Result<(), PlatformError> {
        self.client()
            .await
            .delete_function()
            .function_name(&self.function_name)
            .send()
            .await
            .map_err(|e| PlatformError::Undeploy(anyhow!("{}", e)))?;
        info!("lambda function {} deleted", self.function_name);
        Ok(())
    }

    async fn start(&self, driver: Arc<Driver>) -> anyhow::Result<()> {
        info!(
            "serving map/reduce tasks as lambda function {}",
            self.function_name
        );
        lambda_runtime::run(service_fn(move |event: LambdaEvent<TaskPayload>| {
            let driver = driver.clone();
            async move {
                Ok::<TaskResponse, std::convert::Infallible>(driver.execute_task(event.payload).await)
            }
        }))
        .await
        .map_err(|e| anyhow!("lambda runtime exited: {}", e))
    }
}
