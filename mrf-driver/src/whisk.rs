//! OpenWhisk executor.
//!
//! Tasks go out as blocking action invocations over the OpenWhisk REST API.
//! When this process *is* the action (docker-action runtime), `start` serves
//! the `/init` + `/run` protocol on port 8080 and never hands control back
//! to the driver loop. Creating the action itself happens out of band.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::driver::Driver;
use crate::executor::{
    Executor, Platform, PlatformError, TaskError, TaskPayload, TaskPhase, TaskResponse,
};
use crate::job::Job;
use crate::split::InputSplit;

const ACTION_PROTOCOL_ADDR: &str = "0.0.0.0:8080";

pub struct WhiskExecutor {
    action: String,
    api_host: String,
    auth: Option<(String, String)>,
    http: reqwest::Client,
}

impl WhiskExecutor {
    pub fn new(action: String) -> Self {
        let api_host = std::env::var("__OW_API_HOST")
            .or_else(|_| std::env::var("WHISK_API_HOST"))
            .unwrap_or_else(|_| "http://localhost:3233".to_string());
        let auth = std::env::var("__OW_API_KEY")
            .or_else(|_| std::env::var("WHISK_AUTH"))
            .ok()
            .and_then(|key| {
                key.split_once(':')
                    .map(|(user, pass)| (user.to_string(), pass.to_string()))
            });
        Self {
            action,
            api_host,
            auth,
            http: reqwest::Client::new(),
        }
    }

    fn action_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/_/actions/{}",
            self.api_host.trim_end_matches('/'),
            self.action
        )
    }

    fn authenticated(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn invoke(&self, payload: &TaskPayload) -> Result<TaskResponse, TaskError> {
        let url = format!("{}?blocking=true&result=true", self.action_url());
        let response = self
            .authenticated(self.http.post(&url).json(payload))
            .send()
            .await
            .map_err(|e| TaskError::Transport(anyhow!("whisk invoke failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TaskError::Transport(anyhow!(
                "action invocation returned {}",
                response.status()
            )));
        }
        response
            .json::<TaskResponse>()
            .await
            .map_err(|e| TaskError::Transport(anyhow!("undecodable action response: {}", e)))
    }
}

#[async_trait]
impl Executor for WhiskExecutor {
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

/// Invocation envelope of the docker-action protocol: parameters arrive
/// under a `value` key.
#[derive(Debug, Deserialize)]
struct ActionInvocation {
    value: TaskPayload,
}

async fn init_action() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn run_action(
    State(driver): State<Arc<Driver>>,
    Json(invocation): Json<ActionInvocation>,
) -> Json<TaskResponse> {
    Json(driver.execute_task(invocation.value).await)
}

#[async_trait]
impl Platform for WhiskExecutor {
    async fn deploy(&self) -> Result<(), PlatformError> {
        let response = self
            .authenticated(self.http.get(self.action_url()))
            .send()
            .await
            .map_err(|e| PlatformError::Deploy(anyhow!("whisk unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(PlatformError::Deploy(anyhow!(
                "action {:?} is not deployed: {}",
                self.action,
                response.status()
            )));
        }
        info!("whisk action {} is deployed", self.action);
        Ok(())
    }

    async fn undeploy(&self) -> Result<(), PlatformError> {
        let response = self
            .authenticated(self.http.delete(self.action_url()))
            .send()
            .await
            .map_err(|e| PlatformError::Undeploy(anyhow!("whisk unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(PlatformError::Undeploy(anyhow!(
                "could not delete action {:?}: {}",
                self.action,
                response.status()
            )));
        }
        info!("whisk action {} deleted", self.action);
        Ok(())
    }

    async fn start(&self, driver: Arc<Driver>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/init", post(init_action))
            .route("/run", post(run_action))
            .with_state(driver);

        info!("serving the action protocol on {}", ACTION_PROTOCOL_ADDR);
        let listener = tokio::net::TcpListener::bind(ACTION_PROTOCOL_ADDR).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}
