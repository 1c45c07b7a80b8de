//! Request/response bridge to the external generation worker.
//!
//! Every error this module returns is a transport failure: the worker could
//! not be reached, answered with a non-2xx status, timed out, or sent a body
//! that is not a valid [`WorkerResponse`]. A well-formed response with
//! `status = "failed"` is returned as `Ok`; classifying it is the
//! dispatcher's job.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::model::{WorkerRequest, WorkerResponse};

/// Transport-level errors from the worker RPC.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The HTTP request itself failed (connect, DNS, TLS, reset).
    #[error("worker request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// No response within the configured deadline.
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),

    /// The worker returned a non-2xx status code.
    #[error("worker returned status code {status}: {body}")]
    Status { status: u16, body: String },

    /// The body could not be decoded into a worker response.
    #[error("failed to decode worker response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn call(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError>;
}

/// HTTP client for a single worker endpoint.
pub struct HttpWorkerClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpWorkerClient {
    /// Create a client that POSTs JSON to `endpoint`, giving up after
    /// `timeout` so a wedged worker cannot hold a pool slot forever.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn call(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        debug!(
            task_id = %request.task_id,
            task_type = %request.task_type,
            endpoint = %self.endpoint,
            "calling worker"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| WorkerError::Decode(e.to_string()))
    }
}

impl HttpWorkerClient {
    fn classify(&self, err: reqwest::Error) -> WorkerError {
        if err.is_timeout() {
            WorkerError::Timeout(self.timeout)
        } else {
            WorkerError::Request(err)
        }
    }
}
