//! Seniority inference contract: wire types, clients and the mock model server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::get, routing::post, Json, Router};
use reqwest::StatusCode;
use senrich_core::DedupKey;
use senrich_storage::{RetryDisposition, Retryable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "senrich-inference";

pub const INFER_PATH: &str = "/v1/seniority/infer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeniorityRequest {
    pub dedup_key: DedupKey,
    pub company: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeniorityRequestBatch {
    pub batch: Vec<SeniorityRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeniorityResponse {
    pub dedup_key: DedupKey,
    pub seniority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeniorityResponseBatch {
    pub batch: Vec<SeniorityResponse>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("inference unavailable: {0}")]
    Unavailable(String),
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

impl Retryable for InferenceError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            InferenceError::Request(err) => classify_reqwest_error(err),
            InferenceError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            InferenceError::Unavailable(_) => RetryDisposition::Retryable,
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer_batch(
        &self,
        request: &SeniorityRequestBatch,
    ) -> Result<SeniorityResponseBatch, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{INFER_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer_batch(
        &self,
        request: &SeniorityRequestBatch,
    ) -> Result<SeniorityResponseBatch, InferenceError> {
        let span = info_span!(
            "inference_rpc",
            endpoint = %self.endpoint,
            entries = request.batch.len()
        );
        async {
            let resp = self.client.post(&self.endpoint).json(request).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(InferenceError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body: SeniorityResponseBatch = resp.json().await?;
            debug!(returned = body.batch.len(), "inference batch answered");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Rule-based stand-in for the seniority model.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSeniorityModel;

impl MockSeniorityModel {
    pub fn seniority_for(&self, company: &str, title: &str) -> i32 {
        let company = company.to_lowercase();
        let title = title.to_lowercase();
        if company.contains("opc") {
            return 7;
        }
        const TITLE_LEVELS: [(&str, i32); 5] = [
            ("intern", 1),
            ("junior", 2),
            ("senior", 3),
            ("lead", 4),
            ("partner", 6),
        ];
        TITLE_LEVELS
            .iter()
            .find(|(needle, _)| title.contains(needle))
            .map(|(_, level)| *level)
            .unwrap_or(5)
    }

    pub fn infer(&self, request: &SeniorityRequestBatch) -> SeniorityResponseBatch {
        SeniorityResponseBatch {
            batch: request
                .batch
                .iter()
                .map(|r| SeniorityResponse {
                    dedup_key: r.dedup_key,
                    seniority: self.seniority_for(&r.company, &r.title),
                })
                .collect(),
        }
    }
}

/// Records each batch it answers.
#[derive(Debug, Default)]
pub struct LocalInferenceClient {
    model: MockSeniorityModel,
    calls: Mutex<Vec<SeniorityRequestBatch>>,
    failures_remaining: AtomicUsize,
}

impl LocalInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_log(&self) -> Vec<SeniorityRequestBatch> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for LocalInferenceClient {
    async fn infer_batch(
        &self,
        request: &SeniorityRequestBatch,
    ) -> Result<SeniorityResponseBatch, InferenceError> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InferenceError::Unavailable("injected failure".to_string()));
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(self.model.infer(request))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelServerState {
    pub model: MockSeniorityModel,
    pub batch_delay: Duration,
}

pub fn app(state: ModelServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(INFER_PATH, post(infer))
        .with_state(Arc::new(state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn infer(
    State(state): State<Arc<ModelServerState>>,
    Json(request): Json<SeniorityRequestBatch>,
) -> Json<SeniorityResponseBatch> {
    if !state.batch_delay.is_zero() {
        tokio::time::sleep(state.batch_delay).await;
    }
    debug!(entries = request.batch.len(), "answering inference batch");
    Json(state.model.infer(&request))
}

pub async fn serve(addr: SocketAddr, state: ModelServerState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "mock seniority model listening");
    axum::serve(listener, app(state)).await
}
