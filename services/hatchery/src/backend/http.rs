//! HTTP job backend and newline-delimited JSON event stream.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use hatchery_events::{EventFilter, StreamError, StreamEvent, CLOSE_ABNORMAL};
use hatchery_id::JobId;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EventSource, JobBackend};
use crate::error::BackendError;
use crate::model::{Job, Worker, WorkerModel};

/// Maps a non-success HTTP status to a backend error.
pub fn status_error(status: StatusCode, body: &str) -> BackendError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{} - {}", status, body)
    };
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(message),
        StatusCode::CONFLICT => BackendError::Rejected(message),
        _ => BackendError::Transport(message),
    }
}

fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, BackendError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {}", e)))
}

/// Job backend reached over its REST API.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct BookRequest<'a> {
    hatchery: &'a str,
}

impl HttpBackend {
    /// Create a new backend client.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(Some(Duration::from_secs(30)))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn list_pending_jobs(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, BackendError> {
        let url = format!("{}/v1/queue", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let jobs: Vec<Job> = self.send(request).await?;
        debug!(count = jobs.len(), "Fetched pending jobs");
        Ok(jobs)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, BackendError> {
        let url = format!("{}/v1/queue/{}", self.base_url, id);
        self.send(self.client.get(&url)).await
    }

    async fn take_job(&self, id: JobId, hatchery: &str) -> Result<Job, BackendError> {
        let url = format!("{}/v1/queue/{}/book", self.base_url, id);
        self.send(self.client.post(&url).json(&BookRequest { hatchery }))
            .await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, BackendError> {
        let url = format!("{}/v1/workers", self.base_url);
        self.send(self.client.get(&url)).await
    }

    async fn get_worker_model(
        &self,
        group: &str,
        name: &str,
    ) -> Result<WorkerModel, BackendError> {
        let url = format!("{}/v1/worker-models/{}/{}", self.base_url, group, name);
        self.send(self.client.get(&url)).await
    }
}

/// Event source reading newline-delimited JSON events from a long-lived
/// HTTP response.
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    reconnect_delay: Duration,
}

impl HttpEventSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, BackendError> {
        Ok(Self {
            // No overall timeout: the response body is the stream.
            client: build_client(None)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            reconnect_delay: Duration::from_secs(1),
        })
    }

    async fn open(&self, filters: &[EventFilter]) -> Result<reqwest::Response, StreamError> {
        let url = format!("{}/v1/events/subscribe", self.base_url);
        let mut request = self.client.post(&url).json(filters);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::disconnected(format!("subscribe failed: {}", e)))?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StreamError::unauthorized(
                format!("subscription refused: {}", status),
            )),
            s if s.is_server_error() => Err(StreamError::disconnected(format!(
                "subscription failed: {}",
                status
            ))),
            _ => Err(StreamError::other(format!("subscription failed: {}", status))),
        }
    }
}

/// Outcome of reading one subscription.
enum StreamEnd {
    /// A new filter set arrived; reconnect with it.
    Resubscribe(Vec<EventFilter>),
    /// The connection dropped; wait for the filter set to be re-sent.
    Dropped,
    /// The subscriber is gone.
    Closed,
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn listen(
        &self,
        mut filters: mpsc::Receiver<Vec<EventFilter>>,
        events: mpsc::Sender<StreamEvent>,
        errors: mpsc::Sender<StreamError>,
    ) {
        let mut next: Option<Vec<EventFilter>> = None;
        let mut failed = false;

        loop {
            let set = match next.take() {
                Some(set) => set,
                None => match filters.recv().await {
                    Some(set) => set,
                    None => return,
                },
            };

            if failed {
                tokio::time::sleep(self.reconnect_delay).await;
            }

            let response = match self.open(&set).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Event subscription failed");
                    failed = true;
                    if errors.send(e).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            debug!(filters = set.len(), "Subscribed to event stream");

            match read_stream(response, &mut filters, &events, &errors).await {
                StreamEnd::Resubscribe(set) => {
                    failed = false;
                    next = Some(set);
                }
                StreamEnd::Dropped => failed = true,
                StreamEnd::Closed => return,
            }
        }
    }
}

async fn read_stream(
    response: reqwest::Response,
    filters: &mut mpsc::Receiver<Vec<EventFilter>>,
    events: &mpsc::Sender<StreamEvent>,
    errors: &mpsc::Sender<StreamError>,
) -> StreamEnd {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            set = filters.recv() => {
                return match set {
                    Some(set) => StreamEnd::Resubscribe(set),
                    None => StreamEnd::Closed,
                };
            }
            chunk = stream.next() => {
                let error = match chunk {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        for event in drain_events(&mut buf) {
                            if events.send(event).await.is_err() {
                                return StreamEnd::Closed;
                            }
                        }
                        continue;
                    }
                    Some(Err(e)) => StreamError::disconnected(format!("stream read failed: {}", e)),
                    None => StreamError::from_close_code(CLOSE_ABNORMAL, "stream ended"),
                };

                return if errors.send(error).await.is_ok() {
                    StreamEnd::Dropped
                } else {
                    StreamEnd::Closed
                };
            }
        }
    }
}

/// Takes every complete line out of `buf` and decodes it. A partial last
/// line stays in the buffer. Malformed lines are logged and skipped.
fn drain_events(buf: &mut Vec<u8>) -> Vec<StreamEvent> {
    let mut decoded = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<StreamEvent>(line) {
            Ok(event) => decoded.push(event),
            Err(e) => warn!(
                error = %e,
                line = %String::from_utf8_lossy(line),
                "Skipping malformed stream event"
            ),
        }
    }
    decoded
}
