use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Cancellation scope for a single request. Streams are exempt; they run
/// until `done`/`error`/cancel.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Decoded response body. The health endpoint replies with plain `OK`, so
/// non-JSON success bodies come back as raw text rather than failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Empty,
}

impl Payload {
    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value).map_err(Into::into),
            Payload::Text(text) => serde_json::from_str(&text).map_err(Into::into),
            Payload::Empty => serde_json::from_value(Value::Null).map_err(Into::into),
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Text(text) => serde_json::from_str(&text).map_err(Into::into),
            Payload::Empty => Ok(Value::Null),
        }
    }
}

/// HTTP transport with a uniform timeout/retry decorator around every verb.
pub struct Transport {
    http: HttpClient,
    base_url: String,
}

impl Transport {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Raw client for the event-stream subscription, which must not run
    /// under the 30s scope.
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get(&self, path: &str) -> Result<Payload> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Payload> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Payload> {
        self.request(Method::DELETE, path, None).await
    }

    /// Single code path for all verbs so backoff semantics cannot drift
    /// between them. Retries 5xx up to 3 attempts with 1s/2s delays; 4xx and
    /// network failures are terminal; a timed-out attempt is never retried.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Payload> {
        let url = self.url(path);
        let mut attempt = 1;
        loop {
            let send = self.dispatch(method.clone(), &url, body);
            let outcome = match tokio::time::timeout(REQUEST_TIMEOUT, send).await {
                Err(_) => return Err(Error::Timeout(REQUEST_TIMEOUT)),
                Ok(outcome) => outcome,
            };
            match outcome {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::debug!(%url, attempt, ?delay, error = %err, "retrying after server error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Payload> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        decode_response(response).await
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.pow(attempt.saturating_sub(1))
}

async fn decode_response(response: reqwest::Response) -> Result<Payload> {
    let status = response.status();

    if status == StatusCode::NO_CONTENT {
        return Ok(Payload::Empty);
    }

    if status.is_success() {
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);
        let text = response.text().await?;
        if !is_json {
            return Ok(Payload::Text(text));
        }
        if text.is_empty() {
            return Ok(Payload::Empty);
        }
        let value = serde_json::from_str(&text)?;
        return Ok(Payload::Json(value));
    }

    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(status, &body);
    if status.is_server_error() {
        Err(Error::Server {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(Error::Client {
            status: status.as_u16(),
            message,
        })
    }
}

/// Server-supplied message, in priority order: `error.message`, `error` as a
/// bare string, the raw body, then the HTTP status text.
fn extract_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return message.to_string();
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

type SharedLoad = Shared<BoxFuture<'static, Result<Value>>>;

enum LoadState {
    Idle,
    Loading(SharedLoad),
    Ready(Value),
}

struct Slot {
    epoch: u64,
    state: LoadState,
}

/// Single-flight GET of one idempotent resource. Concurrent `load` calls
/// while a request is in flight await the same future; the resolved value is
/// cached until `reload`. The in-flight slot is cleared when the load
/// settles, success or failure, so a failed load never blocks later ones.
pub struct CoalescedGet {
    transport: Arc<Transport>,
    path: String,
    slot: Mutex<Slot>,
}

impl CoalescedGet {
    pub fn new(transport: Arc<Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
            slot: Mutex::new(Slot {
                epoch: 0,
                state: LoadState::Idle,
            }),
        }
    }

    pub async fn load(&self) -> Result<Value> {
        let (shared, epoch) = {
            let mut slot = self.slot.lock().await;
            match &slot.state {
                LoadState::Ready(value) => return Ok(value.clone()),
                LoadState::Loading(shared) => (shared.clone(), slot.epoch),
                LoadState::Idle => {
                    let shared = self.begin();
                    slot.epoch += 1;
                    slot.state = LoadState::Loading(shared.clone());
                    (shared, slot.epoch)
                }
            }
        };
        let result = shared.await;
        self.settle(epoch, &result).await;
        result
    }

    /// Bypasses both the cached value and any in-flight load.
    pub async fn reload(&self) -> Result<Value> {
        let (shared, epoch) = {
            let mut slot = self.slot.lock().await;
            let shared = self.begin();
            slot.epoch += 1;
            slot.state = LoadState::Loading(shared.clone());
            (shared, slot.epoch)
        };
        let result = shared.await;
        self.settle(epoch, &result).await;
        result
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.epoch += 1;
        slot.state = LoadState::Idle;
    }

    fn begin(&self) -> SharedLoad {
        let transport = Arc::clone(&self.transport);
        let path = self.path.clone();
        async move { transport.get(&path).await?.into_value() }
            .boxed()
            .shared()
    }

    async fn settle(&self, epoch: u64, result: &Result<Value>) {
        let mut slot = self.slot.lock().await;
        // A reload may have superseded this load while we were awaiting.
        if slot.epoch != epoch {
            return;
        }
        slot.state = match result {
            Ok(value) => LoadState::Ready(value.clone()),
            Err(_) => LoadState::Idle,
        };
    }
}
