//! HTTP client for the threads API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::fetcher::SnapshotFetcher;
use crate::model::{Message, Thread, ThreadId, ThreadSnapshot};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct ThreadsClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl ThreadsClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadsClient {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateThreadRequest<'a> {
    title: &'a str,
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesResponse {
    Bare(Vec<Message>),
    Wrapped { messages: Vec<Message> },
}

impl From<MessagesResponse> for Vec<Message> {
    fn from(response: MessagesResponse) -> Self {
        match response {
            MessagesResponse::Bare(messages) | MessagesResponse::Wrapped { messages } => messages,
        }
    }
}

impl ThreadsClient {
    pub fn new(config: ThreadsClientConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(50)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn threads_path() -> &'static str {
        "/threads/"
    }

    #[must_use]
    pub fn thread_path(thread_id: &ThreadId) -> String {
        format!("/threads/{thread_id}")
    }

    #[must_use]
    pub fn messages_path(thread_id: &ThreadId) -> String {
        format!("/threads/{thread_id}/messages/")
    }

    #[must_use]
    pub fn messages_since_path(thread_id: &ThreadId, after_sequence: u64) -> String {
        format!("/threads/{thread_id}/messages/?from_sequence={after_sequence}")
    }

    #[must_use]
    pub fn start_path(thread_id: &ThreadId) -> String {
        format!("/threads/{thread_id}/start")
    }

    #[must_use]
    pub fn stop_path(thread_id: &ThreadId) -> String {
        format!("/threads/{thread_id}/stop")
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>> {
        self.get_json(Self::threads_path()).await
    }

    pub async fn create_thread(&self, title: &str) -> Result<Thread> {
        let title = require_text("title", title)?;
        self.post_json(Self::threads_path(), &CreateThreadRequest { title })
            .await
    }

    pub async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread> {
        self.get_json(Self::thread_path(thread_id).as_str()).await
    }

    pub async fn get_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let response: MessagesResponse = self
            .get_json(Self::messages_path(thread_id).as_str())
            .await?;
        Ok(response.into())
    }

    pub async fn get_messages_since(
        &self,
        thread_id: &ThreadId,
        after_sequence: u64,
    ) -> Result<Vec<Message>> {
        let response: MessagesResponse = self
            .get_json(Self::messages_since_path(thread_id, after_sequence).as_str())
            .await?;
        // Servers that ignore the cursor return everything.
        Ok(messages_after(response.into(), after_sequence))
    }

    pub async fn post_message(&self, thread_id: &ThreadId, content: &str) -> Result<()> {
        let content = require_text("content", content)?;
        self.post_unit(
            Self::messages_path(thread_id).as_str(),
            Some(&PostMessageRequest { content }),
        )
        .await
    }

    pub async fn start_agent(&self, thread_id: &ThreadId) -> Result<()> {
        self.post_unit::<Value>(Self::start_path(thread_id).as_str(), None)
            .await
    }

    pub async fn stop_agent(&self, thread_id: &ThreadId) -> Result<()> {
        self.post_unit::<Value>(Self::stop_path(thread_id).as_str(), None)
            .await
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.send(Method::GET, path, None::<&Value>).await?;
        decode_json_response(path, response).await
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> Deserialize<'de>,
    {
        let response = self.send(Method::POST, path, Some(payload)).await?;
        decode_json_response(path, response).await
    }

    async fn post_unit<Req>(&self, path: &str, payload: Option<&Req>) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        let response = self.send(Method::POST, path, payload).await?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| SyncError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(format_http_error(path, status, &bytes));
        }
        Ok(())
    }

    async fn send<Req>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Req>,
    ) -> Result<reqwest::Response>
    where
        Req: Serialize + ?Sized,
    {
        let url = self
            .endpoint(path)
            .ok_or_else(|| SyncError::InvalidUrl(format!("empty path for {}", self.base_url)))?;
        let body = payload.map(serde_json::to_value).transpose()?;
        let mut last_error: Option<SyncError> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .request(method.clone(), url.as_str())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);
            if let Some(body) = body.as_ref() {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    debug!(attempt, url = %url, "request failed: {}", error);
                    last_error = Some(if error.is_timeout() {
                        SyncError::Timeout(error.to_string())
                    } else {
                        SyncError::Transport(error.to_string())
                    });
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Transport("unknown".to_string())))
    }
}

#[async_trait]
impl SnapshotFetcher for ThreadsClient {
    async fn fetch_snapshot(&self, thread_id: &ThreadId) -> Result<ThreadSnapshot> {
        let (thread, messages) =
            tokio::try_join!(self.get_thread(thread_id), self.get_messages(thread_id))?;
        Ok(ThreadSnapshot {
            thread: Some(thread),
            messages,
        })
    }
}

/// Reject blank user text before any I/O. The text itself is passed through unchanged.
pub fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(SyncError::Validation(format!("{field} must not be empty")));
    }
    Ok(value)
}

#[must_use]
pub fn format_http_error(path: &str, status: StatusCode, body: &[u8]) -> SyncError {
    if status == StatusCode::NOT_FOUND {
        return SyncError::NotFound(path.to_string());
    }
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    SyncError::Http {
        status: status.as_u16(),
        body,
    }
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidUrl("base url missing".to_string()));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(SyncError::InvalidUrl(format!(
            "base url must use http:// or https://, got: {trimmed}"
        )));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(path: &str, response: reqwest::Response) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| SyncError::Transport(error.to_string()))?;

    if !status.is_success() {
        return Err(format_http_error(path, status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| SyncError::Decode(error.to_string()))
}

fn messages_after(messages: Vec<Message>, after_sequence: u64) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|message| {
            message
                .sequence_number
                .is_some_and(|sequence| sequence > after_sequence)
        })
        .collect()
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
