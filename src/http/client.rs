use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use reqwest::Method;

use super::retry::{RetryPolicy, retry};
use crate::error::RequestError;

/// Upper bound on the response text embedded in an error.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client that retries and unwraps `{code, msg}` envelopes.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct RequestClient {
    http: reqwest::Client,
}

impl RequestClient {
    /// Build a client whose every attempt is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RequestError::Client(e.to_string()))?;
        Ok(Self { http })
    }

    /// Send `body` as JSON and return the envelope's `msg`.
    pub async fn call<B>(
        &self,
        method: Method,
        url: &str,
        body: &B,
        policy: &RetryPolicy,
    ) -> Result<Value, RequestError>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        self.execute(method, url, Some(payload), policy).await
    }

    /// Send a request without a body and return the envelope's `msg`.
    pub async fn call_empty(
        &self,
        method: Method,
        url: &str,
        policy: &RetryPolicy,
    ) -> Result<Value, RequestError> {
        self.execute(method, url, None, policy).await
    }

    /// Like [`call`](Self::call) but deserializes `msg` into `T`.
    pub async fn call_json<B, T>(
        &self,
        method: Method,
        url: &str,
        body: &B,
        policy: &RetryPolicy,
    ) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let msg = self.call(method, url, body, policy).await?;
        serde_json::from_value(msg).map_err(|e| RequestError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Send `body` as JSON and return the raw response text (no envelope).
    pub async fn post_raw<B>(
        &self,
        url: &str,
        body: &B,
        policy: &RetryPolicy,
    ) -> Result<String, RequestError>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        retry(policy, url, || self.attempt_text(Method::POST, url, Some(payload.clone()))).await
    }

    /// GET `url` and return the raw response text (no envelope).
    pub async fn fetch_text(&self, url: &str, policy: &RetryPolicy) -> Result<String, RequestError> {
        retry(policy, url, || self.attempt_text(Method::GET, url, None)).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        payload: Option<Vec<u8>>,
        policy: &RetryPolicy,
    ) -> Result<Value, RequestError> {
        retry(policy, url, || {
            let method = method.clone();
            let payload = payload.clone();
            async move {
                let text = self.attempt_text(method, url, payload).await?;
                unwrap_envelope(url, &text)
            }
        })
        .await
    }

    /// One attempt: any transport failure or non-200 status is an error.
    async fn attempt_text(
        &self,
        method: Method,
        url: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<String, RequestError> {
        let request = match payload {
            Some(bytes) => self
                .http
                .request(method, url)
                .header(CONTENT_TYPE, "application/json")
                .body(bytes),
            None => self.http.request(method, url).header(CONTENT_TYPE, "text/plain"),
        };

        let resp = request.send().await.map_err(|e| RequestError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| RequestError::Transport {
            url: url.to_string(),
            reason: format!("reading body: {e}"),
        })?;

        if status != StatusCode::OK {
            return Err(RequestError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        debug!(url, bytes = text.len(), "Request succeeded");
        Ok(text)
    }
}

/// Whether an envelope `code` means success. The code may arrive as a number or a string.
pub fn is_success_code(code: &Value) -> bool {
    match code {
        Value::Number(n) => n.as_i64() == Some(200),
        Value::String(s) => s.trim() == "200",
        _ => false,
    }
}

fn unwrap_envelope(url: &str, text: &str) -> Result<Value, RequestError> {
    let mut envelope: Value = serde_json::from_str(text).map_err(|e| RequestError::Decode {
        url: url.to_string(),
        reason: format!("{e}; body: {}", truncate(text)),
    })?;

    let code = envelope.get("code").cloned().unwrap_or(Value::Null);
    if !is_success_code(&code) {
        return Err(RequestError::Application {
            url: url.to_string(),
            code: code.to_string(),
            body: truncate(text),
        });
    }

    Ok(envelope
        .get_mut("msg")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
