use super::{unwrap_response, JsonRpc, DEFAULT_RPC_TIMEOUT};
use crate::error::{HarnessError, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};

const DEFAULT_RETRIES: u32 = 10;
const BACKOFF_FACTOR: Duration = Duration::from_millis(300);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Gateway statuses worth another attempt.
const RETRY_STATUSES: &[StatusCode] = &[
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::GATEWAY_TIMEOUT,
];

/// JSON-RPC over HTTP POST with basic authentication.
///
/// Connection failures and gateway errors are retried with exponential
/// backoff, which covers daemons whose HTTP listener comes up after their
/// readiness log line. A 500 carrying a JSON `error` body is a daemon
/// rejection and is returned at once.
#[derive(Debug, Clone)]
pub struct HttpJsonRpc {
    url: String,
    user: String,
    password: String,
    retries: u32,
    client: reqwest::Client,
}

impl HttpJsonRpc {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            retries: DEFAULT_RETRIES,
            client,
        })
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self, method: &str, body: &Value) -> std::result::Result<Value, Attempt> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let message = format!("request failed: {}", e);
                if e.is_connect() || e.is_timeout() {
                    Attempt::Retry(message)
                } else {
                    Attempt::Fail(HarnessError::rpc(method, message))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Attempt::Retry(format!("failed to read body: {}", e)))?;
        classify(method, status, &text)
    }
}

/// Outcome of one POST.
enum Attempt {
    Retry(String),
    Fail(HarnessError),
}

fn classify(method: &str, status: StatusCode, text: &str) -> std::result::Result<Value, Attempt> {
    let parsed: Option<Value> = serde_json::from_str(text).ok();
    let has_error = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .is_some_and(|e| !e.is_null());

    if status.is_success() || has_error {
        return parsed.ok_or_else(|| {
            Attempt::Fail(HarnessError::rpc(method, format!("invalid JSON response: {}", text)))
        });
    }
    let message = format!("server returned {} ({})", status, text.trim());
    if RETRY_STATUSES.contains(&status) {
        Err(Attempt::Retry(message))
    } else {
        Err(Attempt::Fail(HarnessError::rpc(method, message)))
    }
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_FACTOR
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF)
}

impl JsonRpc for HttpJsonRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "ln-interop",
            "method": method,
            "params": params,
        });
        debug!(method, url = %self.url, params = %body["params"], "Calling http rpc");

        let mut attempt = 0;
        let response = loop {
            match self.post_once(method, &body).await {
                Ok(response) => break response,
                Err(Attempt::Fail(e)) => return Err(e),
                Err(Attempt::Retry(message)) if attempt < self.retries => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    warn!(method, attempt, ?delay, "Retrying rpc call: {}", message);
                    tokio::time::sleep(delay).await;
                }
                Err(Attempt::Retry(message)) => return Err(HarnessError::rpc(method, message)),
            }
        };

        trace!(method, response = %response, "Received response");
        unwrap_response(method, response)
    }
}
