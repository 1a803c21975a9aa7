use super::DEFAULT_RPC_TIMEOUT;
use crate::error::{HarnessError, Result};
use reqwest::{Certificate, Method};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, trace};

/// JSON REST client pinned to a daemon's self-signed TLS certificate.
///
/// The certificate is read from the node directory, so the client can only be
/// built once the daemon has generated it.
#[derive(Debug, Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    /// Trust exactly the PEM certificate at `cert_path`.
    pub fn with_certificate(base_url: impl Into<String>, cert_path: &Path) -> Result<Self> {
        let pem = std::fs::read(cert_path).map_err(|e| {
            HarnessError::Config(format!("failed to read TLS certificate {}: {}", cert_path.display(), e))
        })?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| HarnessError::Config(format!("invalid TLS certificate {}: {}", cert_path.display(), e)))?;

        let client = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to create HTTPS client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    /// Plain client without certificate pinning.
    pub fn insecure(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, path, body = ?body, "Calling rest endpoint");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::rpc(path, format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HarnessError::rpc(path, format!("failed to read body: {}", e)))?;
        trace!(path, %status, body = %text, "Received response");

        if !status.is_success() {
            return Err(HarnessError::rpc(path, error_message(&text).unwrap_or_else(|| {
                format!("server returned {} ({})", status, text.trim())
            })));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| HarnessError::rpc(path, format!("invalid JSON response: {}", e)))
    }
}

/// The daemon's own wording from a REST error body (`error` or `message`).
fn error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = stream.read(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn get_parses_json() {
        let url = one_shot(200, r#"{"identity_pubkey": "02dd", "block_height": 432}"#).await;
        let client = RestClient::insecure(url).unwrap();
        let info = client.get("/v1/getinfo").await.unwrap();
        assert_eq!(info["identity_pubkey"], "02dd");
    }

    #[tokio::test]
    async fn error_body_message_is_surfaced() {
        let url = one_shot(500, r#"{"error": "unable to find a path to destination", "code": 2}"#).await;
        let client = RestClient::insecure(url).unwrap();
        let err = client.get("/v1/graph/routes/03aa/1").await.unwrap_err();
        assert!(err.is_no_route());
        assert!(matches!(&err, HarnessError::Rpc { method, .. } if method == "/v1/graph/routes/03aa/1"));
    }

    #[test]
    fn missing_certificate_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RestClient::with_certificate("https://localhost:1", &dir.path().join("tls.cert")).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn error_message_prefers_message_field() {
        let text = json!({"error": "rpc error", "message": "peer not found"}).to_string();
        assert_eq!(error_message(&text).as_deref(), Some("peer not found"));
        assert_eq!(error_message("not json"), None);
    }
}
