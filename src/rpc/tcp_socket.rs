use super::{exchange, unwrap_response, with_timeout, JsonRpc, DEFAULT_RPC_TIMEOUT};
use crate::error::{HarnessError, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Unframed JSON request/response over plain TCP, one connection per call.
///
/// Params are always positional.
#[derive(Debug, Clone)]
pub struct TcpSocketRpc {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpSocketRpc {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn round_trip(&self, method: &str, request: Value) -> Result<Value> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| HarnessError::rpc(method, format!("connect {}:{}: {}", self.host, self.port, e)))?;
        exchange(method, &mut stream, &request).await
    }
}

impl JsonRpc for TcpSocketRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let params = match params {
            Value::Null => json!([]),
            Value::Array(items) => Value::Array(items.into_iter().filter(|v| !v.is_null()).collect()),
            other => json!([other]),
        };
        let request = json!({"method": method, "params": params, "id": 0});
        debug!(method, params = %request["params"], "Calling tcp rpc");

        let response = with_timeout(method, self.timeout, self.round_trip(method, request)).await?;
        trace!(method, response = %response, "Received response");
        unwrap_response(method, response)
    }
}
