use super::{exchange, unwrap_response, with_timeout, JsonRpc, DEFAULT_RPC_TIMEOUT};
use crate::error::{HarnessError, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, trace};

/// JSON-RPC 2.0 over a Unix domain socket, one connection per call.
#[derive(Debug)]
pub struct UnixSocketRpc {
    socket_path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl UnixSocketRpc {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn round_trip(&self, method: &str, request: Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| HarnessError::rpc(method, format!("connect {}: {}", self.socket_path.display(), e)))?;
        exchange(method, &mut stream, &request).await
    }
}

impl JsonRpc for UnixSocketRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, params = %request["params"], "Calling unix socket rpc");

        let response = with_timeout(method, self.timeout, self.round_trip(method, request)).await?;
        trace!(method, response = %response, "Received response");
        unwrap_response(method, response)
    }
}
