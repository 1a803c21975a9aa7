//! Wire transports for the node daemons.
//!
//! Each transport speaks one dialect (unix socket, plain TCP, HTTP, REST over
//! TLS) and maps every failure, transport or daemon-reported, onto
//! [`HarnessError::Rpc`] carrying the method name.

pub mod http;
pub mod rest;
pub mod tcp_socket;
#[cfg(unix)]
pub mod unix_socket;

pub use http::HttpJsonRpc;
pub use rest::RestClient;
pub use tcp_socket::TcpSocketRpc;
#[cfg(unix)]
pub use unix_socket::UnixSocketRpc;

use crate::error::{HarnessError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single RPC round trip.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 4096;

/// A JSON-RPC style endpoint: method name in, JSON result out.
#[allow(async_fn_in_trait)]
pub trait JsonRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// `call` and deserialize the result into `T`.
    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| HarnessError::rpc(method, format!("unexpected response shape: {}", e)))
    }
}

/// Bound `fut` by `timeout`, reporting expiry as an RPC failure of `method`.
pub(crate) async fn with_timeout<T>(
    method: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(HarnessError::rpc(method, format!("no response within {:?}", timeout))),
    }
}

/// Pull the `result` out of a JSON-RPC response, or turn its `error` into a
/// typed failure. Error objects contribute their `message`; anything else is
/// rendered as-is.
pub(crate) fn unwrap_response(method: &str, mut response: Value) -> Result<Value> {
    match response.get("error") {
        Some(Value::Null) | None => {}
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| match error {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            return Err(HarnessError::rpc(method, message));
        }
    }
    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| HarnessError::rpc(method, "malformed response, \"result\" missing"))
}

/// Write one JSON object, then read until a complete JSON value has arrived.
///
/// The stream daemons do not frame their responses, so completeness is decided
/// by the parser: a truncated document keeps reading, a closed connection
/// before that point is a lost connection.
pub(crate) async fn exchange<S>(method: &str, stream: &mut S, request: &Value) -> Result<Value>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(request)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HarnessError::rpc(method, "connection to RPC server lost"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(value) = first_json_value(method, &buf)? {
            return Ok(value);
        }
    }
}

/// `Ok(None)` while `buf` holds only a prefix of a document.
fn first_json_value(method: &str, buf: &[u8]) -> Result<Option<Value>> {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match values.next() {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(HarnessError::rpc(method, format!("invalid response: {}", e))),
        None => Ok(None),
    }
}

/// Integers that some daemons encode as strings (64-bit values in JSON).
pub(crate) fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_object_becomes_rpc_error() {
        let response = json!({"id": 0, "error": {"code": -1, "message": "Unknown peer"}});
        let err = unwrap_response("connect", response).unwrap_err();
        match err {
            HarnessError::Rpc { method, message } => {
                assert_eq!(method, "connect");
                assert_eq!(message, "Unknown peer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn null_error_is_success() {
        let response = json!({"id": 0, "error": null, "result": {"id": "02ab"}});
        assert_eq!(unwrap_response("getinfo", response).unwrap(), json!({"id": "02ab"}));
    }

    #[test]
    fn string_error_kept_verbatim() {
        let response = json!({"error": "route not found"});
        let err = unwrap_response("findroute", response).unwrap_err();
        assert!(err.is_no_route());
    }

    #[test]
    fn missing_result_is_malformed() {
        let err = unwrap_response("getinfo", json!({"id": 0})).unwrap_err();
        assert!(err.to_string().contains("result"));
    }

    #[test]
    fn partial_document_waits_for_more() {
        assert!(first_json_value("m", br#"{"result": {"a"#).unwrap().is_none());
        assert!(first_json_value("m", b"").unwrap().is_none());
        let done = first_json_value("m", br#"{"result": 1} trailing"#).unwrap();
        assert_eq!(done, Some(json!({"result": 1})));
        assert!(first_json_value("m", b"}{").is_err());
    }

    #[test]
    fn string_encoded_integers() {
        assert_eq!(as_u64(&json!("2000000")), Some(2_000_000));
        assert_eq!(as_u64(&json!(42)), Some(42));
        assert_eq!(as_u64(&json!(null)), None);
    }

    #[tokio::test]
    async fn exchange_reassembles_split_response() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let n = server.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(request["method"], "getinfo");
            server.write_all(br#"{"id": 0, "res"#).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(br#"ult": {"node_id": "03ff"}}"#).await.unwrap();
        });

        let response = exchange("getinfo", &mut client, &json!({"method": "getinfo", "id": 0}))
            .await
            .unwrap();
        assert_eq!(response["result"]["node_id"], "03ff");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_reports_lost_connection() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(br#"{"id": 0, "#).await.unwrap();
        });
        let err = exchange("getinfo", &mut client, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("connection to RPC server lost"));
        server_task.await.unwrap();
    }
}
