use super::{
    array, payment_failure, require_peer, route_probe, str_field, ChannelEdge, LightningRpc,
    NodeCore, NodeInfo, NodeSpec,
};
use crate::chain::Bitcoind;
use crate::config::HarnessConfig;
use crate::daemon::LaunchConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::{as_u64, RestClient};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const CONF_NAME: &str = "lnd.conf";
pub const TLS_CERT: &str = "tls.cert";
const TLS_KEY: &str = "tls.key";
const READY_PATTERNS: [&str; 2] = ["RPC server listening on", "Done catching up block hashes"];
/// `NESTED_PUBKEY_HASH`
const ADDRESS_TYPE: u8 = 1;
const FUNDING_ATTEMPTS: u32 = 30;

/// Write `lnd.conf` and build the launch parameters.
pub fn prepare(spec: &NodeSpec, config: &HarnessConfig) -> Result<LaunchConfig> {
    fs::write(spec.dir.join(CONF_NAME), "[Application Options]\n")?;
    Ok(launch_config(spec, config))
}

pub fn launch_config(spec: &NodeSpec, config: &HarnessConfig) -> LaunchConfig {
    let chain = &spec.chain;
    let dir = &spec.dir;
    let mut launch = LaunchConfig::new(config.lnd_binary(), dir)
        .args([
            format!("--lnddir={}", dir.display()),
            format!("--configfile={}", dir.join(CONF_NAME).display()),
            "--bitcoin.active".to_string(),
            "--bitcoin.regtest".to_string(),
            "--bitcoin.node=bitcoind".to_string(),
            format!("--bitcoind.rpchost=127.0.0.1:{}", chain.rpc_port),
            format!("--bitcoind.rpcuser={}", chain.rpc_user),
            format!("--bitcoind.rpcpass={}", chain.rpc_password),
            format!("--bitcoind.zmqpubrawblock={}", chain.zmq_block),
            format!("--bitcoind.zmqpubrawtx={}", chain.zmq_tx),
            format!("--rpclisten=127.0.0.1:{}", spec.rpc_port),
            format!("--restlisten=127.0.0.1:{}", spec.rest_port),
            format!("--listen={}:{}", spec.host, spec.port),
            format!("--tlscertpath={}", dir.join(TLS_CERT).display()),
            format!("--tlskeypath={}", dir.join(TLS_KEY).display()),
            "--debuglevel=debug".to_string(),
            "--no-macaroons".to_string(),
            "--nobootstrap".to_string(),
            "--noseedbackup".to_string(),
        ])
        .prefix(format!("lnd({})", spec.port))
        .output_dir(dir)
        .stop_grace(spec.stop_grace);
    for pattern in READY_PATTERNS {
        launch = launch.ready_pattern(pattern);
    }
    launch
}

/// lnd, driven over its REST gateway with the node's own TLS certificate.
pub struct LndNode {
    core: NodeCore,
    client: RwLock<Option<RestClient>>,
}

impl LndNode {
    pub fn new(core: NodeCore) -> Self {
        Self {
            core,
            client: RwLock::new(None),
        }
    }

    #[cfg(test)]
    fn with_client(core: NodeCore, client: RestClient) -> Self {
        Self {
            core,
            client: RwLock::new(Some(client)),
        }
    }

    /// The certificate only exists once lnd has started, so the client is
    /// built on first use and dropped on restart.
    fn client(&self) -> Result<RestClient> {
        if let Some(client) = self.client.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Ok(client.clone());
        }
        let client = RestClient::with_certificate(
            format!("https://localhost:{}", self.core.spec().rest_port),
            &self.core.dir().join(TLS_CERT),
        )?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());
        Ok(client)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.client()?.get(path).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.client()?.post(path, &body).await
    }

    async fn confirmed_balance(&self) -> Result<u64> {
        let balance = self.get("/v1/balance/blockchain").await?;
        Ok(balance.get("confirmed_balance").and_then(as_u64).unwrap_or(0))
    }

    async fn graph(&self) -> Result<Value> {
        self.get("/v1/graph").await
    }
}

fn parse_info(info: &Value) -> Result<NodeInfo> {
    Ok(NodeInfo {
        id: str_field(info, "identity_pubkey")
            .ok_or_else(|| HarnessError::rpc("/v1/getinfo", "missing 'identity_pubkey'"))?
            .to_string(),
        block_height: info.get("block_height").and_then(as_u64).unwrap_or(0),
    })
}

fn graph_edges(graph: &Value) -> BTreeSet<ChannelEdge> {
    array(graph, "edges")
        .iter()
        .filter_map(|e| Some(ChannelEdge::both_ways(str_field(e, "node1_pub")?, str_field(e, "node2_pub")?)))
        .flatten()
        .collect()
}

/// Preimage as hex from a `SendPaymentSync` response.
fn payment_result(response: &Value) -> Result<String> {
    if let Some(error) = str_field(response, "payment_error").filter(|e| !e.is_empty()) {
        return Err(HarnessError::PaymentFailed {
            detail: error.to_string(),
        });
    }
    let encoded = str_field(response, "payment_preimage").unwrap_or_default();
    let preimage = base64::decode(encoded).map_err(|e| HarnessError::PaymentFailed {
        detail: format!("undecodable preimage '{}': {}", encoded, e),
    })?;
    if preimage.is_empty() {
        return Err(HarnessError::PaymentFailed {
            detail: response.to_string(),
        });
    }
    Ok(hex::encode(preimage))
}

/// Pubkeys travel as base64 bytes in the REST encoding.
fn pubkey_bytes(peer_id: &str) -> Result<String> {
    let bytes = hex::decode(peer_id)
        .map_err(|e| HarnessError::rpc("/v1/channels", format!("invalid pubkey '{}': {}", peer_id, e)))?;
    Ok(base64::encode(bytes))
}

impl LightningRpc for LndNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    async fn info(&self) -> Result<NodeInfo> {
        parse_info(&self.get("/v1/getinfo").await?)
    }

    async fn ping(&self) -> Result<()> {
        self.get("/v1/getinfo").await.map(|_| ())
    }

    async fn peers(&self) -> Result<Vec<String>> {
        let peers = self.get("/v1/peers").await?;
        Ok(array(&peers, "peers")
            .iter()
            .filter_map(|p| str_field(p, "pub_key").map(str::to_string))
            .collect())
    }

    async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        let body = json!({
            "addr": {"pubkey": peer_id, "host": format!("{}:{}", host, port)},
            "perm": true,
        });
        let response = self.post("/v1/peers", body).await?;
        debug!(response = %response, "connect returned");
        Ok(())
    }

    async fn new_address(&self) -> Result<String> {
        let response = self.get(&format!("/v1/newaddress?type={}", ADDRESS_TYPE)).await?;
        str_field(&response, "address")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("/v1/newaddress", "missing 'address'"))
    }

    async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()> {
        let before = self.confirmed_balance().await?;
        let address = self.new_address().await?;
        chain.send_to_address(&address, sat).await?;
        chain.generate(1).await?;

        // The wallet lags the block; poll until the deposit shows as confirmed.
        for attempt in 0..FUNDING_ATTEMPTS {
            let balance = self.confirmed_balance().await?;
            if balance >= before + sat {
                debug!(balance, attempt, "Deposit confirmed");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(HarnessError::PollTimeout {
            what: format!("lnd wallet balance to reach {} sat", before + sat),
            timeout: Duration::from_secs(FUNDING_ATTEMPTS as u64),
        })
    }

    async fn open_channel(&self, peer_id: &str, _host: &str, _port: u16, sat: u64) -> Result<()> {
        require_peer("/v1/channels", &self.peers().await?, peer_id)?;
        let body = json!({
            "node_pubkey": pubkey_bytes(peer_id)?,
            "local_funding_amount": sat.to_string(),
            "push_sat": "0",
        });
        self.post("/v1/channels", body).await.map(|_| ())
    }

    async fn channel_is_active(&self, peer_id: &str) -> Result<bool> {
        let channels = self.get("/v1/channels").await?;
        let channels = array(&channels, "channels");
        match channels.iter().find(|c| str_field(c, "remote_pubkey") == Some(peer_id)) {
            Some(channel) => {
                let active = channel.get("active").and_then(Value::as_bool).unwrap_or(false);
                debug!(peer = peer_id, active, "Channel state");
                Ok(active)
            }
            None => {
                warn!(peer = peer_id, "Channel not found");
                Ok(false)
            }
        }
    }

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        Ok(graph_edges(&self.graph().await?))
    }

    async fn announced_nodes(&self) -> Result<BTreeSet<String>> {
        let graph = self.graph().await?;
        Ok(array(&graph, "nodes")
            .iter()
            .filter_map(|n| str_field(n, "pub_key").map(str::to_string))
            .collect())
    }

    async fn create_invoice(&self, msat: u64) -> Result<String> {
        let response = self
            .post("/v1/invoices", json!({"value": (msat / 1000).to_string()}))
            .await?;
        str_field(&response, "payment_request")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("/v1/invoices", "missing 'payment_request'"))
    }

    async fn decode_invoice(&self, payment_request: &str) -> Result<String> {
        let decoded = self.get(&format!("/v1/payreq/{}", payment_request)).await?;
        str_field(&decoded, "payment_hash")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("/v1/payreq", "missing 'payment_hash'"))
    }

    async fn pay(&self, payment_request: &str) -> Result<String> {
        let response = self
            .post("/v1/channels/transactions", json!({"payment_request": payment_request}))
            .await
            .map_err(payment_failure)?;
        payment_result(&response)
    }

    async fn has_route(&self, peer_id: &str, msat: u64) -> Result<bool> {
        route_probe(self.get(&format!("/v1/graph/routes/{}/{}", peer_id, msat / 1000)).await)
    }

    async fn block_sync(&self, block_hash: &str) -> Result<()> {
        let timeout = self.core.spec().ready_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let info = self.get("/v1/getinfo").await?;
            if str_field(&info, "block_hash") == Some(block_hash) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::PollTimeout {
                    what: format!("lnd to learn about block {}", block_hash),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn on_restart(&self) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{test_spec, Implementation};
    use std::path::PathBuf;

    #[test]
    fn launch_config_uses_allocated_ports() {
        let spec = test_spec(Implementation::Lnd, &PathBuf::from("/tmp/run/node-2"));
        let launch = launch_config(&spec, &HarnessConfig::default());

        assert_eq!(launch.program, PathBuf::from("bin/lnd"));
        assert!(launch.args.contains(&"--rpclisten=127.0.0.1:29735".to_string()));
        assert!(launch.args.contains(&"--restlisten=127.0.0.1:39735".to_string()));
        assert!(launch.args.contains(&"--listen=127.0.0.1:19735".to_string()));
        assert!(launch.args.contains(&"--tlscertpath=/tmp/run/node-2/tls.cert".to_string()));
        assert!(launch.args.contains(&"--bitcoind.zmqpubrawtx=tcp://127.0.0.1:29001".to_string()));
        assert_eq!(launch.ready_patterns, READY_PATTERNS.to_vec());
    }

    #[test]
    fn prepare_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_spec(Implementation::Lnd, dir.path());
        prepare(&spec, &HarnessConfig::default()).unwrap();
        let conf = fs::read_to_string(dir.path().join(CONF_NAME)).unwrap();
        assert_eq!(conf, "[Application Options]\n");
    }

    #[test]
    fn info_accepts_string_encoded_height() {
        let info = parse_info(&json!({"identity_pubkey": "02aa", "block_height": "432"})).unwrap();
        assert_eq!(info, NodeInfo { id: "02aa".into(), block_height: 432 });
        assert!(parse_info(&json!({"block_height": 1})).is_err());
    }

    #[test]
    fn graph_edges_are_bidirectional() {
        let graph = json!({
            "nodes": [{"pub_key": "02aa"}, {"pub_key": "03bb"}],
            "edges": [{"channel_id": "1", "node1_pub": "02aa", "node2_pub": "03bb"}]
        });
        let edges = graph_edges(&graph);
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&ChannelEdge::new("03bb", "02aa")));
    }

    #[test]
    fn payment_result_decodes_base64_preimage() {
        let preimage = [7u8; 32];
        let response = json!({"payment_error": "", "payment_preimage": base64::encode(preimage)});
        assert_eq!(payment_result(&response).unwrap(), hex::encode(preimage));

        let failed = json!({"payment_error": "unable to route payment to destination"});
        match payment_result(&failed).unwrap_err() {
            HarnessError::PaymentFailed { detail } => assert!(detail.contains("unable to route")),
            other => panic!("unexpected {other:?}"),
        }

        assert!(payment_result(&json!({"payment_error": ""})).is_err());
    }

    #[test]
    fn pubkey_is_base64_of_raw_bytes() {
        assert_eq!(pubkey_bytes("0203").unwrap(), "AgM=");
        assert!(pubkey_bytes("not-hex").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn channel_lookup_by_remote_pubkey() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await.unwrap();
                let body = json!({"channels": [
                    {"remote_pubkey": "03bb", "active": true},
                    {"remote_pubkey": "02cc", "active": false}
                ]})
                .to_string();
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let core = NodeCore::spawn(
            test_spec(Implementation::Lnd, dir.path()),
            LaunchConfig::new("sh", dir.path()).args(["-c", "sleep 30"]),
        )
        .unwrap();
        let node = LndNode::with_client(core, RestClient::insecure(base).unwrap());

        assert!(node.channel_is_active("03bb").await.unwrap());
        assert!(!node.channel_is_active("02cc").await.unwrap());
        assert!(!node.channel_is_active("02dd").await.unwrap());

        node.core().stop().await.unwrap();
        server.abort();
    }
}
