use super::{
    payment_failure, require_peer, route_probe, str_field, ChannelEdge, LightningRpc,
    NodeCore, NodeInfo, NodeSpec,
};
use crate::chain::Bitcoind;
use crate::config::HarnessConfig;
use crate::daemon::LaunchConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::{as_u64, HttpJsonRpc, JsonRpc};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

pub const CONF_NAME: &str = "eclair.conf";
const API_USER: &str = "user";
const API_PASSWORD: &str = "rpcpass";
const WALLET_ADDRESS: &str = r"initial wallet address=([a-zA-Z0-9]+)";
const NORMAL_STATE: &str = "NORMAL";
const INVOICE_DESCRIPTION: &str = "invoice1";
const FUNDING_ATTEMPTS: u32 = 30;

/// HOCON configuration for a regtest node bound to the shared bitcoind.
pub fn render_config(spec: &NodeSpec) -> String {
    let chain = &spec.chain;
    format!(
        r#"eclair {{
  chain = "regtest"
  server {{
    binding-ip = "{host}"
    port = {port}
  }}
  api {{
    enabled = true
    binding-ip = "127.0.0.1"
    port = {api_port}
    password = "{api_password}"
  }}
  bitcoind {{
    host = "127.0.0.1"
    rpcport = {rpc_port}
    rpcuser = "{rpc_user}"
    rpcpassword = "{rpc_password}"
    zmq = "{zmq_block}"
    zmqblock = "{zmq_block}"
    zmqtx = "{zmq_tx}"
  }}
}}
"#,
        host = spec.host,
        port = spec.port,
        api_port = spec.rpc_port,
        api_password = API_PASSWORD,
        rpc_port = chain.rpc_port,
        rpc_user = chain.rpc_user,
        rpc_password = chain.rpc_password,
        zmq_block = chain.zmq_block,
        zmq_tx = chain.zmq_tx,
    )
}

/// Write `eclair.conf` and build the JVM command line.
pub fn prepare(spec: &NodeSpec, config: &HarnessConfig) -> Result<LaunchConfig> {
    fs::write(spec.dir.join(CONF_NAME), render_config(spec))?;
    Ok(launch_config(spec, config))
}

pub fn launch_config(spec: &NodeSpec, config: &HarnessConfig) -> LaunchConfig {
    LaunchConfig::new(config.java_binary(), &spec.dir)
        .args([
            format!("-Declair.datadir={}", spec.dir.display()),
            "-Declair.printToConsole=true".to_string(),
            "-jar".to_string(),
            config.eclair_jar().display().to_string(),
        ])
        .prefix(format!("eclair({})", spec.port))
        .ready_pattern(regex::escape(&format!("connected to {}", spec.chain.zmq_block)))
        .output_dir(&spec.dir)
        .stop_grace(spec.stop_grace)
}

/// eclair, driven over its HTTP JSON-RPC API.
pub struct EclairNode {
    core: NodeCore,
    rpc: HttpJsonRpc,
}

impl EclairNode {
    pub fn new(core: NodeCore) -> Result<Self> {
        let rpc = HttpJsonRpc::new(
            format!("http://127.0.0.1:{}", core.spec().rpc_port),
            API_USER,
            API_PASSWORD,
        )?;
        Ok(Self { core, rpc })
    }

    #[cfg(test)]
    fn with_rpc(core: NodeCore, rpc: HttpJsonRpc) -> Self {
        Self { core, rpc }
    }

    /// `(nodeId, state)` for every channel, expanding bare channel ids.
    async fn channel_states(&self) -> Result<Vec<(String, String)>> {
        let channels = self.rpc.call("channels", json!([])).await?;
        let mut states = Vec::new();
        for entry in channels.as_array().cloned().unwrap_or_default() {
            let channel = if str_field(&entry, "state").is_some() {
                entry
            } else {
                match entry.as_str().or_else(|| str_field(&entry, "channelId")) {
                    Some(id) => self.rpc.call("channel", json!([id])).await?,
                    None => continue,
                }
            };
            if let (Some(node), Some(state)) = (str_field(&channel, "nodeId"), str_field(&channel, "state")) {
                states.push((node.to_string(), state.to_string()));
            }
        }
        Ok(states)
    }
}

/// The address eclair prints for its on-chain wallet at startup.
fn logged_wallet_address(lines: &[String]) -> Option<String> {
    let re = Regex::new(WALLET_ADDRESS).ok()?;
    lines
        .iter()
        .rev()
        .find_map(|line| re.captures(line).map(|c| c[1].to_string()))
}

fn invoice_from(result: &Value) -> Option<String> {
    match result {
        Value::String(invoice) => Some(invoice.clone()),
        other => str_field(other, "serialized").map(str::to_string),
    }
}

fn payment_result(result: &Value) -> Result<String> {
    if result.get("failures").is_some() {
        return Err(HarnessError::PaymentFailed {
            detail: result.to_string(),
        });
    }
    str_field(result, "paymentPreimage")
        .map(str::to_string)
        .ok_or_else(|| HarnessError::PaymentFailed {
            detail: format!("no preimage in {}", result),
        })
}

fn channel_edges(channels: &Value) -> BTreeSet<ChannelEdge> {
    channels
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|c| Some(ChannelEdge::both_ways(str_field(c, "a")?, str_field(c, "b")?)))
        .flatten()
        .collect()
}

impl EclairNode {
    /// Confirmed on-chain wallet balance in satoshi.
    async fn confirmed_balance(&self) -> Result<u64> {
        let balance = self.rpc.call("onchainbalance", json!({})).await?;
        balance
            .get("confirmed")
            .and_then(as_u64)
            .ok_or_else(|| HarnessError::rpc("onchainbalance", format!("unexpected result {}", balance)))
    }
}

impl LightningRpc for EclairNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    async fn info(&self) -> Result<NodeInfo> {
        let info = self.rpc.call("getinfo", json!([])).await?;
        Ok(NodeInfo {
            id: str_field(&info, "nodeId")
                .ok_or_else(|| HarnessError::rpc("getinfo", "missing 'nodeId'"))?
                .to_string(),
            block_height: info.get("blockHeight").and_then(as_u64).unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.rpc.call("help", json!([])).await.map(|_| ())
    }

    async fn peers(&self) -> Result<Vec<String>> {
        let peers = self.rpc.call("peers", json!([])).await?;
        Ok(peers
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| str_field(p, "nodeId").map(str::to_string))
            .collect())
    }

    async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        self.rpc
            .call("connect", json!([peer_id, host, port]))
            .await
            .map(|_| ())
    }

    async fn new_address(&self) -> Result<String> {
        if let Some(address) = logged_wallet_address(&self.core.log().snapshot()) {
            return Ok(address);
        }
        let address = self.rpc.call("getnewaddress", json!([])).await?;
        address
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("getnewaddress", format!("unexpected result {}", address)))
    }

    /// Waits for eclair's own confirmed balance to cover `sat`. Versions
    /// without `onchainbalance` fall back to the funding tx confirming.
    async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()> {
        let address = self.new_address().await?;
        let txid = chain.send_to_address(&address, sat).await?;

        for _ in 0..FUNDING_ATTEMPTS {
            // eclair picks funds out of blocks; give it the mempool tx first.
            tokio::time::sleep(Duration::from_secs(1)).await;
            chain.generate(1).await?;
            match self.confirmed_balance().await {
                Ok(balance) if balance >= sat => {
                    debug!(%txid, balance, "Funds visible in eclair wallet");
                    return Ok(());
                }
                Ok(balance) => debug!(%txid, balance, "Waiting for eclair to see funds"),
                Err(HarnessError::Rpc { message, .. }) => {
                    debug!(error = %message, "onchainbalance unavailable, checking confirmations");
                    if chain.confirmations(&txid).await? > 0 {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(HarnessError::PollTimeout {
            what: "eclair to see its funding output".to_string(),
            timeout: Duration::from_secs(FUNDING_ATTEMPTS as u64),
        })
    }

    async fn open_channel(&self, peer_id: &str, _host: &str, _port: u16, sat: u64) -> Result<()> {
        require_peer("open", &self.peers().await?, peer_id)?;
        self.rpc
            .call("open", json!([peer_id, sat, 0]))
            .await
            .map(|_| ())
    }

    async fn channel_is_active(&self, peer_id: &str) -> Result<bool> {
        match self.channel_states().await?.into_iter().find(|(node, _)| node == peer_id) {
            Some((_, state)) => {
                debug!(peer = peer_id, %state, "Channel state");
                Ok(state == NORMAL_STATE)
            }
            None => {
                warn!(peer = peer_id, "Channel not found");
                Ok(false)
            }
        }
    }

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        Ok(channel_edges(&self.rpc.call("allchannels", json!([])).await?))
    }

    async fn announced_nodes(&self) -> Result<BTreeSet<String>> {
        let nodes = self.rpc.call("allnodes", json!([])).await?;
        Ok(nodes
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|n| str_field(n, "nodeId").map(str::to_string))
            .collect())
    }

    async fn create_invoice(&self, msat: u64) -> Result<String> {
        let result = self
            .rpc
            .call("receive", json!([msat, INVOICE_DESCRIPTION]))
            .await?;
        invoice_from(&result).ok_or_else(|| HarnessError::rpc("receive", format!("unexpected result {}", result)))
    }

    async fn decode_invoice(&self, payment_request: &str) -> Result<String> {
        let decoded = self.rpc.call("checkinvoice", json!([payment_request])).await?;
        str_field(&decoded, "paymentHash")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("checkinvoice", "missing 'paymentHash'"))
    }

    async fn pay(&self, payment_request: &str) -> Result<String> {
        let result = self
            .rpc
            .call("send", json!([payment_request]))
            .await
            .map_err(payment_failure)?;
        payment_result(&result)
    }

    async fn has_route(&self, peer_id: &str, _msat: u64) -> Result<bool> {
        route_probe(self.rpc.call("findroute", json!([peer_id])).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{test_spec, Implementation};
    use std::path::PathBuf;

    #[test]
    fn config_points_at_shared_bitcoind() {
        let spec = test_spec(Implementation::Eclair, &PathBuf::from("/tmp/run/node-3"));
        let conf = render_config(&spec);
        assert!(conf.contains("chain = \"regtest\""));
        assert!(conf.contains("port = 19735"));
        assert!(conf.contains("port = 29735"));
        assert!(conf.contains("rpcport = 18443"));
        assert!(conf.contains("zmqtx = \"tcp://127.0.0.1:29001\""));
        assert!(conf.contains("password = \"rpcpass\""));
    }

    #[test]
    fn launch_waits_for_zmq_connection() {
        let spec = test_spec(Implementation::Eclair, &PathBuf::from("/tmp/run/node-3"));
        let launch = launch_config(&spec, &HarnessConfig::default());
        assert_eq!(launch.program, PathBuf::from("java"));
        assert_eq!(launch.args.last().map(String::as_str), Some("bin/eclair.jar"));

        let ready = Regex::new(&launch.ready_patterns[0]).unwrap();
        assert!(ready.is_match("INFO  ZMQActor - connected to tcp://127.0.0.1:29000"));
        assert!(!ready.is_match("connected to tcp://127.0.0.1:29001"));
    }

    #[test]
    fn wallet_address_taken_from_log() {
        let lines = vec![
            "starting eclair".to_string(),
            "initial wallet address=2N1xgSUB1d3kQsHnw9Emrdexrn6P83n2AF9".to_string(),
        ];
        assert_eq!(
            logged_wallet_address(&lines).as_deref(),
            Some("2N1xgSUB1d3kQsHnw9Emrdexrn6P83n2AF9")
        );
        assert_eq!(logged_wallet_address(&lines[..1]), None);
    }

    #[test]
    fn invoice_accepts_both_shapes() {
        assert_eq!(invoice_from(&json!("lnbcrt1")).as_deref(), Some("lnbcrt1"));
        assert_eq!(invoice_from(&json!({"serialized": "lnbcrt2"})).as_deref(), Some("lnbcrt2"));
        assert_eq!(invoice_from(&json!(42)), None);
    }

    #[test]
    fn failures_mean_payment_failed() {
        let ok = json!({"paymentPreimage": "ab".repeat(32)});
        assert_eq!(payment_result(&ok).unwrap(), "ab".repeat(32));

        let failed = json!({"failures": [{"t": "route not found"}]});
        assert!(matches!(
            payment_result(&failed),
            Err(HarnessError::PaymentFailed { .. })
        ));
    }

    #[test]
    fn all_channels_yield_both_directions() {
        let channels = json!([{"a": "02aa", "b": "03bb", "shortChannelId": "103x1x0"}]);
        let edges = channel_edges(&channels);
        assert_eq!(
            edges.into_iter().collect::<Vec<_>>(),
            vec![ChannelEdge::new("02aa", "03bb"), ChannelEdge::new("03bb", "02aa")]
        );
    }

    #[cfg(unix)]
    /// Minimal eclair API: answers each JSON-RPC request with `answer`.
    async fn fake_api(answer: fn(&str, &Value) -> Value) -> (String, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                let body = loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some((head, body)) = text.split_once("\r\n\r\n") {
                        let length = head
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if body.len() >= length {
                            break body.to_string();
                        }
                    }
                    if n == 0 {
                        break String::new();
                    }
                };
                let request: Value = serde_json::from_str(&body).unwrap();
                let reply = answer(request["method"].as_str().unwrap(), &request["params"]).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    reply.len(),
                    reply
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });
        (url, server)
    }

    #[cfg(unix)]
    fn ok(result: Value) -> Value {
        json!({"result": result, "error": null, "id": "ln-interop"})
    }

    #[cfg(unix)]
    fn idle_core(dir: &std::path::Path) -> NodeCore {
        NodeCore::spawn(
            test_spec(Implementation::Eclair, dir),
            LaunchConfig::new("sh", dir).args(["-c", "sleep 30"]),
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn channel_ids_are_expanded() {
        let (url, server) = fake_api(|method, params| match method {
            "channels" => ok(json!(["c1", "c2"])),
            "channel" if params[0] == "c1" => ok(json!({"nodeId": "03bb", "state": "NORMAL"})),
            "channel" => ok(json!({"nodeId": "02cc", "state": "WAIT_FOR_FUNDING_CONFIRMED"})),
            other => panic!("unexpected method {other}"),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let node = EclairNode::with_rpc(idle_core(dir.path()), HttpJsonRpc::new(url, API_USER, API_PASSWORD).unwrap());

        assert!(node.channel_is_active("03bb").await.unwrap());
        assert!(!node.channel_is_active("02cc").await.unwrap());
        assert!(!node.channel_is_active("02dd").await.unwrap());

        node.core().stop().await.unwrap();
        server.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn confirmed_balance_reads_wallet() {
        let (url, server) = fake_api(|method, _| match method {
            "onchainbalance" => ok(json!({"confirmed": 2_000_000, "unconfirmed": 0})),
            other => panic!("unexpected method {other}"),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let node = EclairNode::with_rpc(idle_core(dir.path()), HttpJsonRpc::new(url, API_USER, API_PASSWORD).unwrap());
        assert_eq!(node.confirmed_balance().await.unwrap(), 2_000_000);

        node.core().stop().await.unwrap();
        server.abort();
    }
}
