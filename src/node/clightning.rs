use super::{
    array, payment_failure, require_peer, route_probe, str_field, ChannelEdge, LightningRpc,
    NodeCore, NodeInfo, NodeSpec,
};
use crate::chain::Bitcoind;
use crate::config::HarnessConfig;
use crate::daemon::LaunchConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::{as_u64, JsonRpc, UnixSocketRpc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub const SOCKET_NAME: &str = "lightning-rpc";
const READY_PATTERN: &str = "Server started with public key";
const NORMAL_STATE: &str = "CHANNELD_NORMAL";
const FUNDING_ATTEMPTS: u32 = 30;

pub fn launch_config(spec: &NodeSpec, config: &HarnessConfig) -> LaunchConfig {
    let chain = &spec.chain;
    LaunchConfig::new(config.lightningd_binary(), &spec.dir)
        .args([
            format!("--lightning-dir={}", spec.dir.display()),
            format!("--rpc-file={}", spec.dir.join(SOCKET_NAME).display()),
            format!("--addr={}:{}", spec.host, spec.port),
            format!("--bitcoin-datadir={}", chain.dir.display()),
            format!("--bitcoin-rpcuser={}", chain.rpc_user),
            format!("--bitcoin-rpcpassword={}", chain.rpc_password),
            format!("--bitcoin-rpcport={}", chain.rpc_port),
            "--network=regtest".to_string(),
            "--log-level=debug".to_string(),
        ])
        .prefix(format!("lightningd({})", spec.port))
        .ready_pattern(READY_PATTERN)
        .output_dir(&spec.dir)
        .stop_grace(spec.stop_grace)
}

/// c-lightning, driven over its unix socket JSON-RPC.
pub struct CLightningNode {
    core: NodeCore,
    rpc: UnixSocketRpc,
    invoice_count: AtomicU64,
}

impl CLightningNode {
    pub fn new(core: NodeCore) -> Self {
        let rpc = UnixSocketRpc::new(core.dir().join(SOCKET_NAME)).with_timeout(core.spec().rpc_timeout);
        Self {
            core,
            rpc,
            invoice_count: AtomicU64::new(0),
        }
    }

    async fn list_peers(&self) -> Result<Vec<Value>> {
        let result = self.rpc.call("listpeers", json!({})).await?;
        Ok(array(&result, "peers"))
    }

    async fn scid_is_active(&self, short_channel_id: &str) -> Result<bool> {
        let result = self
            .rpc
            .call("listchannels", json!({"short_channel_id": short_channel_id}))
            .await?;
        Ok(array(&result, "channels")
            .iter()
            .any(|c| c.get("active").and_then(Value::as_bool).unwrap_or(false)))
    }
}

/// State and short channel id of the first channel with a peer, falling back
/// to the peer-level fields older versions report.
fn peer_channel(peer: &Value) -> (Option<&str>, Option<&str>) {
    match peer.get("channels").and_then(Value::as_array).and_then(|c| c.first()) {
        Some(channel) => (str_field(channel, "state"), str_field(channel, "short_channel_id")),
        None => (str_field(peer, "state"), str_field(peer, "short_channel_id")),
    }
}

fn new_address_from(result: &Value) -> Option<String> {
    ["address", "bech32", "p2sh-segwit", "p2tr"]
        .iter()
        .find_map(|key| str_field(result, key))
        .map(str::to_string)
}

fn edges_from(result: &Value) -> BTreeSet<ChannelEdge> {
    array(result, "channels")
        .iter()
        .filter_map(|c| Some(ChannelEdge::new(str_field(c, "source")?, str_field(c, "destination")?)))
        .collect()
}

impl LightningRpc for CLightningNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    async fn info(&self) -> Result<NodeInfo> {
        let info = self.rpc.call("getinfo", json!({})).await?;
        Ok(NodeInfo {
            id: str_field(&info, "id")
                .ok_or_else(|| HarnessError::rpc("getinfo", "missing 'id'"))?
                .to_string(),
            block_height: info.get("blockheight").and_then(as_u64).unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.rpc.call("help", json!({})).await.map(|_| ())
    }

    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self
            .list_peers()
            .await?
            .iter()
            .filter(|p| p.get("connected").and_then(Value::as_bool).unwrap_or(true))
            .filter_map(|p| str_field(p, "id").map(str::to_string))
            .collect())
    }

    async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        self.rpc
            .call("connect", json!([peer_id, host, port]))
            .await
            .map(|_| ())
    }

    async fn new_address(&self) -> Result<String> {
        let result = self.rpc.call("newaddr", json!({})).await?;
        new_address_from(&result).ok_or_else(|| HarnessError::rpc("newaddr", "no address in response"))
    }

    async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()> {
        let address = self.new_address().await?;
        chain.send_to_address(&address, sat).await?;

        for _ in 0..FUNDING_ATTEMPTS {
            let funds = self.rpc.call("listfunds", json!({})).await?;
            if !array(&funds, "outputs").is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            chain.generate(1).await?;
        }
        Err(HarnessError::PollTimeout {
            what: format!("{} to see its funding output", self.core.spec().implementation),
            timeout: Duration::from_secs(FUNDING_ATTEMPTS as u64),
        })
    }

    async fn open_channel(&self, peer_id: &str, _host: &str, _port: u16, sat: u64) -> Result<()> {
        require_peer("fundchannel", &self.peers().await?, peer_id)?;
        self.rpc
            .call("fundchannel", json!([peer_id, sat]))
            .await
            .map(|_| ())
    }

    async fn channel_is_active(&self, peer_id: &str) -> Result<bool> {
        let peers = self.list_peers().await?;
        let Some(peer) = peers.iter().find(|p| str_field(p, "id") == Some(peer_id)) else {
            warn!(peer = peer_id, "Channel not found");
            return Ok(false);
        };

        let (state, short_channel_id) = peer_channel(peer);
        let connected = peer.get("connected").and_then(Value::as_bool).unwrap_or(false);
        debug!(peer = peer_id, state = ?state, connected, "Channel state");
        if state != Some(NORMAL_STATE) || !connected {
            return Ok(false);
        }

        // Usable for routing only once gossip has our own channel_update.
        match short_channel_id {
            Some(scid) => self.scid_is_active(scid).await,
            None => Ok(false),
        }
    }

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        let result = self.rpc.call("listchannels", json!({})).await?;
        Ok(edges_from(&result))
    }

    async fn announced_nodes(&self) -> Result<BTreeSet<String>> {
        let result = self.rpc.call("listnodes", json!({})).await?;
        Ok(array(&result, "nodes")
            .iter()
            .filter_map(|n| str_field(n, "nodeid").map(str::to_string))
            .collect())
    }

    async fn create_invoice(&self, msat: u64) -> Result<String> {
        let label = format!("invoice{}", self.invoice_count.fetch_add(1, Ordering::Relaxed));
        let result = self
            .rpc
            .call("invoice", json!([msat, label, "description"]))
            .await?;
        str_field(&result, "bolt11")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("invoice", "missing 'bolt11'"))
    }

    async fn decode_invoice(&self, payment_request: &str) -> Result<String> {
        let result = self.rpc.call("decodepay", json!([payment_request])).await?;
        str_field(&result, "payment_hash")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("decodepay", "missing 'payment_hash'"))
    }

    async fn pay(&self, payment_request: &str) -> Result<String> {
        let result = self
            .rpc
            .call("pay", json!([payment_request]))
            .await
            .map_err(payment_failure)?;
        match str_field(&result, "payment_preimage") {
            Some(preimage) => Ok(preimage.to_string()),
            None => Err(HarnessError::PaymentFailed {
                detail: result.to_string(),
            }),
        }
    }

    async fn has_route(&self, peer_id: &str, msat: u64) -> Result<bool> {
        route_probe(self.rpc.call("getroute", json!([peer_id, msat, 1])).await)
    }
}
