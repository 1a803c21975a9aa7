use super::{
    payment_failure, require_peer, str_field, unsupported, ChannelEdge, Implementation,
    LightningRpc, NodeCore, NodeInfo, NodeSpec,
};
use crate::chain::Bitcoind;
use crate::config::HarnessConfig;
use crate::daemon::LaunchConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::{as_u64, JsonRpc, TcpSocketRpc};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const READY_PATTERN: &str = "start bitcoin testnet/regtest";
const NORMAL_STATUS: &str = "normal operation";
const PAYMENT_STARTED: &str = "start payment";
const PREIMAGE_LINE: &str = "p_payment_preimage:";
const PREIMAGE: &str = "[0-9a-f]{64}";
const FEERATE_PER_KW: u64 = 12_000;

pub fn launch_config(spec: &NodeSpec, config: &HarnessConfig) -> LaunchConfig {
    LaunchConfig::new(config.ptarmd_binary(), &spec.dir)
        .args([
            "-d".to_string(),
            spec.dir.display().to_string(),
            "-p".to_string(),
            spec.port.to_string(),
            "-a".to_string(),
            "127.0.0.1".to_string(),
            "-c".to_string(),
            spec.chain.dir.join(crate::chain::CONF_NAME).display().to_string(),
            "--rpcport".to_string(),
            spec.rpc_port.to_string(),
        ])
        .prefix(format!("ptarmd({})", spec.port))
        .ready_pattern(READY_PATTERN)
        .output_dir(&spec.dir)
        .stop_grace(spec.stop_grace)
}

/// The offline helpers shipped with ptarmd. Both read the node's database
/// from the working directory.
#[derive(Debug, Clone)]
pub struct Tools {
    pub showdb: PathBuf,
    pub routing: PathBuf,
}

impl Tools {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            showdb: config.ptarmigan_tool("showdb"),
            routing: config.ptarmigan_tool("routing"),
        }
    }

    /// Run `showdb <flag>` and parse the first JSON document it prints.
    async fn showdb(&self, dir: &Path, flag: &str) -> Result<Value> {
        let output = Command::new(&self.showdb)
            .arg(flag)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| HarnessError::Spawn {
                program: self.showdb.display().to_string(),
                source: e,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        first_document(&stdout).ok_or_else(|| {
            HarnessError::rpc(format!("showdb {}", flag), format!("no JSON in output: {}", stdout.trim()))
        })
    }

    async fn route_exists(&self, dir: &Path, source: &str, destination: &str, msat: u64) -> Result<bool> {
        let status = Command::new(&self.routing)
            .args(["-s", source, "-r", destination, "-a"])
            .arg(msat.to_string())
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| HarnessError::Spawn {
                program: self.routing.display().to_string(),
                source: e,
            })?
            .status;
        debug!(%status, destination, msat, "routing finished");
        Ok(status.success())
    }
}

fn first_document(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()?
        .ok()
}

fn announcements<'a>(db: &'a Value, list: &str) -> impl Iterator<Item = &'a Value> {
    db.get(list)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
}

fn channel_edges(db: &Value) -> BTreeSet<ChannelEdge> {
    announcements(db, "channel_announcement_list")
        .filter(|c| str_field(c, "type") == Some("channel_announcement"))
        .filter_map(|c| Some(ChannelEdge::both_ways(str_field(c, "node1")?, str_field(c, "node2")?)))
        .flatten()
        .collect()
}

fn announced(db: &Value) -> BTreeSet<String> {
    announcements(db, "node_announcement_list")
        .filter_map(|n| str_field(n, "node").map(str::to_string))
        .collect()
}

fn preimage_in(line: &str) -> Option<String> {
    Regex::new(PREIMAGE).ok()?.find(line).map(|m| m.as_str().to_string())
}

/// ptarmigan, driven over its TCP JSON-RPC plus the offline db tools.
///
/// ptarmd funds channels from an outpoint in bitcoind's wallet, so the
/// outpoint chosen during provisioning is remembered here.
pub struct PtarmiganNode {
    core: NodeCore,
    rpc: TcpSocketRpc,
    tools: Tools,
    funding: Mutex<Option<(String, u32)>>,
}

impl PtarmiganNode {
    pub fn new(core: NodeCore, tools: Tools) -> Self {
        let rpc = TcpSocketRpc::new("127.0.0.1", core.spec().rpc_port).with_timeout(core.spec().rpc_timeout);
        Self {
            core,
            rpc,
            tools,
            funding: Mutex::new(None),
        }
    }

    async fn peer_entries(&self) -> Result<Vec<Value>> {
        let info = self.rpc.call("getinfo", Value::Null).await?;
        Ok(info
            .get("peers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn funding_outpoint(&self) -> Option<(String, u32)> {
        self.funding.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LightningRpc for PtarmiganNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    async fn info(&self) -> Result<NodeInfo> {
        let info = self.rpc.call("getinfo", Value::Null).await?;
        Ok(NodeInfo {
            id: str_field(&info, "node_id")
                .ok_or_else(|| HarnessError::rpc("getinfo", "missing 'node_id'"))?
                .to_string(),
            block_height: info.get("block_count").and_then(as_u64).unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.rpc.call("getinfo", Value::Null).await.map(|_| ())
    }

    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self
            .peer_entries()
            .await?
            .iter()
            .filter_map(|p| str_field(p, "node_id").map(str::to_string))
            .collect())
    }

    async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        self.rpc
            .call("connect", json!([peer_id, host, port]))
            .await
            .map(|_| ())
    }

    async fn new_address(&self) -> Result<String> {
        Err(unsupported(Implementation::Ptarmigan, "new_address"))
    }

    /// Funds come from a dedicated, locked output in bitcoind's own wallet.
    async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()> {
        let address = chain.new_address(Some("p2sh-segwit")).await?;
        let txid = chain.send_to_address(&address, sat).await?;
        let vout = chain
            .list_unspent(&address)
            .await?
            .into_iter()
            .find(|u| u.txid == txid)
            .map(|u| u.vout)
            .ok_or_else(|| HarnessError::rpc("listunspent", format!("output of {} not found", txid)))?;
        chain.lock_unspent(&txid, vout).await?;
        debug!(%txid, vout, "Reserved funding outpoint");
        *self.funding.lock().unwrap_or_else(PoisonError::into_inner) = Some((txid, vout));

        tokio::time::sleep(Duration::from_secs(1)).await;
        chain.generate(1).await?;
        Ok(())
    }

    async fn open_channel(&self, peer_id: &str, host: &str, port: u16, sat: u64) -> Result<()> {
        require_peer("fund", &self.peers().await?, peer_id)?;
        let (txid, vout) = self
            .funding_outpoint()
            .ok_or_else(|| HarnessError::rpc("fund", "no funding outpoint, provision funds first"))?;
        self.rpc
            .call(
                "fund",
                json!([peer_id, host, port, txid, vout, sat, 0, FEERATE_PER_KW]),
            )
            .await
            .map(|_| ())
    }

    async fn channel_is_active(&self, peer_id: &str) -> Result<bool> {
        let peers = self.peer_entries().await?;
        match peers.iter().find(|p| str_field(p, "node_id") == Some(peer_id)) {
            Some(peer) => {
                let status = str_field(peer, "status").unwrap_or_default();
                debug!(peer = peer_id, status, "Channel state");
                Ok(status == NORMAL_STATUS)
            }
            None => {
                warn!(peer = peer_id, "Channel not found");
                Ok(false)
            }
        }
    }

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        Ok(channel_edges(&self.tools.showdb(self.core.dir(), "-c").await?))
    }

    async fn announced_nodes(&self) -> Result<BTreeSet<String>> {
        Ok(announced(&self.tools.showdb(self.core.dir(), "-n").await?))
    }

    async fn create_invoice(&self, msat: u64) -> Result<String> {
        let result = self.rpc.call("invoice", json!([msat])).await?;
        str_field(&result, "bolt11")
            .map(str::to_string)
            .ok_or_else(|| HarnessError::rpc("invoice", "missing 'bolt11'"))
    }

    async fn decode_invoice(&self, _payment_request: &str) -> Result<String> {
        Err(unsupported(Implementation::Ptarmigan, "decode_invoice"))
    }

    /// `routepay` only starts the payment; the preimage shows up in the log.
    /// Only lines printed after the call count, so an earlier payment's
    /// preimage is never returned.
    async fn pay(&self, payment_request: &str) -> Result<String> {
        let mark = self.core.log().len();
        let result = self
            .rpc
            .call("routepay", json!([payment_request, 0]))
            .await
            .map_err(payment_failure)?;
        if result.as_str() != Some(PAYMENT_STARTED) {
            return Err(HarnessError::PaymentFailed {
                detail: result.to_string(),
            });
        }
        let line = self
            .core
            .wait_for_log_since(PREIMAGE_LINE, mark, self.core.spec().ready_timeout)
            .await?;
        preimage_in(&line).ok_or_else(|| HarnessError::PaymentFailed {
            detail: format!("no preimage in '{}'", line),
        })
    }

    async fn has_route(&self, peer_id: &str, msat: u64) -> Result<bool> {
        let own = self.identity().await?;
        self.tools.route_exists(self.core.dir(), &own, peer_id, msat).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_spec;

    #[test]
    fn launch_reads_bitcoind_config() {
        let spec = test_spec(Implementation::Ptarmigan, &PathBuf::from("/tmp/run/node-4"));
        let launch = launch_config(&spec, &HarnessConfig::default());
        assert_eq!(launch.program, PathBuf::from("bin/ptarmd"));
        assert_eq!(
            launch.args,
            vec![
                "-d", "/tmp/run/node-4", "-p", "19735", "-a", "127.0.0.1", "-c",
                "/tmp/run/bitcoind/bitcoin.conf", "--rpcport", "29735",
            ]
        );
        assert_eq!(launch.ready_patterns, vec![READY_PATTERN]);
    }

    #[test]
    fn tools_live_next_to_ptarmd() {
        let tools = Tools::from_config(&HarnessConfig::default());
        assert_eq!(tools.showdb, PathBuf::from("bin/showdb"));
        assert_eq!(tools.routing, PathBuf::from("bin/routing"));
    }

    #[test]
    fn first_document_ignores_trailing_output() {
        let text = "db opened\n{\"node_announcement_list\": [{\"node\": \"02aa\"}]}\nclosing db\n";
        let doc = first_document(text).unwrap();
        assert_eq!(announced(&doc), BTreeSet::from(["02aa".to_string()]));
        assert_eq!(first_document("nothing here"), None);
    }

    #[test]
    fn only_channel_announcements_become_edges() {
        let db = json!({"channel_announcement_list": [
            {"type": "channel_announcement", "node1": "02aa", "node2": "03bb"},
            {"type": "channel_update", "node1": "02aa", "node2": "03cc"}
        ]});
        let edges = channel_edges(&db);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| !e.touches("03cc")));
        assert!(channel_edges(&json!({})).is_empty());
    }

    #[test]
    fn preimage_extracted_from_log_line() {
        let hash = "a1".repeat(32);
        let line = format!("DBG p_payment_preimage: {}", hash);
        assert_eq!(preimage_in(&line), Some(hash));
        assert_eq!(preimage_in("p_payment_preimage: (none)"), None);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pay_returns_preimage_of_this_payment() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_port = listener.local_addr().unwrap().port();
        let trigger = dir.path().join("paid");
        let server = {
            let trigger = trigger.clone();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap();
                let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
                assert_eq!(request["method"], "routepay");
                std::fs::write(&trigger, "").unwrap();
                let reply = json!({"result": PAYMENT_STARTED});
                stream.write_all(&serde_json::to_vec(&reply).unwrap()).await.unwrap();
            })
        };

        let old = "aa".repeat(32);
        let new = "bb".repeat(32);
        let script = format!(
            "echo 'p_payment_preimage: {old}'; while [ ! -f paid ]; do sleep 0.05; done; \
             echo 'payment routed'; echo 'p_payment_preimage: {new}'; sleep 30"
        );
        let mut spec = test_spec(Implementation::Ptarmigan, dir.path());
        spec.rpc_port = rpc_port;
        let core = NodeCore::spawn(spec, LaunchConfig::new("sh", dir.path()).args(["-c", script.as_str()])).unwrap();
        core.wait_for_log("p_payment_preimage", 1000, Duration::from_secs(5))
            .await
            .unwrap();

        let node = PtarmiganNode::new(core, Tools::from_config(&HarnessConfig::default()));
        let preimage = node.pay("lnbcrt10n1").await.unwrap();
        assert_eq!(preimage, new);

        server.await.unwrap();
        node.core().stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn showdb_runs_in_node_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("showdb");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ -f marker ] || exit 1\necho '{\"channel_announcement_list\": [{\"type\": \"channel_announcement\", \"node1\": \"02aa\", \"node2\": \"03bb\"}]}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let tools = Tools {
            showdb: script,
            routing: dir.path().join("routing"),
        };
        let db = tools.showdb(dir.path(), "-c").await.unwrap();
        assert!(channel_edges(&db).contains(&ChannelEdge::new("03bb", "02aa")));

        let missing = tools.route_exists(dir.path(), "02aa", "03bb", 1000).await;
        assert!(matches!(missing, Err(HarnessError::Spawn { .. })));
    }
}
