use super::{unsupported, ChannelEdge, Implementation, LightningRpc, NodeCore, NodeInfo, NodeSpec};
use crate::chain::Bitcoind;
use crate::config::HarnessConfig;
use crate::daemon::LaunchConfig;
use crate::error::Result;
use std::collections::BTreeSet;

const IMPL: Implementation = Implementation::RustLightning;

/// No ready line is printed; readiness is the settle delay alone.
pub fn launch_config(spec: &NodeSpec, config: &HarnessConfig) -> LaunchConfig {
    let chain = &spec.chain;
    LaunchConfig::new(config.rust_lightning_binary(), &spec.dir)
        .args([
            "-chain=regtest".to_string(),
            format!("-p2pport={}", spec.port),
            format!("-datadir={}", spec.dir.display()),
            format!("-rpcauth={}:{}", chain.rpc_user, chain.rpc_password),
            format!("-rpc_host=127.0.0.1:{}", chain.rpc_port),
        ])
        .prefix(format!("rust-lightning({})", spec.port))
        .output_dir(&spec.dir)
        .stop_grace(spec.stop_grace)
}

/// The rust-lightning sample node. It only reads commands from its own
/// terminal, so the harness can run it but not drive it.
pub struct RustLightningNode {
    core: NodeCore,
}

impl RustLightningNode {
    pub fn new(core: NodeCore) -> Self {
        Self { core }
    }
}

impl LightningRpc for RustLightningNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    async fn info(&self) -> Result<NodeInfo> {
        Err(unsupported(IMPL, "info"))
    }

    async fn ping(&self) -> Result<()> {
        Err(unsupported(IMPL, "ping"))
    }

    async fn peers(&self) -> Result<Vec<String>> {
        Err(unsupported(IMPL, "peers"))
    }

    async fn connect(&self, _host: &str, _port: u16, _peer_id: &str) -> Result<()> {
        Err(unsupported(IMPL, "connect"))
    }

    async fn new_address(&self) -> Result<String> {
        Err(unsupported(IMPL, "new_address"))
    }

    async fn provision_funds(&self, _chain: &Bitcoind, _sat: u64) -> Result<()> {
        Err(unsupported(IMPL, "provision_funds"))
    }

    async fn open_channel(&self, _peer_id: &str, _host: &str, _port: u16, _sat: u64) -> Result<()> {
        Err(unsupported(IMPL, "open_channel"))
    }

    async fn channel_is_active(&self, _peer_id: &str) -> Result<bool> {
        Err(unsupported(IMPL, "channel_is_active"))
    }

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        Err(unsupported(IMPL, "known_channels"))
    }

    async fn announced_nodes(&self) -> Result<BTreeSet<String>> {
        Err(unsupported(IMPL, "announced_nodes"))
    }

    async fn create_invoice(&self, _msat: u64) -> Result<String> {
        Err(unsupported(IMPL, "create_invoice"))
    }

    async fn decode_invoice(&self, _payment_request: &str) -> Result<String> {
        Err(unsupported(IMPL, "decode_invoice"))
    }

    async fn pay(&self, _payment_request: &str) -> Result<String> {
        Err(unsupported(IMPL, "pay"))
    }

    async fn has_route(&self, _peer_id: &str, _msat: u64) -> Result<bool> {
        Err(unsupported(IMPL, "has_route"))
    }
}
