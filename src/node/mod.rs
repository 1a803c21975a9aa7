//! Uniform test vocabulary over structurally different lightning daemons.
//!
//! Every adapter is a [`NodeCore`] (the supervised process plus its launch
//! parameters) combined with a daemon-specific RPC client. [`LightningRpc`]
//! is the contract each adapter implements; [`Node`] is the tagged variant the
//! factory hands out so scenarios never care which daemon they are driving.

pub mod clightning;
pub mod eclair;
pub mod lnd;
pub mod ptarmigan;
pub mod rust_lightning;

pub use clightning::CLightningNode;
pub use eclair::EclairNode;
pub use lnd::LndNode;
pub use ptarmigan::PtarmiganNode;
pub use rust_lightning::RustLightningNode;

use crate::chain::{Bitcoind, ChainEndpoint};
use crate::config::HarnessConfig;
use crate::daemon::{LaunchConfig, LogBuffer, ManagedProcess, PatternWaitRequest, StopReport};
use crate::error::{HarnessError, Result};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Pause between stop and start in [`Node::restart`].
pub const RESTART_SETTLE: Duration = Duration::from_secs(5);
/// Lines attached to an exit detected after the ready wait.
const EXIT_TAIL: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Implementation {
    CLightning,
    Lnd,
    Eclair,
    Ptarmigan,
    RustLightning,
}

impl Implementation {
    pub fn all() -> &'static [Implementation] {
        &[
            Self::CLightning,
            Self::Lnd,
            Self::Eclair,
            Self::Ptarmigan,
            Self::RustLightning,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CLightning => "c-lightning",
            Self::Lnd => "lnd",
            Self::Eclair => "eclair",
            Self::Ptarmigan => "ptarmigan",
            Self::RustLightning => "rust-lightning",
        }
    }

    /// Whether the daemon exposes an RPC interface at all.
    pub fn has_rpc(&self) -> bool {
        !matches!(self, Self::RustLightning)
    }

    /// Main artifact the daemon is launched from (the jar for eclair).
    pub fn binary(&self, config: &HarnessConfig) -> PathBuf {
        match self {
            Self::CLightning => config.lightningd_binary(),
            Self::Lnd => config.lnd_binary(),
            Self::Eclair => config.eclair_jar(),
            Self::Ptarmigan => config.ptarmd_binary(),
            Self::RustLightning => config.rust_lightning_binary(),
        }
    }

    /// Extra pause after the ready pattern before the daemon takes commands.
    pub fn ready_settle(&self) -> Duration {
        match self {
            Self::Ptarmigan => Duration::from_secs(3),
            Self::RustLightning => Duration::from_secs(5),
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Implementation {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "c-lightning" | "clightning" | "lightning" | "lightningd" | "cln" => Ok(Self::CLightning),
            "lnd" => Ok(Self::Lnd),
            "eclair" => Ok(Self::Eclair),
            "ptarmigan" | "ptarmd" => Ok(Self::Ptarmigan),
            "rust-lightning" | "rust-lightning-bitcoinrpc" | "rustln" => Ok(Self::RustLightning),
            other => Err(HarnessError::Config(format!(
                "unknown implementation '{}', expected one of: {}",
                other,
                Self::all().iter().map(|i| i.name()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

/// Identity and chain view reported by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    pub block_height: u64,
}

/// One direction of an announced channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelEdge {
    pub source: String,
    pub destination: String,
}

impl ChannelEdge {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Both directions of an undirected announcement.
    pub fn both_ways(a: &str, b: &str) -> [Self; 2] {
        [Self::new(a, b), Self::new(b, a)]
    }

    pub fn touches(&self, node: &str) -> bool {
        self.source == node || self.destination == node
    }
}

/// Everything the factory allocated for one node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub implementation: Implementation,
    pub node_id: u32,
    pub dir: PathBuf,
    pub host: String,
    /// Lightning p2p port
    pub port: u16,
    /// Control port for daemons that listen on TCP (lnd gRPC, eclair API, ptarmigan)
    pub rpc_port: u16,
    /// Secondary port (lnd REST)
    pub rest_port: u16,
    pub chain: ChainEndpoint,
    pub ready_timeout: Duration,
    /// Deadline for a single socket RPC round trip
    pub rpc_timeout: Duration,
    pub stop_grace: Duration,
    pub wait_offset: usize,
}

/// The process half of a node: launch parameters plus the current instance.
///
/// A restart replaces the [`ManagedProcess`]; the launch parameters and the
/// memoized identity survive it.
pub struct NodeCore {
    spec: NodeSpec,
    launch: LaunchConfig,
    process: RwLock<Arc<ManagedProcess>>,
    identity: OnceCell<String>,
}

impl NodeCore {
    pub fn spawn(spec: NodeSpec, launch: LaunchConfig) -> Result<Self> {
        let process = ManagedProcess::spawn(launch.clone())?;
        Ok(Self {
            spec,
            launch,
            process: RwLock::new(Arc::new(process)),
            identity: OnceCell::new(),
        })
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn implementation(&self) -> Implementation {
        self.spec.implementation
    }

    pub fn node_id(&self) -> u32 {
        self.spec.node_id
    }

    pub fn dir(&self) -> &Path {
        &self.spec.dir
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn launch_config(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn process(&self) -> Arc<ManagedProcess> {
        Arc::clone(&self.process.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn log(&self) -> Arc<LogBuffer> {
        Arc::clone(self.process().log())
    }

    /// Cached identity, if one was fetched already.
    pub fn cached_identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Wait for the launch config's ready patterns, then the daemon's settle time.
    pub async fn wait_ready(&self) -> Result<()> {
        let process = self.process();
        let timeout = self.spec.ready_timeout;
        tokio::task::spawn_blocking(move || process.wait_ready(timeout))
            .await
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))??;

        let settle = self.spec.implementation.ready_settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        // Daemons without a ready line can die during the settle delay.
        let process = self.process();
        if !process.is_running() {
            return Err(HarnessError::ProcessTerminated {
                prefix: process.prefix().to_string(),
                pattern: "(settle delay)".to_string(),
                recent: process.log().tail(EXIT_TAIL),
            });
        }
        info!(node = self.spec.node_id, implementation = %self.spec.implementation, "Node ready");
        Ok(())
    }

    /// Pattern wait on the current process, off the async runtime.
    pub async fn wait_for_log(&self, pattern: &str, offset: usize, timeout: Duration) -> Result<String> {
        let request = PatternWaitRequest::new(pattern)?.offset(offset).timeout(timeout);
        self.process().wait_for_log_async(request).await
    }

    /// Pattern wait over lines appended at or after the absolute `index` of
    /// the current process's log.
    pub async fn wait_for_log_since(&self, pattern: &str, index: usize, timeout: Duration) -> Result<String> {
        let pattern = Regex::new(pattern)?;
        let log = self.log();
        tokio::task::spawn_blocking(move || log.wait_since(&pattern, index, timeout))
            .await
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?
            .map(|(_, line)| line)
    }

    pub async fn stop(&self) -> Result<StopReport> {
        self.process().stop_async().await
    }

    /// Launch a fresh process from the same parameters and wait until ready.
    pub async fn start(&self) -> Result<()> {
        if self.process().is_running() {
            debug!(node = self.spec.node_id, "Start requested while running, ignoring");
            return Ok(());
        }
        let process = ManagedProcess::spawn(self.launch.clone())?;
        *self.process.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(process);
        self.wait_ready().await
    }
}

/// The per-daemon contract.
///
/// Amounts are satoshi for on-chain funds and channels, millisatoshi for
/// invoices and route probes.
#[allow(async_fn_in_trait)]
pub trait LightningRpc {
    fn core(&self) -> &NodeCore;

    async fn info(&self) -> Result<NodeInfo>;

    /// Public key; fetched once, then served from cache.
    async fn identity(&self) -> Result<String> {
        let core = self.core();
        core.identity
            .get_or_try_init(|| async { Ok::<_, HarnessError>(self.info().await?.id) })
            .await
            .cloned()
    }

    async fn block_height(&self) -> Result<u64> {
        Ok(self.info().await?.block_height)
    }

    /// Cheapest call the daemon answers.
    async fn ping(&self) -> Result<()>;

    async fn is_alive(&self) -> bool {
        self.ping().await.is_ok()
    }

    async fn peers(&self) -> Result<Vec<String>>;

    async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()>;

    async fn new_address(&self) -> Result<String>;

    async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()>;

    async fn open_channel(&self, peer_id: &str, host: &str, port: u16, sat: u64) -> Result<()>;

    /// False, not an error, while no channel with `peer_id` exists.
    async fn channel_is_active(&self, peer_id: &str) -> Result<bool>;

    async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>>;

    /// Node ids from the daemon's graph, unfiltered.
    async fn announced_nodes(&self) -> Result<BTreeSet<String>>;

    async fn known_nodes(&self) -> Result<BTreeSet<String>> {
        let announced = self.announced_nodes().await?;
        let channels = self.known_channels().await?;
        let own = self.identity().await?;
        Ok(visible_nodes(announced, &channels, &own))
    }

    async fn create_invoice(&self, msat: u64) -> Result<String>;

    /// Payment hash (hex) of `payment_request`.
    async fn decode_invoice(&self, payment_request: &str) -> Result<String>;

    /// Preimage (hex) on success.
    async fn pay(&self, payment_request: &str) -> Result<String>;

    async fn has_route(&self, peer_id: &str, msat: u64) -> Result<bool>;

    /// Wait until the node has processed block `block_hash`.
    async fn block_sync(&self, _block_hash: &str) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    /// Called after the process was relaunched.
    fn on_restart(&self) {}
}

/// Announced nodes, minus the local node unless it is an endpoint of a known
/// channel. Daemons disagree on whether they announce themselves before
/// having channels; this makes gossip assertions comparable.
pub fn visible_nodes(
    mut announced: BTreeSet<String>,
    channels: &BTreeSet<ChannelEdge>,
    own_id: &str,
) -> BTreeSet<String> {
    if !channels.iter().any(|edge| edge.touches(own_id)) {
        announced.remove(own_id);
    }
    announced
}

/// True when `sha256(preimage) == payment_hash`, both hex.
pub fn verify_preimage(preimage_hex: &str, payment_hash_hex: &str) -> Result<bool> {
    let preimage = hex::decode(preimage_hex.trim())
        .map_err(|e| HarnessError::Config(format!("preimage is not hex: {}", e)))?;
    let expected = hex::decode(payment_hash_hex.trim())
        .map_err(|e| HarnessError::Config(format!("payment hash is not hex: {}", e)))?;
    Ok(Sha256::digest(&preimage).as_slice() == expected.as_slice())
}

/// Error for operations a daemon cannot perform.
pub(crate) fn unsupported(implementation: Implementation, operation: &'static str) -> HarnessError {
    HarnessError::Unsupported {
        implementation: implementation.name(),
        operation,
    }
}

/// Reject channel opens to peers we are not connected to.
pub(crate) fn require_peer(method: &str, peers: &[String], peer_id: &str) -> Result<()> {
    if peers.iter().any(|p| p == peer_id) {
        Ok(())
    } else {
        Err(HarnessError::rpc(
            method,
            format!("must connect to {} before opening a channel", peer_id),
        ))
    }
}

/// Turn a daemon's rejection of a payment into [`HarnessError::PaymentFailed`].
pub(crate) fn payment_failure(err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Rpc { message, .. } => HarnessError::PaymentFailed { detail: message },
        other => other,
    }
}

/// Map a route probe's "no route" failure to `false`.
pub(crate) fn route_probe<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_no_route() => Ok(false),
        Err(e) => Err(e),
    }
}

/// `value[key]` as an owned array, empty when absent.
pub(crate) fn array(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

macro_rules! dispatch {
    ($self:ident, $node:ident => $body:expr) => {
        match $self {
            Node::CLightning($node) => $body,
            Node::Lnd($node) => $body,
            Node::Eclair($node) => $body,
            Node::Ptarmigan($node) => $body,
            Node::RustLightning($node) => $body,
        }
    };
}

/// A node of any implementation.
pub enum Node {
    CLightning(CLightningNode),
    Lnd(LndNode),
    Eclair(EclairNode),
    Ptarmigan(PtarmiganNode),
    RustLightning(RustLightningNode),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("implementation", &self.implementation())
            .field("node_id", &self.core().node_id())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Write the daemon's config files, spawn its process and wrap it in the
    /// matching adapter. Does not wait for readiness.
    pub fn launch(spec: NodeSpec, config: &HarnessConfig) -> Result<Self> {
        std::fs::create_dir_all(&spec.dir)?;
        let node = match spec.implementation {
            Implementation::CLightning => {
                let launch = clightning::launch_config(&spec, config);
                Node::CLightning(CLightningNode::new(NodeCore::spawn(spec, launch)?))
            }
            Implementation::Lnd => {
                let launch = lnd::prepare(&spec, config)?;
                Node::Lnd(LndNode::new(NodeCore::spawn(spec, launch)?))
            }
            Implementation::Eclair => {
                let launch = eclair::prepare(&spec, config)?;
                Node::Eclair(EclairNode::new(NodeCore::spawn(spec, launch)?)?)
            }
            Implementation::Ptarmigan => {
                let launch = ptarmigan::launch_config(&spec, config);
                let tools = ptarmigan::Tools::from_config(config);
                Node::Ptarmigan(PtarmiganNode::new(NodeCore::spawn(spec, launch)?, tools))
            }
            Implementation::RustLightning => {
                let launch = rust_lightning::launch_config(&spec, config);
                Node::RustLightning(RustLightningNode::new(NodeCore::spawn(spec, launch)?))
            }
        };
        info!(
            node = node.core().node_id(),
            implementation = %node.implementation(),
            port = node.core().port(),
            pid = node.core().process().pid(),
            "Launched node"
        );
        Ok(node)
    }

    pub fn core(&self) -> &NodeCore {
        dispatch!(self, n => n.core())
    }

    pub fn implementation(&self) -> Implementation {
        self.core().implementation()
    }

    pub fn host(&self) -> &str {
        self.core().host()
    }

    pub fn port(&self) -> u16 {
        self.core().port()
    }

    pub fn log(&self) -> Arc<LogBuffer> {
        self.core().log()
    }

    pub async fn wait_ready(&self) -> Result<()> {
        self.core().wait_ready().await
    }

    pub async fn wait_for_log(&self, pattern: &str, timeout: Duration) -> Result<String> {
        let core = self.core();
        core.wait_for_log(pattern, core.spec().wait_offset, timeout).await
    }

    pub async fn stop(&self) -> Result<StopReport> {
        self.core().stop().await
    }

    pub async fn start(&self) -> Result<()> {
        self.core().start().await?;
        dispatch!(self, n => n.on_restart());
        Ok(())
    }

    /// Stop, let the daemon's state settle on disk, then start again.
    pub async fn restart(&self) -> Result<()> {
        info!(node = self.core().node_id(), implementation = %self.implementation(), "Restarting node");
        self.stop().await?;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start().await
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        dispatch!(self, n => n.info().await)
    }

    pub async fn identity(&self) -> Result<String> {
        dispatch!(self, n => n.identity().await)
    }

    pub async fn block_height(&self) -> Result<u64> {
        dispatch!(self, n => n.block_height().await)
    }

    pub async fn is_alive(&self) -> bool {
        dispatch!(self, n => n.is_alive().await)
    }

    pub async fn peers(&self) -> Result<Vec<String>> {
        dispatch!(self, n => n.peers().await)
    }

    pub async fn connect(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        info!(node = self.core().node_id(), peer = peer_id, host, port, "Connecting");
        dispatch!(self, n => n.connect(host, port, peer_id).await)
    }

    /// Connect to `other` using its advertised host, port and identity.
    pub async fn connect_to(&self, other: &Node) -> Result<()> {
        let peer_id = other.identity().await?;
        self.connect(other.host(), other.port(), &peer_id).await
    }

    pub async fn new_address(&self) -> Result<String> {
        dispatch!(self, n => n.new_address().await)
    }

    pub async fn provision_funds(&self, chain: &Bitcoind, sat: u64) -> Result<()> {
        info!(node = self.core().node_id(), sat, "Provisioning funds");
        dispatch!(self, n => n.provision_funds(chain, sat).await)
    }

    pub async fn open_channel(&self, peer_id: &str, host: &str, port: u16, sat: u64) -> Result<()> {
        info!(node = self.core().node_id(), peer = peer_id, sat, "Opening channel");
        dispatch!(self, n => n.open_channel(peer_id, host, port, sat).await)
    }

    pub async fn channel_is_active(&self, peer_id: &str) -> Result<bool> {
        dispatch!(self, n => n.channel_is_active(peer_id).await)
    }

    pub async fn known_channels(&self) -> Result<BTreeSet<ChannelEdge>> {
        dispatch!(self, n => n.known_channels().await)
    }

    pub async fn known_nodes(&self) -> Result<BTreeSet<String>> {
        dispatch!(self, n => n.known_nodes().await)
    }

    pub async fn create_invoice(&self, msat: u64) -> Result<String> {
        dispatch!(self, n => n.create_invoice(msat).await)
    }

    pub async fn decode_invoice(&self, payment_request: &str) -> Result<String> {
        dispatch!(self, n => n.decode_invoice(payment_request).await)
    }

    pub async fn pay(&self, payment_request: &str) -> Result<String> {
        info!(node = self.core().node_id(), "Paying invoice");
        dispatch!(self, n => n.pay(payment_request).await)
    }

    pub async fn has_route(&self, peer_id: &str, msat: u64) -> Result<bool> {
        dispatch!(self, n => n.has_route(peer_id, msat).await)
    }

    pub async fn block_sync(&self, block_hash: &str) -> Result<()> {
        dispatch!(self, n => n.block_sync(block_hash).await)
    }
}

/// A `NodeSpec` with fixed ports for adapter tests.
#[cfg(test)]
pub(crate) fn test_spec(implementation: Implementation, dir: &Path) -> NodeSpec {
    NodeSpec {
        implementation,
        node_id: 1,
        dir: dir.to_path_buf(),
        host: "127.0.0.1".to_string(),
        port: 19735,
        rpc_port: 29735,
        rest_port: 39735,
        chain: ChainEndpoint {
            dir: PathBuf::from("/tmp/run/bitcoind"),
            rpc_port: 18443,
            rpc_user: "rpcuser".to_string(),
            rpc_password: "rpcpass".to_string(),
            zmq_block: "tcp://127.0.0.1:29000".to_string(),
            zmq_tx: "tcp://127.0.0.1:29001".to_string(),
        },
        ready_timeout: Duration::from_secs(60),
        rpc_timeout: Duration::from_secs(30),
        stop_grace: Duration::from_secs(3),
        wait_offset: 1000,
    }
}
