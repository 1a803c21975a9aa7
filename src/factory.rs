//! Per-test allocation of directories, ports and nodes, plus teardown.

use crate::chain::{Bitcoind, BitcoindOptions};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::node::{Implementation, Node, NodeSpec};
use crate::poll;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Lines of output logged when a node fails to start.
pub const FAILURE_DUMP_LINES: usize = 50;
const LOCALHOST: &str = "127.0.0.1";

/// State shared by every test of one run: where directories go and how
/// many have been handed out.
#[derive(Debug)]
pub struct TestContext {
    base_dir: PathBuf,
    counter: AtomicU64,
}

impl TestContext {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        info!(dir = %base_dir.display(), "Running tests");
        Ok(Self {
            base_dir,
            counter: AtomicU64::new(0),
        })
    }

    /// Use the configured base directory, or a fresh temporary one that
    /// outlives the process for post-mortem inspection.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        match &config.test_dir {
            Some(dir) => Self::new(dir),
            None => {
                let dir = tempfile::Builder::new().prefix("ln-interop-").tempdir()?;
                Self::new(dir.keep())
            }
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<name>_<n>`, unique for the lifetime of this context.
    pub fn test_dir(&self, name: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.base_dir.join(format!("{}_{}", name, n))
    }

    /// Remove the base directory if no test left anything behind.
    pub fn cleanup(&self) -> Result<()> {
        let empty = fs::read_dir(&self.base_dir)?.next().is_none();
        if empty {
            fs::remove_dir(&self.base_dir)?;
        }
        Ok(())
    }
}

/// `N` distinct free ports; `portpicker` may hand out the same one twice.
fn pick_ports<const N: usize>() -> Result<[u16; N]> {
    let mut seen = HashSet::new();
    let mut ports = [0u16; N];
    for slot in ports.iter_mut() {
        *slot = loop {
            let port = portpicker::pick_unused_port()
                .ok_or_else(|| HarnessError::Config("no free local port".to_string()))?;
            if seen.insert(port) {
                break port;
            }
        };
    }
    Ok(ports)
}

/// Start a regtest bitcoind in `dir` and mine it to a usable state.
pub async fn start_bitcoind(config: &HarnessConfig, dir: &Path) -> Result<Bitcoind> {
    let [rpc_port, zmq_block, zmq_tx] = pick_ports::<3>()?;
    let mut options = BitcoindOptions::new(dir, rpc_port, zmq_block, zmq_tx);
    options.binary = config.bitcoind_binary();
    options.rpc_user = config.bitcoind.rpc_user.clone();
    options.rpc_password = config.bitcoind.rpc_password.clone();
    options.ready_timeout = config.timeouts.ready();
    options.stop_grace = config.timeouts.stop_grace();

    let chain = Bitcoind::start(options).await?;
    if let Err(e) = chain.prepare().await {
        warn!(error = %e, "bitcoind preparation failed, stopping it");
        if let Err(stop) = chain.stop().await {
            warn!(error = %stop, "Failed to stop bitcoind");
        }
        return Err(e);
    }
    Ok(chain)
}

/// Hands out started nodes for one test and tears them all down afterwards.
pub struct NodeFactory {
    config: HarnessConfig,
    test_name: String,
    dir: PathBuf,
    chain: Arc<Bitcoind>,
    owns_chain: bool,
    next_id: AtomicU32,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl NodeFactory {
    /// Nodes for `test_name`, backed by an already running `chain`.
    pub fn new(ctx: &TestContext, config: HarnessConfig, test_name: &str, chain: Arc<Bitcoind>) -> Self {
        Self::build(ctx.test_dir(test_name), config, test_name, chain, false)
    }

    /// Allocate the test directory and start a dedicated bitcoind inside it.
    pub async fn with_bitcoind(ctx: &TestContext, config: HarnessConfig, test_name: &str) -> Result<Self> {
        let dir = ctx.test_dir(test_name);
        let chain = start_bitcoind(&config, &dir.join("bitcoind")).await?;
        Ok(Self::build(dir, config, test_name, Arc::new(chain), true))
    }

    fn build(dir: PathBuf, config: HarnessConfig, test_name: &str, chain: Arc<Bitcoind>, owns_chain: bool) -> Self {
        Self {
            config,
            test_name: test_name.to_string(),
            dir,
            chain,
            owns_chain,
            next_id: AtomicU32::new(1),
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chain(&self) -> &Arc<Bitcoind> {
        &self.chain
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Every node handed out so far, in creation order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn node_spec(&self, implementation: Implementation) -> Result<NodeSpec> {
        let node_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let [port, rpc_port, rest_port] = pick_ports::<3>()?;
        Ok(NodeSpec {
            implementation,
            node_id,
            dir: self.dir.join(format!("node-{}", node_id)),
            host: LOCALHOST.to_string(),
            port,
            rpc_port,
            rest_port,
            chain: self.chain.endpoint(),
            ready_timeout: self.config.timeouts.ready(),
            rpc_timeout: self.config.timeouts.rpc(),
            stop_grace: self.config.timeouts.stop_grace(),
            wait_offset: self.config.wait_offset,
        })
    }

    /// Launch a node and return once it is ready and, where it has one,
    /// answering RPC.
    pub async fn get_node(&self, implementation: Implementation) -> Result<Arc<Node>> {
        let spec = self.node_spec(implementation)?;
        let node_id = spec.node_id;
        let node = Node::launch(spec, &self.config)?;

        if let Err(e) = self.await_ready(&node).await {
            error!(
                test = %self.test_name,
                node = node_id,
                %implementation,
                error = %e,
                "Node failed to start"
            );
            for line in node.log().tail(FAILURE_DUMP_LINES) {
                error!(node = node_id, "{}", line);
            }
            if let Err(stop) = node.stop().await {
                warn!(node = node_id, error = %stop, "Failed to stop node after start failure");
            }
            return Err(e);
        }

        let node = Arc::new(node);
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&node));
        Ok(node)
    }

    async fn await_ready(&self, node: &Node) -> Result<()> {
        node.wait_ready().await?;
        if node.implementation().has_rpc() {
            let what = format!("{} rpc to answer", node.implementation());
            poll::wait_for(
                &what,
                self.config.timeouts.ready(),
                self.config.timeouts.poll_interval(),
                || async move { Ok::<_, HarnessError>(node.is_alive().await) },
            )
            .await?;
        }
        Ok(())
    }

    /// Stop every node concurrently, then the chain if this factory started
    /// it. Every stop is attempted; the failures are returned.
    pub async fn teardown(&self) -> Vec<HarnessError> {
        let nodes: Vec<Arc<Node>> = std::mem::take(&mut *self.nodes.lock().unwrap_or_else(PoisonError::into_inner));
        let mut set = JoinSet::new();
        for node in nodes {
            set.spawn(async move {
                let node_id = node.core().node_id();
                (node_id, node.stop().await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((node_id, Ok(report))) => {
                    info!(node = node_id, graceful = report.termination.graceful, "Node stopped");
                }
                Ok((node_id, Err(e))) => {
                    warn!(node = node_id, error = %e, "Failed to stop node");
                    failures.push(e);
                }
                Err(e) => {
                    warn!(error = %e, "Stop task failed");
                    failures.push(HarnessError::Io(std::io::Error::other(e)));
                }
            }
        }

        if self.owns_chain {
            if let Err(e) = self.chain.stop().await {
                warn!(error = %e, "Failed to stop bitcoind");
                failures.push(e);
            }
        }
        failures
    }

    /// Tear down, then remove the test directory if the test passed and
    /// nothing asks for it to be kept.
    pub async fn finish(self, passed: bool) -> Vec<HarnessError> {
        let mut failures = self.teardown().await;
        if passed && failures.is_empty() && !self.config.keep_test_dirs {
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failures.push(e.into()),
            }
        } else {
            info!(dir = %self.dir.display(), "Leaving the test directory intact");
        }
        failures
    }
}
