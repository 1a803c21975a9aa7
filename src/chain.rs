//! Regtest bitcoind: the funding source and block producer for every scenario.

use crate::daemon::{LaunchConfig, ManagedProcess, StopReport, DEFAULT_STOP_GRACE};
use crate::error::{HarnessError, Result};
use crate::rpc::{HttpJsonRpc, JsonRpc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONF_NAME: &str = "bitcoin.conf";
const WALLET_NAME: &str = "ln-interop";
const READY_PATTERN: &str = "Done loading";

/// Blocks needed before segwit is active on regtest.
pub const SEGWIT_HEIGHT: u64 = 120;

const SATS_PER_BTC: f64 = 100_000_000.0;

pub fn sat_to_btc(sat: u64) -> f64 {
    sat as f64 / SATS_PER_BTC
}

pub fn btc_to_sat(btc: f64) -> u64 {
    (btc * SATS_PER_BTC).round() as u64
}

#[derive(Debug, Clone)]
pub struct BitcoindOptions {
    pub binary: PathBuf,
    pub dir: PathBuf,
    pub rpc_port: u16,
    pub zmq_block_port: u16,
    pub zmq_tx_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
}

impl BitcoindOptions {
    pub fn new(dir: impl Into<PathBuf>, rpc_port: u16, zmq_block_port: u16, zmq_tx_port: u16) -> Self {
        Self {
            binary: PathBuf::from("bitcoind"),
            dir: dir.into(),
            rpc_port,
            zmq_block_port,
            zmq_tx_port,
            rpc_user: "rpcuser".to_string(),
            rpc_password: "rpcpass".to_string(),
            ready_timeout: Duration::from_secs(10),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Contents of `bitcoin.conf`.
    pub fn render_config(&self) -> String {
        let mut conf = String::new();
        let _ = writeln!(conf, "rpcuser={}", self.rpc_user);
        let _ = writeln!(conf, "rpcpassword={}", self.rpc_password);
        conf.push_str("printtoconsole=1\nserver=1\nregtest=1\ntxindex=1\nlisten=0\nfallbackfee=0.0002\n");
        let _ = writeln!(conf, "zmqpubrawblock=tcp://127.0.0.1:{}", self.zmq_block_port);
        let _ = writeln!(conf, "zmqpubrawtx=tcp://127.0.0.1:{}", self.zmq_tx_port);
        conf.push_str("[regtest]\n");
        let _ = writeln!(conf, "rpcport={}", self.rpc_port);
        conf
    }

    fn launch_config(&self) -> LaunchConfig {
        let conf = self.dir.join(CONF_NAME);
        LaunchConfig::new(&self.binary, &self.dir)
            .args([
                format!("-datadir={}", self.dir.display()),
                format!("-conf={}", conf.display()),
                "-regtest".to_string(),
                "-logtimestamps".to_string(),
            ])
            .prefix("bitcoind")
            .ready_pattern(READY_PATTERN)
            .output_dir(&self.dir)
            .stop_grace(self.stop_grace)
    }
}

/// What a lightning daemon needs to reach the chain backend.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub dir: PathBuf,
    pub rpc_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    pub zmq_block: String,
    pub zmq_tx: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Unspent {
    pub txid: String,
    pub vout: u32,
    /// BTC
    pub amount: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub confirmations: u64,
}

/// A running regtest bitcoind plus its RPC client.
pub struct Bitcoind {
    options: BitcoindOptions,
    process: Arc<ManagedProcess>,
    rpc: HttpJsonRpc,
}

impl Bitcoind {
    /// Write the config, launch, and wait for `Done loading`.
    pub async fn start(options: BitcoindOptions) -> Result<Self> {
        fs::create_dir_all(options.dir.join("regtest"))?;
        let conf = options.render_config();
        fs::write(options.dir.join(CONF_NAME), &conf)?;
        fs::write(options.dir.join("regtest").join(CONF_NAME), &conf)?;

        let process = Arc::new(ManagedProcess::spawn(options.launch_config())?);
        let ready_timeout = options.ready_timeout;
        let waiter = Arc::clone(&process);
        tokio::task::spawn_blocking(move || waiter.wait_ready(ready_timeout))
            .await
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))??;

        let rpc = HttpJsonRpc::new(
            format!("http://127.0.0.1:{}/", options.rpc_port),
            &options.rpc_user,
            &options.rpc_password,
        )?;
        info!(rpc_port = options.rpc_port, dir = %options.dir.display(), "bitcoind started");

        Ok(Self {
            options,
            process,
            rpc,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    pub fn rpc_port(&self) -> u16 {
        self.options.rpc_port
    }

    pub fn rpc_user(&self) -> &str {
        &self.options.rpc_user
    }

    pub fn rpc_password(&self) -> &str {
        &self.options.rpc_password
    }

    pub fn zmq_block_endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.options.zmq_block_port)
    }

    pub fn zmq_tx_endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.options.zmq_tx_port)
    }

    pub fn endpoint(&self) -> ChainEndpoint {
        ChainEndpoint {
            dir: self.options.dir.clone(),
            rpc_port: self.options.rpc_port,
            rpc_user: self.options.rpc_user.clone(),
            rpc_password: self.options.rpc_password.clone(),
            zmq_block: self.zmq_block_endpoint(),
            zmq_tx: self.zmq_tx_endpoint(),
        }
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    pub fn rpc(&self) -> &HttpJsonRpc {
        &self.rpc
    }

    pub async fn block_count(&self) -> Result<u64> {
        let info = self.rpc.call("getblockchaininfo", json!([])).await?;
        info.get("blocks")
            .and_then(Value::as_u64)
            .ok_or_else(|| HarnessError::rpc("getblockchaininfo", "missing 'blocks'"))
    }

    pub async fn best_block_hash(&self) -> Result<String> {
        self.rpc.call_as("getbestblockhash", json!([])).await
    }

    /// Fresh wallet address; `address_type` e.g. `"p2sh-segwit"` or `"bech32"`.
    pub async fn new_address(&self, address_type: Option<&str>) -> Result<String> {
        let params = match address_type {
            Some(kind) => json!(["", kind]),
            None => json!([]),
        };
        self.rpc.call_as("getnewaddress", params).await
    }

    /// Mine `blocks` to a wallet address; returns the block hashes.
    pub async fn generate(&self, blocks: u64) -> Result<Vec<String>> {
        let address = self.new_address(None).await?;
        let hashes: Vec<String> = self
            .rpc
            .call_as("generatetoaddress", json!([blocks, address]))
            .await?;
        debug!(blocks, tip = ?hashes.last(), "Generated blocks");
        Ok(hashes)
    }

    pub async fn send_to_address(&self, address: &str, sat: u64) -> Result<String> {
        let txid: String = self
            .rpc
            .call_as("sendtoaddress", json!([address, sat_to_btc(sat)]))
            .await?;
        info!(address, sat, %txid, "Sent funds");
        Ok(txid)
    }

    /// Unspent outputs paying `address`, including unconfirmed ones.
    pub async fn list_unspent(&self, address: &str) -> Result<Vec<Unspent>> {
        self.rpc
            .call_as("listunspent", json!([0, 9_999_999, [address]]))
            .await
    }

    /// Exclude an output from the wallet's coin selection.
    pub async fn lock_unspent(&self, txid: &str, vout: u32) -> Result<()> {
        let locked: bool = self
            .rpc
            .call_as("lockunspent", json!([false, [{"txid": txid, "vout": vout}]]))
            .await?;
        if !locked {
            return Err(HarnessError::rpc("lockunspent", format!("could not lock {}:{}", txid, vout)));
        }
        Ok(())
    }

    pub async fn confirmations(&self, txid: &str) -> Result<u64> {
        let tx = self.rpc.call("gettransaction", json!([txid])).await?;
        Ok(tx.get("confirmations").and_then(Value::as_i64).unwrap_or(0).max(0) as u64)
    }

    /// Wallet balance in satoshi.
    pub async fn balance(&self) -> Result<u64> {
        let info = self.rpc.call("getwalletinfo", json!([])).await?;
        let btc = info
            .get("balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| HarnessError::rpc("getwalletinfo", "missing 'balance'"))?;
        Ok(btc_to_sat(btc))
    }

    /// Recent bitcoind releases start without a wallet.
    pub async fn ensure_wallet(&self) -> Result<()> {
        match self.rpc.call("getwalletinfo", json!([])).await {
            Ok(_) => Ok(()),
            Err(HarnessError::Rpc { message, .. }) if message.contains("No wallet is loaded") => {
                info!(wallet = WALLET_NAME, "Creating bitcoind wallet");
                match self.rpc.call("createwallet", json!([WALLET_NAME])).await {
                    Ok(_) => Ok(()),
                    Err(HarnessError::Rpc { message, .. }) if message.contains("already exists") => {
                        self.rpc.call("loadwallet", json!([WALLET_NAME])).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Mine until segwit is active and the wallet has spendable coins.
    pub async fn prepare(&self) -> Result<()> {
        self.ensure_wallet().await?;
        let height = self.block_count().await?;
        if height < SEGWIT_HEIGHT {
            debug!(height, "SegWit not active, generating some more blocks");
            self.generate(SEGWIT_HEIGHT - height).await?;
        } else if self.balance().await? < btc_to_sat(1.0) {
            debug!("Insufficient balance, generating 1 block");
            self.generate(1).await?;
        }
        Ok(())
    }

    /// Ask bitcoind to shut down, then make sure the process tree is gone.
    pub async fn stop(&self) -> Result<StopReport> {
        if let Err(e) = self.rpc.call("stop", json!([])).await {
            warn!("bitcoind stop rpc failed, terminating: {}", e);
        }
        self.process.stop_async().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_regtest_section_with_rpcport() {
        let options = BitcoindOptions::new("/tmp/btc", 18500, 29000, 29001);
        let conf = options.render_config();
        let (global, regtest) = conf.split_once("[regtest]\n").unwrap();

        assert!(global.contains("rpcuser=rpcuser\n"));
        assert!(global.contains("rpcpassword=rpcpass\n"));
        assert!(global.contains("printtoconsole=1\n"));
        assert!(global.contains("zmqpubrawblock=tcp://127.0.0.1:29000\n"));
        assert!(global.contains("zmqpubrawtx=tcp://127.0.0.1:29001\n"));
        assert_eq!(regtest, "rpcport=18500\n");
    }

    #[test]
    fn launch_config_waits_for_done_loading() {
        let options = BitcoindOptions::new("/tmp/btc", 18500, 29000, 29001);
        let launch = options.launch_config();
        assert_eq!(launch.prefix, "bitcoind");
        assert_eq!(launch.ready_patterns, vec![READY_PATTERN]);
        assert!(launch.args.contains(&"-datadir=/tmp/btc".to_string()));
        assert!(launch.args.contains(&"-regtest".to_string()));
    }

    #[test]
    fn amount_conversion() {
        assert_eq!(sat_to_btc(2_000_000), 0.02);
        assert_eq!(btc_to_sat(0.02), 2_000_000);
        assert_eq!(btc_to_sat(50.0), 5_000_000_000);
        assert_eq!(btc_to_sat(sat_to_btc(123_456_789)), 123_456_789);
    }

    #[test]
    fn unspent_parses_listunspent_entry() {
        let entry = json!({
            "txid": "ab".repeat(32),
            "vout": 1,
            "address": "2N8hwP1WmJrFF5QWABn38y63uYLhnJYJYTF",
            "amount": 0.02,
            "confirmations": 0,
            "spendable": true
        });
        let unspent: Unspent = serde_json::from_value(entry).unwrap();
        assert_eq!(unspent.vout, 1);
        assert_eq!(btc_to_sat(unspent.amount), 2_000_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = BitcoindOptions::new(dir.path(), 1, 2, 3);
        options.binary = PathBuf::from("/nonexistent/bitcoind");
        match Bitcoind::start(options).await {
            Err(HarnessError::Spawn { .. }) => {}
            Err(other) => panic!("expected Spawn, got {other:?}"),
            Ok(_) => panic!("bitcoind unexpectedly started"),
        }
        assert!(dir.path().join(CONF_NAME).exists());
    }
}
