use crate::daemon::DEFAULT_WAIT_OFFSET;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Harness settings, read from TOML and adjusted by environment variables.
///
/// Every field has a default, so an empty file (or none at all) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding the daemon binaries (lightningd, lnd, ptarmd, ...)
    pub bin_dir: PathBuf,
    /// Per-binary overrides; unset entries resolve inside `bin_dir`
    pub binaries: Binaries,
    pub bitcoind: BitcoindSettings,
    pub timeouts: Timeouts,
    /// Backlog, in lines, that pattern waits look back by default
    pub wait_offset: usize,
    /// Keep test directories even when the test passed
    pub keep_test_dirs: bool,
    /// Base directory for runs; a fresh temp dir when unset
    pub test_dir: Option<PathBuf>,
    /// Verbose harness logging
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Binaries {
    pub bitcoind: Option<PathBuf>,
    pub lightningd: Option<PathBuf>,
    pub lnd: Option<PathBuf>,
    pub eclair_jar: Option<PathBuf>,
    pub java: Option<PathBuf>,
    pub ptarmd: Option<PathBuf>,
    pub rust_lightning: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindSettings {
    pub rpc_user: String,
    pub rpc_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ready_secs: u64,
    pub stop_grace_secs: u64,
    pub rpc_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("bin"),
            binaries: Binaries::default(),
            bitcoind: BitcoindSettings::default(),
            timeouts: Timeouts::default(),
            wait_offset: DEFAULT_WAIT_OFFSET,
            keep_test_dirs: false,
            test_dir: None,
            debug: false,
        }
    }
}

impl Default for BitcoindSettings {
    fn default() -> Self {
        Self {
            rpc_user: "rpcuser".to_string(),
            rpc_password: "rpcpass".to_string(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready_secs: 60,
            stop_grace_secs: 3,
            rpc_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HarnessConfig {
    /// First existing candidate file, then environment overrides.
    pub fn load() -> Result<Self> {
        let path = crate::clienv::config_file_candidates()
            .into_iter()
            .find(|p| p.exists());

        let config = match path {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::trace!("No config file found, using defaults");
                Self::default()
            }
        };
        Ok(config.with_env_overrides())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading harness config");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        tracing::debug!(path = %path.display(), bin_dir = %config.bin_dir.display(), "Harness config loaded");
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = crate::clienv::bin_dir() {
            self.bin_dir = dir;
        }
        if let Some(dir) = crate::clienv::test_dir() {
            self.test_dir = Some(dir);
        }
        if let Some(keep) = crate::clienv::keep_dirs() {
            self.keep_test_dirs = keep;
        }
        if crate::clienv::test_debug() {
            self.debug = true;
        }
        self
    }

    fn resolve(&self, explicit: &Option<PathBuf>, default_name: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.bin_dir.join(default_name))
    }

    /// bitcoind is looked up on `PATH` unless configured.
    pub fn bitcoind_binary(&self) -> PathBuf {
        self.binaries
            .bitcoind
            .clone()
            .unwrap_or_else(|| PathBuf::from("bitcoind"))
    }

    pub fn lightningd_binary(&self) -> PathBuf {
        self.resolve(&self.binaries.lightningd, "lightningd")
    }

    pub fn lnd_binary(&self) -> PathBuf {
        self.resolve(&self.binaries.lnd, "lnd")
    }

    pub fn eclair_jar(&self) -> PathBuf {
        self.resolve(&self.binaries.eclair_jar, "eclair.jar")
    }

    pub fn java_binary(&self) -> PathBuf {
        self.binaries
            .java
            .clone()
            .unwrap_or_else(|| PathBuf::from("java"))
    }

    pub fn ptarmd_binary(&self) -> PathBuf {
        self.resolve(&self.binaries.ptarmd, "ptarmd")
    }

    /// Helper tools shipped next to ptarmd (`showdb`, `routing`).
    pub fn ptarmigan_tool(&self, name: &str) -> PathBuf {
        self.ptarmd_binary()
            .parent()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|| self.bin_dir.join(name))
    }

    pub fn rust_lightning_binary(&self) -> PathBuf {
        self.resolve(&self.binaries.rust_lightning, "rust-lightning-bitcoinrpc")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: HarnessConfig = toml::from_str("").unwrap();
        assert_eq!(config.bin_dir, PathBuf::from("bin"));
        assert_eq!(config.wait_offset, 1000);
        assert_eq!(config.timeouts.ready(), Duration::from_secs(60));
        assert_eq!(config.bitcoind.rpc_user, "rpcuser");
        assert!(!config.keep_test_dirs);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: HarnessConfig = toml::from_str(
            r#"
            bin_dir = "/opt/ln/bin"
            keep_test_dirs = true

            [binaries]
            lnd = "/usr/local/bin/lnd"

            [timeouts]
            ready_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.lnd_binary(), PathBuf::from("/usr/local/bin/lnd"));
        assert_eq!(config.lightningd_binary(), PathBuf::from("/opt/ln/bin/lightningd"));
        assert_eq!(config.ptarmigan_tool("showdb"), PathBuf::from("/opt/ln/bin/showdb"));
        assert_eq!(config.bitcoind_binary(), PathBuf::from("bitcoind"));
        assert_eq!(config.timeouts.ready_secs, 120);
        assert_eq!(config.timeouts.stop_grace_secs, 3);
        assert!(config.keep_test_dirs);
    }

    #[test]
    fn save_then_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = HarnessConfig::default();
        config.wait_offset = 250;
        config.binaries.java = Some(PathBuf::from("/usr/lib/jvm/bin/java"));
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load_from(&path).unwrap();
        assert_eq!(loaded.wait_offset, 250);
        assert_eq!(loaded.java_binary(), PathBuf::from("/usr/lib/jvm/bin/java"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "wait_offset = \"lots\"").unwrap();
        let err = HarnessConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
