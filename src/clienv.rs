use std::path::PathBuf;

/// Environment variables the harness reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    LnInteropConfig,
    LnInteropBinDir,
    LnInteropTestDir,
    LnInteropKeepDirs,
    TestDebug,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LnInteropConfig => "LN_INTEROP_CONFIG",
            Self::LnInteropBinDir => "LN_INTEROP_BIN_DIR",
            Self::LnInteropTestDir => "LN_INTEROP_TEST_DIR",
            Self::LnInteropKeepDirs => "LN_INTEROP_KEEP_DIRS",
            Self::TestDebug => "TEST_DEBUG",
        }
    }
}

const APP_SUBDIR: &str = "ln-interop";
const LOCAL_CONFIG_FILE: &str = "ln-interop.toml";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// "1", "true", "yes" and "on", case-insensitive.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Explicit config file ($LN_INTEROP_CONFIG)
pub fn config_file_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::LnInteropConfig.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "LN_INTEROP_CONFIG env var");
    val
}

/// Config file candidates, highest priority first.
pub fn config_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = config_file_override() {
        candidates.push(path);
    }
    candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join(APP_SUBDIR).join("config.toml"));
    }
    candidates
}

/// Daemon binary directory override ($LN_INTEROP_BIN_DIR)
pub fn bin_dir() -> Option<PathBuf> {
    let val = env_opt(EnvVar::LnInteropBinDir.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "LN_INTEROP_BIN_DIR env var");
    val
}

/// Base directory for test runs ($LN_INTEROP_TEST_DIR)
pub fn test_dir() -> Option<PathBuf> {
    let val = env_opt(EnvVar::LnInteropTestDir.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "LN_INTEROP_TEST_DIR env var");
    val
}

/// Keep test directories even for passing tests ($LN_INTEROP_KEEP_DIRS)
pub fn keep_dirs() -> Option<bool> {
    let val = env_opt(EnvVar::LnInteropKeepDirs.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "LN_INTEROP_KEEP_DIRS env var");
    val
}

/// Verbose harness logging ($TEST_DEBUG=1)
pub fn test_debug() -> bool {
    let enabled = env_opt(EnvVar::TestDebug.as_str()).is_some_and(|v| is_truthy(&v));
    tracing::trace!(enabled, "TEST_DEBUG env var");
    enabled
}
