use std::path::PathBuf;
use std::time::Duration;

/// Default grace period between the terminate signal and the kill signal.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Everything needed to (re)launch one daemon process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Executable to run
    pub program: PathBuf,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment variables added on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Working directory; also receives stderr and persisted logs
    pub workdir: PathBuf,
    /// Log patterns that must appear, in order, before the daemon counts as ready
    pub ready_patterns: Vec<String>,
    /// Name used in log output and error messages
    pub prefix: String,
    /// Where captured stdout is written on stop, if anywhere
    pub output_dir: Option<PathBuf>,
    /// Grace period before escalating to a forced kill
    pub stop_grace: Duration,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let prefix = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "proc".to_string());
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            workdir: workdir.into(),
            ready_patterns: Vec::new(),
            prefix,
            output_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add a readiness pattern; patterns are awaited in insertion order
    pub fn ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_patterns.push(pattern.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Persist captured output into `dir` when the process is stopped
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}
