use super::launch::LaunchConfig;
use super::log_buffer::{LogBuffer, PatternWaitRequest, DEFAULT_WAIT_OFFSET};
use super::terminate::{terminate_tree, ProcessTree, Termination};
use crate::error::{HarnessError, Result};
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const STDERR_FILE: &str = "stderr.log";
const WATCH_INTERVAL: Duration = Duration::from_millis(100);
/// Time the reader gets to drain the pipe after the root exits.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

type SharedChild = Arc<Mutex<Option<Child>>>;

/// One supervised OS process whose stdout is captured line by line.
///
/// Instances are single-use: once stopped (or once the process exits on its
/// own) the instance never runs again; relaunching means spawning a new one
/// from the same [`LaunchConfig`].
pub struct ManagedProcess {
    config: LaunchConfig,
    pid: u32,
    started_at: Instant,
    log: Arc<LogBuffer>,
    child: SharedChild,
    reader: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// What happened during [`ManagedProcess::stop`].
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub termination: Termination,
    /// Persisted copy of the captured output, if one was written
    pub log_file: Option<PathBuf>,
}

impl ManagedProcess {
    /// Launch the process and start tailing its stdout.
    ///
    /// Returns as soon as the process exists; readiness is a separate concern
    /// (see [`wait_ready`](Self::wait_ready)).
    pub fn spawn(config: LaunchConfig) -> Result<Self> {
        fs::create_dir_all(&config.workdir)?;
        let stderr = File::create(config.workdir.join(STDERR_FILE))?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr));

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(prefix = %config.prefix, argv = ?config.argv(), "Starting process");
        let mut child = cmd.spawn().map_err(|source| {
            error!(prefix = %config.prefix, "Failed to launch: {}", source);
            HarnessError::Spawn {
                program: config.program.display().to_string(),
                source,
            }
        })?;

        let pid = child.id();
        info!(prefix = %config.prefix, pid, "Started process");

        let log = Arc::new(LogBuffer::new(config.prefix.clone()));
        let reader = match child.stdout.take() {
            Some(stdout) => Some(spawn_reader(&config.prefix, stdout, Arc::clone(&log))?),
            None => {
                log.mark_stopped();
                None
            }
        };

        let child = Arc::new(Mutex::new(Some(child)));
        let watcher = spawn_watcher(&config.prefix, Arc::clone(&child), Arc::clone(&log))?;

        Ok(Self {
            config,
            pid,
            started_at: Instant::now(),
            log,
            child,
            reader: Mutex::new(reader),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn log(&self) -> &Arc<LogBuffer> {
        &self.log
    }

    /// False once the root process exited, stdout closed or `stop` ran.
    pub fn is_running(&self) -> bool {
        self.log.is_running()
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        lock_child(&self.child)
    }

    /// Move everything a shutdown needs out of `self`; `None` once stopped.
    fn take_shutdown(&self) -> Option<Shutdown> {
        let child = self.child().take()?;
        Some(Shutdown {
            prefix: self.config.prefix.clone(),
            pid: self.pid,
            grace: self.config.stop_grace,
            child,
            reader: self.reader.lock().unwrap_or_else(PoisonError::into_inner).take(),
            watcher: self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take(),
            log: Arc::clone(&self.log),
        })
    }

    /// Wait for every ready pattern of the launch config, in order, each with
    /// the full `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        for pattern in &self.config.ready_patterns {
            self.wait_for_log(pattern, DEFAULT_WAIT_OFFSET, timeout)?;
        }
        info!(prefix = %self.config.prefix, pid = self.pid, "Process is ready");
        Ok(())
    }

    /// Block until `pattern` shows up at or after `len - offset`.
    pub fn wait_for_log(&self, pattern: &str, offset: usize, timeout: Duration) -> Result<String> {
        let pattern = Regex::new(pattern)?;
        self.log.wait_for_pattern(&pattern, offset, timeout)
    }

    /// Non-blocking check of the full captured history.
    pub fn is_in_log(&self, pattern: &str) -> Result<bool> {
        let pattern = Regex::new(pattern)?;
        Ok(self.log.contains_pattern(&pattern))
    }

    /// Async wrapper around a pattern wait; runs on the blocking pool.
    pub async fn wait_for_log_async(&self, request: PatternWaitRequest) -> Result<String> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.wait(&request))
            .await
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?
    }

    /// Terminate the process and all of its descendants.
    ///
    /// Idempotent: a second call finds nothing to do and returns an empty report.
    pub fn stop(&self) -> Result<StopReport> {
        let Some(shutdown) = self.take_shutdown() else {
            return Ok(StopReport::default());
        };
        let termination = shutdown.run();

        let log_file = match &self.config.output_dir {
            Some(dir) => Some(self.persist_log(dir)?),
            None => None,
        };

        debug!(prefix = %self.config.prefix, "Process stopped");
        Ok(StopReport {
            termination,
            log_file,
        })
    }

    /// Run [`stop`](Self::stop) on the blocking pool.
    pub async fn stop_async(self: &Arc<Self>) -> Result<StopReport> {
        let process = Arc::clone(self);
        tokio::task::spawn_blocking(move || process.stop())
            .await
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?
    }

    fn persist_log(&self, dir: &std::path::Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let path = dir.join(format!("{}-{}.log", sanitize(&self.config.prefix), stamp));
        let mut file = File::create(&path)?;
        for line in self.log.snapshot() {
            writeln!(file, "{line}")?;
        }
        info!(prefix = %self.config.prefix, path = %path.display(), "Persisted process log");
        Ok(path)
    }
}

/// Everything needed to take a process tree down, detached from the
/// [`ManagedProcess`] so it can run on another thread.
struct Shutdown {
    prefix: String,
    pid: u32,
    grace: Duration,
    child: Child,
    reader: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    log: Arc<LogBuffer>,
}

impl Shutdown {
    fn run(mut self) -> Termination {
        info!(prefix = %self.prefix, pid = self.pid, "Stopping process");
        let tree = ProcessTree::capture(self.pid);
        let child = &mut self.child;
        let termination = terminate_tree(&tree, self.grace, || matches!(child.try_wait(), Ok(Some(_))));
        if !termination.graceful {
            warn!(prefix = %self.prefix, killed = ?termination.killed, "Process needed a forced kill");
        }

        // Reader exits once every writer of the pipe is gone.
        for (name, handle) in [("reader", self.reader.take()), ("watcher", self.watcher.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(prefix = %self.prefix, thread = name, "Log thread panicked");
                }
            }
        }
        self.log.mark_stopped();
        termination
    }
}

/// Dropping a running process kills its tree. Inside a tokio runtime the
/// shutdown (up to twice the stop grace) runs on the blocking pool instead of
/// the worker thread; the runtime must stay alive long enough for it to
/// finish. Call [`ManagedProcess::stop`] to wait for the outcome.
impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let Some(shutdown) = self.take_shutdown() else {
            return;
        };
        warn!(prefix = %self.config.prefix, pid = self.pid, "Process dropped without stop, terminating");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || shutdown.run());
            }
            Err(_) => {
                shutdown.run();
            }
        }
    }
}

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background thread that marks the log stopped as soon as the root process
/// exits, even while forked children keep the stdout pipe open.
fn spawn_watcher(prefix: &str, child: SharedChild, log: Arc<LogBuffer>) -> Result<JoinHandle<()>> {
    let prefix = prefix.to_string();
    let handle = thread::Builder::new()
        .name(format!("watch-{prefix}"))
        .spawn(move || loop {
            if !log.is_running() {
                break;
            }
            let status = match lock_child(&child).as_mut() {
                // Taken by a shutdown, which marks the log itself.
                None => break,
                Some(child) => match child.try_wait() {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(prefix = %prefix, "Failed to poll process status: {}", e);
                        break;
                    }
                },
            };
            if let Some(status) = status {
                info!(prefix = %prefix, %status, "Process exited");
                thread::sleep(EXIT_DRAIN);
                log.mark_stopped();
                break;
            }
            thread::sleep(WATCH_INTERVAL);
        })?;
    Ok(handle)
}

/// Background thread that appends each stdout line to the buffer, in order,
/// until the stream closes.
fn spawn_reader(prefix: &str, stdout: ChildStdout, log: Arc<LogBuffer>) -> Result<JoinHandle<()>> {
    let prefix = prefix.to_string();
    let handle = thread::Builder::new()
        .name(format!("tail-{prefix}"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        trace!(target: "daemon", prefix = %prefix, "{}", line);
                        log.push(line);
                    }
                    Err(e) => {
                        warn!(prefix = %prefix, "Error reading process output: {}", e);
                        break;
                    }
                }
            }
            debug!(prefix = %prefix, "Output stream closed");
            log.mark_stopped();
        })?;
    Ok(handle)
}

fn sanitize(prefix: &str) -> String {
    prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
