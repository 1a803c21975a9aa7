use crate::error::{HarnessError, Result};
use regex::Regex;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How far back a wait looks by default, so effects of a command issued just
/// before the wait are not missed.
pub const DEFAULT_WAIT_OFFSET: usize = 1000;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Lines attached to a `ProcessTerminated` error.
const DIAGNOSTIC_TAIL: usize = 50;

struct LogState {
    lines: Vec<String>,
    running: bool,
}

/// Append-only capture of one process's stdout.
///
/// A single reader thread appends; any number of threads may block in
/// [`LogBuffer::wait_for_pattern`]. Each waiter keeps its own scan position, so a
/// match seen by one waiter is still visible to every other waiter.
pub struct LogBuffer {
    prefix: String,
    state: Mutex<LogState>,
    appended: Condvar,
}

/// A single pattern wait: what to look for, how far back, and for how long.
#[derive(Debug, Clone)]
pub struct PatternWaitRequest {
    pub pattern: Regex,
    pub offset: usize,
    pub timeout: Duration,
}

impl PatternWaitRequest {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            offset: DEFAULT_WAIT_OFFSET,
            timeout: DEFAULT_WAIT_TIMEOUT,
        })
    }

    /// Look back at most `offset` lines from the current end of the log.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl LogBuffer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(LogState {
                lines: Vec::new(),
                running: true,
            }),
            appended: Condvar::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // A panicking waiter must not take the log down with it.
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line and wake every waiter.
    pub fn push(&self, line: String) {
        self.lock().lines.push(line);
        self.appended.notify_all();
    }

    /// Record that the owning process is gone. Irreversible.
    pub fn mark_stopped(&self) {
        self.lock().running = false;
        self.appended.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the last `n` lines (or all if `n` exceeds stored count).
    pub fn tail(&self, n: usize) -> Vec<String> {
        let state = self.lock();
        let start = state.lines.len().saturating_sub(n);
        state.lines[start..].to_vec()
    }

    /// Lines at or after `index`.
    pub fn lines_since(&self, index: usize) -> Vec<String> {
        let state = self.lock();
        state.lines.get(index..).map(<[String]>::to_vec).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Non-blocking scan of the whole history.
    pub fn contains_pattern(&self, pattern: &Regex) -> bool {
        let found = self.lock().lines.iter().any(|line| pattern.is_match(line));
        debug!(prefix = %self.prefix, pattern = %pattern, found, "Scanned log history");
        found
    }

    pub fn wait(&self, request: &PatternWaitRequest) -> Result<String> {
        self.wait_for_pattern(&request.pattern, request.offset, request.timeout)
    }

    /// Block until a line at or after `len - offset` matches `pattern`.
    pub fn wait_for_pattern(
        &self,
        pattern: &Regex,
        offset: usize,
        timeout: Duration,
    ) -> Result<String> {
        self.wait_for_match(pattern, offset, timeout)
            .map(|(_, line)| line)
    }

    /// Like [`wait_for_pattern`](Self::wait_for_pattern) but also returns the
    /// index of the matching line.
    pub fn wait_for_match(
        &self,
        pattern: &Regex,
        offset: usize,
        timeout: Duration,
    ) -> Result<(usize, String)> {
        debug!(prefix = %self.prefix, pattern = %pattern, offset, ?timeout, "Waiting for pattern");
        let state = self.lock();
        let start = state.lines.len().saturating_sub(offset);
        self.wait_locked(state, pattern, start, timeout)
    }

    /// Block until a line at or after the absolute `index` matches `pattern`.
    ///
    /// Pair with [`len`](Self::len) taken before triggering an event to see
    /// only the lines that event produced.
    pub fn wait_since(&self, pattern: &Regex, index: usize, timeout: Duration) -> Result<(usize, String)> {
        debug!(prefix = %self.prefix, pattern = %pattern, index, ?timeout, "Waiting for pattern");
        let state = self.lock();
        self.wait_locked(state, pattern, index, timeout)
    }

    fn wait_locked(
        &self,
        mut state: MutexGuard<'_, LogState>,
        pattern: &Regex,
        start: usize,
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let deadline = Instant::now() + timeout;
        let initial_len = state.lines.len();
        let mut pos = start;

        loop {
            // Scan position only ever moves forward.
            while pos < state.lines.len() {
                if pattern.is_match(&state.lines[pos]) {
                    debug!(prefix = %self.prefix, pattern = %pattern, index = pos, "Found pattern");
                    return Ok((pos, state.lines[pos].clone()));
                }
                pos += 1;
            }

            if !state.running {
                let start = state.lines.len().saturating_sub(DIAGNOSTIC_TAIL);
                return Err(HarnessError::ProcessTerminated {
                    prefix: self.prefix.clone(),
                    pattern: pattern.to_string(),
                    recent: state.lines[start..].to_vec(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let recent = state.lines[initial_len.min(state.lines.len())..].to_vec();
                if state.lines[..start.min(initial_len)]
                    .iter()
                    .any(|line| pattern.is_match(line))
                {
                    warn!(prefix = %self.prefix, pattern = %pattern, "Pattern was in the log before the wait window");
                }
                return Err(HarnessError::PatternTimeout {
                    prefix: self.prefix.clone(),
                    pattern: pattern.to_string(),
                    timeout,
                    recent,
                });
            }

            let (guard, _) = self
                .appended
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn re(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let buf = LogBuffer::new("proc");
        for i in 0..10 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.tail(3), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(buf.tail(100).len(), 10);
        assert_eq!(buf.lines_since(8), vec!["line 8", "line 9"]);
        assert!(buf.lines_since(42).is_empty());
    }

    #[test]
    fn finds_line_already_in_backlog() {
        let buf = LogBuffer::new("proc");
        buf.push("booting".into());
        buf.push("Server started with public key 02ab".into());
        buf.push("idle".into());

        let line = buf
            .wait_for_pattern(&re("public key"), DEFAULT_WAIT_OFFSET, Duration::from_secs(1))
            .unwrap();
        assert_eq!(line, "Server started with public key 02ab");
    }

    #[test]
    fn offset_limits_how_far_back_the_scan_starts() {
        let buf = LogBuffer::new("proc");
        for i in 0..10 {
            buf.push(format!("line {i}"));
        }

        // Only the last two lines (8 and 9) are candidates.
        let err = buf
            .wait_for_match(&re("line 7"), 2, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, HarnessError::PatternTimeout { .. }));

        let (index, _) = buf
            .wait_for_match(&re("line \\d"), 2, Duration::from_millis(100))
            .unwrap();
        assert!(index >= 8);
    }

    #[test]
    fn zero_offset_only_sees_new_lines() {
        let buf = Arc::new(LogBuffer::new("proc"));
        buf.push("event A".into());

        let writer = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.push("event B".into());
        });

        let (index, line) = buf
            .wait_for_match(&re("event"), 0, Duration::from_secs(2))
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(line, "event B");
        handle.join().unwrap();
    }

    #[test]
    fn wait_returns_promptly_after_append() {
        let buf = Arc::new(LogBuffer::new("proc"));
        let writer = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            writer.push("payment registered".into());
        });

        let started = Instant::now();
        buf.wait_for_pattern(&re("registered"), 0, Duration::from_secs(10))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn timeout_is_honoured_without_overshoot() {
        let buf = LogBuffer::new("proc");
        buf.push("unrelated".into());

        let started = Instant::now();
        let err = buf
            .wait_for_pattern(&re("magic-token-xyz"), 0, Duration::from_secs(2))
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, HarnessError::PatternTimeout { .. }));
        assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2500), "returned late: {elapsed:?}");
    }

    #[test]
    fn timeout_reports_lines_seen_during_wait() {
        let buf = Arc::new(LogBuffer::new("proc"));
        buf.push("before".into());
        let writer = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.push("during".into());
        });

        let err = buf
            .wait_for_pattern(&re("never"), 0, Duration::from_millis(300))
            .unwrap_err();
        handle.join().unwrap();
        assert_eq!(err.captured_log(), ["during".to_string()]);
    }

    #[test]
    fn stopped_process_fails_promptly() {
        let buf = Arc::new(LogBuffer::new("proc"));
        let stopper = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stopper.push("fatal: shutting down".into());
            stopper.mark_stopped();
        });

        let started = Instant::now();
        let err = buf
            .wait_for_pattern(&re("ready"), 0, Duration::from_secs(30))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            HarnessError::ProcessTerminated { recent, .. } => {
                assert_eq!(recent, vec!["fatal: shutting down".to_string()]);
            }
            other => panic!("expected ProcessTerminated, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn match_before_death_still_wins() {
        let buf = LogBuffer::new("proc");
        buf.push("Done loading".into());
        buf.mark_stopped();

        let line = buf
            .wait_for_pattern(&re("Done loading"), DEFAULT_WAIT_OFFSET, Duration::from_secs(1))
            .unwrap();
        assert_eq!(line, "Done loading");
        assert!(!buf.is_running());
    }

    #[test]
    fn concurrent_waiters_each_see_their_match() {
        let buf = Arc::new(LogBuffer::new("proc"));

        let waiters: Vec<_> = ["alpha", "beta", "alpha|beta"]
            .into_iter()
            .map(|pattern| {
                let buf = Arc::clone(&buf);
                let pattern = re(pattern);
                thread::spawn(move || {
                    buf.wait_for_pattern(&pattern, DEFAULT_WAIT_OFFSET, Duration::from_secs(5))
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        buf.push("alpha".into());
        buf.push("beta".into());

        let results: Vec<String> = waiters
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(results, vec!["alpha", "beta", "alpha"]);
    }

    #[test]
    fn wait_since_ignores_lines_before_index() {
        let buf = Arc::new(LogBuffer::new("proc"));
        buf.push("preimage: aaaa".into());
        let mark = buf.len();

        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                buf.push("unrelated".into());
                buf.push("preimage: bbbb".into());
            })
        };
        let (index, line) = buf
            .wait_since(&re("preimage:"), mark, Duration::from_secs(5))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(index, 2);
        assert_eq!(line, "preimage: bbbb");
    }

    #[test]
    fn contains_pattern_scans_full_history() {
        let buf = LogBuffer::new("proc");
        for i in 0..2000 {
            buf.push(format!("line {i}"));
        }
        assert!(buf.contains_pattern(&re("^line 0$")));
        assert!(!buf.contains_pattern(&re("missing")));
    }

    #[test]
    fn request_builder_defaults() {
        let request = PatternWaitRequest::new("RPC server listening on").unwrap();
        assert_eq!(request.offset, DEFAULT_WAIT_OFFSET);
        assert_eq!(request.timeout, DEFAULT_WAIT_TIMEOUT);

        let request = request.offset(100).timeout(Duration::from_secs(5));
        assert_eq!(request.offset, 100);
        assert_eq!(request.timeout, Duration::from_secs(5));

        assert!(PatternWaitRequest::new("(unclosed").is_err());
    }
}
