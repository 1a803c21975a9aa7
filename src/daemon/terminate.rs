//! Process-tree termination.
//!
//! Some daemons fork helpers (or run inside a runtime that forks workers) that
//! outlive the parent unless signalled individually. Shutdown therefore works
//! on the whole tree: descendants are discovered by walking the OS process
//! table, the process group is signalled as well, and anything still alive
//! after the grace period is killed.

use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite request to exit (SIGTERM on Unix)
    Terminate,
    /// Forced kill (SIGKILL on Unix)
    Kill,
}

/// A root process plus every descendant found when the tree was captured.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    root: u32,
    members: Vec<u32>,
}

impl ProcessTree {
    pub fn capture(root: u32) -> Self {
        let mut members = vec![root];
        members.extend(descendants(root));
        debug!(root, members = ?members, "Captured process tree");
        Self { root, members }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Root first, then descendants in discovery order.
    pub fn pids(&self) -> &[u32] {
        &self.members
    }

    /// Signal the root's process group and every captured member.
    pub fn signal(&self, signal: Signal) {
        signal_group(self.root, signal);
        for &pid in &self.members {
            send_signal(pid, signal);
        }
    }

    /// Members other than the root that are still alive.
    pub fn alive_descendants(&self) -> Vec<u32> {
        self.members[1..]
            .iter()
            .copied()
            .filter(|&pid| is_alive(pid))
            .collect()
    }
}

/// Outcome of a tree shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Termination {
    /// Everything exited within the grace period
    pub graceful: bool,
    /// Pids that had to be killed
    pub killed: Vec<u32>,
}

/// Terminate `tree`, escalating to a kill after `grace`.
///
/// `reap_root` must return true once the root has exited; it is the caller's
/// job to reap its own child so it does not linger as a zombie.
pub fn terminate_tree(
    tree: &ProcessTree,
    grace: Duration,
    mut reap_root: impl FnMut() -> bool,
) -> Termination {
    tree.signal(Signal::Terminate);

    let mut survivors = wait_for_exit(tree, grace, &mut reap_root);
    if survivors.is_empty() {
        return Termination {
            graceful: true,
            killed: Vec::new(),
        };
    }

    warn!(root = tree.root(), survivors = ?survivors, "Processes outlived grace period, killing");
    signal_group(tree.root(), Signal::Kill);
    for &pid in &survivors {
        send_signal(pid, Signal::Kill);
    }

    let stubborn = wait_for_exit(tree, grace, &mut reap_root);
    if !stubborn.is_empty() {
        warn!(root = tree.root(), stubborn = ?stubborn, "Processes still alive after kill");
    }
    survivors.sort_unstable();
    Termination {
        graceful: false,
        killed: survivors,
    }
}

fn wait_for_exit(
    tree: &ProcessTree,
    limit: Duration,
    reap_root: &mut impl FnMut() -> bool,
) -> Vec<u32> {
    let deadline = Instant::now() + limit;
    loop {
        let mut alive = tree.alive_descendants();
        if !reap_root() {
            alive.insert(0, tree.root());
        }
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// All transitive children of `root` currently in the process table.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut found: Vec<u32> = Vec::new();
    let mut frontier = vec![Pid::from_u32(root)];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !found.contains(&pid.as_u32()) {
                found.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    found
}

/// True if `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

#[cfg(unix)]
fn raw_signal(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    // ESRCH just means it is already gone.
    unsafe {
        libc::kill(pid as libc::pid_t, raw_signal(signal));
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) {
    unsafe {
        libc::killpg(pgid as libc::pid_t, raw_signal(signal));
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) {
    // No polite signal on this platform; both phases kill.
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if system.refresh_process(pid) {
        if let Some(process) = system.process(pid) {
            process.kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn finds_grandchildren() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let root = child.id();

        let mut found = Vec::new();
        for _ in 0..40 {
            found = descendants(root);
            if found.len() >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(found.len() >= 2, "found {found:?}");

        let tree = ProcessTree::capture(root);
        let outcome = terminate_tree(&tree, Duration::from_secs(2), || {
            matches!(child.try_wait(), Ok(Some(_)))
        });
        assert!(outcome.graceful);
        assert!(outcome.killed.is_empty());
        assert!(tree.alive_descendants().is_empty());
    }

    #[test]
    fn escalates_when_term_is_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let root = child.id();
        thread::sleep(Duration::from_millis(200));

        let tree = ProcessTree::capture(root);
        let outcome = terminate_tree(&tree, Duration::from_millis(500), || {
            matches!(child.try_wait(), Ok(Some(_)))
        });

        assert!(!outcome.graceful);
        assert!(outcome.killed.contains(&root));
        assert!(!is_alive(root));
    }

    #[test]
    fn dead_pid_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }
}
