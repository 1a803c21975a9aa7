//! Daemon supervision - the processes every test node is built on
//!
//! Handles:
//! - Launching a daemon with its argument vector, working directory and environment
//! - Tailing stdout into a shared, append-only log buffer
//! - Blocking pattern waits against that buffer (readiness, async events)
//! - Tree-wide shutdown with a grace period before the forced kill
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                ManagedProcess                 │
//! ├───────────────────────────────────────────────┤
//! │ LaunchConfig │ reader thread │ ProcessTree    │
//! │  (argv, env) │  (stdout)     │  (terminate)   │
//! ├───────────────────────────────────────────────┤
//! │     LogBuffer (Mutex + Condvar, waiters)      │
//! └───────────────────────────────────────────────┘
//! ```

pub mod launch;
pub mod log_buffer;
pub mod process;
pub mod terminate;

pub use launch::{LaunchConfig, DEFAULT_STOP_GRACE};
pub use log_buffer::{LogBuffer, PatternWaitRequest, DEFAULT_WAIT_OFFSET, DEFAULT_WAIT_TIMEOUT};
pub use process::{ManagedProcess, StopReport};
pub use terminate::{ProcessTree, Termination};
