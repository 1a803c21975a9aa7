pub mod chain;
pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod factory;
pub mod logging;
pub mod node;
pub mod poll;
pub mod rpc;

pub use chain::Bitcoind;
pub use config::HarnessConfig;
pub use daemon::{LaunchConfig, LogBuffer, ManagedProcess, PatternWaitRequest};
pub use error::{HarnessError, Result};
pub use factory::{NodeFactory, TestContext};
pub use node::{verify_preimage, ChannelEdge, Implementation, LightningRpc, Node, NodeInfo};
