use clap::{Parser, Subcommand};
use ln_interop::Implementation;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ln-interop")]
#[command(version)]
#[command(about = "Interoperability harness for lightning implementations", long_about = None)]
pub(crate) struct Cli {
    /// Config file to use instead of the default lookup. Can also be set via LN_INTEROP_CONFIG.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose harness logging (same as TEST_DEBUG=1)
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List the supported implementations and the binaries they resolve to
    Impls,

    /// Start bitcoind and one node, keep them running until Ctrl+C
    Node {
        /// Implementation to start (c-lightning, lnd, eclair, ptarmigan, rust-lightning)
        implementation: Implementation,
    },

    /// Start two nodes, connect them and check that each lists the other as a peer
    Smoke {
        /// Implementation of the connecting node
        first: Implementation,

        /// Implementation of the node being connected to
        second: Implementation,

        /// Seconds to wait for the peers to show up
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}
