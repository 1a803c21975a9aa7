use anyhow::Context;
use ln_interop::{HarnessConfig, HarnessError, Implementation, NodeFactory, TestContext};
use tracing::{info, warn};

/// Log every teardown failure and turn the first into the command's error.
pub(crate) fn check_teardown(failures: Vec<HarnessError>) -> anyhow::Result<()> {
    for failure in &failures {
        warn!(error = %failure, "Teardown failure");
    }
    match failures.into_iter().next() {
        Some(first) => Err(first).context("Teardown did not complete cleanly"),
        None => Ok(()),
    }
}

pub(crate) async fn cmd_node(config: HarnessConfig, implementation: Implementation) -> anyhow::Result<()> {
    let ctx = TestContext::from_config(&config)?;
    let factory = NodeFactory::with_bitcoind(&ctx, config, &format!("node_{}", implementation))
        .await
        .context("Failed to start bitcoind")?;

    let node = match factory.get_node(implementation).await {
        Ok(node) => node,
        Err(e) => {
            check_teardown(factory.finish(false).await)?;
            return Err(e).with_context(|| format!("Failed to start {}", implementation));
        }
    };

    println!("{} running in {}", implementation, node.core().dir().display());
    println!("  p2p      {}:{}", node.host(), node.port());
    println!("  pid      {}", node.core().process().pid());
    if implementation.has_rpc() {
        match node.identity().await {
            Ok(id) => println!("  identity {}", id),
            Err(e) => warn!(error = %e, "Could not fetch identity"),
        }
    }
    println!("  bitcoind 127.0.0.1:{}", factory.chain().rpc_port());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Stopping");

    // Keep the directory for inspection.
    check_teardown(factory.finish(false).await)
}
