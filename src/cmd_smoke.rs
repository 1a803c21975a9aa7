use crate::cmd_node::check_teardown;
use ln_interop::poll::{self, DEFAULT_POLL_INTERVAL};
use ln_interop::{HarnessConfig, HarnessError, Implementation, NodeFactory, TestContext};
use std::time::Duration;
use tracing::{error, info};

async fn connect_both_ways(
    factory: &NodeFactory,
    first: Implementation,
    second: Implementation,
    timeout: Duration,
) -> ln_interop::Result<()> {
    let a = factory.get_node(first).await?;
    let b = factory.get_node(second).await?;

    // lnd wants a block from the last two hours before it accepts peers.
    factory.chain().generate(1).await?;

    let a_id = a.identity().await?;
    let b_id = b.identity().await?;
    info!(from = %a_id, to = %b_id, "Connecting");
    a.connect_to(&b).await?;

    let (a, b, a_id, b_id) = (&a, &b, &a_id, &b_id);
    poll::wait_for(&format!("{} to list {}", first, second), timeout, DEFAULT_POLL_INTERVAL, || async move {
        Ok::<_, HarnessError>(a.peers().await?.contains(b_id))
    })
    .await?;
    poll::wait_for(&format!("{} to list {}", second, first), timeout, DEFAULT_POLL_INTERVAL, || async move {
        Ok::<_, HarnessError>(b.peers().await?.contains(a_id))
    })
    .await
}

pub(crate) async fn cmd_smoke(
    config: HarnessConfig,
    first: Implementation,
    second: Implementation,
    timeout: u64,
) -> anyhow::Result<()> {
    let ctx = TestContext::from_config(&config)?;
    let factory = NodeFactory::with_bitcoind(&ctx, config, &format!("smoke_{}_{}", first, second)).await?;

    let outcome = connect_both_ways(&factory, first, second, Duration::from_secs(timeout)).await;
    let passed = outcome.is_ok();
    let dir = factory.dir().to_path_buf();
    let teardown = check_teardown(factory.finish(passed).await);

    match outcome {
        Ok(()) => {
            println!("{} <-> {}: connected", first, second);
            ctx.cleanup()?;
            teardown
        }
        Err(e) => {
            error!(error = %e, dir = %dir.display(), "Smoke test failed");
            for line in e.captured_log() {
                error!("{}", line);
            }
            Err(e.into())
        }
    }
}
