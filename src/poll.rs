//! Scenario-level polling over node and chain state.
//!
//! Predicates return `Result<bool>`: retryable errors (a daemon still warming
//! up, a route not yet known) count as "not yet", anything else aborts the
//! poll.

use crate::chain::Bitcoind;
use crate::error::{HarnessError, Result};
use crate::node::Node;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GENERATE_BLOCKS: u32 = 30;
pub const DEFAULT_CONFIRM_ATTEMPTS: u32 = 10;
const CONFIRM_INTERVAL: Duration = Duration::from_secs(2);

async fn check<Fut>(what: &str, attempt: Fut) -> Result<bool>
where
    Fut: Future<Output = Result<bool>>,
{
    match attempt.await {
        Ok(done) => Ok(done),
        Err(e) if e.is_retryable() => {
            debug!(what, error = %e, "Not ready yet");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Poll `predicate` every `interval` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, interval: Duration, mut predicate: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check(what, predicate()).await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(HarnessError::PollTimeout {
                what: what.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Wait until every node reports `height` as its block height.
pub async fn wait_for_blockheight<'a, I>(nodes: I, height: u64, timeout: Duration) -> Result<()>
where
    I: IntoIterator<Item = &'a Node>,
{
    for node in nodes {
        let what = format!("node {} to reach block {}", node.core().node_id(), height);
        wait_for(&what, timeout, DEFAULT_POLL_INTERVAL, || async move {
            Ok::<_, HarnessError>(node.block_height().await? == height)
        })
        .await?;
    }
    Ok(())
}

/// Wait until every node has caught up with the chain tip.
pub async fn sync_blockheight<'a, I>(chain: &Bitcoind, nodes: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Node>,
{
    let height = chain.block_count().await?;
    info!(height, "Waiting for nodes to sync");
    wait_for_blockheight(nodes, height, DEFAULT_POLL_TIMEOUT).await
}

/// Mine one block at a time until `predicate` holds, for confirmations that
/// may be delayed by an unknown number of blocks.
pub async fn generate_until<F, Fut>(
    chain: &Bitcoind,
    blocks: u32,
    interval: Duration,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for generated in 0..blocks {
        tokio::time::sleep(interval).await;
        if check("generate_until", predicate()).await? {
            debug!(generated, "Condition met");
            return Ok(());
        }
        chain.generate(1).await?;
    }
    tokio::time::sleep(interval).await;
    if check("generate_until", predicate()).await? {
        return Ok(());
    }
    Err(HarnessError::PollTimeout {
        what: format!("condition after generating {} blocks", blocks),
        timeout: interval * (blocks + 1),
    })
}

async fn both_active(a: &Node, a_id: &str, b: &Node, b_id: &str) -> Result<bool> {
    Ok(check("channel", a.channel_is_active(b_id)).await? && check("channel", b.channel_is_active(a_id)).await?)
}

/// Mine until both ends of the `a`–`b` channel report it active, letting each
/// node process every new block before checking again.
pub async fn confirm_channel(chain: &Bitcoind, a: &Node, b: &Node, attempts: u32) -> Result<()> {
    let a_id = a.identity().await?;
    let b_id = b.identity().await?;
    info!(from = %a_id, to = %b_id, "Waiting for channel to confirm");

    for _ in 0..attempts {
        tokio::time::sleep(CONFIRM_INTERVAL).await;
        if both_active(a, &a_id, b, &b_id).await? {
            info!(from = %a_id, to = %b_id, "Channel confirmed");
            return Ok(());
        }
        let hashes = chain.generate(1).await?;
        if let Some(hash) = hashes.first() {
            a.block_sync(hash).await?;
            b.block_sync(hash).await?;
        }
    }

    if both_active(a, &a_id, b, &b_id).await? {
        return Ok(());
    }
    Err(HarnessError::PollTimeout {
        what: format!("channel {} -> {} to become active", a_id, b_id),
        timeout: CONFIRM_INTERVAL * attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn wait_for_returns_once_predicate_holds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = std::time::Instant::now();
        wait_for("third call", Duration::from_secs(5), Duration::from_millis(20), || async move {
            Ok::<_, HarnessError>(counter.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let started = std::time::Instant::now();
        let err = wait_for("never", Duration::from_millis(200), Duration::from_millis(50), || async {
            Ok::<_, HarnessError>(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::PollTimeout { ref what, .. } if what == "never"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn rpc_errors_count_as_not_yet() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        wait_for("warm-up", Duration::from_secs(5), Duration::from_millis(10), || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HarnessError::rpc("getinfo", "connection refused"))
            } else {
                Ok(true)
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_poll() {
        let err = wait_for("dead", Duration::from_secs(5), Duration::from_millis(10), || async {
            Err::<bool, _>(HarnessError::ProcessTerminated {
                prefix: "lnd".into(),
                pattern: "ready".into(),
                recent: Vec::new(),
            })
        })
        .await
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
