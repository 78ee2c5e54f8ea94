//! Ping watchdog
//!
//! The cluster pings each connected device on an interval; silence means the
//! connection is dead even when the socket has not errored. The watchdog owns
//! a restartable timer and a miss counter: every server ping rearms the timer
//! and zeroes the counter, every expiry counts a miss and invokes the user
//! hook. Once the counter reaches the configured tolerance the watchdog task
//! exits. It never tears the client down itself; the hook is the policy
//! point, and the usual policy is to close the client and reconnect at a
//! higher layer.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PingConfig;

/// Called when we run into situations where we're not getting any more
/// pings. The implementation needs to be provided by the user of the agent.
pub type HandlePingMiss =
    Box<dyn Fn() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Watch the `pinged` channel, counting misses against the tolerance.
///
/// Runs until cancelled or until `max_ping_miss` consecutive misses have
/// been observed. `config` is expected to be clamped already.
pub(crate) async fn watch_pings(
    mut pinged: mpsc::Receiver<Vec<u8>>,
    config: PingConfig,
    handle_ping_miss: HandlePingMiss,
    cancel: CancellationToken,
) {
    info!("watching socket for pings");
    let mut misses = 0u32;
    let mut ping_source_gone = false;
    let timer = tokio::time::sleep(config.ping_wait);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stopped waiting for pings");
                return;
            }
            received = pinged.recv(), if !ping_source_gone => {
                if received.is_none() {
                    // The ping channel only closes when the reader is gone;
                    // keep counting misses off the timer alone.
                    debug!("ping channel closed");
                    ping_source_gone = true;
                    continue;
                }
                debug!("received a ping, resetting ping timer");
                misses = 0;
                timer.as_mut().reset(tokio::time::Instant::now() + config.ping_wait);
            }
            _ = timer.as_mut() => {
                misses += 1;
                error!(misses, "ping miss, calling handler");
                if let Err(e) = handle_ping_miss() {
                    info!(error = %e, "error handling ping miss");
                }
                if misses >= config.max_ping_miss {
                    info!("ping miss tolerance exhausted, no longer waiting for pings");
                    return;
                }
                debug!("resetting ping timer");
                timer.as_mut().reset(tokio::time::Instant::now() + config.ping_wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn counting_hook() -> (HandlePingMiss, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let hook: HandlePingMiss = Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hook, count)
    }

    #[tokio::test]
    async fn cancellation_stops_the_watchdog_without_a_miss() {
        let (hook, count) = counting_hook();
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        watch_pings(
            rx,
            PingConfig {
                ping_wait: Duration::from_secs(1),
                max_ping_miss: 1,
            },
            hook,
            cancel,
        )
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_hook_fires_once_per_miss_until_the_tolerance_is_spent() {
        let (hook, count) = counting_hook();
        let (_tx, rx) = mpsc::channel(1);

        watch_pings(
            rx,
            PingConfig {
                ping_wait: Duration::from_millis(100),
                max_ping_miss: 3,
            },
            hook,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_ping_resets_the_miss_counter() {
        let (hook, count) = counting_hook();
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let watchdog = tokio::spawn(watch_pings(
            rx,
            PingConfig {
                ping_wait: Duration::from_millis(100),
                max_ping_miss: 2,
            },
            hook,
            cancel.clone(),
        ));

        // One miss, then a ping; the counter must start over.
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(b"ping".to_vec()).await.expect("watchdog should be listening");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Two more unanswered intervals exhaust the tolerance.
        tokio::time::sleep(Duration::from_millis(250)).await;
        watchdog.await.expect("watchdog should exit cleanly");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_hook_is_logged_but_does_not_stop_the_count() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let hook: HandlePingMiss = Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err("hook exploded".into())
        });
        let (_tx, rx) = mpsc::channel(1);

        watch_pings(
            rx,
            PingConfig {
                ping_wait: Duration::from_millis(100),
                max_ping_miss: 2,
            },
            hook,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
