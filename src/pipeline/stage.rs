//! Shared plumbing for pipeline stages
//!
//! Every stage is the same machine: a bounded ingress channel, a dispatcher
//! task that pulls items and spawns one worker task per item, and a semaphore
//! capping how many workers run at once. The semaphore doubles as the
//! completion barrier: once the ingress drains, the dispatcher reacquires
//! every permit, so awaiting the dispatcher implies every worker finished.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The ingress, dispatcher handle, and close bookkeeping common to every
/// stage. The stage-specific worker body is supplied to [`spawn_dispatcher`].
pub(crate) struct StageCore<T> {
    label: &'static str,
    closed: AtomicBool,
    ingress: Mutex<Option<mpsc::Sender<T>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    gate: OnceCell<()>,
}

impl<T: Send + 'static> StageCore<T> {
    pub(crate) fn new(
        label: &'static str,
        ingress: mpsc::Sender<T>,
        dispatcher: JoinHandle<()>,
    ) -> Self {
        Self {
            label,
            closed: AtomicBool::new(false),
            ingress: Mutex::new(Some(ingress)),
            dispatcher: Mutex::new(Some(dispatcher)),
            gate: OnceCell::new(),
        }
    }

    /// Queue one item, waiting for ingress capacity if the stage is busy.
    ///
    /// After the stage has closed the item is dropped with an error log; the
    /// drop is the contract, enqueuers never observe a panic.
    pub(crate) async fn enqueue(&self, item: T) {
        if self.closed.load(Ordering::SeqCst) {
            error!(
                "failed to queue message, {} is no longer accepting messages",
                self.label
            );
            return;
        }
        let sender = self.ingress.lock().await.clone();
        match sender {
            Some(sender) => {
                if sender.send(item).await.is_err() {
                    error!(
                        "failed to queue message, {} is no longer accepting messages",
                        self.label
                    );
                }
            }
            None => error!(
                "failed to queue message, {} is no longer accepting messages",
                self.label
            ),
        }
    }

    /// Drain the stage, then run `after_drain` (the downstream close).
    ///
    /// Idempotent: the first caller performs the shutdown, concurrent callers
    /// wait for it to finish. On return every item enqueued before the close
    /// has been fully processed and the downstream has been closed.
    pub(crate) async fn close_with<F>(&self, after_drain: F)
    where
        F: Future<Output = ()>,
    {
        self.gate
            .get_or_init(|| async {
                self.closed.store(true, Ordering::SeqCst);
                // Dropping the ingress sender is what lets the dispatcher
                // observe end-of-input.
                self.ingress.lock().await.take();
                let dispatcher = self.dispatcher.lock().await.take();
                if let Some(dispatcher) = dispatcher {
                    if let Err(e) = dispatcher.await {
                        warn!(stage = self.label, error = %e, "dispatcher task failed");
                    }
                }
                after_drain.await;
                debug!("{} closed", self.label);
            })
            .await;
    }
}

/// Run the dispatcher for one stage: pull items off the ingress in FIFO
/// order and hand each to its own worker task, never exceeding `max_workers`
/// in flight. Returns only after the ingress has closed and every worker has
/// completed.
pub(crate) fn spawn_dispatcher<T, F, Fut>(
    mut ingress: mpsc::Receiver<T>,
    max_workers: usize,
    work: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let workers = Arc::new(Semaphore::new(max_workers));
        while let Some(item) = ingress.recv().await {
            let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                break;
            };
            let job = work(item);
            tokio::spawn(async move {
                job.await;
                drop(permit);
            });
        }
        // Completion barrier: every worker holds a permit until it finishes.
        let _ = workers.acquire_many(max_workers as u32).await;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn counting_stage(max_workers: usize, size: usize) -> (StageCore<u32>, Arc<AtomicUsize>) {
        let processed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&processed);
        let (tx, rx) = mpsc::channel(size);
        let dispatcher = spawn_dispatcher(rx, max_workers, move |_item: u32| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (StageCore::new("test stage", tx, dispatcher), processed)
    }

    #[tokio::test]
    async fn close_waits_for_every_enqueued_item() {
        let (core, processed) = counting_stage(2, 8);
        for item in 0..8 {
            core.enqueue(item).await;
        }
        core.close_with(async {}).await;
        assert_eq!(processed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn items_enqueued_after_close_are_dropped() {
        let (core, processed) = counting_stage(1, 1);
        core.close_with(async {}).await;
        core.enqueue(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_runs_after_drain_once() {
        let (core, _) = counting_stage(1, 4);
        let closes = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let closes = Arc::clone(&closes);
            core.close_with(async move {
                closes.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_workers_never_exceed_the_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        let flight = Arc::clone(&in_flight);
        let seen_peak = Arc::clone(&peak);
        let dispatcher = spawn_dispatcher(rx, 3, move |_item: u32| {
            let flight = Arc::clone(&flight);
            let seen_peak = Arc::clone(&seen_peak);
            async move {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                seen_peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
        let core = StageCore::new("cap stage", tx, dispatcher);

        for item in 0..16 {
            core.enqueue(item).await;
        }
        core.close_with(async {}).await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
