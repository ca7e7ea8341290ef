//! Trailing-edge debounce for pushes.
//!
//! Every submission restarts the window. When the window closes without a
//! newer submission, the last caller becomes the leader: it receives the
//! latest value and reports one shared outcome to everyone who submitted
//! during the window.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

struct Pending<T, R> {
    generation: u64,
    latest: Option<T>,
    waiters: Vec<oneshot::Sender<R>>,
}

pub(crate) struct Debouncer<T, R> {
    window: Duration,
    pending: Mutex<Pending<T, R>>,
}

/// Role of one submission once its window has closed.
pub(crate) enum Turn<T, R> {
    /// Run the operation with `value`, then call [`Batch::finish`].
    Leader(Batch<T, R>),
    /// A later submission leads; await its outcome.
    Follower(oneshot::Receiver<R>),
}

pub(crate) struct Batch<T, R> {
    pub value: T,
    waiters: Vec<oneshot::Sender<R>>,
}

impl<T, R: Clone> Batch<T, R> {
    /// Number of submissions collapsed into this batch.
    pub fn size(&self) -> usize {
        self.waiters.len()
    }

    /// Hand the outcome to every collapsed submission and return it.
    pub fn finish(self, outcome: R) -> R {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

impl<T, R> Debouncer<T, R> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(Pending {
                generation: 0,
                latest: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Submit `value` and wait out the window.
    pub async fn submit(&self, value: T) -> Turn<T, R> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut pending = self.lock();
            pending.generation += 1;
            pending.latest = Some(value);
            pending.waiters.push(tx);
            pending.generation
        };

        tokio::time::sleep(self.window).await;

        let mut pending = self.lock();
        if pending.generation == generation {
            if let Some(value) = pending.latest.take() {
                return Turn::Leader(Batch {
                    value,
                    waiters: std::mem::take(&mut pending.waiters),
                });
            }
        }
        Turn::Follower(rx)
    }

    /// Drop anything waiting. Followers observe a closed channel.
    pub fn cancel(&self) {
        let mut pending = self.lock();
        pending.generation += 1;
        pending.latest = None;
        pending.waiters.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending<T, R>> {
        // A panic while holding this lock leaves the data consistent
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
