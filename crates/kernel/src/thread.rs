//! The user-thread primitive (spec §1 assumes "a suspendable thread that
//! can be created, signalled to continue one slice, signalled to suspend
//! at the next safe point, cancelled, and joined"). spec.md treats this as
//! a collaborator the rest of the kernel is built on; SPEC_FULL.md §4.11
//! supplies the concrete implementation since nothing upstream of this
//! crate provides one.
//!
//! Modeled as a `tokio` task plus two channels, per the Design Note in
//! spec.md §9: a `permit` channel is "continue one slice", and a `cancel`
//! watch channel is the termination path. Grounded in the teacher's
//! `tokio::sync::{mpsc, Mutex}` supervisor-task style
//! (`crates/daemon/src/qemu/supervisor.rs` in the retrieval pack).

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Handle given to user-level task bodies so they can cooperate with the
/// scheduler at their safe points.
#[derive(Clone)]
pub struct ThreadControl {
    permits: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    cancel: watch::Receiver<bool>,
}

/// Returned by [`ThreadControl::checkpoint`]: whether the thread should
/// keep running or has been cancelled and must exit immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Cancelled,
}

impl ThreadControl {
    /// The one safe point a user-level task body calls between units of
    /// simulated work. Suspends until the scheduler sends the next permit
    /// (end of this slice, start of the next one the scheduler grants it)
    /// or until cancellation is observed.
    pub async fn checkpoint(&mut self) -> Checkpoint {
        if *self.cancel.borrow() {
            return Checkpoint::Cancelled;
        }
        tokio::select! {
            biased;
            changed = self.cancel.changed() => {
                if changed.is_err() || *self.cancel.borrow() {
                    return Checkpoint::Cancelled;
                }
                Checkpoint::Continue
            }
            permit = async {
                let mut guard = self.permits.lock().await;
                guard.recv().await
            } => {
                match permit {
                    Some(()) => Checkpoint::Continue,
                    None => Checkpoint::Cancelled,
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

pub type BoxedEntry = Box<dyn FnOnce(ThreadControl) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A user-level "thread" multiplexed by the scheduler. Exactly one is
/// continued at a time (spec §5).
pub struct SuspendableThread {
    permit_tx: mpsc::Sender<()>,
    cancel_tx: watch::Sender<bool>,
    join_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SuspendableThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendableThread")
            .field("finished", &self.join_handle.as_ref().map(|h| h.is_finished()))
            .finish()
    }
}

impl SuspendableThread {
    /// Spawn `entry` as a tokio task. The permit channel has capacity 1:
    /// at most one slice may be "in flight" at a time, matching "at most
    /// one user thread runs per time slice" (spec §4.5).
    pub fn spawn<F, Fut>(entry: F) -> SuspendableThread
    where
        F: FnOnce(ThreadControl) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (permit_tx, permit_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let control = ThreadControl {
            permits: std::sync::Arc::new(tokio::sync::Mutex::new(permit_rx)),
            cancel: cancel_rx,
        };
        let join_handle = tokio::spawn(async move {
            entry(control).await;
        });
        SuspendableThread {
            permit_tx,
            cancel_tx,
            join_handle: Some(join_handle),
        }
    }

    /// Signal the thread to continue one slice. Non-blocking: if the
    /// thread isn't waiting at a checkpoint yet the permit just queues (the
    /// channel has capacity 1, matching the at-most-one-outstanding-slice
    /// invariant).
    pub fn continue_one_slice(&self) {
        let _ = self.permit_tx.try_send(());
    }

    /// Signal cancellation (spec §4.5 "Cancellation... cancels the user
    /// thread; the user thread must treat cancellation as an exit point").
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Join the underlying task. Used by `reap_zombie` (spec §4.2).
    pub async fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn checkpoint_continues_until_cancelled() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let mut thread = SuspendableThread::spawn(move |mut ctl| {
            let counter = Arc::clone(&counter2);
            async move {
                loop {
                    match ctl.checkpoint().await {
                        Checkpoint::Continue => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        Checkpoint::Cancelled => break,
                    }
                }
            }
        });

        for _ in 0..3 {
            thread.continue_one_slice();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        thread.cancel();
        thread.join().await;
        assert!(thread.is_finished());
    }
}
