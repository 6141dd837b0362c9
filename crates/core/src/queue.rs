//! Ordered Task Queue
//!
//! A FIFO queue drained by a single worker task through an async sink. The
//! queue can be paused: items pushed while paused are held, never dropped, and
//! flushed in their original order once resumed. Both the outgoing command
//! buffer of a session and the inbound dispatch queue of a conversation are
//! instances of this type.

use std::future::Future;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// The queue's worker has stopped and no longer accepts items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue `{0}` has shut down")]
pub struct QueueClosed(pub &'static str);

#[derive(Debug, Clone, Copy)]
struct Gate {
    paused: bool,
    /// Incremented on every pause-to-active transition.
    epoch: u64,
}

pub struct OrderedQueue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    gate: watch::Sender<Gate>,
}

impl<T: Send + 'static> OrderedQueue<T> {
    /// Spawns the worker that feeds items to `sink` one at a time.
    ///
    /// A sink that cannot accept an item hands it back as `Err(item)`. The item
    /// stays at the head of the queue and is retried after the next resume, so
    /// ordering survives a sink that is temporarily unavailable.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F, Fut>(name: &'static str, paused: bool, sink: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (gate, gate_rx) = watch::channel(Gate { paused, epoch: 0 });
        tokio::spawn(drain(name, rx, gate_rx, sink));
        Self { name, tx, gate }
    }

    pub fn enqueue(&self, item: T) -> Result<(), QueueClosed> {
        self.tx.send(item).map_err(|_| QueueClosed(self.name))
    }

    /// Stops handing items to the sink. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        let paused = self.gate.send_if_modified(|gate| {
            if gate.paused {
                false
            } else {
                gate.paused = true;
                true
            }
        });
        if paused {
            debug!(queue = self.name, "Queue paused");
        }
        paused
    }

    /// Lets held items flow again, oldest first. Returns `false` if the queue
    /// was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.gate.send_if_modified(|gate| {
            if gate.paused {
                gate.paused = false;
                gate.epoch += 1;
                true
            } else {
                false
            }
        });
        if resumed {
            debug!(queue = self.name, "Queue resumed");
        }
        resumed
    }

    pub fn is_paused(&self) -> bool {
        self.gate.borrow().paused
    }

    /// Pauses the queue until the returned guard is dropped.
    ///
    /// The guard only resumes the queue if it was the one that paused it.
    pub fn hold(&self) -> Hold<'_, T> {
        let paused_here = self.pause();
        Hold {
            queue: self,
            paused_here,
        }
    }
}

/// Guard returned by [`OrderedQueue::hold`].
pub struct Hold<'a, T: Send + 'static> {
    queue: &'a OrderedQueue<T>,
    paused_here: bool,
}

impl<T: Send + 'static> Drop for Hold<'_, T> {
    fn drop(&mut self) {
        if self.paused_here {
            self.queue.resume();
        }
    }
}

async fn drain<T, F, Fut>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<T>,
    mut gate: watch::Receiver<Gate>,
    mut sink: F,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), T>>,
{
    while let Some(mut item) = rx.recv().await {
        let mut rejected_in: Option<u64> = None;
        loop {
            let epoch = match gate
                .wait_for(|g| !g.paused && rejected_in.is_none_or(|seen| g.epoch > seen))
                .await
            {
                Ok(open) => open.epoch,
                Err(_) => {
                    debug!(queue = name, "Queue dropped; worker stopping");
                    return;
                }
            };
            match sink(item).await {
                Ok(()) => break,
                Err(returned) => {
                    warn!(queue = name, "Sink rejected item; holding it until the queue resumes");
                    item = returned;
                    rejected_in = Some(epoch);
                }
            }
        }
    }
    debug!(queue = name, "Queue closed; worker stopping");
}
