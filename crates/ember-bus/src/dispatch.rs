//! Task scheduling for the fire-and-forget path.
//!
//! Two models behind one submit call. Unlimited mode spawns every task
//! onto the runtime; submission never blocks and never fails. Buffered
//! mode pushes tasks into a bounded FIFO drained by a fixed pool; a full
//! queue rejects the submission with `buffer_full` so slow publishers
//! observe overload instead of silently stalling the dispatcher.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::task::TaskTracker;

use ember_core::BusError;

use crate::config::DispatchMode;

pub(crate) type DispatchTask = BoxFuture<'static, ()>;

enum Queue {
    Unlimited,
    Buffered {
        sender: Mutex<Option<mpsc::Sender<DispatchTask>>>,
    },
}

pub(crate) struct Dispatcher {
    tracker: TaskTracker,
    queue: Queue,
}

impl Dispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        let tracker = TaskTracker::new();
        let queue = match mode {
            DispatchMode::Unlimited => Queue::Unlimited,
            DispatchMode::Buffered {
                buffer_size,
                concurrency,
            } => {
                let (sender, receiver) = mpsc::channel::<DispatchTask>(buffer_size.max(1));
                let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                for _ in 0..concurrency.max(1) {
                    let receiver = Arc::clone(&receiver);
                    tracker.spawn(async move {
                        loop {
                            // The guard drops before the task runs; workers
                            // serialize only on the take.
                            let task = receiver.lock().await.recv().await;
                            match task {
                                Some(task) => task.await,
                                None => break,
                            }
                        }
                    });
                }
                Queue::Buffered {
                    sender: Mutex::new(Some(sender)),
                }
            }
        };
        Self { tracker, queue }
    }

    /// Hand one task to the executor.
    pub fn submit(&self, task: DispatchTask) -> Result<(), BusError> {
        match &self.queue {
            Queue::Unlimited => {
                self.tracker.spawn(task);
                Ok(())
            }
            Queue::Buffered { sender } => {
                let guard = sender.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(sender) = guard.as_ref() else {
                    return Err(BusError::Closed);
                };
                sender.try_send(task).map_err(|err| match err {
                    TrySendError::Full(_) => BusError::BufferFull,
                    TrySendError::Closed(_) => BusError::Closed,
                })
            }
        }
    }

    /// Stop accepting work and wait for in-flight tasks, bounded by
    /// `timeout`. Returns whether everything drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if let Queue::Buffered { sender } = &self.queue {
            sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
