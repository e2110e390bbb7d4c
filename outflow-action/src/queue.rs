//! Queue submission.
//!
//! A submitter hands prepared batches to the controller. The direct
//! submitter does so on the calling thread. The memory queue buffers batches
//! in a bounded channel and delivers them from a dedicated worker, which
//! holds on to a batch while the action is suspended and hands it over again
//! once the action may resume, so suspended records are not lost.

use std::{sync::Arc, thread, time::Duration};

use outflow_common::tracing::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    controller::{BatchOutcome, Controller},
    error::{ActionError, ConfigError},
    template::ActionParams,
    types::Disposition,
};

/// Bounds on how long the queue worker sleeps before checking a suspended action again
const REDELIVERY_MIN: Duration = Duration::from_millis(10);
const REDELIVERY_POLL: Duration = Duration::from_millis(250);

pub trait Submitter: Send + Sync + std::fmt::Debug {
    /// Hand a batch over for delivery.
    ///
    /// The outcome's `delivered` counts the records from the front of the
    /// batch that were taken, whether delivered or queued.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::ShutdownAbort`] if shutdown was requested or the
    /// submitter is closed.
    fn submit(&self, batch: Vec<ActionParams>) -> Result<BatchOutcome, ActionError>;

    /// Stop accepting batches and wait until the queued ones are dealt with
    fn close(&self);

    /// Whether batches are delivered from another thread
    fn is_queued(&self) -> bool {
        false
    }
}

/// Delivers on the submitting thread
#[derive(Debug)]
pub struct DirectSubmitter {
    controller: Arc<Controller>,
}

impl DirectSubmitter {
    #[must_use]
    pub const fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

impl Submitter for DirectSubmitter {
    fn submit(&self, batch: Vec<ActionParams>) -> Result<BatchOutcome, ActionError> {
        self.controller.process(&batch)
    }

    fn close(&self) {}
}

/// Bounded in-memory queue with its own delivery thread
#[derive(Debug)]
pub struct MemoryQueue {
    controller: Arc<Controller>,
    sender: Mutex<Option<mpsc::Sender<Vec<ActionParams>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MemoryQueue {
    /// Start the worker thread of a queue holding at most `capacity` batches.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or the worker thread cannot be spawned.
    pub fn spawn(controller: Arc<Controller>, capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "queue",
                reason: "memory queue capacity must be at least 1".to_string(),
            });
        }

        let (sender, receiver) = mpsc::channel(capacity);

        let worker = thread::Builder::new()
            .name(format!("outflow-queue-{}", controller.name()))
            .spawn({
                let controller = Arc::clone(&controller);
                move || run_worker(&controller, receiver)
            })
            .map_err(|err| ConfigError::QueueWorker(err.to_string()))?;

        Ok(Self {
            controller,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl Submitter for MemoryQueue {
    fn submit(&self, batch: Vec<ActionParams>) -> Result<BatchOutcome, ActionError> {
        if self.controller.shutdown().is_triggered() {
            return Err(ActionError::ShutdownAbort);
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(ActionError::ShutdownAbort);
        };

        let records = batch.len();
        match sender.try_send(batch) {
            Ok(()) => Ok(BatchOutcome {
                disposition: Disposition::Accepted,
                delivered: records,
            }),
            Err(TrySendError::Full(batch)) => {
                self.controller.report_backpressure();
                debug!(
                    action = %self.controller.name(),
                    records = batch.len(),
                    "Queue full, deferring batch"
                );
                Ok(BatchOutcome {
                    disposition: Disposition::Deferred,
                    delivered: 0,
                })
            }
            Err(TrySendError::Closed(_)) => Err(ActionError::ShutdownAbort),
        }
    }

    fn close(&self) {
        // Queued batches still drain, but none of them may wait on a retry.
        self.controller.stop();
        drop(self.sender.lock().take());

        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            error!(action = %self.controller.name(), "Queue worker panicked");
        }
    }

    fn is_queued(&self) -> bool {
        true
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(controller: &Controller, mut receiver: mpsc::Receiver<Vec<ActionParams>>) {
    while let Some(mut batch) = receiver.blocking_recv() {
        deliver_queued(controller, &mut batch);
    }

    debug!(action = %controller.name(), "Queue worker stopped");
}

fn deliver_queued(controller: &Controller, batch: &mut Vec<ActionParams>) {
    loop {
        match controller.process(batch) {
            Ok(BatchOutcome {
                disposition: Disposition::Deferred,
                delivered,
            }) => {
                batch.drain(..delivered);
                if controller.is_stopped() {
                    warn!(
                        action = %controller.name(),
                        dropped = batch.len(),
                        "Queue closed while the action is suspended, dropping batch"
                    );
                    return;
                }

                let wait = controller
                    .resume_delay(controller.clock().now())
                    .map_or(REDELIVERY_POLL, |delay| delay.clamp(REDELIVERY_MIN, REDELIVERY_POLL));
                if controller.stop_signal().wait_timeout(wait) {
                    debug!(
                        action = %controller.name(),
                        dropped = batch.len(),
                        "Stopped while the action is suspended, dropping batch"
                    );
                    return;
                }
            }
            Ok(BatchOutcome {
                disposition: Disposition::Disabled,
                delivered,
            }) => {
                warn!(
                    action = %controller.name(),
                    dropped = batch.len() - delivered,
                    "Action disabled, dropping batch"
                );
                return;
            }
            Ok(_) => return,
            Err(err) => {
                debug!(
                    action = %controller.name(),
                    error = %err,
                    dropped = batch.len(),
                    "Batch abandoned"
                );
                return;
            }
        }
    }
}
