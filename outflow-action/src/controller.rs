//! State machine controller.
//!
//! The controller runs batches through the output module and applies the
//! resulting state transitions. Every call into the module happens with the
//! execution guard held, which also owns the retry bookkeeping, so a module
//! is never entered concurrently. The state itself lives in a separate
//! lock-free cell that submitters read without waiting on the guard.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use outflow_common::tracing::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    clock::Clock,
    error::{ActionError, ModuleError},
    module::OutputModule,
    policy::{ResumePolicy, RetryTracker, RetryVerdict},
    shutdown::ShutdownSignal,
    state::{ActionState, AtomicState, StateHandle},
    template::ActionParams,
    types::Disposition,
};

/// Result of running one batch through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub disposition: Disposition,
    /// Records from the front of the batch that reached the module
    pub delivered: usize,
}

/// Everything only the holder of the execution guard may touch
#[derive(Debug)]
struct Exec {
    module: Option<Box<dyn OutputModule>>,
    tracker: RetryTracker,
}

enum Step {
    Again,
    Done(Disposition),
}

#[derive(Debug)]
pub struct Controller {
    name: Arc<str>,
    state: StateHandle,
    /// Resume deadline in milliseconds since the epoch, 0 when unset
    resume_at_ms: AtomicU64,
    exec: Mutex<Exec>,
    /// Copy of the tracker as of the end of the last pass, for diagnostics
    published: Mutex<RetryTracker>,
    policy: ResumePolicy,
    clock: Arc<dyn Clock>,
    shutdown: Arc<ShutdownSignal>,
    /// Fires with `shutdown`, or on its own once the action is torn down
    stop: Arc<ShutdownSignal>,
    delivered: AtomicU64,
    failures: AtomicU64,
    /// A submitter hit a full queue since the last delivery
    backpressure: AtomicBool,
}

impl Controller {
    #[must_use]
    pub fn new(
        name: Arc<str>,
        module: Box<dyn OutputModule>,
        policy: ResumePolicy,
        clock: Arc<dyn Clock>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            name,
            state: Arc::new(AtomicState::new(ActionState::Ready)),
            resume_at_ms: AtomicU64::new(0),
            exec: Mutex::new(Exec {
                module: Some(module),
                tracker: RetryTracker::default(),
            }),
            published: Mutex::new(RetryTracker::default()),
            policy,
            clock,
            stop: shutdown.child(),
            shutdown,
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            backpressure: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ActionState {
        self.state.load()
    }

    /// Shared handle on the state cell, for actions that fail over to this one
    #[must_use]
    pub fn state_handle(&self) -> StateHandle {
        Arc::clone(&self.state)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn shutdown(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// Signal that fires on shutdown or once [`stop`](Self::stop) was called
    pub fn stop_signal(&self) -> &Arc<ShutdownSignal> {
        &self.stop
    }

    /// Give up pending and future retries.
    ///
    /// Deliveries to a healthy module still go through, but a batch that
    /// needs a retry is abandoned with [`ActionError::ShutdownAbort`] and a
    /// retry wait in progress is cut short. Counters are left as they are.
    pub fn stop(&self) {
        if !self.stop.is_triggered() {
            debug!(action = %self.name, "Retries stopped");
            self.stop.trigger();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_triggered()
    }

    pub const fn policy(&self) -> &ResumePolicy {
        &self.policy
    }

    /// Whether the action is suspended and its resume deadline lies after `now`
    pub fn is_deferred(&self, now: SystemTime) -> bool {
        self.state.is_suspended() && to_millis(now) < self.resume_at_ms.load(Ordering::Acquire)
    }

    /// Time left until a suspended action may try to resume, `None` if not suspended
    pub fn resume_delay(&self, now: SystemTime) -> Option<Duration> {
        self.state.is_suspended().then(|| {
            Duration::from_millis(
                self.resume_at_ms
                    .load(Ordering::Acquire)
                    .saturating_sub(to_millis(now)),
            )
        })
    }

    /// Retry bookkeeping as of the end of the last pass
    pub fn tracker(&self) -> RetryTracker {
        self.published.lock().clone()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// A submitter could not queue a batch.
    ///
    /// Counts as a transient failure right away. The next delivery pass
    /// moves the action through retry first, under the same budget as a
    /// failed delivery.
    pub fn report_backpressure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.backpressure.store(true, Ordering::Release);
    }

    /// Run `batch` through the module, retrying and resuming as the state requires.
    ///
    /// Non-transactional delivery picks up at the first undelivered record
    /// after a retry; a failed transaction is replayed as a whole.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::ShutdownAbort`] if shutdown was requested, or
    /// the action was stopped while the batch still needed a retry.
    pub fn process(&self, batch: &[ActionParams]) -> Result<BatchOutcome, ActionError> {
        let mut exec = self.exec.lock();
        let mut next = 0;
        let result = self.run(&mut exec, batch, &mut next);
        self.published.lock().clone_from(&exec.tracker);

        result.map(|disposition| BatchOutcome {
            disposition,
            delivered: next,
        })
    }

    /// Forward a reload signal to the module. Never changes the state.
    ///
    /// # Errors
    ///
    /// Returns the module's failure, after logging it.
    pub fn reload_signal(&self) -> Result<(), ActionError> {
        let mut exec = self.exec.lock();
        let Some(module) = exec.module.as_mut() else {
            return Ok(());
        };

        if let Err(err) = module.on_reload_signal() {
            warn!(
                action = %self.name,
                module = module.name(),
                error = %err,
                "Reload signal handler failed"
            );
            return Err(err.into());
        }

        Ok(())
    }

    /// Take the module out of the controller. Later passes report [`Disposition::Disabled`].
    pub fn release_module(&self) -> Option<Box<dyn OutputModule>> {
        self.exec.lock().module.take()
    }

    fn run(
        &self,
        exec: &mut Exec,
        batch: &[ActionParams],
        next: &mut usize,
    ) -> Result<Disposition, ActionError> {
        loop {
            if self.shutdown.is_triggered() {
                return Err(ActionError::ShutdownAbort);
            }

            let now = self.clock.now();
            let step = match self.state.load() {
                ActionState::Dead => Step::Done(Disposition::Disabled),
                ActionState::Suspended if self.is_deferred(now) => {
                    Step::Done(Disposition::Deferred)
                }
                ActionState::Suspended => self.resume(exec, ActionState::Suspended, now),
                ActionState::Retrying => {
                    if self.stop.is_triggered() {
                        return Err(ActionError::ShutdownAbort);
                    }
                    if let Some(wait) = exec
                        .tracker
                        .retry_at
                        .and_then(|at| at.duration_since(now).ok())
                        && self.clock.wait(&self.stop, wait)
                    {
                        return Err(ActionError::ShutdownAbort);
                    }
                    self.resume(exec, ActionState::Retrying, self.clock.now())
                }
                ActionState::Ready if *next >= batch.len() => Step::Done(Disposition::Accepted),
                ActionState::Ready => self.deliver(exec, batch, next, now),
                stale @ (ActionState::TxActive | ActionState::TxCommitted) => {
                    // An earlier pass unwound mid-transaction.
                    self.move_to(stale, ActionState::Retrying);
                    Step::Again
                }
            };

            if let Step::Done(disposition) = step {
                return Ok(disposition);
            }
        }
    }

    fn deliver(
        &self,
        exec: &mut Exec,
        batch: &[ActionParams],
        next: &mut usize,
        now: SystemTime,
    ) -> Step {
        if self.backpressure.swap(false, Ordering::AcqRel) {
            self.retry_after(&mut exec.tracker, ActionState::Ready, "queue full", now);
            return Step::Again;
        }

        let Some(module) = exec.module.as_mut() else {
            return Step::Done(Disposition::Disabled);
        };

        if module.supports_transactions() {
            self.move_to(ActionState::Ready, ActionState::TxActive);
            if let Err(err) = run_transaction(module.as_mut(), &batch[*next..]) {
                return self.delivery_failed(&mut exec.tracker, ActionState::TxActive, err, now);
            }

            self.count_delivered(batch.len() - *next);
            *next = batch.len();
            exec.tracker.record_delivered();
            self.move_to(ActionState::TxActive, ActionState::TxCommitted);
            self.move_to(ActionState::TxCommitted, ActionState::Ready);
            return Step::Again;
        }

        for params in &batch[*next..] {
            self.move_to(ActionState::Ready, ActionState::TxCommitted);
            if let Err(err) = module.deliver(params) {
                return self.delivery_failed(
                    &mut exec.tracker,
                    ActionState::TxCommitted,
                    err,
                    now,
                );
            }

            *next += 1;
            self.count_delivered(1);
            exec.tracker.record_delivered();
            self.move_to(ActionState::TxCommitted, ActionState::Ready);
        }

        Step::Again
    }

    fn delivery_failed(
        &self,
        tracker: &mut RetryTracker,
        from: ActionState,
        err: ModuleError,
        now: SystemTime,
    ) -> Step {
        self.failures.fetch_add(1, Ordering::Relaxed);

        match err {
            ModuleError::Transient(reason) => self.retry_after(tracker, from, &reason, now),
            ModuleError::Fatal(reason) => self.disable(&ActionError::Fatal(reason)),
        }

        Step::Again
    }

    fn retry_after(
        &self,
        tracker: &mut RetryTracker,
        from: ActionState,
        reason: &str,
        now: SystemTime,
    ) {
        self.move_to(from, ActionState::Retrying);
        if tracker.enter_retry(now, &self.policy) {
            self.disable(&ActionError::Flapping {
                resumes: tracker.resume_ok_in_row,
            });
        } else {
            warn!(action = %self.name, %reason, "Delivery failed, retrying");
        }
    }

    fn resume(&self, exec: &mut Exec, from: ActionState, now: SystemTime) -> Step {
        let Some(module) = exec.module.as_mut() else {
            return Step::Done(Disposition::Disabled);
        };

        match module.try_resume() {
            Ok(()) => {
                exec.tracker.record_resumed();
                self.resume_at_ms.store(0, Ordering::Release);
                self.move_to(from, ActionState::Ready);
                info!(action = %self.name, %from, "Action resumed");
                Step::Again
            }
            Err(ModuleError::Transient(reason)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.resume_failed(&mut exec.tracker, from, now, &reason)
            }
            Err(ModuleError::Fatal(reason)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.disable(&ActionError::Fatal(reason));
                Step::Again
            }
        }
    }

    fn resume_failed(
        &self,
        tracker: &mut RetryTracker,
        from: ActionState,
        now: SystemTime,
        reason: &str,
    ) -> Step {
        let retries = tracker.retries_since_suspend;

        match tracker.record_failed_attempt(now, &self.policy) {
            RetryVerdict::Wait(wait) => {
                self.move_to(from, ActionState::Retrying);
                debug!(
                    action = %self.name,
                    retries,
                    wait_secs = wait.as_secs(),
                    %reason,
                    "Retry failed"
                );
                Step::Again
            }
            RetryVerdict::Suspend(deadline) => {
                self.resume_at_ms
                    .store(to_millis(deadline).max(1), Ordering::Release);
                self.move_to(from, ActionState::Suspended);
                warn!(
                    action = %self.name,
                    error = %ActionError::BudgetExhausted { retries },
                    %reason,
                    suspensions = tracker.suspensions,
                    resume_in_secs = deadline.duration_since(now).unwrap_or_default().as_secs(),
                    "Action suspended"
                );
                Step::Done(Disposition::Deferred)
            }
        }
    }

    fn disable(&self, cause: &ActionError) {
        if self.state.kill() {
            self.resume_at_ms.store(0, Ordering::Release);
            error!(action = %self.name, error = %cause, "Action disabled");
        }
    }

    fn move_to(&self, from: ActionState, to: ActionState) {
        if from == to {
            return;
        }

        if let Err(actual) = self.state.transition(from, to) {
            debug!(action = %self.name, %from, %to, %actual, "State transition refused");
        }
    }

    fn count_delivered(&self, count: usize) {
        self.delivered
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

fn run_transaction(
    module: &mut dyn OutputModule,
    batch: &[ActionParams],
) -> Result<(), ModuleError> {
    module.begin_transaction()?;
    for params in batch {
        module.deliver(params)?;
    }
    module.commit()
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}
