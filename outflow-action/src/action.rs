//! Action instances.
//!
//! An action binds one output module to the filter, controller and submitter
//! that decide when and how records reach it. Actions are built with an
//! [`ActionBuilder`] while configuration is loaded and are immutable once
//! [`finalize`](ActionBuilder::finalize) succeeds.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use outflow_action::{
//!     ActionBuilder, ActionDefaults, Disposition, TemplateRegistry, modules::DiscardOutput,
//! };
//! use outflow_common::LogRecord;
//!
//! let action = ActionBuilder::new("sink")
//!     .module(DiscardOutput)
//!     .finalize(ActionDefaults::default(), &TemplateRegistry::new())
//!     .unwrap();
//!
//! let record = Arc::new(LogRecord::new("host", "app:", " started"));
//! assert_eq!(action.execute(&record), Ok(Disposition::Accepted));
//! action.destruct();
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use outflow_common::{
    LogRecord,
    tracing::{debug, trace},
};
use parking_lot::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    config::{ActionConfig, QueueConfig},
    controller::{BatchOutcome, Controller},
    error::{ActionError, ConfigError},
    module::{BindContext, OutputModule},
    policy::{ResumeBackoff, ResumePolicy, RetryBudget},
    queue::{DirectSubmitter, MemoryQueue, Submitter},
    registry::ActionDefaults,
    shutdown::ShutdownSignal,
    state::{ActionState, StateHandle},
    template::{ActionParams, ParamPassing, Template, TemplateRegistry},
    throttle::{Checkpoint, ThrottleConfig, ThrottleFilter, Verdict},
    types::{ActionStats, Disposition},
};

/// Collects everything an action needs before it can be bound
#[derive(Debug)]
pub struct ActionBuilder {
    name: String,
    config: ActionConfig,
    module: Option<Box<dyn OutputModule>>,
    previous: Option<StateHandle>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<ShutdownSignal>,
}

impl ActionBuilder {
    /// Start with the default configuration and no output module
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ActionConfig::default(),
            module: None,
            previous: None,
            clock: Arc::new(SystemClock),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(mut self, config: ActionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn module(self, module: impl OutputModule + 'static) -> Self {
        self.boxed_module(Box::new(module))
    }

    #[must_use]
    pub fn boxed_module(mut self, module: Box<dyn OutputModule>) -> Self {
        self.module = Some(module);
        self
    }

    /// The action watched by the failover gate
    #[must_use]
    pub fn previous(mut self, previous: StateHandle) -> Self {
        self.previous = Some(previous);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn shutdown(mut self, shutdown: Arc<ShutdownSignal>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Validate the configuration, bind the module and start the submitter.
    ///
    /// `defaults` supplies the retry budget for actions that do not set one;
    /// the value is captured here and never looked up again.
    ///
    /// # Errors
    ///
    /// Returns an error if no module is bound, a template is unknown, the
    /// failover gate has no previous action, a setting is out of range, or
    /// the module rejects the binding.
    pub fn finalize(
        self,
        defaults: ActionDefaults,
        templates: &TemplateRegistry,
    ) -> Result<Action, ConfigError> {
        let Self {
            name,
            config,
            module,
            previous,
            clock,
            shutdown,
        } = self;

        let mut module = module.ok_or_else(|| ConfigError::MissingModule(name.clone()))?;
        if config.exec_only_when_previous_suspended && previous.is_none() {
            return Err(ConfigError::MissingPrevious(name));
        }
        validate(&config)?;

        let resolved = templates.resolve(&config.templates)?;
        module.construct(&BindContext {
            action_name: name.clone(),
            templates: config.templates.clone(),
            queued: matches!(config.queue, QueueConfig::Memory { .. }),
        })?;

        let budget = config
            .resume_retry_count
            .unwrap_or(defaults.resume_retry_count);
        let policy = ResumePolicy {
            budget,
            interval_secs: config.resume_interval_secs,
            flap_threshold: config.flap_threshold,
            backoff: config.backoff,
        };

        debug!(
            action = %name,
            module = module.name(),
            ?budget,
            queue = ?config.queue,
            "Action bound"
        );

        let name: Arc<str> = name.into();
        let controller = Arc::new(Controller::new(
            Arc::clone(&name),
            module,
            policy,
            clock,
            shutdown,
        ));
        let submitter: Box<dyn Submitter> = match config.queue {
            QueueConfig::Direct => Box::new(DirectSubmitter::new(Arc::clone(&controller))),
            QueueConfig::Memory { capacity } => {
                Box::new(MemoryQueue::spawn(Arc::clone(&controller), capacity)?)
            }
        };

        Ok(Action {
            name,
            throttle: Mutex::new(ThrottleFilter::new(ThrottleConfig::from(&config))),
            templates: resolved,
            config,
            previous,
            controller,
            submitter,
            submit_order: Mutex::new(()),
            destructed: AtomicBool::new(false),
        })
    }
}

fn validate(config: &ActionConfig) -> Result<(), ConfigError> {
    if config.param_passing != ParamPassing::Record && config.templates.is_empty() {
        return Err(ConfigError::InvalidSetting {
            field: "templates",
            reason: "at least one template is needed unless records are passed whole".to_string(),
        });
    }

    if let ResumeBackoff::Exponential {
        max_interval_secs,
        jitter_factor,
    } = config.backoff
    {
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(ConfigError::InvalidSetting {
                field: "backoff",
                reason: format!("jitter factor {jitter_factor} is outside 0.0..=1.0"),
            });
        }
        if max_interval_secs < config.resume_interval_secs {
            return Err(ConfigError::InvalidSetting {
                field: "backoff",
                reason: format!(
                    "maximum interval {max_interval_secs}s is below the resume interval {}s",
                    config.resume_interval_secs
                ),
            });
        }
    }

    Ok(())
}

/// A bound output destination
#[derive(Debug)]
pub struct Action {
    name: Arc<str>,
    config: ActionConfig,
    templates: Vec<Arc<Template>>,
    throttle: Mutex<ThrottleFilter>,
    previous: Option<StateHandle>,
    controller: Arc<Controller>,
    submitter: Box<dyn Submitter>,
    /// Held from the throttle check until the submitter answers, so records
    /// reach the submitter in the order the filter passed them
    submit_order: Mutex<()>,
    destructed: AtomicBool,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &ActionConfig {
        &self.config
    }

    pub fn state(&self) -> ActionState {
        self.controller.state()
    }

    /// Shared handle on this action's state, for a failover action that follows it
    #[must_use]
    pub fn state_handle(&self) -> StateHandle {
        self.controller.state_handle()
    }

    /// Retry budget captured when the action was bound
    pub fn retry_budget(&self) -> RetryBudget {
        self.controller.policy().budget
    }

    /// Submit one record.
    ///
    /// The throttle filter runs first; a record that passes is then either
    /// handed to the submitter or, if the action cannot take it right now,
    /// answered straight away with [`Disposition::Deferred`] or
    /// [`Disposition::Disabled`]. A queued action keeps accepting records
    /// while suspended, up to its capacity.
    ///
    /// Records from concurrent callers are submitted one caller at a time,
    /// in the order the filter saw them. If nothing was taken, the filter
    /// is rolled back: the interval and sampling gates do not count the
    /// attempt and a repeat summary stays owed.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::ShutdownAbort`] once shutdown has been requested.
    pub fn execute(&self, record: &Arc<LogRecord>) -> Result<Disposition, ActionError> {
        if self.destructed.load(Ordering::Acquire) {
            return Ok(Disposition::Disabled);
        }
        if self.controller.shutdown().is_triggered() {
            return Err(ActionError::ShutdownAbort);
        }

        let now = self.controller.clock().now();
        let previous_suspended = self
            .previous
            .as_ref()
            .is_some_and(|previous| previous.is_suspended());

        let _order = self.submit_order.lock();
        let (verdict, checkpoint) = {
            let mut throttle = self.throttle.lock();
            let checkpoint = throttle.checkpoint();
            (throttle.check(record, now, previous_suspended), checkpoint)
        };

        match verdict {
            Verdict::Skip(reason) => {
                trace!(action = %self.name, ?reason, "Record skipped");
                Ok(Disposition::Skipped)
            }
            Verdict::Pass(records) => self.submit(&records, now, checkpoint),
        }
    }

    /// Deliver the summary owed for a pending run of repeated records.
    ///
    /// Returns [`Disposition::Skipped`] when nothing was owed.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::ShutdownAbort`] once shutdown has been requested.
    pub fn flush_repeated(&self) -> Result<Disposition, ActionError> {
        if self.destructed.load(Ordering::Acquire) {
            return Ok(Disposition::Disabled);
        }

        self.flush_pending()
    }

    /// Forward a reload signal (SIGHUP) to the output module.
    ///
    /// A failure is logged and returned, but leaves the state untouched.
    ///
    /// # Errors
    ///
    /// Returns the module's failure.
    pub fn call_hup_handler(&self) -> Result<(), ActionError> {
        self.controller.reload_signal()
    }

    /// Flush any owed summary, close the submitter and release the module.
    ///
    /// Pending retries are given up first, so this returns promptly even
    /// when the destination never recovers. Safe to call more than once;
    /// later calls do nothing.
    pub fn destruct(&self) {
        if self.destructed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.controller.stop();
        if let Err(err) = self.flush_pending() {
            debug!(action = %self.name, error = %err, "Repeat summary not delivered");
        }
        self.submitter.close();

        if let Some(module) = self.controller.release_module() {
            debug!(action = %self.name, module = module.name(), "Output module released");
        }
    }

    pub fn is_destructed(&self) -> bool {
        self.destructed.load(Ordering::Acquire)
    }

    /// Snapshot of state and counters
    pub fn stats(&self) -> ActionStats {
        let tracker = self.controller.tracker();
        let throttle = self.throttle.lock();

        ActionStats {
            name: self.name.to_string(),
            state: self.controller.state(),
            retries_since_suspend: tracker.retries_since_suspend,
            resume_ok_in_row: tracker.resume_ok_in_row,
            suspensions: tracker.suspensions,
            resume_at: tracker.resume_at,
            delivered: self.controller.delivered(),
            failures: self.controller.failures(),
            skipped_occurrences: throttle.skipped_occurrences(),
            repeat_count: throttle.repeat_count(),
        }
    }

    fn flush_pending(&self) -> Result<Disposition, ActionError> {
        let _order = self.submit_order.lock();
        let (summary, checkpoint) = {
            let mut throttle = self.throttle.lock();
            let checkpoint = throttle.checkpoint();
            (throttle.flush_repeated(), checkpoint)
        };

        match summary {
            Some(summary) => self.submit(&[summary], self.controller.clock().now(), checkpoint),
            None => Ok(Disposition::Skipped),
        }
    }

    /// Submit records the filter passed. Callers hold `submit_order`.
    fn submit(
        &self,
        records: &[Arc<LogRecord>],
        now: SystemTime,
        checkpoint: Checkpoint,
    ) -> Result<Disposition, ActionError> {
        let result = self.hand_over(records, now);

        let taken = result.as_ref().is_ok_and(|outcome| {
            outcome.disposition == Disposition::Accepted || outcome.delivered > 0
        });
        if !taken {
            self.throttle.lock().restore(checkpoint);
            trace!(action = %self.name, "Nothing submitted, throttle state restored");
        }

        result.map(|outcome| outcome.disposition)
    }

    fn hand_over(
        &self,
        records: &[Arc<LogRecord>],
        now: SystemTime,
    ) -> Result<BatchOutcome, ActionError> {
        let refused = |disposition| BatchOutcome {
            disposition,
            delivered: 0,
        };

        if self.controller.state() == ActionState::Dead {
            return Ok(refused(Disposition::Disabled));
        }
        if !self.submitter.is_queued() && self.controller.is_deferred(now) {
            return Ok(refused(Disposition::Deferred));
        }

        let batch = records
            .iter()
            .map(|record| ActionParams::prepare(self.config.param_passing, &self.templates, record))
            .collect();

        self.submitter.submit(batch)
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        self.destruct();
    }
}
