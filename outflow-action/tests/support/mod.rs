//! Shared helpers for the action integration tests
//!
//! [`MockOutput`] is a scripted output module. Tests keep the [`Probe`] it
//! reports to, script the outcome of upcoming calls on it and inspect what
//! was delivered afterwards, even once the action has released the module.

#![allow(dead_code, clippy::unwrap_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use outflow_action::{
    Action, ActionBuilder, ActionConfig, ActionDefaults, ActionParams, ManualClock, ModuleError,
    OutputModule, ParamPassing, ShutdownSignal, TemplateRegistry,
};
use outflow_common::LogRecord;
use parking_lot::Mutex;

type Script = Mutex<VecDeque<Result<(), ModuleError>>>;

/// What the mock module did, and what it will do next
#[derive(Debug, Default)]
pub struct Probe {
    deliver_script: Script,
    resume_script: Script,
    reload_script: Script,
    delivered: Mutex<Vec<String>>,
    pending: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    deliver_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    commits: AtomicUsize,
    reloads: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outcomes of the next deliveries, after which deliveries succeed
    pub fn script_deliver(&self, outcomes: impl IntoIterator<Item = Result<(), ModuleError>>) {
        self.deliver_script.lock().extend(outcomes);
    }

    /// Outcomes of the next resume probes, after which they succeed
    pub fn script_resume(&self, outcomes: impl IntoIterator<Item = Result<(), ModuleError>>) {
        self.resume_script.lock().extend(outcomes);
    }

    pub fn script_reload(&self, outcomes: impl IntoIterator<Item = Result<(), ModuleError>>) {
        self.reload_script.lock().extend(outcomes);
    }

    /// Time every delivery takes
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    pub fn deliver_calls(&self) -> usize {
        self.deliver_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Most calls that were ever inside the module at the same time
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next(script: &Script) -> Result<(), ModuleError> {
        script.lock().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Debug)]
pub struct MockOutput {
    probe: Arc<Probe>,
    transactional: bool,
}

impl MockOutput {
    pub fn new(probe: &Arc<Probe>) -> Self {
        Self {
            probe: Arc::clone(probe),
            transactional: false,
        }
    }

    pub fn transactional(probe: &Arc<Probe>) -> Self {
        Self {
            probe: Arc::clone(probe),
            transactional: true,
        }
    }
}

impl OutputModule for MockOutput {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn begin_transaction(&mut self) -> Result<(), ModuleError> {
        self.probe.pending.lock().clear();
        Ok(())
    }

    fn deliver(&mut self, params: &ActionParams) -> Result<(), ModuleError> {
        let probe = &self.probe;
        let active = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_active.fetch_max(active, Ordering::SeqCst);
        probe.deliver_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *probe.delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let outcome = Probe::next(&probe.deliver_script);
        if outcome.is_ok() {
            let text = render(params);
            if self.transactional {
                probe.pending.lock().push(text);
            } else {
                probe.delivered.lock().push(text);
            }
        }

        probe.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn commit(&mut self) -> Result<(), ModuleError> {
        self.probe.commits.fetch_add(1, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.probe.pending.lock());
        self.probe.delivered.lock().extend(pending);
        Ok(())
    }

    fn try_resume(&mut self) -> Result<(), ModuleError> {
        self.probe.resume_calls.fetch_add(1, Ordering::SeqCst);
        Probe::next(&self.probe.resume_script)
    }

    fn on_reload_signal(&mut self) -> Result<(), ModuleError> {
        self.probe.reloads.fetch_add(1, Ordering::SeqCst);
        Probe::next(&self.probe.reload_script)
    }
}

fn render(params: &ActionParams) -> String {
    match params {
        ActionParams::Record(record) => record.message.clone(),
        ActionParams::Strings(strings) => strings.join("|"),
        ActionParams::Arrays(arrays) => format!("{arrays:?}"),
    }
}

pub fn transient() -> Result<(), ModuleError> {
    Err(ModuleError::Transient("connection refused".to_string()))
}

pub fn fatal() -> Result<(), ModuleError> {
    Err(ModuleError::Fatal("permission denied".to_string()))
}

pub fn record(message: &str) -> Arc<LogRecord> {
    Arc::new(LogRecord::new("host", "app:", message))
}

/// Configuration handing whole records to the module
pub fn config() -> ActionConfig {
    ActionConfig {
        param_passing: ParamPassing::Record,
        ..ActionConfig::default()
    }
}

/// Everything an action under test is wired to
pub struct Harness {
    pub probe: Arc<Probe>,
    pub clock: Arc<ManualClock>,
    pub shutdown: Arc<ShutdownSignal>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            probe: Probe::new(),
            clock: Arc::new(ManualClock::default()),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn builder(&self, name: &str, config: ActionConfig) -> ActionBuilder {
        ActionBuilder::new(name)
            .config(config)
            .module(MockOutput::new(&self.probe))
            .clock(self.clock.clone())
            .shutdown(Arc::clone(&self.shutdown))
    }

    pub fn action(&self, config: ActionConfig) -> Action {
        self.builder("test", config)
            .finalize(ActionDefaults::default(), &TemplateRegistry::new())
            .unwrap()
    }

    pub fn transactional_action(&self, config: ActionConfig) -> Action {
        self.builder("test", config)
            .module(MockOutput::transactional(&self.probe))
            .finalize(ActionDefaults::default(), &TemplateRegistry::new())
            .unwrap()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
