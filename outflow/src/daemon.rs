//! Daemon runtime.
//!
//! Input is read line by line on its own thread and every record is handed
//! to each action of the active generation. The async side only waits for
//! signals and the mark timer:
//!
//! - SIGHUP: forward the reload signal to every action
//! - SIGUSR1: re-read the configuration and swap in a new generation
//! - SIGTERM / CTRL+C: destruct all actions, a second CTRL+C aborts pending retries
//!
//! Mark records and the summaries owed for collapsed repeats go out on
//! their own timers.

use std::{
    io::BufRead,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use outflow_action::{
    ActionRegistry, Clock, ConfigError, Disposition, ShutdownSignal, SystemClock, TemplateRegistry,
};
use outflow_common::{
    LogRecord, internal,
    tracing::{debug, error, info, trace, warn},
};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::oneshot,
    time::{Instant, interval_at},
};

use crate::config::{DaemonConfig, with_previous};

#[derive(Debug)]
pub struct Daemon {
    config_path: PathBuf,
    hostname: String,
    mark_interval: Option<Duration>,
    repeat_flush_interval: Option<Duration>,
    registry: ActionRegistry,
    clock: Arc<dyn Clock>,
    shutdown: Arc<ShutdownSignal>,
}

impl Daemon {
    /// Load the configuration at `config_path` and bind its actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or any action fails to bind.
    pub fn start(config_path: PathBuf) -> anyhow::Result<Self> {
        let config = DaemonConfig::load(&config_path)?;
        Self::with_config(config_path, &config, Arc::new(SystemClock))
    }

    /// Bind the actions of an already parsed configuration.
    ///
    /// `config_path` is where [`reload`](Self::reload) reads the next configuration from.
    ///
    /// # Errors
    ///
    /// Returns an error if any action fails to bind.
    pub fn with_config(
        config_path: PathBuf,
        config: &DaemonConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let registry = ActionRegistry::new();
        if let Some(budget) = config.resume_retry_count {
            registry.set_resume_retry_default(budget)?;
        }

        let daemon = Self {
            config_path,
            hostname: config.hostname.clone(),
            mark_interval: (config.mark_interval_secs > 0)
                .then(|| Duration::from_secs(config.mark_interval_secs)),
            repeat_flush_interval: (config.repeat_flush_secs > 0)
                .then(|| Duration::from_secs(config.repeat_flush_secs)),
            registry,
            clock,
            shutdown: ShutdownSignal::new(),
        };
        daemon.load_generation(config)?;

        Ok(daemon)
    }

    pub const fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Re-read the configuration file and replace the active generation.
    ///
    /// The current generation keeps serving if the new one fails to bind.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or an action fails to bind.
    pub fn reload(&self) -> anyhow::Result<()> {
        let config = DaemonConfig::load(&self.config_path)?;
        if let Some(budget) = config.resume_retry_count
            && budget != self.registry.defaults().resume_retry_count
        {
            warn!(
                ?budget,
                "The resume retry default cannot change after startup, keeping the current one"
            );
        }

        let id = self.load_generation(&config)?;
        let released = self.registry.reap();
        internal!(
            level = INFO,
            "Configuration reloaded, generation {id} active, {released} retired generations released"
        );

        Ok(())
    }

    /// Hand `record` to every active action. Returns how many accepted it.
    pub fn dispatch(&self, record: &Arc<LogRecord>) -> usize {
        let generation = self.registry.active();
        let mut accepted = 0;

        for action in generation.actions() {
            match action.execute(record) {
                Ok(Disposition::Accepted) => accepted += 1,
                Ok(disposition) => {
                    trace!(action = action.name(), ?disposition, "Record not delivered");
                }
                Err(err) if err.is_shutdown() => break,
                Err(err) => {
                    warn!(action = action.name(), error = %err, "Record submission failed");
                }
            }
        }

        accepted
    }

    /// Parse one input line and dispatch it. Blank and malformed lines are skipped.
    pub fn dispatch_line(&self, line: &str) -> Option<usize> {
        if line.trim().is_empty() {
            return None;
        }

        match LogRecord::parse_line(&self.hostname, line) {
            Ok(record) => Some(self.dispatch(&Arc::new(record))),
            Err(err) => {
                warn!(error = %err, "Skipping malformed input line");
                None
            }
        }
    }

    /// Dispatch a mark record
    pub fn mark(&self) -> usize {
        self.dispatch(&Arc::new(LogRecord::mark(&self.hostname)))
    }

    /// Deliver the summaries owed for runs of repeated records. Returns how many were accepted.
    pub fn flush_repeated(&self) -> usize {
        let generation = self.registry.active();
        let mut flushed = 0;

        for action in generation.actions() {
            match action.flush_repeated() {
                Ok(Disposition::Accepted) => flushed += 1,
                Ok(_) => {}
                Err(err) if err.is_shutdown() => break,
                Err(err) => {
                    warn!(action = action.name(), error = %err, "Repeat summary not delivered");
                }
            }
        }

        flushed
    }

    /// Forward SIGHUP to every active action. Returns how many handlers failed.
    pub fn hangup(&self) -> usize {
        self.registry
            .active()
            .actions()
            .iter()
            .filter(|action| action.call_hup_handler().is_err())
            .count()
    }

    /// Log a statistics line for every active action
    pub fn report(&self) {
        for action in self.registry.active().actions() {
            let stats = action.stats();
            info!(
                action = %stats.name,
                state = %stats.state,
                delivered = stats.delivered,
                failures = stats.failures,
                suspensions = stats.suspensions,
                "Action statistics"
            );
        }
    }

    /// Destruct every action, delivering what is still queued
    pub fn stop(&self) {
        self.registry.shutdown();
    }

    /// Make pending retries and queued deliveries give up
    pub fn abort(&self) {
        self.shutdown.trigger();
    }

    /// Run until input ends or a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed or the input
    /// thread cannot be started.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut reload = signal(SignalKind::user_defined1())?;

        let (input_closed, mut input_done) = oneshot::channel();
        Arc::clone(&self).spawn_reader(input_closed)?;

        let mark_period = self.mark_interval.unwrap_or(Duration::from_secs(3600));
        let mut marks = interval_at(Instant::now() + mark_period, mark_period);
        let flush_period = self.repeat_flush_interval.unwrap_or(Duration::from_secs(3600));
        let mut flushes = interval_at(Instant::now() + flush_period, flush_period);

        internal!(
            level = INFO,
            "Daemon running with {} actions",
            self.registry.active().len()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
                    break;
                }
                _ = terminate.recv() => {
                    internal!(level = INFO, "Terminate Signal received, shutting down");
                    break;
                }
                _ = &mut input_done => {
                    internal!(level = INFO, "Input closed, shutting down");
                    break;
                }
                _ = hangup.recv() => {
                    let daemon = Arc::clone(&self);
                    let failed = tokio::task::spawn_blocking(move || daemon.hangup()).await?;
                    internal!(level = INFO, "SIGHUP forwarded to actions, {failed} handlers failed");
                }
                _ = reload.recv() => {
                    internal!(level = INFO, "Reload requested");
                    let daemon = Arc::clone(&self);
                    if let Err(err) = tokio::task::spawn_blocking(move || daemon.reload()).await? {
                        error!("Reload failed, keeping the current configuration: {err}");
                    }
                }
                _ = marks.tick(), if self.mark_interval.is_some() => {
                    let daemon = Arc::clone(&self);
                    drop(tokio::task::spawn_blocking(move || daemon.mark()));
                }
                _ = flushes.tick(), if self.repeat_flush_interval.is_some() => {
                    let daemon = Arc::clone(&self);
                    drop(tokio::task::spawn_blocking(move || daemon.flush_repeated()));
                }
            }
        }

        let mut drain = tokio::task::spawn_blocking({
            let daemon = Arc::clone(&self);
            move || {
                daemon.report();
                daemon.stop();
            }
        });

        tokio::select! {
            result = &mut drain => result?,
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "Forcing shutdown");
                self.abort();
                drain.await?;
            }
        }

        internal!(level = INFO, "Shutdown complete");
        Ok(())
    }

    fn load_generation(&self, config: &DaemonConfig) -> anyhow::Result<u64> {
        let templates = config.template_registry()?;
        self.registry.new_scope()?;

        if let Err(err) = self.bind_actions(config, &templates) {
            self.registry.abandon_scope()?;
            return Err(err.into());
        }

        Ok(self.registry.restore_scope()?.id())
    }

    fn bind_actions(
        &self,
        config: &DaemonConfig,
        templates: &TemplateRegistry,
    ) -> Result<(), ConfigError> {
        let mut previous = None;
        for (definition, builder) in config.builders(&self.clock, &self.shutdown) {
            let action = self
                .registry
                .bind(with_previous(builder, previous.as_ref()), templates)?;
            debug!(action = %definition.name, output = ?definition.output, "Action configured");
            previous = Some(action.state_handle());
        }
        Ok(())
    }

    fn spawn_reader(self: Arc<Self>, done: oneshot::Sender<()>) -> std::io::Result<()> {
        thread::Builder::new()
            .name("outflow-input".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(line) => {
                            self.dispatch_line(&line);
                        }
                        Err(err) => {
                            error!("Failed to read input: {err}");
                            break;
                        }
                    }

                    if self.shutdown.is_triggered() {
                        break;
                    }
                }

                if done.send(()).is_err() {
                    debug!("Input ended after the daemon stopped");
                }
            })?;

        Ok(())
    }
}
