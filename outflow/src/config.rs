//! Daemon configuration file.
//!
//! ```ron
//! (
//!     hostname: "web01",
//!     mark_interval_secs: 1200,
//!     repeat_flush_secs: 30,
//!     resume_retry_count: Some(Limited(3)),
//!     templates: {
//!         "Short": "%tag%%msg%\n",
//!     },
//!     actions: [
//!         (
//!             name: "messages",
//!             output: File("/var/log/outflow/messages"),
//!             settings: (templates: ["Short"], reduce_repeated: true),
//!         ),
//!         (name: "sink", output: Discard),
//!     ],
//! )
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::AHashMap;
use outflow_action::{
    ActionBuilder, ActionConfig, Clock, ConfigError, OutputModule, RetryBudget, ShutdownSignal,
    StateHandle, TemplateRegistry,
    modules::{DiscardOutput, FileOutput},
};
use serde::Deserialize;

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

const fn default_mark_interval() -> u64 {
    1200
}

const fn default_repeat_flush() -> u64 {
    30
}

/// Where an action delivers to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum OutputKind {
    File(PathBuf),
    Discard,
}

impl OutputKind {
    fn module(&self) -> Box<dyn OutputModule> {
        match self {
            Self::File(path) => Box::new(FileOutput::new(path.clone())),
            Self::Discard => Box::new(DiscardOutput),
        }
    }
}

/// One configured action
#[derive(Debug, Clone, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub output: OutputKind,
    #[serde(default)]
    pub settings: ActionConfig,
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Hostname stamped on records read from input
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Seconds between mark records, 0 disables them
    #[serde(default = "default_mark_interval")]
    pub mark_interval_secs: u64,

    /// Seconds between flushes of owed "repeated N times" summaries, 0 disables them
    #[serde(default = "default_repeat_flush")]
    pub repeat_flush_secs: u64,

    /// Retry budget for actions that do not set their own
    #[serde(default)]
    pub resume_retry_count: Option<RetryBudget>,

    /// Named templates, in addition to the built-in ones
    #[serde(default)]
    pub templates: AHashMap<String, String>,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl DaemonConfig {
    /// Read and parse the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid RON.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }

    /// Parse a configuration from RON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn parse(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(content)
    }

    /// The built-in templates plus the configured ones.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured template does not parse.
    pub fn template_registry(&self) -> Result<TemplateRegistry, ConfigError> {
        let mut registry = TemplateRegistry::new();
        for (name, source) in &self.templates {
            registry.insert(name, source)?;
        }
        Ok(registry)
    }

    /// Builders for every configured action, in configuration order.
    ///
    /// The failover gate is not wired here; see [`with_previous`].
    pub fn builders<'a>(
        &'a self,
        clock: &'a Arc<dyn Clock>,
        shutdown: &'a Arc<ShutdownSignal>,
    ) -> impl Iterator<Item = (&'a ActionDefinition, ActionBuilder)> + 'a {
        self.actions.iter().map(move |definition| {
            let builder = ActionBuilder::new(definition.name.clone())
                .config(definition.settings.clone())
                .boxed_module(definition.output.module())
                .clock(Arc::clone(clock))
                .shutdown(Arc::clone(shutdown));
            (definition, builder)
        })
    }
}

/// Let `builder` watch the action bound just before it, if there is one
#[must_use]
pub fn with_previous(builder: ActionBuilder, previous: Option<&StateHandle>) -> ActionBuilder {
    match previous {
        Some(previous) => builder.previous(Arc::clone(previous)),
        None => builder,
    }
}

/// Find the configuration file using the following precedence:
/// 1. The `--config` command line argument
/// 2. `OUTFLOW_CONFIG` environment variable
/// 3. ./outflow.config.ron (current working directory)
/// 4. /etc/outflow/outflow.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if an explicitly named file does not exist, or if none
/// of the default locations holds a configuration.
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var("OUTFLOW_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "OUTFLOW_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./outflow.config.ron"),
        PathBuf::from("/etc/outflow/outflow.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config argument\n  - OUTFLOW_CONFIG environment variable\n{paths_tried}"
    )
}
