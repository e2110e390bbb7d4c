//! Versioned collection of actions.
//!
//! Every configuration load builds a new generation of actions inside a
//! scope. While the scope is open the current generation keeps serving;
//! closing the scope publishes the new generation and retires the old one.
//! A retired generation is destructed once nobody holds it any more, so
//! records already handed to it finish their delivery.
//!
//! ```text
//! new_scope()       bind() ...          restore_scope()        reap()
//!     │                 │                     │                   │
//!     v                 v                     v                   v
//! [active: g1]    [active: g1]          [active: g2]         [active: g2]
//!                 [building: g2]        [retired: g1]        [retired: -]
//! ```

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use outflow_common::tracing::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    action::{Action, ActionBuilder},
    error::ConfigError,
    policy::RetryBudget,
    template::TemplateRegistry,
};

/// Registry-wide values an action captures when it is bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionDefaults {
    /// Budget for actions that do not configure their own
    pub resume_retry_count: RetryBudget,
}

/// One published set of actions
#[derive(Debug)]
pub struct Generation {
    id: u64,
    actions: Vec<Arc<Action>>,
}

impl Generation {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Action>> {
        self.actions.iter().find(|action| action.name() == name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Destruct every action, in configuration order
    pub fn destruct(&self) {
        for action in &self.actions {
            action.destruct();
        }
    }
}

#[derive(Debug)]
struct Scope {
    id: u64,
    actions: Vec<Arc<Action>>,
}

#[derive(Debug)]
pub struct ActionRegistry {
    retry_default: OnceLock<RetryBudget>,
    bound: AtomicBool,
    next_id: AtomicU64,
    active: RwLock<Arc<Generation>>,
    building: Mutex<Option<Scope>>,
    retired: Mutex<Vec<Arc<Generation>>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Start with an empty active generation
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_default: OnceLock::new(),
            bound: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            active: RwLock::new(Arc::new(Generation {
                id: 0,
                actions: Vec::new(),
            })),
            building: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Set the retry budget for actions that do not configure one.
    ///
    /// # Errors
    ///
    /// Returns an error if the default was set before, or if any action has
    /// already been bound through this registry.
    pub fn set_resume_retry_default(&self, budget: RetryBudget) -> Result<(), ConfigError> {
        if self.bound.load(Ordering::Acquire) {
            return Err(ConfigError::DefaultAfterBind);
        }

        self.retry_default
            .set(budget)
            .map_err(|_| ConfigError::DefaultAlreadySet)?;
        debug!(?budget, "Resume retry default set");
        Ok(())
    }

    pub fn defaults(&self) -> ActionDefaults {
        ActionDefaults {
            resume_retry_count: self.retry_default.get().copied().unwrap_or_default(),
        }
    }

    /// Open a scope that collects the next generation.
    ///
    /// # Errors
    ///
    /// Returns an error if a scope is already open.
    pub fn new_scope(&self) -> Result<u64, ConfigError> {
        let mut building = self.building.lock();
        if building.is_some() {
            return Err(ConfigError::ScopeAlreadyOpen);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *building = Some(Scope {
            id,
            actions: Vec::new(),
        });
        debug!(generation = id, "Configuration scope opened");
        Ok(id)
    }

    /// Finalize `builder` and add the action to the open scope.
    ///
    /// # Errors
    ///
    /// Returns an error if no scope is open or the action fails to bind.
    pub fn bind(
        &self,
        builder: ActionBuilder,
        templates: &TemplateRegistry,
    ) -> Result<Arc<Action>, ConfigError> {
        let mut building = self.building.lock();
        let scope = building.as_mut().ok_or(ConfigError::NoOpenScope)?;

        self.bound.store(true, Ordering::Release);
        let action = Arc::new(builder.finalize(self.defaults(), templates)?);
        scope.actions.push(Arc::clone(&action));
        Ok(action)
    }

    /// Close the open scope: publish its generation and retire the active one.
    ///
    /// # Errors
    ///
    /// Returns an error if no scope is open.
    pub fn restore_scope(&self) -> Result<Arc<Generation>, ConfigError> {
        let scope = self
            .building
            .lock()
            .take()
            .ok_or(ConfigError::NoOpenScope)?;
        let generation = Arc::new(Generation {
            id: scope.id,
            actions: scope.actions,
        });

        let previous = std::mem::replace(&mut *self.active.write(), Arc::clone(&generation));
        info!(
            generation = generation.id,
            actions = generation.len(),
            retired = previous.id,
            "Configuration generation active"
        );
        if !previous.is_empty() {
            self.retired.lock().push(previous);
        }

        Ok(generation)
    }

    /// Drop the open scope and destruct what was bound in it. The active generation is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if no scope is open.
    pub fn abandon_scope(&self) -> Result<(), ConfigError> {
        let scope = self
            .building
            .lock()
            .take()
            .ok_or(ConfigError::NoOpenScope)?;

        warn!(
            generation = scope.id,
            actions = scope.actions.len(),
            "Configuration scope abandoned"
        );
        for action in &scope.actions {
            action.destruct();
        }
        Ok(())
    }

    /// The generation currently serving records
    pub fn active(&self) -> Arc<Generation> {
        Arc::clone(&self.active.read())
    }

    /// Destruct retired generations nobody holds any more. Returns how many were destructed.
    pub fn reap(&self) -> usize {
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|generation| {
            if Arc::strong_count(generation) > 1 {
                return true;
            }
            debug!(generation = generation.id, "Retired generation destructed");
            generation.destruct();
            false
        });
        before - retired.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Destruct every generation: the open scope, the retired ones and the active one
    pub fn shutdown(&self) {
        if let Some(scope) = self.building.lock().take() {
            for action in &scope.actions {
                action.destruct();
            }
        }

        for generation in self.retired.lock().drain(..) {
            generation.destruct();
        }
        self.active().destruct();
        info!("All actions destructed");
    }
}
