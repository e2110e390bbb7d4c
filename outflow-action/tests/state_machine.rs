//! Retry, suspension and disabling of actions whose module fails

#![allow(clippy::unwrap_used)]

mod support;

use std::{sync::Arc, thread, time::Duration};

use outflow_action::{
    ActionBuilder, ActionConfig, ActionDefaults, ActionError, ActionState, ConfigError,
    Disposition, ModuleError, RetryBudget, TemplateRegistry,
};
use pretty_assertions::assert_eq;
use support::{Harness, MockOutput, Probe, config, fatal, record, transient};

fn retrying(budget: RetryBudget, interval_secs: u64) -> ActionConfig {
    ActionConfig {
        resume_retry_count: Some(budget),
        resume_interval_secs: interval_secs,
        ..config()
    }
}

#[test]
fn test_delivery_returns_to_ready() {
    let harness = Harness::new();
    let action = harness.action(config());

    assert_eq!(action.state(), ActionState::Ready);
    assert_eq!(action.execute(&record("one")), Ok(Disposition::Accepted));
    assert_eq!(action.execute(&record("two")), Ok(Disposition::Accepted));

    assert_eq!(action.state(), ActionState::Ready);
    assert_eq!(harness.probe.delivered(), vec!["one", "two"]);
    assert_eq!(action.stats().delivered, 2);
}

#[test]
fn test_transient_failure_retries_then_delivers() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    let action = harness.action(retrying(RetryBudget::Limited(3), 0));

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));

    let stats = action.stats();
    assert_eq!(stats.state, ActionState::Ready);
    assert_eq!(stats.retries_since_suspend, 0);
    assert_eq!(stats.resume_ok_in_row, 0);
    assert_eq!(stats.failures, 1);
    assert_eq!(harness.probe.delivered(), vec!["x"]);
    assert_eq!(harness.probe.resume_calls(), 1);
}

#[test]
fn test_retry_counter_resets_on_ready() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    harness.probe.script_resume([transient(), transient()]);
    let action = harness.action(retrying(RetryBudget::Limited(5), 10));

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));

    assert_eq!(harness.probe.resume_calls(), 3);
    let stats = action.stats();
    assert_eq!(stats.state, ActionState::Ready);
    assert_eq!(stats.retries_since_suspend, 0);
    assert_eq!(stats.suspensions, 0);
}

#[test]
fn test_exhausted_budget_suspends_until_deadline() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    harness
        .probe
        .script_resume([transient(), transient(), transient()]);
    let action = harness.action(retrying(RetryBudget::Limited(2), 30));

    assert_eq!(action.execute(&record("lost")), Ok(Disposition::Deferred));
    let stats = action.stats();
    assert_eq!(stats.state, ActionState::Suspended);
    assert_eq!(stats.suspensions, 1);
    assert_eq!(stats.retries_since_suspend, 0);
    assert!(stats.resume_at.is_some());

    // Before the deadline submissions fail fast without touching the module.
    assert_eq!(action.execute(&record("early")), Ok(Disposition::Deferred));
    assert_eq!(harness.probe.deliver_calls(), 1);
    assert_eq!(harness.probe.resume_calls(), 3);

    harness.advance(30);
    assert_eq!(action.execute(&record("late")), Ok(Disposition::Accepted));
    assert_eq!(action.state(), ActionState::Ready);
    assert_eq!(harness.probe.delivered(), vec!["late"]);
}

#[test]
fn test_failed_resume_after_suspension_reenters_retry() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    // Exhaust the budget, fail the resume after the deadline once, then recover.
    harness
        .probe
        .script_resume(std::iter::repeat_with(transient).take(4));
    let action = harness.action(retrying(RetryBudget::Limited(2), 5));

    assert_eq!(action.execute(&record("a")), Ok(Disposition::Deferred));
    assert_eq!(action.state(), ActionState::Suspended);

    harness.advance(5);
    assert_eq!(action.execute(&record("b")), Ok(Disposition::Accepted));
    assert_eq!(harness.probe.resume_calls(), 5);
    assert_eq!(action.stats().suspensions, 1);
    assert_eq!(harness.probe.delivered(), vec!["b"]);
}

#[test]
fn test_budget_counts_retries_after_the_resume_probe() {
    for (limit, attempts) in [(0, 1), (1, 2), (2, 3)] {
        let harness = Harness::new();
        harness.probe.script_deliver([transient()]);
        harness
            .probe
            .script_resume(std::iter::repeat_with(transient).take(10));
        let action = harness.action(retrying(RetryBudget::Limited(limit), 1));

        assert_eq!(action.execute(&record("x")), Ok(Disposition::Deferred));
        assert_eq!(action.state(), ActionState::Suspended);
        assert_eq!(
            harness.probe.resume_calls(),
            attempts,
            "budget Limited({limit})"
        );
    }
}

#[test]
fn test_unlimited_budget_never_suspends() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    harness
        .probe
        .script_resume(std::iter::repeat_with(transient).take(50));
    let action = harness.action(retrying(RetryBudget::Unlimited, 1));

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));

    let stats = action.stats();
    assert_eq!(stats.suspensions, 0);
    assert_eq!(stats.state, ActionState::Ready);
    assert_eq!(harness.probe.resume_calls(), 51);
    assert_eq!(harness.probe.delivered(), vec!["x"]);
}

#[test]
fn test_flapping_destination_is_disabled() {
    let harness = Harness::new();
    // Every resume reports success, every delivery right after it fails.
    harness
        .probe
        .script_deliver(std::iter::repeat_with(transient).take(20));
    let action = harness.action(ActionConfig {
        flap_threshold: 3,
        ..retrying(RetryBudget::Unlimited, 0)
    });

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Disabled));

    let stats = action.stats();
    assert_eq!(stats.state, ActionState::Dead);
    assert_eq!(stats.resume_ok_in_row, 4);
    assert_eq!(harness.probe.deliver_calls(), 5);

    assert_eq!(action.execute(&record("y")), Ok(Disposition::Disabled));
    assert_eq!(harness.probe.deliver_calls(), 5);
}

#[test]
fn test_flap_counter_resets_after_confirmed_delivery() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient(), transient()]);
    let action = harness.action(ActionConfig {
        flap_threshold: 3,
        ..retrying(RetryBudget::Unlimited, 0)
    });

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));
    assert_eq!(action.stats().resume_ok_in_row, 0);

    // A fresh run of failures starts counting from zero again.
    harness.probe.script_deliver([transient(), transient(), transient()]);
    assert_eq!(action.execute(&record("y")), Ok(Disposition::Accepted));
    assert_eq!(action.state(), ActionState::Ready);
}

#[test]
fn test_fatal_failure_disables_immediately() {
    let harness = Harness::new();
    harness.probe.script_deliver([fatal()]);
    let action = harness.action(retrying(RetryBudget::Unlimited, 0));

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Disabled));
    assert_eq!(action.state(), ActionState::Dead);
    assert_eq!(harness.probe.resume_calls(), 0);
}

#[test]
fn test_fatal_resume_disables() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    harness.probe.script_resume([fatal()]);
    let action = harness.action(retrying(RetryBudget::Limited(3), 0));

    assert_eq!(action.execute(&record("x")), Ok(Disposition::Disabled));
    assert_eq!(action.state(), ActionState::Dead);
}

#[test]
fn test_non_transactional_retry_skips_delivered_records() {
    let harness = Harness::new();
    let action = harness.action(ActionConfig {
        reduce_repeated: true,
        ..retrying(RetryBudget::Limited(1), 0)
    });

    for _ in 0..3 {
        action.execute(&record("same")).unwrap();
    }
    // The next record is preceded by the repeat summary in one batch; the
    // record itself fails once.
    harness.probe.script_deliver([Ok(()), transient()]);
    assert_eq!(action.execute(&record("other")), Ok(Disposition::Accepted));

    assert_eq!(
        harness.probe.delivered(),
        vec!["same", "last message repeated 2 times", "other"]
    );
    assert_eq!(harness.probe.deliver_calls(), 4);
}

#[test]
fn test_transactional_batch_is_replayed_whole() {
    let harness = Harness::new();
    let action = harness.transactional_action(ActionConfig {
        reduce_repeated: true,
        ..retrying(RetryBudget::Limited(1), 0)
    });

    for _ in 0..3 {
        action.execute(&record("same")).unwrap();
    }
    harness.probe.script_deliver([Ok(()), transient()]);
    assert_eq!(action.execute(&record("other")), Ok(Disposition::Accepted));

    assert_eq!(
        harness.probe.delivered(),
        vec!["same", "last message repeated 2 times", "other"]
    );
    // One commit for "same", one for the replayed batch.
    assert_eq!(harness.probe.commits(), 2);
    assert_eq!(harness.probe.deliver_calls(), 5);
    assert_eq!(action.state(), ActionState::Ready);
}

#[test]
fn test_shutdown_aborts_without_counting() {
    let harness = Harness::new();
    let action = harness.action(retrying(RetryBudget::Limited(2), 0));
    let before = action.stats();

    harness.shutdown.trigger();
    assert_eq!(action.execute(&record("x")), Err(ActionError::ShutdownAbort));

    assert_eq!(action.stats(), before);
    assert_eq!(harness.probe.deliver_calls(), 0);
}

#[test]
fn test_shutdown_interrupts_retry_wait() {
    let probe = Probe::new();
    probe.script_deliver([transient()]);
    probe.script_resume([transient()]);
    let shutdown = outflow_action::ShutdownSignal::new();

    // Wall clock: the second retry would only come after a minute.
    let action = Arc::new(
        ActionBuilder::new("slow")
            .config(retrying(RetryBudget::Unlimited, 60))
            .module(MockOutput::new(&probe))
            .shutdown(Arc::clone(&shutdown))
            .finalize(ActionDefaults::default(), &TemplateRegistry::new())
            .unwrap(),
    );

    let worker = thread::spawn({
        let action = Arc::clone(&action);
        move || action.execute(&support::record("x"))
    });

    assert!(support::wait_for(Duration::from_secs(5), || probe.resume_calls() == 1));
    thread::sleep(Duration::from_millis(50));
    shutdown.trigger();

    assert_eq!(worker.join().unwrap(), Err(ActionError::ShutdownAbort));
    let stats = action.stats();
    assert_eq!(stats.state, ActionState::Retrying);
    assert_eq!(stats.retries_since_suspend, 1);
    assert_eq!(probe.resume_calls(), 1);
}

#[test]
fn test_hup_failure_leaves_state_alone() {
    let harness = Harness::new();
    let action = harness.action(config());

    assert_eq!(action.call_hup_handler(), Ok(()));
    harness
        .probe
        .script_reload([Err(ModuleError::Transient("reopen failed".to_string()))]);
    assert_eq!(
        action.call_hup_handler(),
        Err(ActionError::Transient("reopen failed".to_string()))
    );

    assert_eq!(harness.probe.reloads(), 2);
    assert_eq!(action.state(), ActionState::Ready);
    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));
}

#[test]
fn test_destruct_is_idempotent() {
    let harness = Harness::new();
    let action = harness.action(config());

    action.destruct();
    action.destruct();

    assert!(action.is_destructed());
    assert_eq!(action.execute(&record("x")), Ok(Disposition::Disabled));
    assert_eq!(action.call_hup_handler(), Ok(()));
}

#[test]
fn test_finalize_rejects_bad_bindings() {
    let harness = Harness::new();
    let templates = TemplateRegistry::new();

    let missing = ActionBuilder::new("bare").finalize(ActionDefaults::default(), &templates);
    assert_eq!(
        missing.map(|_| ()),
        Err(ConfigError::MissingModule("bare".to_string()))
    );

    let unknown = harness
        .builder(
            "fmt",
            ActionConfig {
                templates: vec!["NoSuchFormat".to_string()],
                ..ActionConfig::default()
            },
        )
        .finalize(ActionDefaults::default(), &templates);
    assert_eq!(
        unknown.map(|_| ()),
        Err(ConfigError::UnknownTemplate("NoSuchFormat".to_string()))
    );

    let orphan = harness
        .builder(
            "failover",
            ActionConfig {
                exec_only_when_previous_suspended: true,
                ..config()
            },
        )
        .finalize(ActionDefaults::default(), &templates);
    assert_eq!(
        orphan.map(|_| ()),
        Err(ConfigError::MissingPrevious("failover".to_string()))
    );

    let empty = harness
        .builder(
            "empty",
            ActionConfig {
                templates: Vec::new(),
                ..ActionConfig::default()
            },
        )
        .finalize(ActionDefaults::default(), &templates);
    assert!(matches!(
        empty,
        Err(ConfigError::InvalidSetting {
            field: "templates",
            ..
        })
    ));
}

#[test]
fn test_registry_default_applies_without_own_budget() {
    let harness = Harness::new();
    harness.probe.script_deliver([transient()]);
    harness.probe.script_resume([transient()]);

    let action = harness
        .builder(
            "inherits",
            ActionConfig {
                resume_interval_secs: 0,
                ..config()
            },
        )
        .finalize(
            ActionDefaults {
                resume_retry_count: RetryBudget::Unlimited,
            },
            &TemplateRegistry::new(),
        )
        .unwrap();

    assert_eq!(action.retry_budget(), RetryBudget::Unlimited);
    assert_eq!(action.execute(&record("x")), Ok(Disposition::Accepted));
    assert_eq!(action.stats().suspensions, 0);
}
