//! Background loops.
//!
//! One supervised scheduler drives the periodic maintenance tasks:
//! subscription renewal, stale-trigger expiry, event and temp-token
//! cleanup, failed-registration retries, and redelivery of events the
//! queue never picked up. Every task captures its own errors and reports a
//! stats tuple to the metrics collector.

use crate::queue::NormalizedEvent;
use crate::state::SharedState;
use crate::triggers::{MAX_REGISTRATION_RETRIES, apply_registration, reregister_trigger, renew_trigger};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use toolgate_core::types::TriggerStatus;
use tracing::{error, info, warn};

/// Events remain PENDING this long before the redelivery loop retries them.
const REDELIVERY_GRACE_SECS: i64 = 60;
/// Rows deleted per cleanup batch.
const CLEANUP_BATCH_SIZE: usize = 500;

/// Outcome counts one background task reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobStats {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Spawn the periodic schedulers. Returned handles live as long as the
/// process.
pub fn spawn_background_jobs(state: SharedState) -> Vec<tokio::task::JoinHandle<()>> {
    let renewal_state = state.clone();
    let renewal_interval = Duration::from_secs(state.config.renewal_interval_secs);
    let renewal = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(renewal_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_renewal_cycle(&renewal_state).await;
        }
    });

    let cleanup_state = state.clone();
    let cleanup_interval = Duration::from_secs(state.config.cleanup_interval_secs);
    let cleanup = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_cleanup_cycle(&cleanup_state).await;
        }
    });

    vec![renewal, cleanup]
}

/// The renewal-cadence tasks, each isolated from the others' failures.
pub async fn run_renewal_cycle(state: &SharedState) {
    let stats = renew_expiring(state).await;
    report(state, "renew_expiring", stats);

    let stats = retry_failed_registrations(state).await;
    report(state, "retry_failed_registrations", stats);

    let stats = redeliver_pending_events(state).await;
    report(state, "redeliver_pending_events", stats);
}

/// The cleanup-cadence tasks.
pub async fn run_cleanup_cycle(state: &SharedState) {
    let now = Utc::now();

    match state.store.expire_stale_triggers(now) {
        Ok(count) if count > 0 => {
            info!(count, "marked stale triggers EXPIRED");
            state
                .metrics
                .increment_counter("triggers_expired", count as f64, &[]);
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "expire_stale_triggers failed"),
    }

    match state.store.cleanup_expired_events(now, CLEANUP_BATCH_SIZE) {
        Ok(count) if count > 0 => {
            info!(count, "deleted expired trigger events");
            state
                .metrics
                .increment_counter("trigger_events_expired", count as f64, &[]);
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "cleanup_expired_events failed"),
    }

    match state.store.cleanup_expired_oauth1_tokens(now) {
        Ok(count) if count > 0 => {
            info!(count, "deleted expired OAuth1 temp tokens");
            state
                .metrics
                .increment_counter("oauth1_temp_tokens_expired", count as f64, &[]);
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "cleanup_oauth1_temp_tokens failed"),
    }
}

/// Renew ACTIVE triggers whose subscriptions expire within 24 hours.
pub async fn renew_expiring(state: &SharedState) -> JobStats {
    let mut stats = JobStats::default();
    let expires_before = Utc::now() + ChronoDuration::hours(24);
    let expiring = match state.store.get_expiring_triggers(expires_before) {
        Ok(triggers) => triggers,
        Err(e) => {
            error!(error = %e, "failed to load expiring triggers");
            return stats;
        }
    };

    for trigger in expiring {
        let result = renew_trigger(state, &trigger).await;
        if result.success {
            if let Some(external_id) = &result.external_webhook_id {
                let _ = state
                    .store
                    .update_trigger_external_id(trigger.id, external_id);
            }
            if let Some(expires_at) = result.expires_at {
                let _ = state.store.update_trigger_expires_at(trigger.id, expires_at);
            }
            stats.succeeded += 1;
            info!(trigger_id = %trigger.id, "renewed webhook subscription");
        } else if result.error_message.as_deref() == Some("no connector registered") {
            stats.skipped += 1;
        } else {
            let _ = state
                .store
                .update_trigger_status(trigger.id, TriggerStatus::Error);
            stats.failed += 1;
            warn!(
                trigger_id = %trigger.id,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "webhook renewal failed"
            );
        }
    }
    stats
}

/// Retry registration for recently failed triggers, up to the retry cap.
pub async fn retry_failed_registrations(state: &SharedState) -> JobStats {
    let mut stats = JobStats::default();
    let cutoff = Utc::now() - ChronoDuration::hours(24);
    let error_triggers = match state.store.get_error_triggers_since(cutoff) {
        Ok(triggers) => triggers,
        Err(e) => {
            error!(error = %e, "failed to load error triggers");
            return stats;
        }
    };

    for trigger in error_triggers {
        if trigger.retry_count() >= MAX_REGISTRATION_RETRIES {
            stats.skipped += 1;
            continue;
        }
        let result = reregister_trigger(state, &trigger).await;
        let success = result.success;
        if let Err(e) = apply_registration(state, &trigger, &result) {
            error!(trigger_id = %trigger.id, error = %e, "failed to persist retry outcome");
        }
        if success {
            stats.succeeded += 1;
            info!(trigger_id = %trigger.id, "registration retry succeeded");
        } else {
            stats.failed += 1;
        }
    }
    stats
}

/// Re-enqueue PENDING events the delivery worker never received.
pub async fn redeliver_pending_events(state: &SharedState) -> JobStats {
    let mut stats = JobStats::default();
    let received_before = Utc::now() - ChronoDuration::seconds(REDELIVERY_GRACE_SECS);
    let pending = match state
        .store
        .get_pending_events(received_before, CLEANUP_BATCH_SIZE)
    {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "failed to load pending events");
            return stats;
        }
    };

    for event in pending {
        let provider = state
            .store
            .get_trigger(event.trigger_id)
            .ok()
            .flatten()
            .and_then(|trigger| {
                state
                    .store
                    .get_app_by_id(trigger.app_id)
                    .ok()
                    .flatten()
                    .and_then(|app| state.connectors.get(&app.name))
            })
            .map(|connector| connector.provider().to_string());
        let Some(provider) = provider else {
            stats.skipped += 1;
            continue;
        };

        let enqueued = state.queue.enqueue(NormalizedEvent {
            provider,
            event_type: event.event_type.clone(),
            subject_id: event.trigger_id,
            event_id: event.id,
            timestamp: event.received_at,
            data: event.event_data.clone(),
        });
        match enqueued {
            Ok(()) => stats.succeeded += 1,
            Err(_) => {
                stats.failed += 1;
                break;
            }
        }
    }
    stats
}

fn report(state: &SharedState, task: &str, stats: JobStats) {
    if stats != JobStats::default() {
        info!(
            task,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "background task completed"
        );
    }
    state.metrics.increment_counter(
        "background_task_runs",
        1.0,
        &[("task", task)],
    );
    state.metrics.set_gauge(
        "background_task_failed",
        stats.failed as f64,
        &[("task", task)],
    );
}
