//! Schedule-trigger firing.
//!
//! Once a minute the scheduler walks the enabled schedule triggers and
//! fires those whose cron expression matched since the previous tick.
//! Idempotency keys are derived from the fire minute, so an overlapping
//! scheduler instance cannot double-dispatch a workflow run.

use berth_core::error::PlatformResult;
use berth_dispatch::model::TriggerConfig;
use berth_dispatch::validate::normalize_cron;
use berth_dispatch::{DispatchOutcome, Dispatcher};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Does the expression fire in `(after, until]`?
pub fn is_due(cron_expr: &str, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    let Ok(schedule) = cron::Schedule::from_str(&normalize_cron(cron_expr)) else {
        return false;
    };
    schedule
        .after(&after)
        .next()
        .map(|fire| fire <= until)
        .unwrap_or(false)
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Scheduler { dispatcher }
    }

    /// One tick: fire everything due in `(after, until]`.
    pub async fn tick(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> PlatformResult<u32> {
        let triggers = self
            .dispatcher
            .store()
            .triggers
            .list_enabled_schedules()
            .await?;
        let mut fired = 0;
        for trigger in triggers {
            let TriggerConfig::Schedule { cron, .. } = &trigger.config else {
                continue;
            };
            if !is_due(cron, after, until) {
                continue;
            }
            let fire_time = OffsetDateTime::from_unix_timestamp(until.timestamp())
                .unwrap_or_else(|_| OffsetDateTime::now_utc());
            match self.dispatcher.fire_schedule(&trigger, fire_time).await {
                Ok(DispatchOutcome::Deduplicated(_)) => {
                    log::debug!("scheduler: {} already fired this minute", trigger.id);
                }
                Ok(_) => fired += 1,
                Err(e) => {
                    log::warn!("scheduler: trigger {} failed: {e}", trigger.id);
                }
            }
        }
        Ok(fired)
    }

    /// Run forever on a one-minute cadence.
    pub async fn run(self) {
        let mut previous = Utc::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick establishes the baseline
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match self.tick(previous, now).await {
                Ok(fired) if fired > 0 => log::info!("scheduler: fired {fired} triggers"),
                Ok(_) => {}
                Err(e) => log::error!("scheduler tick failed: {e}"),
            }
            previous = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn daily_nine_oclock_fires_in_its_minute() {
        let expr = "0 9 * * *";
        assert!(is_due(expr, at(2026, 8, 1, 8, 59), at(2026, 8, 1, 9, 0)));
        assert!(!is_due(expr, at(2026, 8, 1, 9, 0), at(2026, 8, 1, 9, 1)));
        assert!(!is_due(expr, at(2026, 8, 1, 10, 0), at(2026, 8, 1, 10, 1)));
    }

    #[test]
    fn every_five_minutes() {
        let expr = "*/5 * * * *";
        assert!(is_due(expr, at(2026, 8, 1, 12, 4), at(2026, 8, 1, 12, 5)));
        assert!(!is_due(expr, at(2026, 8, 1, 12, 5), at(2026, 8, 1, 12, 6)));
    }

    #[test]
    fn bad_expressions_never_fire() {
        assert!(!is_due("garbage", at(2026, 8, 1, 0, 0), at(2026, 8, 2, 0, 0)));
    }
}
