// src/scheduler.rs

use crate::config::ConfigError;
use async_trait::async_trait;
use std::sync::Arc;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");
const OFFSET_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// A fixed wall-clock time, every day, at a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    time: Time,
    offset: UtcOffset,
}

impl DailySchedule {
    pub fn new(time: Time, offset: UtcOffset) -> Self {
        Self { time, offset }
    }

    /// Parse `"HH:MM"` and `"+HH:MM"` (or `"UTC"`).
    pub fn parse(time_text: &str, offset_text: &str) -> Result<Self, ConfigError> {
        let time = Time::parse(time_text.trim(), TIME_FORMAT).map_err(|e| {
            ConfigError::Invalid {
                key: "schedule.validation_time",
                reason: format!("{time_text:?}: {e}"),
            }
        })?;
        let offset_text = offset_text.trim();
        let offset = if offset_text.eq_ignore_ascii_case("utc") || offset_text == "Z" {
            UtcOffset::UTC
        } else {
            UtcOffset::parse(offset_text, OFFSET_FORMAT).map_err(|e| ConfigError::Invalid {
                key: "schedule.utc_offset",
                reason: format!("{offset_text:?}: {e}"),
            })?
        };
        Ok(Self { time, offset })
    }

    /// The first scheduled instant strictly after `now`.
    pub fn next_run_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let local = now.to_offset(self.offset);
        let today = local.date().with_time(self.time).assume_offset(self.offset);
        if today > local {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

/// Work the scheduler fires once per day.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self);
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for it to finish. A run in progress completes first.
    pub async fn stop(self) {
        if self.stop_tx.send(true).is_err() {
            warn!("Scheduler already exited");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
        info!("Scheduler stopped");
    }
}

pub fn spawn(schedule: DailySchedule, job: Arc<dyn ScheduledJob>) -> SchedulerHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let now = OffsetDateTime::now_utc();
            let next = schedule.next_run_after(now);
            let wait: std::time::Duration = (next - now).try_into().unwrap_or_default();
            info!(next_run = %next, wait_secs = wait.as_secs(), "Next validation run scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    info!("Scheduled validation run starting");
                    job.run().await;
                }
                _ = stop_rx.changed() => break,
            }
        }
    });
    SchedulerHandle { stop_tx, task }
}
