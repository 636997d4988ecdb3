//! Cron-driven cycle scheduling with overlap skipping and execution windows.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::OptionFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{HostUpgradesError, Result};

/// Per-cycle context: when the cycle was scheduled, and until when it may
/// start upgrading.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl CycleContext {
    pub fn new(started_at: DateTime<Utc>, deadline: Option<Instant>) -> Self {
        Self {
            started_at,
            deadline,
        }
    }

    /// A cycle starting now, with no deadline.
    pub fn unbounded() -> Self {
        Self::new(Utc::now(), None)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail with [`HostUpgradesError::DeadlineExceeded`] once the window has
    /// closed. Checked before anything disruptive starts; an upgrade already
    /// running is never interrupted.
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(HostUpgradesError::DeadlineExceeded(
                format!("upgrade window for cycle scheduled at {} has closed", self.started_at),
            )),
            _ => Ok(()),
        }
    }
}

/// Parse a cron expression.
///
/// Standard 5-field expressions run at second zero; 6/7-field expressions
/// and `@daily`-style descriptors are passed through.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if !expression.starts_with('@') && expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| HostUpgradesError::Config(format!("invalid schedule {:?}: {}", expression, e)))
}

pub struct Scheduler {
    schedule: Option<Schedule>,
    window: Option<Duration>,
}

impl Scheduler {
    /// `window` bounds how long after its fire time a cycle may still start
    /// upgrading; `None` disables the deadline.
    pub fn new(expression: Option<&str>, window: Option<Duration>) -> Result<Self> {
        let schedule = expression.map(parse_schedule).transpose()?;
        Ok(Self { schedule, window })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.as_ref()?.after(&after).next()
    }

    /// Run `cycle` once without a schedule, or on every cron fire until a
    /// fatal error.
    ///
    /// Without a schedule the cycle result is returned as is. On a schedule,
    /// non-fatal cycle errors are logged and the next fire goes ahead.
    pub async fn run<F, Fut>(&self, cycle: F) -> Result<()>
    where
        F: FnMut(CycleContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Some(schedule) = &self.schedule else {
            info!("No schedule configured, running once");
            let mut cycle = cycle;
            return cycle(CycleContext::unbounded()).await;
        };

        if let Some(next) = self.next_after(Utc::now()) {
            info!(next = %next, "Scheduled upgrades");
        }

        self.run_with(cron_triggers(schedule.clone()), cycle).await
    }

    /// Drive `cycle` from an arbitrary stream of fire times.
    ///
    /// At most one cycle runs at a time: a fire arriving while a cycle is
    /// still running is dropped, not queued. Returns once the triggers end
    /// and the last cycle finished, or on the first fatal cycle error.
    pub async fn run_with<T, F, Fut>(&self, triggers: T, mut cycle: F) -> Result<()>
    where
        T: Stream<Item = DateTime<Utc>>,
        F: FnMut(CycleContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut triggers = std::pin::pin!(triggers.fuse());
        let mut running: Option<Pin<Box<Fut>>> = None;
        let mut triggers_done = false;

        loop {
            if triggers_done && running.is_none() {
                info!("Schedule ended");
                return Ok(());
            }

            tokio::select! {
                Some(result) = OptionFuture::from(running.as_mut()), if running.is_some() => {
                    running = None;

                    match result {
                        Ok(()) => debug!("Scheduled cycle finished"),
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Scheduled cycle failed fatally");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "Scheduled cycle failed"),
                    }
                }
                fire = triggers.next(), if !triggers_done => {
                    let Some(fire) = fire else {
                        triggers_done = true;
                        continue;
                    };

                    if running.is_some() {
                        warn!(scheduled_at = %fire, "Scheduler is busy, skipping scheduled run");
                        continue;
                    }

                    let ctx = self.context(fire);
                    info!(
                        scheduled_at = %fire,
                        window_seconds = self.window.map(|w| w.as_secs()),
                        "Starting scheduled upgrade cycle"
                    );
                    running = Some(Box::pin(cycle(ctx)));
                }
            }
        }
    }

    fn context(&self, fire: DateTime<Utc>) -> CycleContext {
        let deadline = self.window.map(|window| {
            let late = (Utc::now() - fire).to_std().unwrap_or_default();
            Instant::now() + window.saturating_sub(late)
        });
        CycleContext::new(fire, deadline)
    }
}

/// Fire times of `schedule`, each yielded once its time has come.
fn cron_triggers(schedule: Schedule) -> BoxStream<'static, DateTime<Utc>> {
    stream::unfold((schedule, Utc::now()), |(schedule, last)| async move {
        let next = schedule.after(&last).next()?;
        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;
        Some((next, (schedule, next)))
    })
    .boxed()
}
