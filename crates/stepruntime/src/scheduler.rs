use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;
use stepcore::{Event, EventBus, StepDefinition, StepTrigger, TraceContext};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval applied to five-field cron expressions, which are not evaluated.
pub const DEGRADED_CRON_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted interval. Keeps `now + period` representable.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("schedule '{schedule_id}': invalid interval '{interval}': {reason}")]
    InvalidInterval {
        schedule_id: String,
        interval: String,
        reason: String,
    },

    #[error("{} schedule(s) failed to start: {}", .0.len(), describe(.0))]
    StartFailed(Vec<ScheduleError>),

    #[error("Scheduler is already running")]
    AlreadyRunning,
}

fn describe(errors: &[ScheduleError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl ScheduleError {
    /// Ids of the schedules this error is about.
    pub fn schedule_ids(&self) -> Vec<&str> {
        match self {
            ScheduleError::InvalidInterval { schedule_id, .. } => vec![schedule_id.as_str()],
            ScheduleError::StartFailed(errors) => errors.iter().flat_map(|e| e.schedule_ids()).collect(),
            ScheduleError::AlreadyRunning => Vec::new(),
        }
    }
}

/// Parsed form of a schedule's interval string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSpec {
    pub period: Duration,
    /// Set when a cron expression was replaced by [`DEGRADED_CRON_INTERVAL`].
    pub degraded: bool,
}

impl IntervalSpec {
    pub fn millis(&self) -> u64 {
        self.period.as_millis() as u64
    }
}

/// Parse `<integer><s|m|h|d>`, e.g. `30s` or `2h`.
///
/// A string of five whitespace-separated fields is taken as a cron
/// expression and runs hourly instead.
pub fn parse_interval(raw: &str) -> Result<IntervalSpec, String> {
    let spec = raw.trim();

    if spec.split_whitespace().count() == 5 {
        return Ok(IntervalSpec {
            period: DEGRADED_CRON_INTERVAL,
            degraded: true,
        });
    }

    let unit = spec.chars().last().ok_or_else(|| "empty interval".to_string())?;
    let digits = &spec[..spec.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("expected <integer><s|m|h|d>".to_string());
    }

    let count: u64 = digits.parse().map_err(|_| "number out of range".to_string())?;
    if count == 0 {
        return Err("interval must be greater than zero".to_string());
    }

    let unit_secs = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        other => return Err(format!("unknown unit '{}'", other)),
    };
    let secs = count
        .checked_mul(unit_secs)
        .ok_or_else(|| "number out of range".to_string())?;

    let period = Duration::from_secs(secs);
    if period > MAX_INTERVAL {
        return Err("interval is longer than 366 days".to_string());
    }

    Ok(IntervalSpec {
        period,
        degraded: false,
    })
}

/// One schedule as the scheduler sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDefinition {
    /// Id of the step declaring the schedule.
    pub id: String,
    pub interval: String,
    pub event_type: String,
    pub flows: BTreeSet<String>,
}

impl ScheduleDefinition {
    pub fn from_step(step: &StepDefinition) -> Option<Self> {
        match &step.trigger {
            StepTrigger::Schedule { interval, event_type } => Some(Self {
                id: step.id.clone(),
                interval: interval.clone(),
                event_type: event_type.clone(),
                flows: step.flows.clone(),
            }),
            _ => None,
        }
    }

    /// The tick event published for this schedule.
    pub fn tick_event(&self) -> Event {
        Event::new(
            self.event_type.clone(),
            json!({
                "scheduledAt": Utc::now().to_rfc3339(),
                "scheduleId": self.id,
            }),
        )
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Turns schedule definitions into recurring bus events.
///
/// Every schedule runs on its own timer task. A tick publishes and moves on;
/// delivery happens on a spawned round, so slow handlers never delay the next tick.
pub struct Scheduler {
    bus: EventBus,
    schedules: Vec<ScheduleDefinition>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(bus: EventBus, schedules: Vec<ScheduleDefinition>) -> Self {
        Self {
            bus,
            schedules,
            running: Mutex::new(None),
        }
    }

    pub fn schedules(&self) -> &[ScheduleDefinition] {
        &self.schedules
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Activate every schedule with a valid interval.
    ///
    /// Schedules whose interval does not parse are left inactive and reported
    /// together in [`ScheduleError::StartFailed`]; the valid ones keep running.
    pub fn start(&self) -> Result<(), ScheduleError> {
        let mut running = self.lock();
        if running.is_some() {
            return Err(ScheduleError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut failures = Vec::new();

        for schedule in &self.schedules {
            let spec = match parse_interval(&schedule.interval) {
                Ok(spec) => spec,
                Err(reason) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        interval = %schedule.interval,
                        %reason,
                        "Invalid schedule interval"
                    );
                    failures.push(ScheduleError::InvalidInterval {
                        schedule_id: schedule.id.clone(),
                        interval: schedule.interval.clone(),
                        reason,
                    });
                    continue;
                }
            };

            if spec.degraded {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    interval = %schedule.interval,
                    "Cron expressions are not supported; running every hour instead"
                );
            }

            tracing::info!(
                schedule_id = %schedule.id,
                event_type = %schedule.event_type,
                period_ms = spec.millis(),
                "Starting schedule"
            );
            tasks.push(tokio::spawn(run_schedule(
                self.bus.clone(),
                schedule.clone(),
                spec.period,
                cancel.child_token(),
            )));
        }

        *running = Some(Running { cancel, tasks });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ScheduleError::StartFailed(failures))
        }
    }

    /// Deactivate all schedules. No tick is published once this returns.
    pub async fn stop(&self) {
        let running = self.lock().take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Schedule task failed: {}", e);
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.cancel.cancel();
        }
    }
}

async fn run_schedule(bus: EventBus, schedule: ScheduleDefinition, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let trace = TraceContext::new()
                    .with_origin(schedule.id.clone())
                    .with_flows(schedule.flows.iter().cloned());
                tracing::debug!(
                    schedule_id = %schedule.id,
                    trace_id = %trace.trace_id,
                    event_type = %schedule.event_type,
                    "Schedule tick"
                );
                tokio::spawn(bus.publish(schedule.tick_event(), trace));
            }
        }
    }
}
