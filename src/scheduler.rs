//! In-process scheduler: fires each workflow on its cron interval.
//!
//! Guarantees:
//! - at most one active run per workflow; a trigger that finds a run in
//!   progress is skipped,
//! - runs of different workflows never overlap on the shared output
//!   directory,
//! - every run is bounded by its workflow timeout (see [`run_workflow`]).

use chrono::{DateTime, SecondsFormat, Utc};
use cron::Schedule as CronSchedule;
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::workflow::{run_workflow, RunReport, Services, Workflow, WorkflowError};

/// When a workflow fires.
#[derive(Debug, Clone)]
pub enum Interval {
    Cron {
        /// As written in the manifest.
        expr: String,
        schedule: Box<CronSchedule>,
    },
    /// Only runs when triggered explicitly.
    Once,
}

impl Interval {
    /// Accepts 5-field cron, 6/7-field cron (with seconds), the `@hourly`
    /// style presets, and `@once` / `None` for unscheduled workflows.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let expanded = match trimmed {
            "" | "@once" | "None" | "none" => return Ok(Interval::Once),
            "@hourly" => "0 0 * * * *".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@quarterly" => "0 0 0 1 */3 *".to_string(),
            expr => match expr.split_whitespace().count() {
                // cron crate expects 6 or 7 fields (with seconds), so prepend "0" for 5-field
                5 => unix_to_cron(expr)?,
                6 | 7 => expr.to_string(),
                n => return Err(format!("expected 5 to 7 fields, found {n}")),
            },
        };
        let schedule = CronSchedule::from_str(&expanded).map_err(|e| e.to_string())?;
        Ok(Interval::Cron {
            expr: trimmed.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Interval::Cron { schedule, .. } => schedule.after(&after).next(),
            Interval::Once => None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Interval::Cron { .. })
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrites a 5-field unix cron expression into the 6-field form the `cron`
/// crate parses. Unix counts weekdays 0-7 from Sunday while the crate counts
/// 1-7, so numeric weekdays are rewritten to names.
fn unix_to_cron(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    };
    let weekday = weekday
        .split(',')
        .map(weekday_item)
        .collect::<Result<Vec<_>, _>>()?
        .join(",");
    Ok(format!("0 {minute} {hour} {day} {month} {weekday}"))
}

/// One list item of the weekday field. `*` and `*/n` select the same days in
/// both numberings and are kept; numeric values and ranges are expanded to
/// names. Items already using names pass through.
fn weekday_item(item: &str) -> Result<String, String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid weekday step in '{item}'"))?;
            if step == 0 {
                return Err(format!("invalid weekday step in '{item}'"));
            }
            (base, step)
        }
        None => (item, 1),
    };
    if base == "*" || !base.chars().any(|c| c.is_ascii_digit()) {
        return Ok(item.to_string());
    }

    let number = |raw: &str| -> Result<u32, String> {
        match raw.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(n),
            _ => Err(format!("invalid weekday '{raw}' in '{item}'")),
        }
    };
    let (start, end) = match base.split_once('-') {
        Some((start, end)) => (number(start)?, number(end)?),
        // `n/step` runs from n to the end of the week.
        None if step > 1 => (number(base)?, 6),
        None => {
            let n = number(base)?;
            (n, n)
        }
    };
    if start > end {
        return Err(format!("invalid weekday range in '{item}'"));
    }

    let mut names: Vec<&str> = Vec::new();
    for n in (start..=end).step_by(step as usize) {
        let name = WEEKDAYS[(n % 7) as usize];
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names.join(","))
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Cron { expr, .. } => f.write_str(expr),
            Interval::Once => f.write_str("@once"),
        }
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(RunReport),
    Failed(WorkflowError),
    /// A run of the same workflow was still active.
    Skipped,
}

struct ScheduledWorkflow {
    workflow: Workflow,
    active: Mutex<()>,
}

pub struct Scheduler {
    services: Services,
    output_dir: PathBuf,
    workflows: Vec<ScheduledWorkflow>,
    output_lock: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(services: Services, output_dir: PathBuf, workflows: Vec<Workflow>) -> Self {
        Self {
            services,
            output_dir,
            workflows: workflows
                .into_iter()
                .map(|workflow| ScheduledWorkflow {
                    workflow,
                    active: Mutex::new(()),
                })
                .collect(),
            output_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.iter().map(|sw| &sw.workflow)
    }

    /// Runs workflow `id` now. `None` when no such workflow exists.
    pub async fn trigger(&self, id: &str, execution_time: &str) -> Option<TriggerOutcome> {
        let sw = self.workflows.iter().find(|sw| sw.workflow.id == id)?;
        Some(self.trigger_workflow(sw, execution_time).await)
    }

    async fn trigger_workflow(&self, sw: &ScheduledWorkflow, execution_time: &str) -> TriggerOutcome {
        let Ok(_active) = sw.active.try_lock() else {
            warn!(workflow = %sw.workflow.id, execution_time, "[SCHED] Previous run still active, skipping");
            return TriggerOutcome::Skipped;
        };
        let _output = self.output_lock.lock().await;

        info!(workflow = %sw.workflow.id, execution_time, "[SCHED] Starting run");
        match run_workflow(&self.services, &self.output_dir, &sw.workflow, execution_time).await {
            Ok(report) => {
                info!(workflow = %sw.workflow.id, run_id = %report.run_id, "[SCHED] Run succeeded");
                TriggerOutcome::Completed(report)
            }
            Err(e) => {
                error!(
                    workflow = %sw.workflow.id,
                    stage = e.stage().map(|s| s.id()).unwrap_or("-"),
                    error = %e,
                    "[SCHED][ERROR] Run failed"
                );
                TriggerOutcome::Failed(e)
            }
        }
    }

    async fn drive(&self, sw: &ScheduledWorkflow) {
        loop {
            let now = Utc::now();
            let Some(next) = sw.workflow.interval.next_after(now) else {
                info!(workflow = %sw.workflow.id, "[SCHED] No upcoming fire time, not scheduling");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            info!(workflow = %sw.workflow.id, next = %next, "[SCHED] Next run scheduled");
            tokio::time::sleep(wait).await;

            let execution_time = next.to_rfc3339_opts(SecondsFormat::Micros, false);
            self.trigger_workflow(sw, &execution_time).await;
        }
    }

    /// Drives every scheduled workflow until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let scheduled: Vec<_> = self
            .workflows
            .iter()
            .filter(|sw| sw.workflow.interval.is_scheduled())
            .collect();
        info!(workflows = scheduled.len(), "[SCHED] Scheduler started");

        let loops = join_all(scheduled.into_iter().map(|sw| self.drive(sw)));
        tokio::select! {
            _ = loops => info!("[SCHED] All schedules exhausted"),
            _ = shutdown => info!("[SCHED] Shutdown requested"),
        }
    }
}
