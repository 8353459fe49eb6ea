//! Sync mode decision engine.
//!
//! Stateless policy choosing between a full resync, an incremental
//! (delta) sync, or skipping, given sync history and workload volume.
//! The only ambient input is the current time; [`decide_at`] takes it
//! explicitly for deterministic tests.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use time::OffsetDateTime;

/// Estimated minutes per item for a full sync pass.
const MINUTES_PER_ITEM: f64 = 0.05;
/// Delta passes pay a diffing overhead per item.
const DELTA_OVERHEAD: f64 = 1.5;
/// Hours in the 30-day month the change estimator assumes.
const HOURS_PER_MONTH: f64 = 30.0 * 24.0;

/// Sync strategy for the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Delta,
    Skip,
}

impl SyncMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
            Self::Skip => "skip",
        }
    }
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only sync history for one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncHistory {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync_time: Option<OffsetDateTime>,
    pub last_sync_type: Option<SyncMode>,
    pub last_sync_item_count: Option<u64>,
    pub last_sync_duration_secs: Option<u64>,
    /// Fraction of recent runs that failed, 0.0..=1.0.
    pub failure_rate: Option<f64>,
}

/// Read-only workload volume inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadMetrics {
    pub total_items: u64,
    /// Items touched in the last 30 days.
    pub recent_items: u64,
    pub upcoming_items: u64,
    pub average_items_per_month: f64,
}

/// Decision output; ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDecision {
    pub mode: SyncMode,
    pub reason: String,
    pub estimated_duration_min: u64,
    pub estimated_item_count: u64,
}

/// Decide the next sync mode using the current UTC time.
pub fn decide(
    history: &SyncHistory,
    metrics: &WorkloadMetrics,
    forced: Option<SyncMode>,
) -> SyncDecision {
    decide_at(OffsetDateTime::now_utc(), history, metrics, forced)
}

/// Decide the next sync mode at an explicit point in time.
///
/// Policy ladder, first match wins: forced mode, no history, stale
/// (>= 30 days), unreliable history (failure rate > 0.2), too recent
/// (< 1 hour), then a change-volume estimate picks skip/full/delta.
pub fn decide_at(
    now: OffsetDateTime,
    history: &SyncHistory,
    metrics: &WorkloadMetrics,
    forced: Option<SyncMode>,
) -> SyncDecision {
    if let Some(mode) = forced {
        let estimated_changes = estimate_changes(metrics, hours_since(now, history));
        return match mode {
            SyncMode::Full => full_decision(metrics, "user requested"),
            SyncMode::Delta => delta_decision(estimated_changes, "user requested"),
            SyncMode::Skip => skip_decision("user requested"),
        };
    }

    let Some(last_sync) = history.last_sync_time else {
        return full_decision(metrics, "no previous sync, initial full sync required");
    };

    let hours_since_sync = (now - last_sync).whole_seconds() as f64 / 3600.0;

    if hours_since_sync >= 30.0 * 24.0 {
        return full_decision(metrics, "stale history, full resync recommended");
    }

    if history.failure_rate.unwrap_or(0.0) > 0.2 {
        return full_decision(metrics, "high failure rate, full sync for reliability");
    }

    if hours_since_sync < 1.0 {
        return skip_decision("last sync too recent");
    }

    let estimated_changes = estimate_changes(metrics, Some(hours_since_sync));

    if estimated_changes < 10 && hours_since_sync < 24.0 {
        return skip_decision("too few estimated changes");
    }

    if estimated_changes > 100 {
        return full_decision(metrics, "too many estimated changes for efficient delta");
    }

    delta_decision(estimated_changes, "delta optimal")
}

fn hours_since(now: OffsetDateTime, history: &SyncHistory) -> Option<f64> {
    history
        .last_sync_time
        .map(|last| (now - last).whole_seconds() as f64 / 3600.0)
}

/// `ceil(avg_per_month / 720 * hours) + ceil(recent * 0.10)`.
///
/// Without history the recent-item churn term alone is used.
fn estimate_changes(metrics: &WorkloadMetrics, hours_since_sync: Option<f64>) -> u64 {
    let drift = hours_since_sync
        .map(|hours| (metrics.average_items_per_month / HOURS_PER_MONTH * hours).ceil())
        .unwrap_or(0.0);
    let churn = (metrics.recent_items as f64 * 0.10).ceil();
    (drift + churn) as u64
}

fn full_decision(metrics: &WorkloadMetrics, reason: &str) -> SyncDecision {
    SyncDecision {
        mode: SyncMode::Full,
        reason: reason.to_owned(),
        estimated_duration_min: (1.0 + metrics.total_items as f64 * MINUTES_PER_ITEM).ceil() as u64,
        estimated_item_count: metrics.total_items,
    }
}

fn delta_decision(estimated_changes: u64, reason: &str) -> SyncDecision {
    SyncDecision {
        mode: SyncMode::Delta,
        reason: reason.to_owned(),
        estimated_duration_min: (1.0
            + estimated_changes as f64 * MINUTES_PER_ITEM * DELTA_OVERHEAD)
            .ceil() as u64,
        estimated_item_count: estimated_changes,
    }
}

fn skip_decision(reason: &str) -> SyncDecision {
    SyncDecision {
        mode: SyncMode::Skip,
        reason: reason.to_owned(),
        estimated_duration_min: 0,
        estimated_item_count: 0,
    }
}

/// One finished sync run, input to [`analyze_performance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub sync_type: SyncMode,
    pub item_count: u64,
    pub duration_secs: u64,
    pub succeeded: bool,
}

/// Operator-facing summary of past runs. Reporting only, no decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub recommendation: String,
    pub average_duration_secs: f64,
    pub success_rate: f64,
    /// UTC hour with the most successful runs, ties resolved to the
    /// earliest hour.
    pub optimal_hour: Option<u8>,
}

/// Summarize past runs for operator tooling.
pub fn analyze_performance(runs: &[SyncRunSummary]) -> PerformanceReport {
    if runs.is_empty() {
        return PerformanceReport {
            recommendation: String::from("no sync history to analyze"),
            average_duration_secs: 0.0,
            success_rate: 0.0,
            optimal_hour: None,
        };
    }

    let total = runs.len() as f64;
    let succeeded = runs.iter().filter(|run| run.succeeded).count() as f64;
    let success_rate = succeeded / total;
    let average_duration_secs =
        runs.iter().map(|run| run.duration_secs as f64).sum::<f64>() / total;

    let mut per_hour = [0u32; 24];
    for run in runs.iter().filter(|run| run.succeeded) {
        per_hour[run.completed_at.hour() as usize] += 1;
    }
    let optimal_hour = per_hour
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .max_by(|(hour_a, count_a), (hour_b, count_b)| {
            count_a.cmp(count_b).then(hour_b.cmp(hour_a))
        })
        .map(|(hour, _)| hour as u8);

    let recommendation = if success_rate < 0.8 {
        String::from("investigate recurring sync failures before scheduling more runs")
    } else if average_duration_secs > 900.0 {
        String::from("runs are slow, prefer delta syncs where possible")
    } else {
        String::from("sync cadence is healthy")
    };

    PerformanceReport {
        recommendation,
        average_duration_secs,
        success_rate,
        optimal_hour,
    }
}
