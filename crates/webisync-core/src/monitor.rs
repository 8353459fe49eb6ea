//! Sync job health monitor.
//!
//! Watches one persisted job at a time per heartbeat, comparing provider-
//! reported progress against the locally persisted record. Two conditions
//! trigger autonomous recovery: a *phantom* job (provider active, local
//! record never advanced) and a *stalled* job (local progress stopped
//! inside known time bounds). Progress mismatch alone is reported, never
//! auto-cancelled; "job appears slow" is left to operator judgement.
//!
//! Forced recovery is the only mutation this module performs, and it goes
//! through the store's conditional cancel so terminal records stay final.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{
    CancelOutcome, ExternalProgress, JobStatus, JobStore, ProgressProbe, StoreError, SyncJobRecord,
};

/// Percent gap between external and persisted progress treated as a high
/// severity mismatch.
const HIGH_MISMATCH_PERCENT: u8 = 30;
const MEDIUM_MISMATCH_PERCENT: u8 = 10;

/// Detection thresholds and the heartbeat cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    pub heartbeat_interval: Duration,
    /// Quiet time after which a barely-started job counts as stalled.
    pub stall_quiet_after: Duration,
    pub stall_quiet_max_percent: u8,
    /// Total runtime after which a half-done job counts as stalled.
    pub stall_runtime_after: Duration,
    pub stall_runtime_max_percent: u8,
    /// Persisted progress at or below this still counts as "never started"
    /// for phantom detection.
    pub phantom_local_max_percent: u8,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stall_quiet_after: Duration::from_secs(120),
            stall_quiet_max_percent: 10,
            stall_runtime_after: Duration::from_secs(180),
            stall_runtime_max_percent: 50,
            phantom_local_max_percent: 5,
        }
    }
}

/// Severity of a progress mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Result of comparing external against persisted progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub issue: Option<String>,
    pub severity: Severity,
}

/// Result of a stalled-progress check for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StallReport {
    pub is_stalled: bool,
    pub job_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl StallReport {
    const fn healthy() -> Self {
        Self {
            is_stalled: false,
            job_id: None,
            reason: None,
        }
    }
}

/// Forced-recovery failures.
#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type InconsistencyHook = Arc<dyn Fn(Uuid, &ConsistencyReport) + Send + Sync>;

struct HeartbeatHandle {
    generation: u64,
    task: JoinHandle<()>,
}

/// Diagnostics and heartbeat supervision for persisted sync jobs.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    store: Arc<dyn JobStore>,
    probe: Option<Arc<dyn ProgressProbe>>,
    on_inconsistency: Option<InconsistencyHook>,
    heartbeats: Arc<Mutex<HashMap<Uuid, HeartbeatHandle>>>,
    generation: AtomicU64,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn JobStore>, config: HealthMonitorConfig) -> Self {
        Self {
            config,
            store,
            probe: None,
            on_inconsistency: None,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProgressProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Alerting hook for non-consistent reports. Escalation policy is the
    /// operator's; the monitor only surfaces.
    pub fn with_inconsistency_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Uuid, &ConsistencyReport) + Send + Sync + 'static,
    {
        self.on_inconsistency = Some(Arc::new(hook));
        self
    }

    /// Whether the provider reports activity for a job whose persisted
    /// record never advanced. On-demand check; probe absence or failure
    /// reads as "not phantom".
    pub async fn detect_phantom(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let Some(record) = self.store.job(job_id).await? else {
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }
        let Some(probe) = &self.probe else {
            return Ok(false);
        };

        let external = match probe.progress(job_id).await {
            Ok(Some(external)) => external,
            Ok(None) => return Ok(false),
            Err(error) => {
                warn!(job = %job_id, %error, "progress probe failed");
                return Ok(false);
            }
        };

        Ok(is_phantom(&self.config, external, &record))
    }

    /// Stalled-progress check for the owner's single active job.
    pub async fn detect_stalled(&self, owner_id: &str) -> Result<StallReport, StoreError> {
        let Some(record) = self.store.active_job_for_owner(owner_id).await? else {
            return Ok(StallReport::healthy());
        };

        match stall_reason(&self.config, &record, OffsetDateTime::now_utc()) {
            Some(reason) => Ok(StallReport {
                is_stalled: true,
                job_id: Some(record.id),
                reason: Some(reason),
            }),
            None => Ok(StallReport::healthy()),
        }
    }

    /// Force-cancel a job, stamping the reason and completion time.
    ///
    /// Idempotent: an already-terminal job is left untouched and reported
    /// as such; only a missing job is an error.
    pub async fn force_recover(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<CancelOutcome, RecoverError> {
        recover(self.store.as_ref(), job_id, reason).await
    }

    /// Start (or restart) the heartbeat loop for a job.
    ///
    /// Keyed by job id; a prior heartbeat for the same id is aborted and
    /// replaced, so starting is idempotent.
    pub fn start_heartbeat(&self, job_id: Uuid, owner_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = HeartbeatContext {
            config: self.config,
            store: Arc::clone(&self.store),
            probe: self.probe.clone(),
            hook: self.on_inconsistency.clone(),
            heartbeats: Arc::downgrade(&self.heartbeats),
            generation,
        };

        let task = tokio::spawn(run_heartbeat(ctx, job_id, owner_id.to_owned()));
        let mut beats = self
            .heartbeats
            .lock()
            .expect("heartbeat map lock is not poisoned");
        if let Some(previous) = beats.insert(job_id, HeartbeatHandle { generation, task }) {
            previous.task.abort();
            debug!(job = %job_id, "replaced existing heartbeat");
        }
    }

    /// Stop the heartbeat for a job. Returns whether one was running.
    pub fn stop_heartbeat(&self, job_id: Uuid) -> bool {
        let handle = self
            .heartbeats
            .lock()
            .expect("heartbeat map lock is not poisoned")
            .remove(&job_id);
        match handle {
            Some(handle) => {
                handle.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn active_heartbeats(&self) -> usize {
        self.heartbeats
            .lock()
            .expect("heartbeat map lock is not poisoned")
            .len()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let mut beats = match self.heartbeats.lock() {
            Ok(beats) => beats,
            Err(_) => return,
        };
        for (_, handle) in beats.drain() {
            handle.task.abort();
        }
    }
}

/// Compare provider-reported progress against the persisted record.
///
/// A gap over 30 points is a high severity mismatch, over 10 medium.
/// High severity is surfaced, never auto-cancelled: transient reporting
/// skew must not kill healthy jobs.
pub fn validate_consistency(external: ExternalProgress, persisted_percent: u8) -> ConsistencyReport {
    let gap = external.percent.abs_diff(persisted_percent);

    if gap > HIGH_MISMATCH_PERCENT {
        ConsistencyReport {
            is_consistent: false,
            issue: Some(format!(
                "external progress {}% differs from persisted {}% by {} points",
                external.percent, persisted_percent, gap
            )),
            severity: Severity::High,
        }
    } else if gap > MEDIUM_MISMATCH_PERCENT {
        ConsistencyReport {
            is_consistent: false,
            issue: Some(format!(
                "external progress {}% drifting from persisted {}%",
                external.percent, persisted_percent
            )),
            severity: Severity::Medium,
        }
    } else {
        ConsistencyReport {
            is_consistent: true,
            issue: None,
            severity: Severity::Low,
        }
    }
}

fn is_phantom(
    config: &HealthMonitorConfig,
    external: ExternalProgress,
    record: &SyncJobRecord,
) -> bool {
    external.is_active()
        && record.stage_progress_percent <= config.phantom_local_max_percent
        && record.status == JobStatus::Started
}

fn stall_reason(
    config: &HealthMonitorConfig,
    record: &SyncJobRecord,
    now: OffsetDateTime,
) -> Option<String> {
    let quiet_secs = (now - record.updated_at).whole_seconds();
    let runtime_secs = (now - record.started_at).whole_seconds();
    let percent = record.stage_progress_percent;

    if quiet_secs > config.stall_quiet_after.as_secs() as i64
        && percent <= config.stall_quiet_max_percent
    {
        return Some(format!(
            "no progress update for {quiet_secs}s at {percent}%"
        ));
    }
    if runtime_secs > config.stall_runtime_after.as_secs() as i64
        && percent < config.stall_runtime_max_percent
    {
        return Some(format!(
            "running for {runtime_secs}s but only {percent}% complete"
        ));
    }
    None
}

async fn recover(
    store: &dyn JobStore,
    job_id: Uuid,
    reason: &str,
) -> Result<CancelOutcome, RecoverError> {
    let message = format!("Auto-cancelled: {reason}");
    match store
        .cancel_if_active(job_id, &message, OffsetDateTime::now_utc())
        .await?
    {
        CancelOutcome::NotFound => Err(RecoverError::NotFound(job_id)),
        CancelOutcome::AlreadyTerminal => {
            debug!(job = %job_id, "job already terminal, recovery is a no-op");
            Ok(CancelOutcome::AlreadyTerminal)
        }
        CancelOutcome::Cancelled => {
            info!(job = %job_id, reason, "job force-recovered");
            Ok(CancelOutcome::Cancelled)
        }
    }
}

struct HeartbeatContext {
    config: HealthMonitorConfig,
    store: Arc<dyn JobStore>,
    probe: Option<Arc<dyn ProgressProbe>>,
    hook: Option<InconsistencyHook>,
    heartbeats: Weak<Mutex<HashMap<Uuid, HeartbeatHandle>>>,
    generation: u64,
}

enum Tick {
    Continue,
    Stop,
}

async fn run_heartbeat(ctx: HeartbeatContext, job_id: Uuid, owner_id: String) {
    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first interval tick fires immediately; skip it so a freshly
    // started job gets a full interval before its first check.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if matches!(heartbeat_tick(&ctx, job_id, &owner_id).await, Tick::Stop) {
            break;
        }
    }

    // Self-cleanup so no finished loop lingers in the map.
    if let Some(beats) = ctx.heartbeats.upgrade() {
        let mut beats = beats.lock().expect("heartbeat map lock is not poisoned");
        if beats
            .get(&job_id)
            .is_some_and(|handle| handle.generation == ctx.generation)
        {
            beats.remove(&job_id);
        }
    }
}

async fn heartbeat_tick(ctx: &HeartbeatContext, job_id: Uuid, owner_id: &str) -> Tick {
    let record = match ctx.store.job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(job = %job_id, "job record disappeared, stopping heartbeat");
            return Tick::Stop;
        }
        Err(error) => {
            warn!(job = %job_id, %error, "job store read failed, will retry next beat");
            return Tick::Continue;
        }
    };

    if record.is_terminal() {
        debug!(job = %job_id, status = %record.status, "job terminal, stopping heartbeat");
        return Tick::Stop;
    }

    // Best-effort: probe failures are logged, never fatal.
    let external = match &ctx.probe {
        Some(probe) => match probe.progress(job_id).await {
            Ok(external) => external,
            Err(error) => {
                warn!(job = %job_id, %error, "progress probe failed");
                None
            }
        },
        None => None,
    };

    if let Some(external) = external {
        if is_phantom(&ctx.config, external, &record) {
            warn!(
                job = %job_id,
                external_percent = external.percent,
                local_percent = record.stage_progress_percent,
                "phantom sync detected"
            );
            if let Err(error) = recover(
                ctx.store.as_ref(),
                job_id,
                "phantom sync detected (external progress without local updates)",
            )
            .await
            {
                warn!(job = %job_id, %error, "phantom recovery failed");
            }
            return Tick::Stop;
        }
    }

    match ctx.store.active_job_for_owner(owner_id).await {
        Ok(Some(active)) if active.id == job_id => {
            if let Some(reason) = stall_reason(&ctx.config, &record, OffsetDateTime::now_utc()) {
                warn!(job = %job_id, reason, "stalled sync detected");
                if let Err(error) = recover(ctx.store.as_ref(), job_id, &reason).await {
                    warn!(job = %job_id, %error, "stall recovery failed");
                }
                return Tick::Stop;
            }
        }
        Ok(_) => {}
        Err(error) => {
            warn!(owner = owner_id, %error, "active job lookup failed");
        }
    }

    if let Some(external) = external {
        let report = validate_consistency(external, record.stage_progress_percent);
        if !report.is_consistent {
            warn!(
                job = %job_id,
                severity = ?report.severity,
                issue = report.issue.as_deref().unwrap_or(""),
                "progress mismatch"
            );
            if let Some(hook) = &ctx.hook {
                hook(job_id, &report);
            }
        }
    }

    Tick::Continue
}
