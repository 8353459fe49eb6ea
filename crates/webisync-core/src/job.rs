//! Persisted-job contracts shared by the engine and its collaborators.
//!
//! The orchestrator owns normal progress updates; this crate only reads
//! job rows and force-cancels them through the conditional
//! [`JobStore::cancel_if_active`] path.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Boxed future used by dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lifecycle status of a persisted sync job. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Started,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record for one logical sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub status: JobStatus,
    pub stage_progress_percent: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl SyncJobRecord {
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Provider-side activity state for an in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Provider-reported progress snapshot, read by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProgress {
    pub percent: u8,
    pub status: ExternalStatus,
}

impl ExternalProgress {
    /// The provider considers the job alive and moving.
    pub const fn is_active(self) -> bool {
        self.percent > 0 || matches!(self.status, ExternalStatus::Running)
    }
}

/// Outcome of a conditional cancel against the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The record transitioned to cancelled.
    Cancelled,
    /// The record was already terminal; nothing changed.
    AlreadyTerminal,
    /// No record exists for the id.
    NotFound,
}

/// Job store access failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job store rejected update: {0}")]
    Rejected(String),
}

/// Transactional store holding [`SyncJobRecord`] rows.
///
/// Implementations must give `cancel_if_active` conditional semantics:
/// the transition happens only while the current status is non-terminal,
/// so the monitor never races the orchestrator's own progress writes.
pub trait JobStore: Send + Sync {
    fn job<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<Option<SyncJobRecord>, StoreError>>;

    /// The single currently active (non-terminal) job for an owner, if any.
    fn active_job_for_owner<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SyncJobRecord>, StoreError>>;

    fn cancel_if_active<'a>(
        &'a self,
        id: Uuid,
        error_message: &'a str,
        completed_at: OffsetDateTime,
    ) -> BoxFuture<'a, Result<CancelOutcome, StoreError>>;
}

/// Progress probe failures. Never fatal to the monitor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("progress probe unavailable: {0}")]
pub struct ProbeError(pub String);

/// Best-effort view of provider-side progress for a job.
pub trait ProgressProbe: Send + Sync {
    fn progress<'a>(
        &'a self,
        job_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<ExternalProgress>, ProbeError>>;
}
