//! Contract tests for [`JobStore`] implementations.
//!
//! The monitor relies on the store's conditional cancel being the only
//! place terminal-state protection lives. Any backing implementation must
//! satisfy these semantics; the in-memory store here is the reference.

use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;
use uuid::Uuid;
use webisync_core::job::{
    BoxFuture, CancelOutcome, JobStatus, JobStore, StoreError, SyncJobRecord,
};

#[derive(Default)]
struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, SyncJobRecord>>,
}

impl MemoryStore {
    fn insert(&self, record: SyncJobRecord) {
        self.jobs
            .lock()
            .expect("job map lock")
            .insert(record.id, record);
    }

    fn get(&self, id: Uuid) -> Option<SyncJobRecord> {
        self.jobs.lock().expect("job map lock").get(&id).cloned()
    }
}

impl JobStore for MemoryStore {
    fn job<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<Option<SyncJobRecord>, StoreError>> {
        let record = self.get(id);
        Box::pin(async move { Ok(record) })
    }

    fn active_job_for_owner<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SyncJobRecord>, StoreError>> {
        let record = self
            .jobs
            .lock()
            .expect("job map lock")
            .values()
            .find(|record| record.owner_id == owner_id && !record.is_terminal())
            .cloned();
        Box::pin(async move { Ok(record) })
    }

    fn cancel_if_active<'a>(
        &'a self,
        id: Uuid,
        error_message: &'a str,
        completed_at: OffsetDateTime,
    ) -> BoxFuture<'a, Result<CancelOutcome, StoreError>> {
        let outcome = {
            let mut jobs = self.jobs.lock().expect("job map lock");
            match jobs.get_mut(&id) {
                None => CancelOutcome::NotFound,
                Some(record) if record.is_terminal() => CancelOutcome::AlreadyTerminal,
                Some(record) => {
                    record.status = JobStatus::Cancelled;
                    record.error_message = Some(error_message.to_owned());
                    record.completed_at = Some(completed_at);
                    record.updated_at = completed_at;
                    CancelOutcome::Cancelled
                }
            }
        };
        Box::pin(async move { Ok(outcome) })
    }
}

fn record(owner_id: &str, status: JobStatus) -> SyncJobRecord {
    let now = OffsetDateTime::now_utc();
    SyncJobRecord {
        id: Uuid::new_v4(),
        owner_id: owner_id.to_owned(),
        status,
        stage_progress_percent: 0,
        started_at: now,
        updated_at: now,
        completed_at: None,
        error_message: None,
    }
}

#[tokio::test]
async fn lookup_of_unknown_job_returns_none() {
    let store = MemoryStore::default();
    let found = store.job(Uuid::new_v4()).await.expect("store ok");
    assert_eq!(found, None);
}

#[tokio::test]
async fn active_lookup_skips_terminal_records() {
    let store = MemoryStore::default();
    store.insert(record("tenant-1", JobStatus::Completed));
    store.insert(record("tenant-1", JobStatus::Failed));

    let active = store
        .active_job_for_owner("tenant-1")
        .await
        .expect("store ok");
    assert_eq!(active, None);

    let running = record("tenant-1", JobStatus::Running);
    let running_id = running.id;
    store.insert(running);
    let active = store
        .active_job_for_owner("tenant-1")
        .await
        .expect("store ok");
    assert_eq!(active.map(|record| record.id), Some(running_id));
}

#[tokio::test]
async fn cancel_stamps_message_and_completion_time() {
    let store = MemoryStore::default();
    let job = record("tenant-1", JobStatus::Running);
    let job_id = job.id;
    store.insert(job);

    let completed_at = OffsetDateTime::now_utc();
    let outcome = store
        .cancel_if_active(job_id, "Auto-cancelled: operator request", completed_at)
        .await
        .expect("store ok");
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let cancelled = store.get(job_id).expect("record");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some("Auto-cancelled: operator request")
    );
    assert_eq!(cancelled.completed_at, Some(completed_at));
    assert_eq!(cancelled.updated_at, completed_at);
}

#[tokio::test]
async fn cancel_leaves_terminal_records_untouched() {
    let store = MemoryStore::default();
    let mut job = record("tenant-1", JobStatus::Completed);
    job.completed_at = Some(OffsetDateTime::now_utc());
    let job_id = job.id;
    let original = job.clone();
    store.insert(job);

    let outcome = store
        .cancel_if_active(job_id, "Auto-cancelled: late", OffsetDateTime::now_utc())
        .await
        .expect("store ok");
    assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
    assert_eq!(store.get(job_id).expect("record"), original);
}

#[tokio::test]
async fn cancel_of_unknown_job_reports_not_found() {
    let store = MemoryStore::default();
    let outcome = store
        .cancel_if_active(
            Uuid::new_v4(),
            "Auto-cancelled: gone",
            OffsetDateTime::now_utc(),
        )
        .await
        .expect("store ok");
    assert_eq!(outcome, CancelOutcome::NotFound);
}
