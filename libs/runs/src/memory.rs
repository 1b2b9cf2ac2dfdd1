//! In-memory status store and result archive.
//!
//! Both stores are process-local and lose their contents on restart. Every
//! write to the registry publishes the same [`StatusChange`] notifications a
//! real status store would, so the watch pipeline can be driven end to end.
//! Failure injection hooks let tests simulate backend outages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::encoding::encode_archive_actions;
use crate::error::{ArchiveError, RegistryError};
use crate::keys::{run_key, RunKeySuffix, StatusChange, WatchEventType};
use crate::registry::{ArchiveStore, RunRegistry, StatusFeed};
use crate::types::{ArchiveAction, InterruptReason, Run, RunStatus};

const FEED_CAPACITY: usize = 1024;

// =============================================================================
// Registry
// =============================================================================

/// In-memory [`RunRegistry`] that doubles as a [`StatusFeed`].
pub struct InMemoryRunRegistry {
    runs: RwLock<BTreeMap<String, Run>>,
    feed: broadcast::Sender<StatusChange>,
    failing_runs: Mutex<HashSet<String>>,
    fail_reads: AtomicBool,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            runs: RwLock::new(BTreeMap::new()),
            feed,
            failing_runs: Mutex::new(HashSet::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Add or replace a run, as a submitter would.
    pub async fn insert(&self, run: Run) {
        let name = run.name.clone();
        let status = run.status;
        let old = self.runs.write().await.insert(name.clone(), run);
        let event_type = if old.is_some() {
            WatchEventType::Modified
        } else {
            WatchEventType::New
        };
        self.notify(
            &name,
            RunKeySuffix::Status,
            event_type,
            old.map(|r| r.status.to_string()),
            Some(status.to_string()),
        );
    }

    /// Set an interrupt reason on a run, as the API does for cancel and reset.
    pub async fn request_interrupt(
        &self,
        run_name: &str,
        reason: InterruptReason,
        interrupted_at: Option<DateTime<Utc>>,
    ) -> Result<(), RegistryError> {
        let old = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_name)
                .ok_or_else(|| RegistryError::NotFound(run_name.to_string()))?;
            let old = run.interrupt_reason.replace(reason.clone());
            run.interrupted_at = interrupted_at;
            old
        };
        self.notify(
            run_name,
            RunKeySuffix::InterruptReason,
            WatchEventType::Modified,
            old.map(String::from),
            Some(reason.to_string()),
        );
        Ok(())
    }

    /// Make every write touching `run_name` fail with a backend error.
    pub async fn fail_writes_for(&self, run_name: &str) {
        self.failing_runs.lock().await.insert(run_name.to_string());
    }

    /// Make every read fail with a backend error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Publish a raw notification on the feed.
    pub fn publish(&self, change: StatusChange) {
        // No subscribers is not an error.
        let _ = self.feed.send(change);
    }

    fn notify(
        &self,
        run_name: &str,
        suffix: RunKeySuffix,
        event_type: WatchEventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.publish(StatusChange::new(
            run_key(run_name, suffix),
            event_type,
            old_value,
            new_value,
        ));
    }

    fn check_reads(&self) -> Result<(), RegistryError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RegistryError::Backend("injected read failure".to_string()));
        }
        Ok(())
    }

    async fn check_writes(&self, run_name: &str) -> Result<(), RegistryError> {
        if self.failing_runs.lock().await.contains(run_name) {
            return Err(RegistryError::Backend(format!(
                "injected write failure for {run_name}"
            )));
        }
        Ok(())
    }

    /// Apply `f` to a run under the write lock and publish a status change
    /// if it moved.
    async fn update<T>(
        &self,
        run_name: &str,
        f: impl FnOnce(&mut Run) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        self.check_writes(run_name).await?;
        let (old_status, new_status, out) = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_name)
                .ok_or_else(|| RegistryError::NotFound(run_name.to_string()))?;
            let old_status = run.status;
            let out = f(run)?;
            (old_status, run.status, out)
        };
        if old_status != new_status {
            debug!(run_name = %run_name, from = %old_status, to = %new_status, "Run status changed");
            self.notify(
                run_name,
                RunKeySuffix::Status,
                WatchEventType::Modified,
                Some(old_status.to_string()),
                Some(new_status.to_string()),
            );
        }
        Ok(out)
    }

    async fn filtered(&self, pred: impl Fn(&Run) -> bool) -> Result<Vec<Run>, RegistryError> {
        self.check_reads()?;
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|run| pred(run))
            .cloned()
            .collect())
    }
}

impl Default for InMemoryRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRegistry for InMemoryRunRegistry {
    async fn get_interrupted_runs(&self) -> Result<Vec<Run>, RegistryError> {
        self.filtered(Run::is_interrupted).await
    }

    async fn get_queued_runs(&self) -> Result<Vec<Run>, RegistryError> {
        self.filtered(|run| run.status == RunStatus::Queued).await
    }

    async fn get_run(&self, run_name: &str) -> Result<Option<Run>, RegistryError> {
        self.check_reads()?;
        Ok(self.runs.read().await.get(run_name).cloned())
    }

    async fn all_runs(&self) -> Result<Vec<Run>, RegistryError> {
        self.filtered(|_| true).await
    }

    async fn try_allocate(&self, run_name: &str, controller: &str) -> Result<bool, RegistryError> {
        self.update(run_name, |run| {
            if !run.is_schedulable() {
                return Ok(false);
            }
            run.status = RunStatus::Allocated;
            run.controller = Some(controller.to_string());
            Ok(true)
        })
        .await
    }

    async fn mark_cancelling(
        &self,
        run_name: &str,
        expected: RunStatus,
    ) -> Result<bool, RegistryError> {
        self.update(run_name, |run| {
            if run.status != expected {
                return Ok(false);
            }
            run.status = RunStatus::Cancelling;
            Ok(true)
        })
        .await
    }

    async fn mark_queued(&self, run_name: &str) -> Result<Run, RegistryError> {
        self.update(run_name, |run| {
            if run.status.is_terminal() {
                return Err(RegistryError::InvalidTransition {
                    run: run.name.clone(),
                    from: run.status,
                    to: RunStatus::Queued,
                });
            }
            run.status = RunStatus::Queued;
            run.interrupt_reason = None;
            run.interrupted_at = None;
            run.pending_archive_actions.clear();
            run.result = None;
            run.controller = None;
            run.queued_at = Some(Utc::now());
            Ok(run.clone())
        })
        .await
    }

    async fn mark_finished(&self, run_name: &str, result: &str) -> Result<(), RegistryError> {
        self.update(run_name, |run| {
            run.status = RunStatus::Finished;
            run.result = Some(result.to_string());
            run.pending_archive_actions.clear();
            Ok(())
        })
        .await
    }

    async fn append_archive_action(
        &self,
        run_name: &str,
        action: ArchiveAction,
    ) -> Result<(), RegistryError> {
        let (old, new) = self
            .update(run_name, |run| {
                let old = run.pending_archive_actions.clone();
                run.pending_archive_actions.push(action);
                Ok((old, run.pending_archive_actions.clone()))
            })
            .await?;
        self.notify(
            run_name,
            RunKeySuffix::ArchiveActions,
            WatchEventType::Modified,
            encode_archive_actions(&old).ok(),
            encode_archive_actions(&new).ok(),
        );
        Ok(())
    }

    async fn set_archive_run_id(
        &self,
        run_name: &str,
        archive_run_id: &str,
    ) -> Result<(), RegistryError> {
        self.update(run_name, |run| {
            run.archive_run_id = Some(archive_run_id.to_string());
            Ok(())
        })
        .await
    }
}

impl StatusFeed for InMemoryRunRegistry {
    fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.feed.subscribe()
    }
}

// =============================================================================
// Archive
// =============================================================================

/// A result-archive record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub run_name: String,
    pub status: RunStatus,
    pub result: Option<String>,
}

/// In-memory [`ArchiveStore`].
pub struct InMemoryArchive {
    records: RwLock<HashMap<String, ArchiveRecord>>,
    next_id: AtomicU64,
    fail_writes: AtomicBool,
    fail_creates: AtomicBool,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
        }
    }

    /// Seed a record under a known id.
    pub async fn insert(&self, record_id: &str, run_name: &str, status: RunStatus) {
        self.records.write().await.insert(
            record_id.to_string(),
            ArchiveRecord {
                run_name: run_name.to_string(),
                status,
                result: None,
            },
        );
    }

    pub async fn record(&self, record_id: &str) -> Option<ArchiveRecord> {
        self.records.read().await.get(record_id).cloned()
    }

    /// Every record created for a run, in no particular order.
    pub async fn records_for(&self, run_name: &str) -> Vec<(String, ArchiveRecord)> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.run_name == run_name)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only record creation; status updates still succeed.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    fn check_writes(&self) -> Result<(), ArchiveError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ArchiveError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchive {
    async fn update_record_status(
        &self,
        record_id: &str,
        status: RunStatus,
        result: &str,
    ) -> Result<(), ArchiveError> {
        self.check_writes()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| ArchiveError::NotFound(record_id.to_string()))?;
        record.status = status;
        record.result = Some(result.to_string());
        Ok(())
    }

    async fn create_record(
        &self,
        run_name: &str,
        status: RunStatus,
    ) -> Result<String, ArchiveError> {
        self.check_writes()?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ArchiveError::Backend("injected create failure".to_string()));
        }
        let id = format!("arc_{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(&id, run_name, status).await;
        Ok(id)
    }
}
