//! Reconciliation of a decoded contact stream against local state.
//!
//! A run applies the stream batch by batch, one transaction per batch, and
//! collects what the batches did. Nothing reaches the run until its batch has
//! committed, so a rolled-back batch leaves no trace in the final report. The
//! closing transaction prunes known contacts missing from a complete sync and
//! deletes the job record, so the prune and the job's completion are atomic.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use contactsync_core::{AccountId, E164, JobId, LocalIdentifiers};
use contactsync_events::InsertedThread;

use crate::contact_stream::ContactDetails;
use crate::jobs::JobStoreError;
use crate::jobs::store::remove_in;
use crate::storage::accounts;
use crate::storage::{Database, StorageError, TimerUpdate};

pub mod merge;

pub use merge::{MergedContact, RecordOutcome, SkipReason, merge_contact};

/// Accounts deleted per statement while pruning.
pub const PRUNE_CHUNK_SIZE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

/// Counters for one run, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunStats {
    pub batches: u64,
    pub records: u64,
    pub merged: u64,
    pub skipped_local: u64,
    pub skipped_unidentified: u64,
    pub timers_updated: u64,
    pub accounts_pruned: u64,
}

/// Run-local state of one sync job.
#[derive(Debug)]
pub struct ReconciliationRun {
    job_id: JobId,
    is_complete_sync: bool,
    seen_phone_numbers: BTreeSet<E164>,
    inserted_threads: Vec<InsertedThread>,
    contacts_changed: bool,
    stats: RunStats,
}

impl ReconciliationRun {
    pub fn new(job_id: JobId, is_complete_sync: bool) -> Self {
        Self {
            job_id,
            is_complete_sync,
            seen_phone_numbers: BTreeSet::new(),
            inserted_threads: Vec::new(),
            contacts_changed: false,
            stats: RunStats::default(),
        }
    }

    pub fn seen_phone_numbers(&self) -> &BTreeSet<E164> {
        &self.seen_phone_numbers
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    fn absorb(&mut self, batch: BatchDelta) {
        self.stats.batches += 1;
        self.stats.records += batch.records;
        self.stats.skipped_local += batch.skipped_local;
        self.stats.skipped_unidentified += batch.skipped_unidentified;
        for merged in batch.merged {
            self.stats.merged += 1;
            if merged.thread_created {
                self.inserted_threads.push(InsertedThread {
                    thread_id: merged.thread_id,
                    sort_order: merged.sort_order,
                });
            }
            if matches!(merged.timer, Some(TimerUpdate::Updated(_))) {
                self.stats.timers_updated += 1;
            }
            if merged.account.is_some_and(|change| change.is_change()) {
                self.contacts_changed = true;
            }
            if let Some(phone_number) = merged.phone_number {
                self.seen_phone_numbers.insert(phone_number);
            }
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    pub inserted_threads: Vec<InsertedThread>,
    /// Whether any known contact was inserted, updated or pruned.
    pub contacts_changed: bool,
    pub stats: RunStats,
}

#[derive(Debug, Default)]
struct BatchDelta {
    records: u64,
    skipped_local: u64,
    skipped_unidentified: u64,
    merged: Vec<MergedContact>,
}

/// Applies contact batches to the local database.
#[derive(Debug, Clone)]
pub struct ContactReconciler {
    db: Database,
}

impl ContactReconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Merge one batch in its own transaction.
    ///
    /// Cancellation is checked before the transaction opens and again right
    /// before it commits; a cancelled batch is rolled back entirely.
    pub async fn apply_batch(
        &self,
        run: &mut ReconciliationRun,
        local: &LocalIdentifiers,
        batch: &[ContactDetails],
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let mut tx = self.db.begin().await?;
        let mut delta = BatchDelta::default();
        for contact in batch {
            delta.records += 1;
            match merge_contact(&mut tx, local, contact).await? {
                RecordOutcome::Merged(merged) => delta.merged.push(merged),
                RecordOutcome::Skipped(SkipReason::LocalUser) => delta.skipped_local += 1,
                RecordOutcome::Skipped(SkipReason::MissingIdentifier) => {
                    debug!(job_id = %run.job_id, "skipping contact without identifiers");
                    delta.skipped_unidentified += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        tx.commit().await?;

        debug!(
            job_id = %run.job_id,
            batch = run.stats.batches + 1,
            records = delta.records,
            "contact batch committed"
        );
        run.absorb(delta);
        Ok(())
    }

    /// Prune (complete syncs only) and delete the job record in one
    /// transaction.
    pub async fn finish(
        &self,
        mut run: ReconciliationRun,
        local: &LocalIdentifiers,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationOutcome, ReconcileError> {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let mut tx = self.db.begin().await?;
        let pruned = if run.is_complete_sync {
            prune(&mut tx, &run.seen_phone_numbers, local).await?
        } else {
            0
        };
        remove_in(&mut tx, run.job_id).await?;

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        tx.commit().await?;

        run.stats.accounts_pruned = pruned;
        if pruned > 0 {
            run.contacts_changed = true;
        }
        info!(
            job_id = %run.job_id,
            complete = run.is_complete_sync,
            batches = run.stats.batches,
            merged = run.stats.merged,
            threads_inserted = run.inserted_threads.len(),
            pruned,
            "contact sync reconciled"
        );

        Ok(ReconciliationOutcome {
            inserted_threads: run.inserted_threads,
            contacts_changed: run.contacts_changed,
            stats: run.stats,
        })
    }
}

/// Delete known contacts whose number is neither in `seen` nor local.
async fn prune(
    conn: &mut sqlx::SqliteConnection,
    seen: &BTreeSet<E164>,
    local: &LocalIdentifiers,
) -> Result<u64, ReconcileError> {
    let doomed: Vec<AccountId> = accounts::fetch_all_phone_numbers(conn)
        .await?
        .into_iter()
        .filter(|(_, phone_number)| {
            !seen.contains(phone_number) && !local.contains_phone_number(phone_number)
        })
        .map(|(id, _)| id)
        .collect();

    let mut pruned = 0;
    for chunk in doomed.chunks(PRUNE_CHUNK_SIZE) {
        pruned += accounts::delete_many(conn, chunk).await?;
    }
    if pruned > 0 {
        debug!(pruned, "pruned contacts missing from complete sync");
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_stream::{ContactStreamDecoder, DEFAULT_BATCH_SIZE};
    use crate::jobs::{JobRecord, JobRecordStore, PayloadDescriptor};
    use crate::storage::{recipients, threads};
    use crate::test_support::{LOCAL_NUMBER, aci, contact, encode, local_identifiers, phone};

    async fn setup(is_complete_sync: bool) -> (Database, JobRecordStore, JobRecord) {
        let db = Database::in_memory().await.unwrap();
        let store = JobRecordStore::new(db.clone());
        let job = JobRecord::incoming_contact_sync(PayloadDescriptor::Invalid, is_complete_sync);
        store.persist(&job).await.unwrap();
        (db, store, job)
    }

    async fn seed_accounts(db: &Database, numbers: &[&str]) {
        let mut conn = db.pool().acquire().await.unwrap();
        for number in numbers {
            accounts::upsert(&mut conn, &phone(number), None, None).await.unwrap();
        }
    }

    async fn account_numbers(db: &Database) -> Vec<String> {
        let mut conn = db.pool().acquire().await.unwrap();
        accounts::fetch_all(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.phone_number.as_str().to_string())
            .collect()
    }

    #[tokio::test]
    async fn complete_sync_prunes_missing_accounts_but_not_local_numbers() {
        let (db, store, job) = setup(true).await;
        seed_accounts(&db, &[LOCAL_NUMBER, "+15559999999"]).await;
        let reconciler = ContactReconciler::new(db.clone());
        let local = local_identifiers();
        let cancel = CancellationToken::new();

        let mut run = ReconciliationRun::new(job.id, true);
        let batch = vec![
            contact(Some(aci(1)), Some("+15551111111")),
            contact(Some(aci(2)), Some("+15552222222")),
        ];
        reconciler.apply_batch(&mut run, &local, &batch, &cancel).await.unwrap();
        let outcome = reconciler.finish(run, &local, &cancel).await.unwrap();

        assert_eq!(
            account_numbers(&db).await,
            vec![LOCAL_NUMBER, "+15551111111", "+15552222222"]
        );
        assert_eq!(outcome.stats.accounts_pruned, 1);
        assert!(outcome.contacts_changed);
        assert!(store.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aci_only_record_keeps_account_for_known_number() {
        let local = local_identifiers();
        let cancel = CancellationToken::new();

        let (db, store, first) = setup(true).await;
        let reconciler = ContactReconciler::new(db.clone());
        let mut run = ReconciliationRun::new(first.id, true);
        reconciler
            .apply_batch(&mut run, &local, &[contact(Some(aci(1)), Some("+15551111111"))], &cancel)
            .await
            .unwrap();
        reconciler.finish(run, &local, &cancel).await.unwrap();

        let second = JobRecord::incoming_contact_sync(PayloadDescriptor::Invalid, true);
        store.persist(&second).await.unwrap();
        let mut run = ReconciliationRun::new(second.id, true);
        reconciler
            .apply_batch(&mut run, &local, &[contact(Some(aci(1)), None)], &cancel)
            .await
            .unwrap();
        assert!(run.seen_phone_numbers().contains(&phone("+15551111111")));
        let outcome = reconciler.finish(run, &local, &cancel).await.unwrap();

        assert_eq!(outcome.stats.accounts_pruned, 0);
        assert_eq!(account_numbers(&db).await, vec!["+15551111111"]);
    }

    #[tokio::test]
    async fn seventeen_records_commit_in_three_batches() {
        let (db, _store, job) = setup(true).await;
        let reconciler = ContactReconciler::new(db.clone());
        let local = local_identifiers();
        let cancel = CancellationToken::new();
        let contacts: Vec<_> = (1..=17)
            .map(|i| contact(Some(aci(i)), Some(format!("+1555200{i:04}").as_str())))
            .collect();

        let mut decoder = ContactStreamDecoder::new(encode(&contacts));
        let mut run = ReconciliationRun::new(job.id, true);
        loop {
            let batch = decoder.next_batch(DEFAULT_BATCH_SIZE).unwrap();
            if batch.is_empty() {
                break;
            }
            reconciler.apply_batch(&mut run, &local, &batch, &cancel).await.unwrap();
        }
        let outcome = reconciler.finish(run, &local, &cancel).await.unwrap();

        assert_eq!(outcome.stats.batches, 3);
        assert_eq!(outcome.stats.records, 17);
        assert_eq!(outcome.stats.merged, 17);
        assert_eq!(account_numbers(&db).await.len(), 17);
    }

    #[tokio::test]
    async fn incomplete_sync_keeps_unlisted_accounts() {
        let (db, _store, job) = setup(false).await;
        seed_accounts(&db, &["+15559999999"]).await;
        let reconciler = ContactReconciler::new(db.clone());
        let local = local_identifiers();
        let cancel = CancellationToken::new();

        let mut run = ReconciliationRun::new(job.id, false);
        reconciler
            .apply_batch(&mut run, &local, &[contact(None, Some("+15551111111"))], &cancel)
            .await
            .unwrap();
        let outcome = reconciler.finish(run, &local, &cancel).await.unwrap();

        assert_eq!(account_numbers(&db).await, vec!["+15551111111", "+15559999999"]);
        assert_eq!(outcome.stats.accounts_pruned, 0);
    }

    #[tokio::test]
    async fn pruning_spans_several_chunks() {
        let (db, _store, job) = setup(true).await;
        let numbers: Vec<String> = (0..20).map(|i| format!("+1555100{i:04}")).collect();
        let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();
        seed_accounts(&db, &refs).await;

        let reconciler = ContactReconciler::new(db.clone());
        let run = ReconciliationRun::new(job.id, true);
        let outcome = reconciler
            .finish(run, &local_identifiers(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats.accounts_pruned, 20);
        assert!(account_numbers(&db).await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_batch_rolls_back_and_reports_nothing() {
        let (db, store, job) = setup(true).await;
        let reconciler = ContactReconciler::new(db.clone());
        let local = local_identifiers();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut run = ReconciliationRun::new(job.id, true);
        let err = reconciler
            .apply_batch(&mut run, &local, &[contact(Some(aci(1)), Some("+15551111111"))], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(run.stats().batches, 0);
        assert!(run.seen_phone_numbers().is_empty());

        let err = reconciler.finish(run, &local, &cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(recipients::fetch_all(&mut conn).await.unwrap().is_empty());
        drop(conn);
        assert!(store.get(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_contacts_insert_one_thread() {
        let (db, _store, job) = setup(false).await;
        let reconciler = ContactReconciler::new(db.clone());
        let local = local_identifiers();
        let cancel = CancellationToken::new();
        let alice = contact(Some(aci(1)), Some("+15551111111"));

        let mut run = ReconciliationRun::new(job.id, false);
        reconciler.apply_batch(&mut run, &local, &[alice.clone()], &cancel).await.unwrap();
        reconciler.apply_batch(&mut run, &local, &[alice], &cancel).await.unwrap();
        let outcome = reconciler.finish(run, &local, &cancel).await.unwrap();

        assert_eq!(outcome.inserted_threads.len(), 1);
        assert_eq!(outcome.inserted_threads[0].sort_order, u32::MAX);
        assert_eq!(outcome.stats.batches, 2);

        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(threads::fetch_all(&mut conn).await.unwrap().len(), 1);
    }
}
