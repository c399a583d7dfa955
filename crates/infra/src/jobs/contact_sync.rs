//! The incoming contact sync job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use contactsync_events::{ContactSyncEvent, EventBus};

use crate::capabilities::{AttachmentDownloader, DownloadError, LocalIdentityProvider};
use crate::contact_stream::{ContactStreamDecoder, DEFAULT_BATCH_SIZE};
use crate::reconcile::{ContactReconciler, ReconcileError, ReconciliationRun};
use crate::storage::Database;

use super::runner::{JobError, JobRunner, JobRunnerFactory};
use super::types::{JobKind, JobPayload, JobRecord, PayloadDescriptor};

impl From<DownloadError> for JobError {
    fn from(err: DownloadError) -> Self {
        if err.is_transient() {
            JobError::transient(err.to_string())
        } else {
            JobError::structural(err.to_string())
        }
    }
}

impl From<ReconcileError> for JobError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Cancelled => JobError::Cancelled,
            other => JobError::transient(other.to_string()),
        }
    }
}

/// Builds runners for [`JobKind::IncomingContactSync`] and reports abandoned
/// jobs on the event bus.
pub struct ContactSyncJobRunnerFactory<B> {
    db: Database,
    downloader: Arc<dyn AttachmentDownloader>,
    identity: Arc<dyn LocalIdentityProvider>,
    events: Arc<B>,
    batch_size: usize,
}

impl<B> ContactSyncJobRunnerFactory<B>
where
    B: EventBus<ContactSyncEvent> + 'static,
{
    pub fn new(
        db: Database,
        downloader: Arc<dyn AttachmentDownloader>,
        identity: Arc<dyn LocalIdentityProvider>,
        events: Arc<B>,
    ) -> Self {
        Self {
            db,
            downloader,
            identity,
            events,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl<B> JobRunnerFactory for ContactSyncJobRunnerFactory<B>
where
    B: EventBus<ContactSyncEvent> + 'static,
{
    type Runner = ContactSyncJobRunner<B>;

    fn kind(&self) -> JobKind {
        JobKind::IncomingContactSync
    }

    fn build_runner(&self) -> Self::Runner {
        ContactSyncJobRunner {
            reconciler: ContactReconciler::new(self.db.clone()),
            downloader: self.downloader.clone(),
            identity: self.identity.clone(),
            events: self.events.clone(),
            batch_size: self.batch_size,
        }
    }

    fn did_abandon(&self, job: &JobRecord, error: &JobError) {
        publish(
            &*self.events,
            ContactSyncEvent::SyncAbandoned {
                job_id: job.id,
                reason: error.abandon_reason(),
            },
        );
    }
}

pub struct ContactSyncJobRunner<B> {
    reconciler: ContactReconciler,
    downloader: Arc<dyn AttachmentDownloader>,
    identity: Arc<dyn LocalIdentityProvider>,
    events: Arc<B>,
    batch_size: usize,
}

#[async_trait]
impl<B> JobRunner for ContactSyncJobRunner<B>
where
    B: EventBus<ContactSyncEvent> + 'static,
{
    async fn execute(&self, job: &JobRecord, cancel: &CancellationToken) -> Result<(), JobError> {
        let JobPayload::IncomingContactSync {
            descriptor,
            is_complete_sync,
        } = &job.payload;

        if matches!(descriptor, PayloadDescriptor::Invalid) {
            return Err(JobError::structural("sync message carried no usable attachment"));
        }
        let local = self
            .identity
            .local_identifiers()
            .map_err(|e| JobError::precondition(e.to_string(), false))?;

        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        // Download before any transaction opens.
        let payload = self.downloader.download_and_decrypt(descriptor).await?;
        debug!(job_id = %job.id, len = payload.len(), "contact sync payload ready");

        let mut decoder = ContactStreamDecoder::new(payload);
        let mut run = ReconciliationRun::new(job.id, *is_complete_sync);
        loop {
            let batch = decoder
                .next_batch(self.batch_size)
                .map_err(|e| JobError::structural(e.to_string()))?;
            if batch.is_empty() {
                break;
            }
            self.reconciler
                .apply_batch(&mut run, &local, &batch, cancel)
                .await?;
        }

        let outcome = self.reconciler.finish(run, &local, cancel).await?;

        if outcome.contacts_changed {
            publish(&*self.events, ContactSyncEvent::ContactsChanged);
        }
        publish(&*self.events, ContactSyncEvent::IdentityStateChanged);
        publish(
            &*self.events,
            ContactSyncEvent::IncomingContactSyncDidComplete {
                inserted_threads: outcome.inserted_threads,
            },
        );
        Ok(())
    }
}

/// Events describe committed state; a failed publish only delays consumers.
fn publish<B: EventBus<ContactSyncEvent> + ?Sized>(events: &B, event: ContactSyncEvent) {
    if let Err(e) = events.publish(event) {
        warn!(error = ?e, "failed to publish contact sync event");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;

    use contactsync_events::{AbandonReason, InMemoryEventBus};

    use super::*;
    use crate::capabilities::StaticLocalIdentity;
    use crate::jobs::{JobQueue, JobQueueConfig, JobRecordStore, RetryPolicy};
    use crate::storage::{accounts, recipients, threads};
    use crate::test_support::{LOCAL_NUMBER, aci, contact, encode, local_identifiers, phone};

    /// Serves fixed bytes, or fails with a network error while `failures` lasts.
    struct FakeDownloader {
        payload: Bytes,
        failures: Mutex<usize>,
        calls: AtomicUsize,
    }

    impl FakeDownloader {
        fn serving(payload: Bytes) -> Arc<Self> {
            Arc::new(Self {
                payload,
                failures: Mutex::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                payload: Bytes::new(),
                failures: Mutex::new(times),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AttachmentDownloader for FakeDownloader {
        async fn download_and_decrypt(
            &self,
            _descriptor: &PayloadDescriptor,
        ) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(DownloadError::Network("connection reset".to_string()));
            }
            Ok(self.payload.clone())
        }
    }

    struct Harness {
        db: Database,
        store: JobRecordStore,
        bus: Arc<InMemoryEventBus<ContactSyncEvent>>,
        factory: ContactSyncJobRunnerFactory<InMemoryEventBus<ContactSyncEvent>>,
    }

    async fn harness(downloader: Arc<dyn AttachmentDownloader>) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let factory = ContactSyncJobRunnerFactory::new(
            db.clone(),
            downloader,
            Arc::new(StaticLocalIdentity::registered(local_identifiers())),
            bus.clone(),
        );
        Harness {
            store: JobRecordStore::new(db.clone()),
            db,
            bus,
            factory,
        }
    }

    fn sync_job(is_complete_sync: bool) -> JobRecord {
        JobRecord::incoming_contact_sync(
            PayloadDescriptor::LegacyAttachment {
                attachment_id: "contacts".to_string(),
            },
            is_complete_sync,
        )
    }

    async fn run(h: &Harness, job: &JobRecord) -> Result<(), JobError> {
        h.store.persist(job).await.unwrap();
        h.factory
            .build_runner()
            .execute(job, &CancellationToken::new())
            .await
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

    fn two_contacts_and_self() -> Bytes {
        let mut alice = contact(Some(aci(1)), Some("+15551111111"));
        alice.inbox_position = Some(1);
        let bob = contact(None, Some("+15552222222"));
        let me = contact(Some(aci(0)), Some(LOCAL_NUMBER));
        encode(&[alice, bob, me])
    }

    #[tokio::test]
    async fn complete_sync_reconciles_and_prunes() {
        let h = harness(FakeDownloader::serving(two_contacts_and_self())).await;
        {
            let mut conn = h.db.pool().acquire().await.unwrap();
            accounts::upsert(&mut conn, &phone("+15559999999"), None, Some("Gone"))
                .await
                .unwrap();
        }
        let events = h.bus.subscribe();
        let job = sync_job(true);

        run(&h, &job).await.unwrap();

        assert_eq!(account_numbers(&h.db).await, vec!["+15551111111", "+15552222222"]);
        let mut conn = h.db.pool().acquire().await.unwrap();
        assert_eq!(recipients::fetch_all(&mut conn).await.unwrap().len(), 2);
        assert_eq!(threads::fetch_all(&mut conn).await.unwrap().len(), 2);
        drop(conn);
        assert!(h.store.get(job.id).await.unwrap().is_none());

        let events = events.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ContactSyncEvent::ContactsChanged);
        assert_eq!(events[1], ContactSyncEvent::IdentityStateChanged);
        let ContactSyncEvent::IncomingContactSyncDidComplete { inserted_threads } = &events[2] else {
            panic!("unexpected event {:?}", events[2]);
        };
        let orders: Vec<u32> = inserted_threads.iter().map(|t| t.sort_order).collect();
        assert_eq!(orders, vec![1, u32::MAX]);
    }

    #[tokio::test]
    async fn incomplete_sync_keeps_existing_contacts() {
        let h = harness(FakeDownloader::serving(two_contacts_and_self())).await;
        {
            let mut conn = h.db.pool().acquire().await.unwrap();
            accounts::upsert(&mut conn, &phone("+15559999999"), None, None)
                .await
                .unwrap();
        }

        run(&h, &sync_job(false)).await.unwrap();

        assert_eq!(
            account_numbers(&h.db).await,
            vec!["+15551111111", "+15552222222", "+15559999999"]
        );
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent() {
        let h = harness(FakeDownloader::serving(two_contacts_and_self())).await;
        run(&h, &sync_job(true)).await.unwrap();

        let events = h.bus.subscribe();
        run(&h, &sync_job(true)).await.unwrap();

        let events = events.drain();
        assert_eq!(
            events,
            vec![
                ContactSyncEvent::IdentityStateChanged,
                ContactSyncEvent::IncomingContactSyncDidComplete {
                    inserted_threads: Vec::new()
                },
            ]
        );
        let mut conn = h.db.pool().acquire().await.unwrap();
        assert_eq!(threads::fetch_all(&mut conn).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn seventeen_records_are_all_applied() {
        let contacts: Vec<_> = (1..=17)
            .map(|i| contact(Some(aci(i)), Some(format!("+1555200{i:04}").as_str())))
            .collect();
        let h = harness(FakeDownloader::serving(encode(&contacts))).await;
        let events = h.bus.subscribe();

        run(&h, &sync_job(true)).await.unwrap();

        let Some(ContactSyncEvent::IncomingContactSyncDidComplete { inserted_threads }) =
            events.drain().pop()
        else {
            panic!("sync did not complete");
        };
        assert_eq!(inserted_threads.len(), 17);
        assert_eq!(account_numbers(&h.db).await.len(), 17);
    }

    #[tokio::test]
    async fn unidentified_records_are_skipped() {
        let payload = encode(&[contact(None, None), contact(Some(aci(1)), None)]);
        let h = harness(FakeDownloader::serving(payload)).await;

        run(&h, &sync_job(true)).await.unwrap();

        let mut conn = h.db.pool().acquire().await.unwrap();
        assert_eq!(recipients::fetch_all(&mut conn).await.unwrap().len(), 1);
        drop(conn);
        assert!(account_numbers(&h.db).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_stream_is_structural() {
        let h = harness(FakeDownloader::serving(Bytes::from_static(&[0xFF; 11]))).await;
        let err = run(&h, &sync_job(true)).await.unwrap_err();
        assert!(matches!(err, JobError::Structural(_)));
        assert_eq!(err.abandon_reason(), AbandonReason::MalformedPayload);
    }

    #[tokio::test]
    async fn invalid_descriptor_and_unregistered_device_fail_without_download() {
        let downloader = FakeDownloader::serving(Bytes::new());
        let h = harness(downloader.clone()).await;
        let job = JobRecord::incoming_contact_sync(PayloadDescriptor::Invalid, true);
        assert!(matches!(run(&h, &job).await.unwrap_err(), JobError::Structural(_)));

        let unregistered = ContactSyncJobRunnerFactory::new(
            h.db.clone(),
            downloader.clone(),
            Arc::new(StaticLocalIdentity::unregistered()),
            h.bus.clone(),
        );
        let err = unregistered
            .build_runner()
            .execute(&sync_job(true), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Precondition { retryable: false, .. }));
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_run_leaves_no_state() {
        let h = harness(FakeDownloader::serving(two_contacts_and_self())).await;
        let job = sync_job(true);
        h.store.persist(&job).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.factory.build_runner().execute(&job, &cancel).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert!(account_numbers(&h.db).await.is_empty());
        assert!(h.store.get(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queue_abandons_after_five_network_failures() {
        let downloader = FakeDownloader::failing(usize::MAX);
        let h = harness(downloader.clone()).await;
        let events = h.bus.subscribe();
        let job = sync_job(true);
        h.store.persist(&job).await.unwrap();

        let config = JobQueueConfig::default()
            .with_retry_policy(RetryPolicy::fixed(4, Duration::from_millis(1)));
        let handle = JobQueue::new(h.factory, h.store.clone(), config)
            .start(true)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_until_idle())
            .await
            .unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 5);
        assert!(h.store.get(job.id).await.unwrap().is_none());
        assert_eq!(
            events.drain(),
            vec![ContactSyncEvent::SyncAbandoned {
                job_id: job.id,
                reason: AbandonReason::RetriesExhausted,
            }]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn queue_retries_transient_failure_then_completes() {
        let downloader = Arc::new(FakeDownloader {
            payload: two_contacts_and_self(),
            failures: Mutex::new(1),
            calls: AtomicUsize::new(0),
        });
        let h = harness(downloader.clone()).await;
        let events = h.bus.subscribe();
        let job = sync_job(true);
        h.store.persist(&job).await.unwrap();

        let config = JobQueueConfig::default()
            .with_retry_policy(RetryPolicy::fixed(4, Duration::from_millis(1)));
        let handle = JobQueue::new(h.factory, h.store.clone(), config)
            .start(false)
            .await
            .unwrap();
        handle.add_persisted_job(job.id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_until_idle())
            .await
            .unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            events.drain().last(),
            Some(ContactSyncEvent::IncomingContactSyncDidComplete { .. })
        ));
        assert_eq!(account_numbers(&h.db).await.len(), 2);
        handle.shutdown().await;
    }
}
