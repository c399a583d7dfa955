//! Serialized job queue with retry, backoff and reachability-triggered retries.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use contactsync_core::JobId;

use super::runner::{JobError, JobRunner, JobRunnerFactory};
use super::store::{JobRecordStore, JobStoreError};
use super::types::{JobRecord, RetryPolicy};

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Name for logging
    pub name: String,
    pub retry_policy: RetryPolicy,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            name: "job-queue".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl JobQueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue {0} is stopped")]
    Stopped(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Queue runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_abandoned: u64,
    pub jobs_cancelled: u64,
    pub uptime_secs: u64,
}

/// Point-in-time view of the worker's queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueSnapshot {
    /// Enqueue requests not yet seen by the worker
    pub inbox: usize,
    /// Jobs ready to run, in run order
    pub ready: usize,
    /// Jobs waiting out a backoff delay
    pub parked: usize,
    pub running: Option<JobId>,
    pub reachable: bool,
    pub stopped: bool,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.inbox == 0 && self.ready == 0 && self.parked == 0 && self.running.is_none()
    }
}

#[derive(Debug)]
enum Command {
    Enqueue(JobId),
    Reachability(bool),
}

/// A queue running every job of one kind, one job at a time.
pub struct JobQueue<F: JobRunnerFactory> {
    factory: F,
    store: JobRecordStore,
    config: JobQueueConfig,
}

impl<F: JobRunnerFactory> JobQueue<F> {
    pub fn new(factory: F, store: JobRecordStore, config: JobQueueConfig) -> Self {
        Self {
            factory,
            store,
            config,
        }
    }

    /// Spawn the worker task.
    ///
    /// With `restart_existing`, every unfinished record of this kind is
    /// queued (oldest first) before any newly added job.
    pub async fn start(self, restart_existing: bool) -> Result<JobQueueHandle, QueueError> {
        let existing = if restart_existing {
            self.store.load_all_pending(self.factory.kind()).await?
        } else {
            Vec::new()
        };

        let (commands, inbox) = mpsc::unbounded_channel();
        let state = Arc::new(watch::Sender::new(QueueSnapshot {
            reachable: true,
            ..QueueSnapshot::default()
        }));
        let stats = Arc::new(Mutex::new(QueueStats::default()));
        let cancel = CancellationToken::new();
        let name = self.config.name.clone();

        let mut worker = Worker {
            factory: self.factory,
            store: self.store,
            policy: self.config.retry_policy,
            name: name.clone(),
            ready: VecDeque::new(),
            parked: Vec::new(),
            known: HashSet::new(),
            running: None,
            reachable: true,
            state: state.clone(),
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        if !existing.is_empty() {
            info!(queue = %name, count = existing.len(), "restarting unfinished jobs");
        }
        for job in existing {
            worker.restore(&job);
        }
        worker.publish();

        let join = tokio::spawn(worker.run(inbox));

        Ok(JobQueueHandle {
            name,
            commands,
            state,
            stats,
            cancel,
            started: Instant::now(),
            join: Some(join),
        })
    }
}

/// Handle to control a running queue. Dropping it stops the worker.
#[derive(Debug)]
pub struct JobQueueHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<QueueSnapshot>>,
    stats: Arc<Mutex<QueueStats>>,
    cancel: CancellationToken,
    started: Instant,
    join: Option<JoinHandle<()>>,
}

impl JobQueueHandle {
    /// Queue a job whose record the caller has already committed.
    ///
    /// Ids already queued, parked or running are ignored.
    pub fn add_persisted_job(&self, id: JobId) -> Result<(), QueueError> {
        self.state.send_modify(|s| s.inbox += 1);
        self.commands.send(Command::Enqueue(id)).map_err(|_| {
            self.state.send_modify(|s| s.inbox = s.inbox.saturating_sub(1));
            QueueError::Stopped(self.name.clone())
        })
    }

    /// Follow a reachability signal. When it turns `true`, every job parked
    /// after a transient failure runs without waiting out its backoff.
    pub fn listen_for_reachability_changes(&self, mut reachable: watch::Receiver<bool>) {
        let commands = self.commands.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let current = *reachable.borrow_and_update();
                if commands.send(Command::Reachability(current)).is_err() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = reachable.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Get current queue statistics.
    pub fn stats(&self) -> QueueStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.borrow().clone()
    }

    /// Wait until the worker's state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&QueueSnapshot) -> bool,
    ) -> QueueSnapshot {
        let mut state = self.state.subscribe();
        match state.wait_for(|s| predicate(s)).await {
            Ok(snapshot) => (*snapshot).clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Wait until nothing is queued, parked or running, or the worker stopped.
    pub async fn wait_until_idle(&self) -> QueueSnapshot {
        self.wait_for(|s| s.is_idle() || s.stopped).await
    }

    /// Token observed by running jobs; cancelling it stops the worker.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the running job, if any, and wait for the worker to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(queue = %self.name, error = %e, "job queue worker panicked");
            }
        }
    }
}

impl Drop for JobQueueHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<F: JobRunnerFactory> {
    factory: F,
    store: JobRecordStore,
    policy: RetryPolicy,
    name: String,
    ready: VecDeque<JobId>,
    parked: Vec<(JobId, Instant)>,
    known: HashSet<JobId>,
    running: Option<JobId>,
    reachable: bool,
    state: Arc<watch::Sender<QueueSnapshot>>,
    stats: Arc<Mutex<QueueStats>>,
    cancel: CancellationToken,
}

impl<F: JobRunnerFactory> Worker<F> {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        info!(queue = %self.name, "job queue started");
        let cancel = self.cancel.clone();

        loop {
            while let Ok(command) = inbox.try_recv() {
                self.handle(command);
            }
            if cancel.is_cancelled() {
                break;
            }
            self.promote_due();
            self.publish();

            if let Some(id) = self.ready.pop_front() {
                self.run_job(id).await;
                continue;
            }

            let wake_at = self.next_wake();
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
            }
        }

        inbox.close();
        self.running = None;
        self.publish();
        self.state.send_modify(|s| s.stopped = true);
        info!(queue = %self.name, "job queue stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(id) => {
                if self.known.insert(id) {
                    self.ready.push_back(id);
                } else {
                    debug!(queue = %self.name, job_id = %id, "job already queued");
                }
                // Leaving the inbox and entering `ready` must be one update,
                // or waiters could observe a spurious idle state.
                let ready = self.ready.len();
                self.state.send_modify(|s| {
                    s.inbox = s.inbox.saturating_sub(1);
                    s.ready = ready;
                });
            }
            Command::Reachability(reachable) => {
                let regained = reachable && !self.reachable;
                self.reachable = reachable;
                if regained && !self.parked.is_empty() {
                    info!(
                        queue = %self.name,
                        count = self.parked.len(),
                        "network reachable, retrying parked jobs"
                    );
                    self.ready.extend(self.parked.drain(..).map(|(id, _)| id));
                }
            }
        }
        self.publish();
    }

    fn restore(&mut self, job: &JobRecord) {
        if !self.known.insert(job.id) {
            return;
        }
        let delay = job
            .next_attempt_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|delay| !delay.is_zero());
        match delay {
            Some(delay) => self.parked.push((job.id, Instant::now() + delay)),
            None => self.ready.push_back(job.id),
        }
    }

    /// Move parked jobs whose backoff elapsed to the ready queue. Nothing is
    /// due while the network is unreachable.
    fn promote_due(&mut self) {
        if !self.reachable {
            return;
        }
        let now = Instant::now();
        let mut i = 0;
        while i < self.parked.len() {
            if self.parked[i].1 <= now {
                let (id, _) = self.parked.remove(i);
                self.ready.push_back(id);
            } else {
                i += 1;
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        if !self.reachable {
            return None;
        }
        self.parked.iter().map(|(_, at)| *at).min()
    }

    fn publish(&self) {
        let ready = self.ready.len();
        let parked = self.parked.len();
        let running = self.running;
        let reachable = self.reachable;
        self.state.send_modify(|s| {
            s.ready = ready;
            s.parked = parked;
            s.running = running;
            s.reachable = reachable;
        });
    }

    fn record<T>(&self, update: impl FnOnce(&mut QueueStats) -> T) -> T {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats)
    }

    async fn run_job(&mut self, id: JobId) {
        let job = match self.store.mark_running(id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                debug!(queue = %self.name, job_id = %id, "job record gone, skipping");
                self.known.remove(&id);
                return;
            }
            Err(e) => {
                error!(queue = %self.name, job_id = %id, error = %e, "failed to claim job");
                self.park(id, self.policy.delay_for_attempt(1));
                return;
            }
        };

        self.running = Some(id);
        self.publish();
        debug!(queue = %self.name, job_id = %id, attempt = job.attempt, "running job");

        let runner = self.factory.build_runner();
        let result = runner.execute(&job, &self.cancel).await;

        self.running = None;
        self.record(|s| s.jobs_processed += 1);

        match result {
            Ok(()) => self.succeed(&job).await,
            Err(JobError::Cancelled) => self.release(&job).await,
            Err(err) if err.is_retryable() && self.policy.should_retry(job.attempt) => {
                self.retry(&job, &err).await
            }
            Err(err) => self.abandon(&job, &err).await,
        }
        self.publish();
    }

    async fn succeed(&mut self, job: &JobRecord) {
        // Runners usually delete the record with their final commit already.
        if let Err(e) = self.store.remove(job.id).await {
            error!(queue = %self.name, job_id = %job.id, error = %e, "failed to delete finished job");
        }
        self.known.remove(&job.id);
        self.record(|s| s.jobs_succeeded += 1);
        info!(queue = %self.name, job_id = %job.id, attempt = job.attempt, "job succeeded");
    }

    async fn release(&mut self, job: &JobRecord) {
        if let Err(e) = self.store.mark_pending(job.id).await {
            error!(queue = %self.name, job_id = %job.id, error = %e, "failed to release cancelled job");
        }
        self.known.remove(&job.id);
        self.record(|s| s.jobs_cancelled += 1);
        info!(queue = %self.name, job_id = %job.id, "job run cancelled");
    }

    async fn retry(&mut self, job: &JobRecord, err: &JobError) {
        let delay = self.policy.delay_for_attempt(job.attempt);
        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        if let Err(e) = self.store.record_failure(job.id, &err.to_string(), retry_at).await {
            error!(queue = %self.name, job_id = %job.id, error = %e, "failed to record job failure");
        }
        self.park(job.id, delay);
        self.record(|s| s.jobs_retried += 1);
        warn!(
            queue = %self.name,
            job_id = %job.id,
            attempt = job.attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "job failed, will retry"
        );
    }

    async fn abandon(&mut self, job: &JobRecord, err: &JobError) {
        if let Err(e) = self.store.remove(job.id).await {
            error!(queue = %self.name, job_id = %job.id, error = %e, "failed to delete abandoned job");
        }
        self.known.remove(&job.id);
        self.record(|s| s.jobs_abandoned += 1);
        warn!(
            queue = %self.name,
            job_id = %job.id,
            attempt = job.attempt,
            terminal_reason = ?err.abandon_reason(),
            error = %err,
            "job abandoned"
        );
        self.factory.did_abandon(job, err);
    }

    fn park(&mut self, id: JobId, delay: Duration) {
        self.parked.push((id, Instant::now() + delay));
    }
}
