//! Command-line driver for the contact sync engine.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use contactsync_core::{Aci, E164, JobId, LocalIdentifiers};
use contactsync_events::{ContactSyncEvent, EventBus, InMemoryEventBus};
use contactsync_infra::capabilities::{FileAttachmentDownloader, StaticLocalIdentity};
use contactsync_infra::jobs::{
    ContactSyncJobRunnerFactory, JobKind, JobQueue, JobQueueConfig, JobRecord, JobRecordStore,
    PayloadDescriptor,
};
use contactsync_infra::{ContactSyncConfig, Database};

mod cli;

pub use cli::{Cli, Command, IdentityArgs, IngestArgs};

/// Execute `cli`, writing JSON lines (events or job records) to `out`.
pub async fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let mut config = ContactSyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }
    if let Some(retry_limit) = cli.retry_limit {
        config = config.with_retry_limit(retry_limit);
    }

    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    let store = JobRecordStore::new(db.clone());

    match cli.command {
        Command::Pending => {
            for job in store.load_all_pending(JobKind::IncomingContactSync).await? {
                writeln!(out, "{}", serde_json::to_string(&job)?)?;
            }
            Ok(())
        }
        Command::Ingest(args) => {
            let job = JobRecord::incoming_contact_sync(
                PayloadDescriptor::Downloaded { path: args.path },
                !args.incomplete,
            );
            store.persist(&job).await?;
            info!(job_id = %job.id, complete = !args.incomplete, "queued contact sync");
            drive(&config, db, store, &args.identity, Some(job.id), out).await
        }
        Command::Resume(identity) => drive(&config, db, store, &identity, None, out).await,
    }
}

async fn drive(
    config: &ContactSyncConfig,
    db: Database,
    store: JobRecordStore,
    identity: &IdentityArgs,
    job_id: Option<JobId>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let local = local_identifiers(identity)?;
    let bus = Arc::new(InMemoryEventBus::<ContactSyncEvent>::new());
    let events = bus.subscribe();

    let factory = ContactSyncJobRunnerFactory::new(
        db,
        Arc::new(FileAttachmentDownloader::new(&identity.attachments_dir)),
        Arc::new(StaticLocalIdentity::registered(local)),
        bus.clone(),
    )
    .with_batch_size(config.batch_size);
    let queue_config = JobQueueConfig::default()
        .with_name(&config.queue_name)
        .with_retry_policy(config.retry_policy());

    let handle = JobQueue::new(factory, store, queue_config).start(true).await?;
    if let Some(job_id) = job_id {
        handle.add_persisted_job(job_id)?;
    }
    handle.wait_until_idle().await;
    let stats = handle.stats();
    handle.shutdown().await;

    for event in events.drain() {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        abandoned = stats.jobs_abandoned,
        "contact sync queue drained"
    );
    Ok(())
}

fn local_identifiers(identity: &IdentityArgs) -> anyhow::Result<LocalIdentifiers> {
    let aci: Aci = identity
        .local_aci
        .parse()
        .context("invalid --local-aci")?;
    let mut numbers = identity
        .local_numbers
        .iter()
        .map(|raw| E164::parse(raw).with_context(|| format!("invalid --local-number {raw}")));
    let first = numbers
        .next()
        .context("at least one --local-number is required")??;
    numbers.try_fold(
        LocalIdentifiers::new(aci, first),
        |local, number| -> anyhow::Result<LocalIdentifiers> {
            Ok(local.with_phone_number(number?))
        },
    )
}
