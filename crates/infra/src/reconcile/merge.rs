//! Per-record merge of a synced contact into local state.

use chrono::Utc;
use sqlx::SqliteConnection;

use contactsync_core::{Aci, E164, LocalIdentifiers, ThreadId};

use crate::contact_stream::ContactDetails;
use crate::storage::accounts::{self, AccountChange};
use crate::storage::disappearing::{self, TimerUpdate};
use crate::storage::recipients;
use crate::storage::threads;
use crate::storage::{SignalRecipient, StorageError};

/// Why a record produced no local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record describes the local user.
    LocalUser,
    /// Neither an ACI nor a phone number survived decoding.
    MissingIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedContact {
    pub thread_id: ThreadId,
    pub thread_created: bool,
    /// Inbox position hint; `u32::MAX` when the record carried none.
    pub sort_order: u32,
    pub phone_number: Option<E164>,
    pub account: Option<AccountChange>,
    pub timer: Option<TimerUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Merged(MergedContact),
    Skipped(SkipReason),
}

/// Apply one contact record on `conn`.
pub async fn merge_contact(
    conn: &mut SqliteConnection,
    local: &LocalIdentifiers,
    contact: &ContactDetails,
) -> Result<RecordOutcome, StorageError> {
    if local.matches(contact.aci.as_ref(), contact.phone_number.as_ref()) {
        return Ok(RecordOutcome::Skipped(SkipReason::LocalUser));
    }

    let recipient = match (contact.aci, contact.phone_number.as_ref()) {
        (Some(aci), phone_number) => merge_aci(conn, aci, phone_number).await?,
        (None, Some(phone_number)) => fetch_or_create_by_phone(conn, phone_number).await?,
        (None, None) => return Ok(RecordOutcome::Skipped(SkipReason::MissingIdentifier)),
    };

    let (thread, thread_created) = threads::fetch_or_create_visible(conn, recipient.id).await?;

    let timer = match contact.expire_timer {
        Some(seconds) => Some(
            disappearing::apply_remote_update(conn, thread.id, seconds, contact.expire_timer_version)
                .await?,
        ),
        None => None,
    };

    // An ACI-only record still counts as seeing the number its recipient holds.
    let phone_number = recipient.phone_number.clone();
    let account = match phone_number.as_ref() {
        Some(phone_number) => Some(
            accounts::upsert(conn, phone_number, contact.aci, contact.name.as_deref()).await?,
        ),
        None => None,
    };

    Ok(RecordOutcome::Merged(MergedContact {
        thread_id: thread.id,
        thread_created,
        sort_order: contact.inbox_position.unwrap_or(u32::MAX),
        phone_number,
        account,
        timer,
    }))
}

/// Resolve the recipient for `aci`, attaching `phone_number` to it.
///
/// The ACI is the merge key. A phone-only recipient holding the number is
/// adopted; a recipient with a different ACI loses the number to this one.
pub async fn merge_aci(
    conn: &mut SqliteConnection,
    aci: Aci,
    phone_number: Option<&E164>,
) -> Result<SignalRecipient, StorageError> {
    let by_aci = recipients::fetch_by_aci(conn, &aci).await?;
    let by_phone = match phone_number {
        Some(phone_number) => recipients::fetch_by_phone_number(conn, phone_number).await?,
        None => None,
    };

    match (by_aci, by_phone) {
        (Some(mut recipient), holder) => {
            let mut changed = !recipient.is_registered;
            if let Some(phone_number) = phone_number {
                if recipient.phone_number.as_ref() != Some(phone_number) {
                    if let Some(holder) = holder.filter(|h| h.id != recipient.id) {
                        release_phone_number(conn, holder).await?;
                    }
                    recipient.phone_number = Some(phone_number.clone());
                    changed = true;
                }
            }
            if changed {
                recipient.is_registered = true;
                recipient.updated_at = Utc::now();
                recipients::update(conn, &recipient).await?;
            }
            Ok(recipient)
        }
        (None, Some(mut holder)) if holder.aci.is_none() => {
            holder.aci = Some(aci);
            holder.is_registered = true;
            holder.updated_at = Utc::now();
            recipients::update(conn, &holder).await?;
            Ok(holder)
        }
        (None, holder) => {
            if let Some(holder) = holder {
                release_phone_number(conn, holder).await?;
            }
            let recipient = SignalRecipient::new(Some(aci), phone_number.cloned(), true);
            recipients::insert(conn, &recipient).await?;
            Ok(recipient)
        }
    }
}

async fn fetch_or_create_by_phone(
    conn: &mut SqliteConnection,
    phone_number: &E164,
) -> Result<SignalRecipient, StorageError> {
    if let Some(recipient) = recipients::fetch_by_phone_number(conn, phone_number).await? {
        return Ok(recipient);
    }
    let recipient = SignalRecipient::new(None, Some(phone_number.clone()), false);
    recipients::insert(conn, &recipient).await?;
    Ok(recipient)
}

async fn release_phone_number(
    conn: &mut SqliteConnection,
    mut holder: SignalRecipient,
) -> Result<(), StorageError> {
    tracing::debug!(recipient_id = %holder.id, "phone number moved to another ACI");
    holder.phone_number = None;
    holder.updated_at = Utc::now();
    recipients::update(conn, &holder).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::test_support::{LOCAL_NUMBER, aci, contact, local_identifiers, phone};

    #[tokio::test]
    async fn phone_only_recipient_is_adopted_by_aci() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let number = phone("+15551111111");

        let phone_only = fetch_or_create_by_phone(&mut conn, &number).await.unwrap();
        let merged = merge_aci(&mut conn, aci(1), Some(&number)).await.unwrap();

        assert_eq!(merged.id, phone_only.id);
        assert_eq!(merged.aci, Some(aci(1)));
        assert!(merged.is_registered);
        assert_eq!(recipients::fetch_all(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn phone_number_is_stolen_from_another_aci() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let number = phone("+15551111111");

        let old = merge_aci(&mut conn, aci(1), Some(&number)).await.unwrap();
        let new = merge_aci(&mut conn, aci(2), Some(&number)).await.unwrap();
        assert_ne!(old.id, new.id);

        let old = recipients::fetch_by_aci(&mut conn, &aci(1)).await.unwrap().unwrap();
        assert_eq!(old.phone_number, None);
        let holder = recipients::fetch_by_phone_number(&mut conn, &number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.aci, Some(aci(2)));
    }

    #[tokio::test]
    async fn aci_record_without_phone_keeps_known_number() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let number = phone("+15551111111");

        merge_aci(&mut conn, aci(1), Some(&number)).await.unwrap();
        let merged = merge_aci(&mut conn, aci(1), None).await.unwrap();
        assert_eq!(merged.phone_number, Some(number));
    }

    #[tokio::test]
    async fn local_user_and_unidentified_records_are_skipped() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let local = local_identifiers();

        for record in [
            contact(Some(aci(0)), None),
            contact(None, Some(LOCAL_NUMBER)),
            contact(Some(aci(7)), Some(LOCAL_NUMBER)),
        ] {
            assert_eq!(
                merge_contact(&mut conn, &local, &record).await.unwrap(),
                RecordOutcome::Skipped(SkipReason::LocalUser)
            );
        }
        assert_eq!(
            merge_contact(&mut conn, &local, &contact(None, None)).await.unwrap(),
            RecordOutcome::Skipped(SkipReason::MissingIdentifier)
        );
        assert!(recipients::fetch_all(&mut conn).await.unwrap().is_empty());
        assert!(threads::fetch_all(&mut conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_creates_thread_timer_and_account_once() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let local = local_identifiers();
        let mut record = contact(Some(aci(1)), Some("+15551111111"));
        record.name = Some("Alice".to_string());
        record.inbox_position = Some(3);
        record.expire_timer = Some(3600);

        let RecordOutcome::Merged(first) = merge_contact(&mut conn, &local, &record).await.unwrap()
        else {
            panic!("record was skipped");
        };
        assert!(first.thread_created);
        assert_eq!(first.sort_order, 3);
        assert_eq!(first.account, Some(AccountChange::Inserted));
        assert!(matches!(first.timer, Some(TimerUpdate::Updated(token)) if token.duration_seconds == 3600));

        let RecordOutcome::Merged(second) = merge_contact(&mut conn, &local, &record).await.unwrap()
        else {
            panic!("record was skipped");
        };
        assert_eq!(second.thread_id, first.thread_id);
        assert!(!second.thread_created);
        assert_eq!(second.account, Some(AccountChange::Unchanged));
        assert!(matches!(second.timer, Some(TimerUpdate::Unchanged(_))));
    }

    #[tokio::test]
    async fn missing_inbox_position_sorts_last() {
        let db = Database::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let outcome = merge_contact(&mut conn, &local_identifiers(), &contact(None, Some("+15552222222")))
            .await
            .unwrap();
        let RecordOutcome::Merged(merged) = outcome else {
            panic!("record was skipped");
        };
        assert_eq!(merged.sort_order, u32::MAX);
        assert_eq!(merged.timer, None);
    }
}
