//! Contact threads: at most one per recipient.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use contactsync_core::{RecipientId, ThreadId};

use super::{StorageError, parse_column};

const TABLE: &str = "contact_threads";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactThread {
    pub id: ThreadId,
    pub recipient_id: RecipientId,
    pub should_be_visible: bool,
    pub created_at: DateTime<Utc>,
}

fn from_row(row: &SqliteRow) -> Result<ContactThread, StorageError> {
    Ok(ContactThread {
        id: parse_column(row, "id", TABLE)?,
        recipient_id: parse_column(row, "recipient_id", TABLE)?,
        should_be_visible: row.try_get("should_be_visible")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn fetch_by_recipient(
    conn: &mut SqliteConnection,
    recipient_id: RecipientId,
) -> Result<Option<ContactThread>, StorageError> {
    let row = sqlx::query(
        "SELECT id, recipient_id, should_be_visible, created_at FROM contact_threads WHERE recipient_id = ?1",
    )
    .bind(recipient_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn fetch_all(conn: &mut SqliteConnection) -> Result<Vec<ContactThread>, StorageError> {
    let rows = sqlx::query(
        "SELECT id, recipient_id, should_be_visible, created_at FROM contact_threads ORDER BY created_at, id",
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Fetch the recipient's thread, creating a visible one if absent.
///
/// Returns the thread and whether this call created it. An existing hidden
/// thread is made visible.
pub async fn fetch_or_create_visible(
    conn: &mut SqliteConnection,
    recipient_id: RecipientId,
) -> Result<(ContactThread, bool), StorageError> {
    if let Some(mut thread) = fetch_by_recipient(conn, recipient_id).await? {
        if !thread.should_be_visible {
            sqlx::query("UPDATE contact_threads SET should_be_visible = 1 WHERE id = ?1")
                .bind(thread.id.to_string())
                .execute(&mut *conn)
                .await?;
            thread.should_be_visible = true;
        }
        return Ok((thread, false));
    }

    let thread = ContactThread {
        id: ThreadId::new(),
        recipient_id,
        should_be_visible: true,
        created_at: Utc::now(),
    };
    sqlx::query(
        r#"
        INSERT INTO contact_threads (id, recipient_id, should_be_visible, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(thread.id.to_string())
    .bind(thread.recipient_id.to_string())
    .bind(thread.should_be_visible)
    .bind(thread.created_at)
    .execute(&mut *conn)
    .await?;

    Ok((thread, true))
}
