//! Recipient rows: one per remote identity, keyed by ACI and/or phone number.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use contactsync_core::{Aci, E164, RecipientId};

use super::{StorageError, parse_column, parse_optional_column};

const TABLE: &str = "recipients";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRecipient {
    pub id: RecipientId,
    pub aci: Option<Aci>,
    pub phone_number: Option<E164>,
    pub is_registered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignalRecipient {
    pub fn new(aci: Option<Aci>, phone_number: Option<E164>, is_registered: bool) -> Self {
        let now = Utc::now();
        Self {
            id: RecipientId::new(),
            aci,
            phone_number,
            is_registered,
            created_at: now,
            updated_at: now,
        }
    }
}

fn from_row(row: &SqliteRow) -> Result<SignalRecipient, StorageError> {
    Ok(SignalRecipient {
        id: parse_column(row, "id", TABLE)?,
        aci: parse_optional_column(row, "aci", TABLE)?,
        phone_number: parse_optional_column(row, "phone_number", TABLE)?,
        is_registered: row.try_get("is_registered")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const COLUMNS: &str = "id, aci, phone_number, is_registered, created_at, updated_at";

pub async fn fetch_by_aci(
    conn: &mut SqliteConnection,
    aci: &Aci,
) -> Result<Option<SignalRecipient>, StorageError> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM recipients WHERE aci = ?1"))
        .bind(aci.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn fetch_by_phone_number(
    conn: &mut SqliteConnection,
    phone_number: &E164,
) -> Result<Option<SignalRecipient>, StorageError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM recipients WHERE phone_number = ?1"
    ))
    .bind(phone_number.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn fetch_all(conn: &mut SqliteConnection) -> Result<Vec<SignalRecipient>, StorageError> {
    let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM recipients ORDER BY created_at, id"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

pub async fn insert(
    conn: &mut SqliteConnection,
    recipient: &SignalRecipient,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO recipients (id, aci, phone_number, is_registered, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(recipient.id.to_string())
    .bind(recipient.aci.map(|aci| aci.to_string()))
    .bind(recipient.phone_number.as_ref().map(|p| p.as_str().to_string()))
    .bind(recipient.is_registered)
    .bind(recipient.created_at)
    .bind(recipient.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Overwrite the identity columns of an existing recipient.
pub async fn update(
    conn: &mut SqliteConnection,
    recipient: &SignalRecipient,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE recipients
        SET aci = ?2, phone_number = ?3, is_registered = ?4, updated_at = ?5
        WHERE id = ?1
        "#,
    )
    .bind(recipient.id.to_string())
    .bind(recipient.aci.map(|aci| aci.to_string()))
    .bind(recipient.phone_number.as_ref().map(|p| p.as_str().to_string()))
    .bind(recipient.is_registered)
    .bind(recipient.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
