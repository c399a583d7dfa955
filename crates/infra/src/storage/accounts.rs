//! Known contacts ("accounts") learned from contact syncs.
//!
//! These are the rows a complete sync prunes: an account whose phone number is
//! absent from the latest authoritative contact list no longer exists remotely.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use contactsync_core::{AccountId, Aci, E164};

use super::{StorageError, parse_column, parse_optional_column};

const TABLE: &str = "signal_accounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalAccount {
    pub id: AccountId,
    pub phone_number: E164,
    pub aci: Option<Aci>,
    pub contact_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountChange {
    Inserted,
    Updated,
    Unchanged,
}

impl AccountChange {
    pub fn is_change(self) -> bool {
        !matches!(self, AccountChange::Unchanged)
    }
}

fn from_row(row: &SqliteRow) -> Result<SignalAccount, StorageError> {
    Ok(SignalAccount {
        id: parse_column(row, "id", TABLE)?,
        phone_number: parse_column(row, "phone_number", TABLE)?,
        aci: parse_optional_column(row, "aci", TABLE)?,
        contact_name: row.try_get("contact_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn fetch_by_phone_number(
    conn: &mut SqliteConnection,
    phone_number: &E164,
) -> Result<Option<SignalAccount>, StorageError> {
    let row = sqlx::query(
        r#"
        SELECT id, phone_number, aci, contact_name, created_at, updated_at
        FROM signal_accounts
        WHERE phone_number = ?1
        "#,
    )
    .bind(phone_number.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn fetch_all(conn: &mut SqliteConnection) -> Result<Vec<SignalAccount>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT id, phone_number, aci, contact_name, created_at, updated_at
        FROM signal_accounts
        ORDER BY phone_number
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Ids and phone numbers of every known contact; the minimum pruning needs.
pub async fn fetch_all_phone_numbers(
    conn: &mut SqliteConnection,
) -> Result<Vec<(AccountId, E164)>, StorageError> {
    let rows = sqlx::query("SELECT id, phone_number FROM signal_accounts ORDER BY phone_number")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            Ok((
                parse_column(row, "id", TABLE)?,
                parse_column(row, "phone_number", TABLE)?,
            ))
        })
        .collect()
}

/// Insert or refresh the known contact for `phone_number`.
pub async fn upsert(
    conn: &mut SqliteConnection,
    phone_number: &E164,
    aci: Option<Aci>,
    contact_name: Option<&str>,
) -> Result<AccountChange, StorageError> {
    let now = Utc::now();

    match fetch_by_phone_number(conn, phone_number).await? {
        None => {
            sqlx::query(
                r#"
                INSERT INTO signal_accounts (id, phone_number, aci, contact_name, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                "#,
            )
            .bind(AccountId::new().to_string())
            .bind(phone_number.as_str())
            .bind(aci.map(|aci| aci.to_string()))
            .bind(contact_name)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(AccountChange::Inserted)
        }
        Some(existing) => {
            // A record without an ACI does not erase one we already know.
            let aci = aci.or(existing.aci);
            if existing.aci == aci && existing.contact_name.as_deref() == contact_name {
                return Ok(AccountChange::Unchanged);
            }
            sqlx::query(
                "UPDATE signal_accounts SET aci = ?2, contact_name = ?3, updated_at = ?4 WHERE id = ?1",
            )
            .bind(existing.id.to_string())
            .bind(aci.map(|aci| aci.to_string()))
            .bind(contact_name)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(AccountChange::Updated)
        }
    }
}

/// Delete the given accounts; returns the number of rows removed.
pub async fn delete_many(
    conn: &mut SqliteConnection,
    ids: &[AccountId],
) -> Result<u64, StorageError> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("DELETE FROM signal_accounts WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(")");

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}
