//! Per-thread disappearing message timers.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use contactsync_core::ThreadId;

use super::{StorageError, parse_column, u32_column};

const TABLE: &str = "disappearing_message_configs";

/// The user-visible timer state: enabled flag plus duration.
///
/// Two tokens built from the same remote value are always equal, which makes
/// applying a remote update idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisappearingMessageToken {
    pub is_enabled: bool,
    pub duration_seconds: u32,
}

impl DisappearingMessageToken {
    pub const DISABLED: Self = Self {
        is_enabled: false,
        duration_seconds: 0,
    };

    /// Remote timers use `0` to mean "off".
    pub fn from_remote_seconds(seconds: u32) -> Self {
        if seconds == 0 {
            Self::DISABLED
        } else {
            Self {
                is_enabled: true,
                duration_seconds: seconds,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisappearingMessagesConfiguration {
    pub thread_id: ThreadId,
    pub token: DisappearingMessageToken,
    pub timer_version: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerUpdate {
    /// Stored state already matched (or the update was older than it).
    Unchanged(DisappearingMessageToken),
    Updated(DisappearingMessageToken),
}

impl TimerUpdate {
    pub fn token(&self) -> DisappearingMessageToken {
        match self {
            TimerUpdate::Unchanged(token) | TimerUpdate::Updated(token) => *token,
        }
    }
}

fn from_row(row: &SqliteRow) -> Result<DisappearingMessagesConfiguration, StorageError> {
    Ok(DisappearingMessagesConfiguration {
        thread_id: parse_column(row, "thread_id", TABLE)?,
        token: DisappearingMessageToken {
            is_enabled: row.try_get("is_enabled")?,
            duration_seconds: u32_column(row, "duration_seconds", TABLE)?,
        },
        timer_version: u32_column(row, "timer_version", TABLE)?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn fetch(
    conn: &mut SqliteConnection,
    thread_id: ThreadId,
) -> Result<Option<DisappearingMessagesConfiguration>, StorageError> {
    let row = sqlx::query(
        r#"
        SELECT thread_id, is_enabled, duration_seconds, timer_version, updated_at
        FROM disappearing_message_configs
        WHERE thread_id = ?1
        "#,
    )
    .bind(thread_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Apply a timer received from another device.
///
/// A thread without a stored configuration is disabled. Updates carrying a
/// version lower than the stored one are ignored.
pub async fn apply_remote_update(
    conn: &mut SqliteConnection,
    thread_id: ThreadId,
    remote_seconds: u32,
    remote_version: Option<u32>,
) -> Result<TimerUpdate, StorageError> {
    let token = DisappearingMessageToken::from_remote_seconds(remote_seconds);
    let current = fetch(conn, thread_id).await?;

    let current_version = current.as_ref().map_or(0, |c| c.timer_version);
    if remote_version.is_some_and(|v| v < current_version) {
        let kept = current.map_or(DisappearingMessageToken::DISABLED, |c| c.token);
        return Ok(TimerUpdate::Unchanged(kept));
    }

    let current_token = current.as_ref().map_or(DisappearingMessageToken::DISABLED, |c| c.token);
    let version = remote_version.unwrap_or(current_version);
    if current_token == token && version == current_version {
        return Ok(TimerUpdate::Unchanged(token));
    }

    sqlx::query(
        r#"
        INSERT INTO disappearing_message_configs
            (thread_id, is_enabled, duration_seconds, timer_version, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (thread_id) DO UPDATE SET
            is_enabled = excluded.is_enabled,
            duration_seconds = excluded.duration_seconds,
            timer_version = excluded.timer_version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(thread_id.to_string())
    .bind(token.is_enabled)
    .bind(i64::from(token.duration_seconds))
    .bind(i64::from(version))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if current_token == token {
        Ok(TimerUpdate::Unchanged(token))
    } else {
        Ok(TimerUpdate::Updated(token))
    }
}
