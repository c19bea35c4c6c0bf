//! Lock table in the shared SQLite database.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use super::{LockBackend, LockMode, LockOwner};
use crate::db::Db;
use crate::error::{GraphRepoError, Result};

/// `object_locks` rows; every process opening the same database file shares them.
#[derive(Debug, Clone)]
pub struct SqliteLockBackend {
    db: Db,
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn server_error(action: &str, key: &str, e: impl std::fmt::Display) -> GraphRepoError {
    GraphRepoError::LockServer(format!("{} {}: {}", action, key, e))
}

fn attempt(
    conn: &mut Connection,
    key: &str,
    mode: LockMode,
    owner: &LockOwner,
    lease: Duration,
) -> rusqlite::Result<bool> {
    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let reclaimed = tx.execute(
        "DELETE FROM object_locks WHERE lock_key = ?1 AND expires_at <= ?2",
        params![key, now_ms],
    )?;
    if reclaimed > 0 {
        log::warn!("Reclaimed {} expired lock(s) on {}", reclaimed, key);
    }

    let conflicts: i64 = match mode {
        LockMode::Write => tx.query_row(
            "SELECT COUNT(*) FROM object_locks WHERE lock_key = ?1 AND owner <> ?2",
            params![key, owner.as_str()],
            |row| row.get(0),
        )?,
        LockMode::Read => tx.query_row(
            "SELECT COUNT(*) FROM object_locks WHERE lock_key = ?1 AND owner <> ?2 AND mode = 'write'",
            params![key, owner.as_str()],
            |row| row.get(0),
        )?,
    };
    if conflicts > 0 {
        tx.commit()?;
        return Ok(false);
    }

    let expires_at = now_ms.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
    tx.execute(
        r#"
        INSERT INTO object_locks (lock_key, owner, mode, hold_count, acquired_at, expires_at)
        VALUES (?1, ?2, ?3, 1, ?4, ?5)
        ON CONFLICT(lock_key, owner, mode) DO UPDATE SET
            hold_count = hold_count + 1,
            expires_at = excluded.expires_at
        "#,
        params![key, owner.as_str(), mode.as_str(), now.to_rfc3339(), expires_at],
    )?;
    tx.commit()?;
    Ok(true)
}

fn extend(conn: &mut Connection, key: &str, mode: LockMode, owner: &LockOwner, lease: Duration) -> rusqlite::Result<bool> {
    let expires_at = Utc::now()
        .timestamp_millis()
        .saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        "UPDATE object_locks SET expires_at = MAX(expires_at, ?4) \
         WHERE lock_key = ?1 AND owner = ?2 AND mode = ?3",
        params![key, owner.as_str(), mode.as_str(), expires_at],
    )?;
    tx.commit()?;
    Ok(updated > 0)
}

impl SqliteLockBackend {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn connection(&self, key: &str) -> Result<Option<Connection>> {
        match self.db.open_connection() {
            Ok(conn) => Ok(Some(conn)),
            Err(GraphRepoError::Database(e)) if is_busy(&e) => Ok(None),
            Err(e) => Err(server_error("Cannot open lock table for", key, e)),
        }
    }
}

impl LockBackend for SqliteLockBackend {
    fn try_acquire(&self, key: &str, mode: LockMode, owner: &LockOwner, lease: Duration) -> Result<bool> {
        let Some(mut conn) = self.connection(key)? else {
            return Ok(false);
        };
        match attempt(&mut conn, key, mode, owner, lease) {
            Ok(acquired) => Ok(acquired),
            Err(e) if is_busy(&e) => Ok(false),
            Err(e) => Err(server_error("Cannot acquire lock on", key, e)),
        }
    }

    fn renew(&self, key: &str, mode: LockMode, owner: &LockOwner, lease: Duration) -> Result<bool> {
        let mut conn = self
            .db
            .open_connection()
            .map_err(|e| server_error("Cannot open lock table for", key, e))?;
        extend(&mut conn, key, mode, owner, lease).map_err(|e| server_error("Cannot renew lock on", key, e))
    }

    fn release(&self, key: &str, mode: LockMode, owner: &LockOwner) -> Result<()> {
        let mut conn = self
            .db
            .open_connection()
            .map_err(|e| server_error("Cannot open lock table for", key, e))?;
        let run = |conn: &mut Connection| -> rusqlite::Result<Option<i64>> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let held: Option<i64> = tx
                .query_row(
                    "SELECT hold_count FROM object_locks WHERE lock_key = ?1 AND owner = ?2 AND mode = ?3",
                    params![key, owner.as_str(), mode.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match held {
                Some(1) => {
                    tx.execute(
                        "DELETE FROM object_locks WHERE lock_key = ?1 AND owner = ?2 AND mode = ?3",
                        params![key, owner.as_str(), mode.as_str()],
                    )?;
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE object_locks SET hold_count = hold_count - 1 \
                         WHERE lock_key = ?1 AND owner = ?2 AND mode = ?3",
                        params![key, owner.as_str(), mode.as_str()],
                    )?;
                }
                None => {}
            }
            tx.commit()?;
            Ok(held)
        };
        match run(&mut conn) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(GraphRepoError::LockServer(format!(
                "{} lock on {} is not held by {}",
                mode, key, owner
            ))),
            Err(e) => Err(server_error("Cannot release lock on", key, e)),
        }
    }
}
