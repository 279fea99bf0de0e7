//! Credential pool persistence with SQLite
//!
//! Keeps API keys per provider together with an append-only error log. The
//! error log drives rate-limit cooldowns during selection; nothing else reads
//! it.

use crate::util::{mask_secret, truncate};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Minutes a credential stays out of rotation after a rate-limit error.
pub const RATE_LIMIT_WINDOW_MINUTES: i64 = 5;

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Stored timestamps start with a four-digit year; anything else counts as unset
const TIMESTAMP_GLOB: &str = "[0-9][0-9][0-9][0-9]-*";

const CREDENTIAL_COLUMNS: &str =
    "id, provider, api_key, name, created_at, last_used, use_count, is_active";

/// Kind of failure recorded against a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Other => "OTHER",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "RATE_LIMIT" => ErrorKind::RateLimit,
            _ => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub provider: String,
    pub secret: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub active: bool,
}

impl Credential {
    /// Secret with only its edges visible, for listings and logs.
    pub fn masked_secret(&self) -> String {
        mask_secret(&self.secret)
    }

    /// Name if present, otherwise `#id`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} (#{})", name, self.id),
            None => format!("#{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub credential_id: i64,
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// What happened when adding a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added(i64),
    /// The same secret existed but had been deleted
    Reactivated(i64),
    /// The same secret is already active for this provider
    Duplicate,
}

/// Why the store could not be opened
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not create {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// SQLite-backed credential pool
pub struct CredentialStore {
    conn: Connection,
}

impl CredentialStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Ok(Self::init(conn)?)
    }

    /// Store that lives only as long as the value; used by tests and dry runs
    pub fn open_in_memory() -> SqlResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch(include_str!("credentials_schema.sql"))?;
        Ok(Self { conn })
    }

    pub fn add(
        &self,
        provider: &str,
        secret: &str,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> SqlResult<AddOutcome> {
        let existing: Option<(i64, bool)> = self
            .conn
            .query_row(
                "SELECT id, is_active FROM api_keys WHERE provider = ?1 AND api_key = ?2",
                params![provider, secret],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((_, true)) => Ok(AddOutcome::Duplicate),
            Some((id, false)) => {
                self.conn.execute(
                    "UPDATE api_keys SET is_active = 1, name = COALESCE(?1, name) WHERE id = ?2",
                    params![name, id],
                )?;
                Ok(AddOutcome::Reactivated(id))
            }
            None => {
                self.conn.execute(
                    "INSERT INTO api_keys (provider, api_key, name, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![provider, secret, name, timestamp(now)],
                )?;
                Ok(AddOutcome::Added(self.conn.last_insert_rowid()))
            }
        }
    }

    /// Credentials ordered by provider then id, optionally for one provider
    pub fn list(&self, provider: Option<&str>, include_inactive: bool) -> SqlResult<Vec<Credential>> {
        let sql = format!(
            "SELECT {} FROM api_keys
             WHERE (?1 IS NULL OR provider = ?1) AND (?2 OR is_active = 1)
             ORDER BY provider, id",
            CREDENTIAL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![provider, include_inactive], credential_from_row)?;
        rows.collect()
    }

    pub fn get(&self, id: i64) -> SqlResult<Option<Credential>> {
        let sql = format!("SELECT {} FROM api_keys WHERE id = ?1", CREDENTIAL_COLUMNS);
        self.conn
            .query_row(&sql, params![id], credential_from_row)
            .optional()
    }

    /// Soft delete. Returns false if no active credential had this id.
    pub fn deactivate(&self, id: i64) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn active_ids(&self, provider: &str) -> SqlResult<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM api_keys WHERE provider = ?1 AND is_active = 1 ORDER BY id")?;
        let rows = stmt.query_map(params![provider], |row| row.get(0))?;
        rows.collect()
    }

    pub fn active_count(&self, provider: &str) -> SqlResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE provider = ?1 AND is_active = 1",
            params![provider],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Dispense the least recently used credential that is not cooling down
    /// after a rate limit. The returned credential already reflects the
    /// updated `last_used` and `use_count`.
    pub fn next_credential(
        &self,
        provider: &str,
        now: DateTime<Utc>,
    ) -> SqlResult<Option<Credential>> {
        let cutoff = now - Duration::minutes(RATE_LIMIT_WINDOW_MINUTES);
        let tx = self.conn.unchecked_transaction()?;

        let sql = format!(
            "SELECT {} FROM api_keys k
             WHERE k.provider = ?1 AND k.is_active = 1
               AND NOT EXISTS (
                   SELECT 1 FROM api_key_errors e
                   WHERE e.api_key_id = k.id
                     AND e.error_type = 'RATE_LIMIT'
                     AND e.occurred_at GLOB ?3
                     AND e.occurred_at > ?2
               )
             ORDER BY CASE WHEN k.last_used GLOB ?3 THEN k.last_used END ASC, k.use_count ASC, k.created_at ASC, k.id ASC
             LIMIT 1",
            CREDENTIAL_COLUMNS
        );
        let picked = tx
            .query_row(
                &sql,
                params![provider, timestamp(cutoff), TIMESTAMP_GLOB],
                credential_from_row,
            )
            .optional()?;

        let Some(mut credential) = picked else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE api_keys SET last_used = ?1, use_count = use_count + 1 WHERE id = ?2",
            params![timestamp(now), credential.id],
        )?;
        tx.commit()?;

        credential.last_used = Some(now);
        credential.use_count += 1;
        Ok(Some(credential))
    }

    pub fn record_error(
        &self,
        credential_id: i64,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO api_key_errors (api_key_id, error_type, error_message, occurred_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                credential_id,
                kind.as_str(),
                truncate(message, MAX_ERROR_MESSAGE_CHARS),
                timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// Most recent errors for a credential, newest first
    pub fn recent_errors(&self, credential_id: i64, limit: usize) -> SqlResult<Vec<ErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT api_key_id, error_type, error_message, occurred_at
             FROM api_key_errors WHERE api_key_id = ?1
             ORDER BY occurred_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![credential_id, limit as i64], |row| {
            let kind: String = row.get(1)?;
            let occurred: String = row.get(3)?;
            Ok(ErrorRecord {
                credential_id: row.get(0)?,
                kind: ErrorKind::from_str(&kind),
                message: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                occurred_at: parse_timestamp(&occurred).unwrap_or(DateTime::UNIX_EPOCH),
            })
        })?;
        rows.collect()
    }
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `None` for text that is not an RFC 3339 timestamp
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(err) => {
            warn!(value = s, error = %err, "ignoring unreadable timestamp in the key database");
            None
        }
    }
}

fn credential_from_row(row: &Row<'_>) -> SqlResult<Credential> {
    let created_at: String = row.get(4)?;
    let last_used: Option<String> = row.get(5)?;
    Ok(Credential {
        id: row.get(0)?,
        provider: row.get(1)?,
        secret: row.get(2)?,
        name: row.get(3)?,
        created_at: parse_timestamp(&created_at).unwrap_or(DateTime::UNIX_EPOCH),
        last_used: last_used.as_deref().and_then(parse_timestamp),
        use_count: row.get(6)?,
        active: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(minutes_ago)
    }

    fn added(outcome: AddOutcome) -> i64 {
        match outcome {
            AddOutcome::Added(id) => id,
            other => panic!("expected Added, got {:?}", other),
        }
    }

    #[test]
    fn test_add_rejects_duplicate_per_provider() {
        let store = CredentialStore::open_in_memory().unwrap();
        let now = Utc::now();
        added(store.add("gemini", "key-1", Some("main"), now).unwrap());
        assert_eq!(
            store.add("gemini", "key-1", None, now).unwrap(),
            AddOutcome::Duplicate
        );
        // Same secret under another provider is a different credential
        added(store.add("openai", "key-1", None, now).unwrap());
        assert_eq!(store.list(None, false).unwrap().len(), 2);
    }

    #[test]
    fn test_deactivate_is_soft_and_readd_reactivates() {
        let store = CredentialStore::open_in_memory().unwrap();
        let id = added(store.add("gemini", "key-1", None, Utc::now()).unwrap());

        assert!(store.deactivate(id).unwrap());
        assert!(!store.deactivate(id).unwrap());
        assert_eq!(store.active_count("gemini").unwrap(), 0);

        let row = store.get(id).unwrap().unwrap();
        assert!(!row.active);
        assert_eq!(store.list(Some("gemini"), true).unwrap().len(), 1);

        assert_eq!(
            store.add("gemini", "key-1", None, Utc::now()).unwrap(),
            AddOutcome::Reactivated(id)
        );
        assert_eq!(store.active_ids("gemini").unwrap(), vec![id]);
    }

    #[test]
    fn test_next_credential_skips_recently_rate_limited() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(60)).unwrap());
        let b = added(store.add("gemini", "key-b", None, at(30)).unwrap());

        store
            .record_error(a, ErrorKind::RateLimit, "429 Too Many Requests", at(2))
            .unwrap();

        let picked = store.next_credential("gemini", Utc::now()).unwrap().unwrap();
        assert_eq!(picked.id, b);
    }

    #[test]
    fn test_rate_limit_cooldown_expires() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(60)).unwrap());
        store
            .record_error(a, ErrorKind::RateLimit, "quota", at(6))
            .unwrap();
        let picked = store.next_credential("gemini", Utc::now()).unwrap().unwrap();
        assert_eq!(picked.id, a);
    }

    #[test]
    fn test_other_errors_do_not_exclude() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(60)).unwrap());
        store
            .record_error(a, ErrorKind::Other, "bad request", at(1))
            .unwrap();
        assert!(store.next_credential("gemini", Utc::now()).unwrap().is_some());
    }

    #[test]
    fn test_selection_is_least_recently_used_and_dispenses() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(60)).unwrap());
        let b = added(store.add("gemini", "key-b", None, at(50)).unwrap());

        // Both unused: creation order breaks the tie
        let first = store.next_credential("gemini", at(3)).unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.use_count, 1);

        let second = store.next_credential("gemini", at(2)).unwrap().unwrap();
        assert_eq!(second.id, b);

        let third = store.next_credential("gemini", at(1)).unwrap().unwrap();
        assert_eq!(third.id, a);
        assert_eq!(store.get(a).unwrap().unwrap().use_count, 2);
    }

    #[test]
    fn test_next_credential_none_when_all_cooling_down() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("openai", "key-a", None, at(10)).unwrap());
        store
            .record_error(a, ErrorKind::RateLimit, "rate limit", at(0))
            .unwrap();
        assert!(store.next_credential("openai", Utc::now()).unwrap().is_none());
        assert!(store.next_credential("gemini", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_error_log_is_truncated_and_ordered() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(10)).unwrap());
        store
            .record_error(a, ErrorKind::Other, &"e".repeat(900), at(5))
            .unwrap();
        store
            .record_error(a, ErrorKind::RateLimit, "slow down", at(1))
            .unwrap();

        let errors = store.recent_errors(a, 10).unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, ErrorKind::RateLimit);
        assert_eq!(errors[1].message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
    }

    #[test]
    fn test_store_persists_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("keys.db");
        {
            let store = CredentialStore::open(&path).unwrap();
            store
                .add("gemini", "AIzaSyExampleExample", Some("work"), Utc::now())
                .unwrap();
        }
        let store = CredentialStore::open(&path).unwrap();
        let all = store.list(Some("gemini"), false).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].masked_secret(), "AIza…mple");
        assert_eq!(all[0].label(), format!("work (#{})", all[0].id));
    }

    #[test]
    fn test_open_reports_unusable_directory() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let Err(err) = CredentialStore::open(&blocker.join("keys.db")) else {
            panic!("opening under a regular file should fail");
        };
        assert!(matches!(err, StoreError::Directory { ref path, .. } if path == &blocker));
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[test]
    fn test_unreadable_timestamps_count_as_unset() {
        let store = CredentialStore::open_in_memory().unwrap();
        let a = added(store.add("gemini", "key-a", None, at(60)).unwrap());
        let b = added(store.add("gemini", "key-b", None, at(50)).unwrap());
        store.next_credential("gemini", at(30)).unwrap();
        store
            .conn
            .execute(
                "UPDATE api_keys SET last_used = 'yesterday-ish', created_at = 'soon' WHERE id = ?1",
                params![b],
            )
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO api_key_errors (api_key_id, error_type, error_message, occurred_at)
                 VALUES (?1, 'RATE_LIMIT', 'slow down', 'garbage')",
                params![b],
            )
            .unwrap();

        let listed = store.get(b).unwrap().unwrap();
        assert_eq!(listed.last_used, None);
        assert_eq!(listed.created_at, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            store.recent_errors(b, 1).unwrap()[0].occurred_at,
            DateTime::<Utc>::UNIX_EPOCH
        );

        // `a` was used half an hour ago; `b` reads as never used and is not cooling down
        let next = store.next_credential("gemini", Utc::now()).unwrap().unwrap();
        assert_eq!(next.id, b);
        assert_eq!(store.get(a).unwrap().unwrap().use_count, 1);
    }
}
