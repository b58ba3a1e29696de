//! Sqlite-backed storage adapter.
//!
//! All rusqlite work runs on the blocking pool; each adapter invocation is
//! one transaction, so no partial write is observable outside it. Duplicate
//! event uids are absorbed, never surfaced as errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use time::format_description::well_known::Rfc3339;

use super::{CredentialRecord, CredentialStore, StoreError, TagStore};
use crate::event::{BillingEvent, EventKind};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

/// Pre-serialized persistence shape of one event. Serialization and the
/// timestamp conversion happen before the transaction body, so a formatting
/// failure never opens a transaction.
#[derive(Clone, Debug)]
pub struct EventRow {
    pub uid: String,
    pub kind: &'static str,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub reported_at: String,
    pub data_json: String,
}

impl EventRow {
    pub fn prepare(
        event: &BillingEvent,
        api_key_id: Option<&str>,
        uid: &str,
    ) -> Result<Self, StoreError> {
        let reported_at = event
            .reported_at
            .format(&Rfc3339)
            .map_err(|err| StoreError::InvalidTimestamp(err.to_string()))?;
        let data_json = event.payload.data_json()?;
        Ok(Self {
            uid: uid.to_string(),
            kind: event.kind().as_str(),
            user_id: event.user_id().map(str::to_string),
            api_key_id: api_key_id.map(str::to_string),
            reported_at,
            data_json,
        })
    }
}

/// Event row as read back from the store.
#[derive(Clone, Debug)]
pub struct PersistedEvent {
    pub id: i64,
    pub uid: String,
    pub kind: EventKind,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub reported_at: String,
    pub data: serde_json::Value,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            conn.execute(
                "INSERT INTO credentials (id, key_hash, expires_at, revoked)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     key_hash = excluded.key_hash,
                     expires_at = excluded.expires_at,
                     revoked = excluded.revoked",
                rusqlite::params![
                    record.id,
                    record.key_hash,
                    record.expires_at,
                    record.revoked as i64
                ],
            )
            .map_err(query_error)?;
            Ok(())
        })
        .await?
    }

    pub async fn credential_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let path = self.path.clone();
        let key_hash = key_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CredentialRecord>, StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            conn.query_row(
                "SELECT id, key_hash, expires_at, revoked FROM credentials WHERE key_hash = ?1",
                rusqlite::params![key_hash],
                |row| {
                    Ok(CredentialRecord {
                        id: row.get(0)?,
                        key_hash: row.get(1)?,
                        expires_at: row.get(2)?,
                        revoked: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()
            .map_err(query_error)
        })
        .await?
    }

    pub async fn set_tag_amount(&self, tag: &str, amount_cents: i64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let tag = tag.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            conn.execute(
                "INSERT INTO tags (tag, amount_cents) VALUES (?1, ?2)
                 ON CONFLICT(tag) DO UPDATE SET amount_cents = excluded.amount_cents",
                rusqlite::params![tag, amount_cents],
            )
            .map_err(query_error)?;
            Ok(())
        })
        .await?
    }

    pub async fn tag_amount(&self, tag: &str) -> Result<Option<i64>, StoreError> {
        let path = self.path.clone();
        let tag = tag.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            conn.query_row(
                "SELECT amount_cents FROM tags WHERE tag = ?1",
                rusqlite::params![tag],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_error)
        })
        .await?
    }

    /// Writes one event atomically: upsert the owning user row, then insert
    /// the event. `Ok(None)` means the uid was already recorded, which is a
    /// benign duplicate, not an error.
    pub async fn insert_event(
        &self,
        event: &BillingEvent,
        api_key_id: Option<&str>,
        uid: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row = EventRow::prepare(event, api_key_id, uid)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let mut conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::TransactionFailed(err.to_string()))?;

            if let Some(user_id) = &row.user_id {
                tx.execute(
                    "INSERT OR IGNORE INTO users (id) VALUES (?1)",
                    rusqlite::params![user_id],
                )
                .map_err(|err| StoreError::UserInsertFailed(err.to_string()))?;
            }

            let inserted = tx.execute(
                "INSERT INTO events (uid, kind, user_id, api_key_id, reported_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.uid,
                    row.kind,
                    row.user_id,
                    row.api_key_id,
                    row.reported_at,
                    row.data_json
                ],
            );
            match inserted {
                Ok(0) => Err(StoreError::EmptyResult),
                Ok(_) => {
                    let id = tx.last_insert_rowid();
                    tx.commit()
                        .map_err(|err| StoreError::TransactionFailed(err.to_string()))?;
                    Ok(Some(id))
                }
                Err(err) if is_unique_violation(&err) => {
                    // Already recorded; keep the user upsert.
                    tx.commit()
                        .map_err(|err| StoreError::TransactionFailed(err.to_string()))?;
                    Ok(None)
                }
                Err(err) => Err(classify_insert_error(err)),
            }
        })
        .await?
    }

    /// Multi-row path for the batch coordinator: one transaction for the
    /// whole slice, duplicates skipped. Returns the number of rows actually
    /// inserted.
    pub async fn insert_events(&self, rows: Vec<EventRow>) -> Result<usize, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let mut conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::TransactionFailed(err.to_string()))?;

            let mut persisted = 0usize;
            for row in &rows {
                if let Some(user_id) = &row.user_id {
                    tx.execute(
                        "INSERT OR IGNORE INTO users (id) VALUES (?1)",
                        rusqlite::params![user_id],
                    )
                    .map_err(|err| StoreError::UserInsertFailed(err.to_string()))?;
                }
                let changed = tx
                    .execute(
                        "INSERT OR IGNORE INTO events
                             (uid, kind, user_id, api_key_id, reported_at, data_json)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![
                            row.uid,
                            row.kind,
                            row.user_id,
                            row.api_key_id,
                            row.reported_at,
                            row.data_json
                        ],
                    )
                    .map_err(classify_insert_error)?;
                persisted += changed;
            }

            tx.commit()
                .map_err(|err| StoreError::TransactionFailed(err.to_string()))?;
            Ok(persisted)
        })
        .await?
    }

    pub async fn list_events(&self, user_id: &str) -> Result<Vec<PersistedEvent>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<PersistedEvent>, StoreError> {
            let conn = open_connection(path).map_err(query_error)?;
            init_schema(&conn).map_err(query_error)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, uid, kind, user_id, api_key_id, reported_at, data_json
                     FROM events WHERE user_id = ?1 ORDER BY id",
                )
                .map_err(query_error)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(query_error)?;

            let mut out = Vec::new();
            for row in rows {
                let (id, uid, kind_raw, user_id, api_key_id, reported_at, data_json) =
                    row.map_err(query_error)?;
                let kind = EventKind::from_persisted(&kind_raw)
                    .ok_or_else(|| StoreError::UnknownEventType(kind_raw.clone()))?;
                out.push(PersistedEvent {
                    id,
                    uid,
                    kind,
                    user_id,
                    api_key_id,
                    reported_at,
                    data: serde_json::from_str(&data_json)?,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Derived price for checkout-link generation: the sum of debit cents
    /// across the user's rows. Missing users and non-positive sums are
    /// rejected here rather than propagated downstream.
    pub async fn price(&self, user_id: &str) -> Result<i64, StoreError> {
        let events = self.list_events(user_id).await?;
        if events.is_empty() {
            return Err(StoreError::PriceCalculationFailed(format!(
                "no events recorded for user {user_id}"
            )));
        }
        let mut total: i64 = 0;
        for event in &events {
            if let Some(cents) = event.data.get("debitAmountCents").and_then(|v| v.as_i64()) {
                total = total.checked_add(cents).ok_or_else(|| {
                    StoreError::PriceCalculationFailed("price overflow".to_string())
                })?;
            }
        }
        if total <= 0 {
            return Err(StoreError::PriceCalculationFailed(format!(
                "computed price {total} is not positive"
            )));
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl CredentialStore for SqliteStore {
    async fn credential_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        SqliteStore::credential_by_hash(self, key_hash).await
    }
}

#[async_trait::async_trait]
impl TagStore for SqliteStore {
    async fn tag_amount(&self, tag: &str) -> Result<Option<i64>, StoreError> {
        SqliteStore::tag_amount(self, tag).await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            expires_at INTEGER NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tags (
            tag TEXT PRIMARY KEY NOT NULL,
            amount_cents INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            user_id TEXT REFERENCES users(id),
            api_key_id TEXT,
            reported_at TEXT NOT NULL,
            data_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_user_kind
            ON events(user_id, kind);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    );
    Ok(conn)
}

fn query_error(err: rusqlite::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    if let rusqlite::Error::SqliteFailure(code, _) = err {
        return code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY;
    }
    err.to_string().contains("UNIQUE constraint failed")
}

fn classify_insert_error(err: rusqlite::Error) -> StoreError {
    let message = err.to_string();
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return StoreError::ForeignKeyViolation(message);
        }
        if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return StoreError::DuplicateKey(message);
        }
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::ConstraintViolation(message);
        }
    }
    // No structured code; fall back to message patterns.
    if message.contains("UNIQUE constraint failed") {
        return StoreError::DuplicateKey(message);
    }
    if message.contains("FOREIGN KEY constraint failed") {
        return StoreError::ForeignKeyViolation(message);
    }
    StoreError::EventInsertFailed(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AiTokenUsageData, EventPayload, PaymentData, SdkCallData};

    const USER: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

    fn sdk_call(cents: i64) -> BillingEvent {
        BillingEvent::new(EventPayload::SdkCall {
            user_id: USER.to_string(),
            data: SdkCallData {
                feature: "search".to_string(),
                debit_amount_cents: cents,
            },
        })
    }

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("metergate.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn credentials_round_trip() {
        let (_dir, store) = store().await;
        let record = CredentialRecord {
            id: "key-1".to_string(),
            key_hash: "abc123".to_string(),
            expires_at: 4_000_000_000,
            revoked: false,
        };
        store.upsert_credential(&record).await.expect("upsert");

        let loaded = store
            .credential_by_hash("abc123")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(loaded, record);

        assert!(
            store
                .credential_by_hash("missing")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_event_uid_is_absorbed() {
        let (_dir, store) = store().await;
        let event = sdk_call(250);

        let first = store
            .insert_event(&event, Some("key-1"), "evt-1")
            .await
            .expect("first insert");
        assert!(first.is_some());

        let second = store
            .insert_event(&event, Some("key-1"), "evt-1")
            .await
            .expect("second insert");
        assert!(second.is_none());

        let events = store.list_events(USER).await.expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, "evt-1");
        assert_eq!(events[0].api_key_id.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn persisted_event_preserves_kind_user_and_data() {
        let (_dir, store) = store().await;
        let event = BillingEvent::new(EventPayload::AiTokenUsage {
            user_id: USER.to_string(),
            data: AiTokenUsageData {
                model: "gpt-4o-mini".to_string(),
                input_tokens: 12,
                output_tokens: 34,
            },
        });
        store
            .insert_event(&event, None, "evt-usage")
            .await
            .expect("insert");

        let events = store.list_events(USER).await.expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::AiTokenUsage);
        assert_eq!(events[0].user_id.as_deref(), Some(USER));
        assert_eq!(events[0].data["model"], "gpt-4o-mini");
        assert_eq!(events[0].data["inputTokens"], 12);
        assert_eq!(events[0].data["outputTokens"], 34);
        // RFC 3339, value unchanged up to formatting.
        assert!(events[0].reported_at.contains('T'), "{}", events[0].reported_at);
    }

    #[tokio::test]
    async fn batch_insert_skips_duplicates_and_counts_inserted() {
        let (_dir, store) = store().await;
        let rows = vec![
            EventRow::prepare(&sdk_call(100), Some("key-1"), "evt-1").expect("row"),
            EventRow::prepare(&sdk_call(200), Some("key-1"), "evt-2").expect("row"),
            EventRow::prepare(&sdk_call(300), Some("key-1"), "evt-1").expect("row"),
        ];
        let persisted = store.insert_events(rows).await.expect("batch");
        assert_eq!(persisted, 2);

        let events = store.list_events(USER).await.expect("list");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn price_sums_debits_and_rejects_empty_or_non_positive() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.price(USER).await,
            Err(StoreError::PriceCalculationFailed(_))
        ));

        store
            .insert_event(&sdk_call(250), None, "evt-1")
            .await
            .expect("insert");
        store
            .insert_event(
                &BillingEvent::new(EventPayload::Payment {
                    user_id: USER.to_string(),
                    data: PaymentData {
                        debit_amount_cents: 1050,
                    },
                }),
                None,
                "evt-2",
            )
            .await
            .expect("insert");
        assert_eq!(store.price(USER).await.expect("price"), 1300);

        let zero_user = "00000000-0000-0000-0000-000000000000";
        store
            .insert_event(
                &BillingEvent::new(EventPayload::AiTokenUsage {
                    user_id: zero_user.to_string(),
                    data: AiTokenUsageData {
                        model: "m".to_string(),
                        input_tokens: 1,
                        output_tokens: 1,
                    },
                }),
                None,
                "evt-3",
            )
            .await
            .expect("insert");
        assert!(matches!(
            store.price(zero_user).await,
            Err(StoreError::PriceCalculationFailed(_))
        ));
    }

    #[tokio::test]
    async fn tag_amounts_round_trip() {
        let (_dir, store) = store().await;
        store.set_tag_amount("pro-call", 250).await.expect("set");
        assert_eq!(
            store.tag_amount("pro-call").await.expect("get"),
            Some(250)
        );
        assert_eq!(store.tag_amount("missing").await.expect("get"), None);

        store.set_tag_amount("pro-call", 300).await.expect("update");
        assert_eq!(
            store.tag_amount("pro-call").await.expect("get"),
            Some(300)
        );
    }

    #[test]
    fn insert_errors_classify_by_extended_code_and_message() {
        let fk = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY),
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        assert!(matches!(
            classify_insert_error(fk),
            StoreError::ForeignKeyViolation(_)
        ));

        let unique = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: events.uid".to_string()),
        );
        assert!(is_unique_violation(&unique));
        assert!(matches!(
            classify_insert_error(unique),
            StoreError::DuplicateKey(_)
        ));

        let check = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_CHECK),
            Some("CHECK constraint failed".to_string()),
        );
        assert!(matches!(
            classify_insert_error(check),
            StoreError::ConstraintViolation(_)
        ));
    }
}
