use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use time::OffsetDateTime;
use tracing::{debug, info, trace};

use crate::error::StoreError;

use super::{
    AppendOutcome, CreateMode, DEFAULT_EXPIRATION_SECS, DocumentStore, FetchedDocument, Key,
    NO_EXPIRATION, NewToken, Permissions, TokenGrant,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS Docs (
        docid TEXT PRIMARY KEY,
        lastAccess INTEGER,
        data BLOB
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS Keys (
        docid TEXT,
        name TEXT,
        value TEXT,
        version INTEGER,
        UNIQUE(docid, name),
        FOREIGN KEY (docid) REFERENCES Docs(docid) ON DELETE CASCADE
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS Tokens (
        tokenID TEXT UNIQUE,
        docID TEXT,
        userID TEXT,
        permissions TEXT,
        expiration INTEGER
    );
    "#,
    "CREATE INDEX IF NOT EXISTS TokenUserIndex ON Tokens(userID);",
];

/// SQLite-backed [`DocumentStore`]. All documents live in a single file
/// database; a one-connection pool serializes writers, and each operation
/// runs inside a transaction so the CAS checks are atomic.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    expiration: AtomicI64,
    last_sweep: Mutex<Option<Instant>>,
}

fn map_sqlx_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://vellum.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(map_sqlx_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(map_sqlx_err)?;
        }

        info!(url, "sqlite store ready");
        Ok(Self {
            pool,
            expiration: AtomicI64::new(0),
            last_sweep: Mutex::new(None),
        })
    }

    fn row_to_key(row: &SqliteRow) -> Key {
        Key {
            version: row.get::<i64, _>("version") as u32,
            name: row.get("name"),
            value: row.get("value"),
        }
    }

    /// Delete expired documents and tokens, at most once per hour.
    async fn sweep(&self) -> Result<(), StoreError> {
        let mut seconds = self.expiration.load(Ordering::Relaxed);
        if seconds == NO_EXPIRATION {
            return Ok(());
        }
        if seconds == 0 {
            seconds = DEFAULT_EXPIRATION_SECS;
        }

        {
            let mut last = self.last_sweep.lock().expect("sweep clock poisoned");
            if let Some(at) = *last
                && at.elapsed() < SWEEP_INTERVAL
            {
                return Ok(());
            }
            *last = Some(Instant::now());
        }

        let now = now_unix();
        let removed = sqlx::query("DELETE FROM Docs WHERE lastAccess < ?1")
            .bind(now - seconds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if removed.rows_affected() > 0 {
            info!(count = removed.rows_affected(), "removed expired documents");
        }
        sqlx::query("DELETE FROM Tokens WHERE expiration < ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_document(
        &self,
        doc_id: &str,
        mode: CreateMode,
        initial: &[u8],
    ) -> Result<FetchedDocument, StoreError> {
        self.sweep().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let existing: Option<Vec<u8>> = sqlx::query("SELECT data FROM Docs WHERE docid = ?1")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .map(|row| row.get("data"));

        if existing.is_none() && mode == CreateMode::NeverCreate {
            return Err(StoreError::Missing);
        }
        if existing.is_some() && mode == CreateMode::AlwaysCreate {
            return Err(StoreError::Exists);
        }

        let (content, created) = match existing {
            Some(data) => {
                sqlx::query("UPDATE Docs SET lastAccess = ?1 WHERE docid = ?2")
                    .bind(now_unix())
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;
                (data, false)
            }
            None => {
                sqlx::query("INSERT INTO Docs (docid, lastAccess, data) VALUES (?1, ?2, ?3)")
                    .bind(doc_id)
                    .bind(now_unix())
                    .bind(initial)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;
                (initial.to_vec(), true)
            }
        };

        tx.commit().await.map_err(map_sqlx_err)?;
        trace!(doc_id, created, len = content.len(), "fetched document");
        Ok(FetchedDocument { content, created })
    }

    async fn append_document(
        &self,
        doc_id: &str,
        old_length: u64,
        data: &[u8],
    ) -> Result<AppendOutcome, StoreError> {
        self.sweep().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let mut doc: Vec<u8> = sqlx::query("SELECT data FROM Docs WHERE docid = ?1")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .map(|row| row.get("data"))
            .ok_or(StoreError::Missing)?;

        if doc.len() as u64 != old_length {
            return Ok(AppendOutcome::Conflict {
                current_length: doc.len() as u64,
            });
        }

        doc.extend_from_slice(data);
        sqlx::query("UPDATE Docs SET data = ?1, lastAccess = ?2 WHERE docid = ?3")
            .bind(doc.as_slice())
            .bind(now_unix())
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(AppendOutcome::Appended {
            new_length: doc.len() as u64,
        })
    }

    async fn get_document_keys(&self, doc_id: &str) -> Result<Vec<Key>, StoreError> {
        let rows = sqlx::query("SELECT name, value, version FROM Keys WHERE docid = ?1")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(Self::row_to_key).collect())
    }

    async fn set_document_key(
        &self,
        doc_id: &str,
        old_version: u32,
        key: Key,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let current: Option<i64> =
            sqlx::query("SELECT version FROM Keys WHERE docid = ?1 AND name = ?2")
                .bind(doc_id)
                .bind(&key.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?
                .map(|row| row.get("version"));

        match current {
            Some(version) if version as u32 != old_version => return Err(StoreError::Conflict),
            Some(_) => {
                sqlx::query("UPDATE Keys SET value = ?1, version = ?2 WHERE docid = ?3 AND name = ?4")
                    .bind(&key.value)
                    .bind(key.version as i64)
                    .bind(doc_id)
                    .bind(&key.name)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;
            }
            None if old_version != 0 => return Err(StoreError::Conflict),
            None => {
                sqlx::query("INSERT INTO Keys (docid, name, value, version) VALUES (?1, ?2, ?3, ?4)")
                    .bind(doc_id)
                    .bind(&key.name)
                    .bind(&key.value)
                    .bind(key.version as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;
            }
        }

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM Docs WHERE docid = ?1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn add_token(&self, token: NewToken<'_>) -> Result<(), StoreError> {
        self.sweep().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        if !token.contents.is_empty() {
            let exists = sqlx::query("SELECT docid FROM Docs WHERE docid = ?1")
                .bind(token.doc_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            if exists.is_some() {
                return Err(StoreError::Conflict);
            }
            sqlx::query("INSERT INTO Docs (docid, lastAccess, data) VALUES (?1, ?2, ?3)")
                .bind(token.doc_id)
                .bind(now_unix())
                .bind(token.contents)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        }

        let inserted = sqlx::query(
            "INSERT INTO Tokens (tokenID, docID, userID, permissions, expiration) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(token.token)
        .bind(token.doc_id)
        .bind(token.user_id)
        .bind(token.permissions)
        .bind(token.expires_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                debug!(token = token.token, doc_id = token.doc_id, "token added");
                tx.commit().await.map_err(map_sqlx_err)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Exists),
            Err(e) => Err(map_sqlx_err(e)),
        }
    }

    async fn get_token(&self, token: &str) -> Result<TokenGrant, StoreError> {
        let row = sqlx::query(
            "SELECT docID, userID, permissions FROM Tokens \
             WHERE tokenID = ?1 AND expiration > ?2",
        )
        .bind(token)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(StoreError::Missing)?;

        let permissions: String = row.get("permissions");
        Ok(TokenGrant {
            doc_id: row.get("docID"),
            user_id: row.get("userID"),
            permissions: Permissions::parse(&permissions),
        })
    }

    async fn update_user(&self, user_id: &str, permissions: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE Tokens SET permissions = ?1 WHERE userID = ?2")
            .bind(permissions)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    fn set_expiration(&self, seconds: i64) {
        self.expiration.store(seconds, Ordering::Relaxed);
    }
}
