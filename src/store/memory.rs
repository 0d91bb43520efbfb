use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::StoreError;

use super::{
    AppendOutcome, CreateMode, DEFAULT_EXPIRATION_SECS, DocumentStore, FetchedDocument, Key,
    NO_EXPIRATION, NewToken, Permissions, TokenGrant,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// In-memory [`DocumentStore`]. The single mutex makes every operation
/// atomic; suitable for tests and single-process deployments that accept
/// losing documents on restart.
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
    expiration: AtomicI64,
}

#[derive(Default)]
struct MemoryState {
    docs: HashMap<String, StoredDocument>,
    keys: HashMap<String, Vec<Key>>,
    tokens: HashMap<String, TokenRow>,
    last_sweep: Option<Instant>,
}

struct StoredDocument {
    data: Vec<u8>,
    last_access: Instant,
}

struct TokenRow {
    doc_id: String,
    user_id: String,
    permissions: String,
    expires_at: i64,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryState::default()),
            expiration: AtomicI64::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(&self, state: &mut MemoryState) {
        let mut seconds = self.expiration.load(Ordering::Relaxed);
        if seconds == NO_EXPIRATION {
            return;
        }
        if seconds == 0 {
            seconds = DEFAULT_EXPIRATION_SECS;
        }

        if let Some(last) = state.last_sweep
            && last.elapsed() < SWEEP_INTERVAL
        {
            return;
        }
        state.last_sweep = Some(Instant::now());

        let mut expired = Vec::new();
        state.docs.retain(|doc_id, doc| {
            if doc.last_access.elapsed().as_secs() as i64 > seconds {
                expired.push(doc_id.clone());
                false
            } else {
                true
            }
        });
        for doc_id in &expired {
            info!("Remove expired document {doc_id}");
            state.keys.remove(doc_id);
        }

        let now = now_unix();
        state.tokens.retain(|_, row| row.expires_at > now);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(
        &self,
        doc_id: &str,
        mode: CreateMode,
        initial: &[u8],
    ) -> Result<FetchedDocument, StoreError> {
        let mut state = self.inner.lock().await;
        self.sweep(&mut state);

        let exists = state.docs.contains_key(doc_id);
        if !exists && mode == CreateMode::NeverCreate {
            return Err(StoreError::Missing);
        }
        if exists && mode == CreateMode::AlwaysCreate {
            return Err(StoreError::Exists);
        }

        let created = !exists;
        let doc = state
            .docs
            .entry(doc_id.to_string())
            .or_insert_with(|| StoredDocument {
                data: initial.to_vec(),
                last_access: Instant::now(),
            });
        doc.last_access = Instant::now();

        trace!(doc_id, created, len = doc.data.len(), "fetched document");
        Ok(FetchedDocument {
            content: doc.data.clone(),
            created,
        })
    }

    async fn append_document(
        &self,
        doc_id: &str,
        old_length: u64,
        data: &[u8],
    ) -> Result<AppendOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        self.sweep(&mut state);

        let doc = state.docs.get_mut(doc_id).ok_or(StoreError::Missing)?;
        if doc.data.len() as u64 != old_length {
            return Ok(AppendOutcome::Conflict {
                current_length: doc.data.len() as u64,
            });
        }

        doc.last_access = Instant::now();
        doc.data.extend_from_slice(data);
        Ok(AppendOutcome::Appended {
            new_length: doc.data.len() as u64,
        })
    }

    async fn get_document_keys(&self, doc_id: &str) -> Result<Vec<Key>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.keys.get(doc_id).cloned().unwrap_or_default())
    }

    async fn set_document_key(
        &self,
        doc_id: &str,
        old_version: u32,
        key: Key,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let keys = state.keys.entry(doc_id.to_string()).or_default();

        match keys.iter_mut().find(|k| k.name == key.name) {
            Some(existing) => {
                if existing.version != old_version {
                    return Err(StoreError::Conflict);
                }
                *existing = key;
            }
            None => {
                if old_version != 0 {
                    return Err(StoreError::Conflict);
                }
                keys.push(key);
            }
        }
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        state.docs.remove(doc_id);
        state.keys.remove(doc_id);
        Ok(())
    }

    async fn add_token(&self, token: NewToken<'_>) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        self.sweep(&mut state);

        if state.tokens.contains_key(token.token) {
            return Err(StoreError::Exists);
        }

        if !token.contents.is_empty() {
            if state.docs.contains_key(token.doc_id) {
                return Err(StoreError::Conflict);
            }
            state.docs.insert(
                token.doc_id.to_string(),
                StoredDocument {
                    data: token.contents.to_vec(),
                    last_access: Instant::now(),
                },
            );
        }

        debug!(token = token.token, doc_id = token.doc_id, "token added");
        state.tokens.insert(
            token.token.to_string(),
            TokenRow {
                doc_id: token.doc_id.to_string(),
                user_id: token.user_id.to_string(),
                permissions: token.permissions.to_string(),
                expires_at: token.expires_at,
            },
        );
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<TokenGrant, StoreError> {
        let state = self.inner.lock().await;
        let row = state.tokens.get(token).ok_or(StoreError::Missing)?;
        if row.expires_at <= now_unix() {
            return Err(StoreError::Missing);
        }
        Ok(TokenGrant {
            doc_id: row.doc_id.clone(),
            user_id: row.user_id.clone(),
            permissions: Permissions::parse(&row.permissions),
        })
    }

    async fn update_user(&self, user_id: &str, permissions: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        for row in state.tokens.values_mut() {
            if row.user_id == user_id {
                row.permissions = permissions.to_string();
            }
        }
        Ok(())
    }

    fn set_expiration(&self, seconds: i64) {
        self.expiration.store(seconds, Ordering::Relaxed);
    }
}
