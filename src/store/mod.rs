use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Documents are swept after this many seconds without activity unless the
/// deployment overrides it.
pub const DEFAULT_EXPIRATION_SECS: i64 = 24 * 60 * 60;

/// Sentinel for [`DocumentStore::set_expiration`]: documents never expire.
pub const NO_EXPIRATION: i64 = -1;

/// Whether a document lookup may create the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Create the document if it does not exist, otherwise return it.
    PossiblyCreate,
    /// Return the existing document; `Missing` if absent.
    NeverCreate,
    /// Create the document; `Exists` if already present.
    AlwaysCreate,
}

impl CreateMode {
    pub fn from_wire(raw: u8) -> Option<CreateMode> {
        match raw {
            0 => Some(CreateMode::PossiblyCreate),
            1 => Some(CreateMode::NeverCreate),
            2 => Some(CreateMode::AlwaysCreate),
            _ => None,
        }
    }
}

/// A versioned name/value pair attached to a document or a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub version: u32,
    pub name: String,
    pub value: String,
}

/// Access rights carried by a token. Parsed from the `r`/`w`/`a` permission
/// letters used by the management API and JWT claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Permissions {
    pub fn parse(raw: &str) -> Self {
        Self {
            read: raw.contains('r'),
            write: raw.contains('w'),
            admin: raw.contains('a'),
        }
    }

    /// Rights granted when a client connects with a plain document id and
    /// no token system is configured.
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            admin: true,
        }
    }
}

/// Result of a document lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub content: Vec<u8>,
    /// Whether this call created the document.
    pub created: bool,
}

/// Result of an append attempt. A conflict is an expected outcome, not an
/// error: it carries the authoritative length so the client can retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { new_length: u64 },
    Conflict { current_length: u64 },
}

/// What a registered or signed token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub doc_id: String,
    pub user_id: String,
    pub permissions: Permissions,
}

/// Registration request for [`DocumentStore::add_token`].
#[derive(Debug, Clone, Copy)]
pub struct NewToken<'a> {
    pub token: &'a str,
    pub doc_id: &'a str,
    pub user_id: &'a str,
    pub permissions: &'a str,
    /// Unix seconds after which the token is invalid.
    pub expires_at: i64,
    /// Optional initial document contents, created atomically with the
    /// token. Non-empty contents conflict with an existing document.
    pub contents: &'a [u8],
}

/// Storage backend contract.
///
/// Both the existence-check-then-create of `get_document` and the
/// length-compare-then-append of `append_document` are atomic with respect
/// to concurrent callers for the same document id. Every entry point bumps
/// the document's last-access time and may lazily sweep expired rows, at
/// most once per hour.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(
        &self,
        doc_id: &str,
        mode: CreateMode,
        initial: &[u8],
    ) -> Result<FetchedDocument, StoreError>;

    /// Append `data` if the current length equals `old_length`. A zero
    /// length append succeeds and leaves the document unchanged.
    async fn append_document(
        &self,
        doc_id: &str,
        old_length: u64,
        data: &[u8],
    ) -> Result<AppendOutcome, StoreError>;

    async fn get_document_keys(&self, doc_id: &str) -> Result<Vec<Key>, StoreError>;

    /// Compare-and-set on the key version: succeeds if the key exists with
    /// version `old_version`, or does not exist and `old_version` is 0.
    async fn set_document_key(
        &self,
        doc_id: &str,
        old_version: u32,
        key: Key,
    ) -> Result<(), StoreError>;

    async fn delete_document(&self, doc_id: &str) -> Result<(), StoreError>;

    async fn add_token(&self, token: NewToken<'_>) -> Result<(), StoreError>;

    /// Resolve a registered token. Expired tokens are `Missing`.
    async fn get_token(&self, token: &str) -> Result<TokenGrant, StoreError>;

    /// Rewrite the permissions on every live token of the user.
    async fn update_user(&self, user_id: &str, permissions: &str) -> Result<(), StoreError>;

    /// Idle seconds before a document is deleted; 0 restores the default,
    /// [`NO_EXPIRATION`] disables expiry.
    fn set_expiration(&self, seconds: i64);
}

pub type SharedStore = Arc<dyn DocumentStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_parse_letters() {
        let p = Permissions::parse("rw");
        assert!(p.read && p.write && !p.admin);
        assert_eq!(Permissions::parse(""), Permissions::default());
        assert!(Permissions::parse("a").admin);
    }

    #[test]
    fn create_mode_from_wire() {
        assert_eq!(CreateMode::from_wire(0), Some(CreateMode::PossiblyCreate));
        assert_eq!(CreateMode::from_wire(1), Some(CreateMode::NeverCreate));
        assert_eq!(CreateMode::from_wire(2), Some(CreateMode::AlwaysCreate));
        assert_eq!(CreateMode::from_wire(9), None);
    }
}
