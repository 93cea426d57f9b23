//! Per-session credential persistence.
//!
//! A [`CredentialStore`] is a view over a shared [`KvBackend`], scoped to one
//! session by a key prefix. It holds two kinds of records:
//!
//! - the primary bundle ([`Credentials`]) under `creds`, created on first use
//! - indexed protocol keys addressed by ([`KeyCategory`], item id)
//!
//! Backend keys look like `whatsapp-session-7:pre-key-12`. Payloads are
//! encoded with [`codec`] so arbitrary bytes round-trip exactly.

pub mod backend;
pub mod codec;
pub mod credentials;
pub mod sqlite;

pub use backend::{KvBackend, MemoryBackend};
pub use credentials::{Contact, Credentials, KeyPair, SignedKeyPair};
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::session::SessionId;

/// Default namespace prefix for session keys.
pub const DEFAULT_KEY_PREFIX: &str = "whatsapp-session-";

/// Item key of the primary credential bundle.
const CREDS_KEY: &str = "creds";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("payload encoding error: {0}")]
    Encoding(String),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Indexed key categories the protocol engine persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyCategory {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
    LidMapping,
    DeviceList,
    TcToken,
}

impl KeyCategory {
    pub const ALL: [KeyCategory; 9] = [
        KeyCategory::PreKey,
        KeyCategory::Session,
        KeyCategory::SenderKey,
        KeyCategory::SenderKeyMemory,
        KeyCategory::AppStateSyncKey,
        KeyCategory::AppStateSyncVersion,
        KeyCategory::LidMapping,
        KeyCategory::DeviceList,
        KeyCategory::TcToken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreKey => "pre-key",
            Self::Session => "session",
            Self::SenderKey => "sender-key",
            Self::SenderKeyMemory => "sender-key-memory",
            Self::AppStateSyncKey => "app-state-sync-key",
            Self::AppStateSyncVersion => "app-state-sync-version",
            Self::LidMapping => "lid-mapping",
            Self::DeviceList => "device-list",
            Self::TcToken => "tctoken",
        }
    }
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown key category `{s}`"))
    }
}

/// One mutation of an indexed key. `payload: None` deletes the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWrite {
    pub category: KeyCategory,
    pub id: String,
    pub payload: Option<Vec<u8>>,
}

impl KeyWrite {
    pub fn put(category: KeyCategory, id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            category,
            id: id.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn delete(category: KeyCategory, id: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
            payload: None,
        }
    }
}

/// The key store handed to the protocol engine on connect.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    async fn get_keys(
        &self,
        category: KeyCategory,
        ids: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError>;

    async fn set_keys(&self, writes: Vec<KeyWrite>) -> Result<(), StoreError>;
}

/// Make an identifier safe to embed in a backend key.
///
/// `/` becomes `__` and `:` becomes `-`, so the `:` that ends a session
/// prefix can never appear inside an identifier.
pub fn normalize_key_name(key: &str) -> String {
    key.replace('/', "__").replace(':', "-")
}

#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KvBackend>,
    session_id: SessionId,
    prefix: String,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: &str, session_id: SessionId) -> Self {
        let prefix = format!(
            "{namespace}{}:",
            normalize_key_name(&session_id.to_string())
        );
        Self {
            backend,
            session_id,
            prefix,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Prefix shared by every key of this session.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn storage_key(&self, item: &str) -> String {
        format!("{}{}", self.prefix, normalize_key_name(item))
    }

    fn item_key(category: KeyCategory, id: &str) -> String {
        format!("{category}-{id}")
    }

    async fn read(&self, item: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend
            .get(&self.storage_key(item))
            .await?
            .map(|raw| codec::decode(&raw))
            .transpose()
    }

    async fn write(&self, item: &str, payload: &[u8]) -> Result<(), StoreError> {
        let raw = codec::encode(payload)?;
        self.backend.set(&self.storage_key(item), &raw).await
    }

    async fn remove(&self, item: &str) -> Result<(), StoreError> {
        self.backend.delete(&self.storage_key(item)).await
    }

    /// Read several keys of one category. Every requested id is present in
    /// the result, mapped to `None` when nothing is stored.
    pub async fn get<S>(
        &self,
        category: KeyCategory,
        ids: &[S],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError>
    where
        S: AsRef<str> + Sync,
    {
        let reads = ids.iter().map(|id| async move {
            let id = id.as_ref();
            let payload = self.read(&Self::item_key(category, id)).await?;
            Ok::<_, StoreError>((id.to_string(), payload))
        });
        Ok(try_join_all(reads).await?.into_iter().collect())
    }

    /// Apply a batch of writes. Distinct keys are written concurrently; when
    /// a key appears more than once the last write in the batch wins.
    pub async fn set(&self, writes: Vec<KeyWrite>) -> Result<(), StoreError> {
        let mut latest: HashMap<String, Option<Vec<u8>>> = HashMap::with_capacity(writes.len());
        for write in writes {
            latest.insert(Self::item_key(write.category, &write.id), write.payload);
        }

        let tasks = latest.into_iter().map(|(item, payload)| async move {
            match payload {
                Some(bytes) => self.write(&item, &bytes).await,
                None => self.remove(&item).await,
            }
        });
        try_join_all(tasks).await?;
        Ok(())
    }

    /// Stored primary bundle, or a fresh one on first run. A fresh bundle is
    /// not persisted until the engine reports a credentials update.
    pub async fn load_primary_credentials(&self) -> Result<Credentials, StoreError> {
        match self.backend.get(&self.storage_key(CREDS_KEY)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => {
                tracing::debug!(
                    session = %self.session_id,
                    "no stored credentials, starting from a fresh bundle"
                );
                Ok(Credentials::init())
            }
        }
    }

    pub async fn save_primary_credentials(&self, creds: &Credentials) -> Result<(), StoreError> {
        let raw = serde_json::to_string(creds)?;
        self.backend.set(&self.storage_key(CREDS_KEY), &raw).await
    }

    /// Delete every key of this session, returning how many were removed.
    pub async fn purge(&self) -> Result<usize, StoreError> {
        let keys = self.backend.keys_with_prefix(&self.prefix).await?;
        let removed = keys.len();
        try_join_all(keys.iter().map(|key| self.backend.delete(key))).await?;
        tracing::info!(session = %self.session_id, removed, "purged stored credentials");
        Ok(removed)
    }

    /// Number of stored records per category name (`creds` included).
    /// Keys that match no known category are counted under `other`.
    pub async fn inventory(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut by_longest = KeyCategory::ALL;
        by_longest.sort_by_key(|category| std::cmp::Reverse(category.as_str().len()));

        let mut counts = BTreeMap::new();
        for key in self.backend.keys_with_prefix(&self.prefix).await? {
            let item = &key[self.prefix.len()..];
            let bucket = if item == CREDS_KEY {
                CREDS_KEY
            } else {
                by_longest
                    .iter()
                    .find(|category| {
                        item.strip_prefix(category.as_str())
                            .is_some_and(|rest| rest.starts_with('-'))
                    })
                    .map_or("other", |category| category.as_str())
            };
            *counts.entry(bucket.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl SignalKeyStore for CredentialStore {
    async fn get_keys(
        &self,
        category: KeyCategory,
        ids: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError> {
        self.get(category, ids).await
    }

    async fn set_keys(&self, writes: Vec<KeyWrite>) -> Result<(), StoreError> {
        self.set(writes).await
    }
}
