//! API Key Identity
//!
//! Handles API key generation, storage, and verification. A valid key
//! establishes who is calling and counts usage; it never pays for a call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{MintError, Repository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{PaymentError, Result};

const KEY_PREFIX: &str = "sk-sov-";

/// API key (formatted: sk-sov-<32 hex>)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiKey(String);

impl ApiKey {
    /// Generate a new API key
    pub fn generate() -> Self {
        Self(format!("{KEY_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Parse from a header value, tolerating a `Bearer ` prefix
    pub fn from_string(s: impl AsRef<str>) -> Self {
        let s = s.as_ref().trim();
        Self(s.strip_prefix("Bearer ").unwrap_or(s).trim().to_string())
    }

    /// Get the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key with the middle hidden, for logs and listings
    pub fn masked(&self) -> String {
        let key = self.0.as_str();
        match (key.get(..12), key.len().checked_sub(4).and_then(|i| key.get(i..))) {
            (Some(head), Some(tail)) if key.len() > 16 => format!("{head}...{tail}"),
            _ => "***".into(),
        }
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.masked())
    }
}

/// A registered key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Agent the key was issued to
    pub agent_name: String,

    pub description: String,

    /// Whether key is active
    pub active: bool,

    pub created_at: DateTime<Utc>,

    pub last_used: Option<DateTime<Utc>>,

    pub revoked_at: Option<DateTime<Utc>>,

    /// Authenticated calls made with this key
    pub usage_count: u64,
}

impl ApiKeyRecord {
    /// Create a new record
    pub fn new(agent_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            description: description.into(),
            active: true,
            created_at: Utc::now(),
            last_used: None,
            revoked_at: None,
            usage_count: 0,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.active
    }

    pub fn record_usage(&mut self) {
        self.usage_count += 1;
        self.last_used = Some(Utc::now());
    }

    /// Deactivate the key
    pub fn revoke(&mut self) {
        self.active = false;
        self.revoked_at = Some(Utc::now());
    }
}

/// Caller identity established by a valid key
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub agent_name: String,
    pub key: String,
}

/// Key listing entry
#[derive(Clone, Debug, Serialize)]
pub struct KeySummary {
    pub key: String,
    pub agent_name: String,
    pub active: bool,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity provider interface
///
/// The gateway only needs these three operations; the license store behind
/// them can be local or remote.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a key to an identity; `None` when unknown or revoked
    async fn validate(&self, key: &ApiKey) -> Result<Option<Identity>>;

    /// Count one authenticated call
    async fn record_usage(&self, key: &ApiKey) -> Result<()>;

    /// Issue a key for an agent
    async fn issue(&self, agent_name: &str, description: &str) -> Result<ApiKey>;
}

/// Local key registry backed by a [`Repository`]
pub struct KeyRegistry {
    store: Arc<dyn Repository<ApiKeyRecord>>,
    issue_lock: Mutex<()>,
}

impl KeyRegistry {
    pub fn new(store: Arc<dyn Repository<ApiKeyRecord>>) -> Self {
        Self {
            store,
            issue_lock: Mutex::new(()),
        }
    }

    /// Deactivate a key; returns false when the key is unknown
    pub async fn revoke(&self, key: &ApiKey) -> Result<bool> {
        let store = Arc::clone(&self.store);
        let id = key.as_str().to_string();
        let revoked = blocking(move || {
            store
                .modify(&id, &mut |current| {
                    current.map(|record| {
                        let mut record = record.clone();
                        record.revoke();
                        record
                    })
                })
                .map_err(storage)
        })
        .await?;

        if revoked {
            tracing::info!(key = %key, "Revoked API key");
        }
        Ok(revoked)
    }

    /// All keys, masked
    pub async fn list(&self) -> Result<Vec<KeySummary>> {
        let store = Arc::clone(&self.store);
        let entries = blocking(move || store.entries().map_err(storage)).await?;

        Ok(entries
            .into_iter()
            .map(|(key, record)| KeySummary {
                key: ApiKey(key).masked(),
                agent_name: record.agent_name,
                active: record.active,
                usage_count: record.usage_count,
                created_at: record.created_at,
            })
            .collect())
    }

    pub fn get(&self, key: &ApiKey) -> Result<Option<ApiKeyRecord>> {
        self.store.get(key.as_str()).map_err(storage)
    }
}

#[async_trait]
impl IdentityProvider for KeyRegistry {
    async fn validate(&self, key: &ApiKey) -> Result<Option<Identity>> {
        if key.as_str().is_empty() {
            return Ok(None);
        }

        let store = Arc::clone(&self.store);
        let id = key.as_str().to_string();
        let record = blocking(move || store.get(&id).map_err(storage)).await?;

        Ok(record.filter(ApiKeyRecord::is_valid).map(|record| Identity {
            agent_name: record.agent_name,
            key: key.masked(),
        }))
    }

    async fn record_usage(&self, key: &ApiKey) -> Result<()> {
        let store = Arc::clone(&self.store);
        let id = key.as_str().to_string();
        blocking(move || {
            store
                .modify(&id, &mut |current| {
                    current.map(|record| {
                        let mut record = record.clone();
                        record.record_usage();
                        record
                    })
                })
                .map_err(storage)
        })
        .await?;
        Ok(())
    }

    async fn issue(&self, agent_name: &str, description: &str) -> Result<ApiKey> {
        let agent_name = agent_name.trim().to_string();
        if agent_name.is_empty() {
            return Err(PaymentError::InvalidApiKey("agent name required".into()));
        }

        let _guard = self.issue_lock.lock().await;

        let store = Arc::clone(&self.store);
        let record = ApiKeyRecord::new(&agent_name, description);
        let key = blocking(move || {
            let taken = store
                .entries()
                .map_err(storage)?
                .iter()
                .any(|(_, existing)| existing.active && existing.agent_name == record.agent_name);
            if taken {
                return Err(PaymentError::AgentExists(record.agent_name));
            }

            let key = ApiKey::generate();
            store.upsert(key.as_str(), record).map_err(storage)?;
            Ok(key)
        })
        .await?;

        tracing::info!(agent = %agent_name, key = %key, "Issued API key");
        Ok(key)
    }
}

/// Run store work off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PaymentError::Storage(format!("store task failed: {e}")))?
}

fn storage(err: MintError) -> PaymentError {
    PaymentError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::MemoryStore;

    fn registry() -> KeyRegistry {
        KeyRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_api_key_generation() {
        let key = ApiKey::generate();
        assert!(key.as_str().starts_with("sk-sov-"));
        assert_eq!(key.as_str().len(), 7 + 32);
        assert!(key.masked().contains("..."));
    }

    #[test]
    fn test_bearer_prefix_stripped() {
        let key = ApiKey::from_string("Bearer sk-sov-abc");
        assert_eq!(key.as_str(), "sk-sov-abc");
    }

    #[tokio::test]
    async fn test_issue_validate_revoke() {
        let registry = registry();
        let key = registry.issue("Agent_Smith", "test agent").await.unwrap();

        let identity = registry.validate(&key).await.unwrap().unwrap();
        assert_eq!(identity.agent_name, "Agent_Smith");

        registry.record_usage(&key).await.unwrap();
        registry.record_usage(&key).await.unwrap();
        let record = registry.get(&key).unwrap().unwrap();
        assert_eq!(record.usage_count, 2);
        assert!(record.last_used.is_some());

        assert!(registry.revoke(&key).await.unwrap());
        assert_eq!(registry.validate(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_one_active_key_per_agent() {
        let registry = registry();
        let first = registry.issue("bot", "").await.unwrap();

        assert!(matches!(
            registry.issue("bot", "").await,
            Err(PaymentError::AgentExists(_))
        ));

        registry.revoke(&first).await.unwrap();
        assert!(registry.issue("bot", "").await.is_ok());
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let registry = registry();
        let key = ApiKey::from_string("sk-sov-unknown");
        assert_eq!(registry.validate(&key).await.unwrap(), None);
        assert!(!registry.revoke(&key).await.unwrap());
        registry.record_usage(&key).await.unwrap();
    }
}
