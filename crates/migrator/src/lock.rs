//! Cross-process migration lock.
//!
//! The lock is a single document in its own collection. Every transition is
//! one conditional `update_one`, so exclusion relies only on single-document
//! atomicity of the store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use doc_store::{Document, DocumentStore, DocumentStoreExt, IndexSpec, UpdateSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::Result;

/// Value of the `key` field identifying the lock document.
pub const LOCK_KEY: &str = "LOCK";

const KEY_FIELD: &str = "key";
const STATUS_FIELD: &str = "status";
const HOLDER_FIELD: &str = "holder";
const ACQUIRED_AT_FIELD: &str = "acquired_at";

/// Token identifying the process that holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(Uuid);

impl HolderToken {
    /// Creates a new random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HolderToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HolderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status stored in the lock document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    #[default]
    Unlocked,
    Locked,
}

impl LockStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Unlocked => "UNLOCKED",
            LockStatus::Locked => "LOCKED",
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of the lock document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub status: LockStatus,
    #[serde(default)]
    pub holder: Option<HolderToken>,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        self.status == LockStatus::Locked
    }
}

/// Acquires and releases the migration lock on behalf of one process.
///
/// ```text
/// (absent) ──initialize──► UNLOCKED ──acquire──► LOCKED ──release──► UNLOCKED
/// ```
///
/// The lock has no lease: a holder that dies without releasing leaves it
/// LOCKED until an operator calls [`LockCoordinator::force_release`].
#[derive(Debug, Clone)]
pub struct LockCoordinator<S> {
    store: S,
    collection: String,
    token: HolderToken,
}

impl<S: DocumentStore> LockCoordinator<S> {
    /// Creates a coordinator with a fresh holder token.
    pub fn new(store: S, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            token: HolderToken::new(),
        }
    }

    /// Returns this coordinator's holder token.
    pub fn token(&self) -> HolderToken {
        self.token
    }

    /// Returns the lock collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn lock_filter() -> Document {
        let mut filter = Document::new();
        filter.insert(KEY_FIELD.to_string(), Value::from(LOCK_KEY));
        filter
    }

    /// Makes sure the lock document exists. Never changes an existing one.
    #[tracing::instrument(skip(self), fields(collection = %self.collection))]
    pub async fn initialize(&self) -> Result<()> {
        self.store
            .create_index(&self.collection, IndexSpec::new([KEY_FIELD]).unique())
            .await?;

        let outcome = self
            .store
            .update_one(
                &self.collection,
                UpdateSpec::new(Self::lock_filter())
                    .set_on_insert(STATUS_FIELD, LockStatus::Unlocked.as_str())
                    .set_on_insert(HOLDER_FIELD, Value::Null)
                    .set_on_insert(ACQUIRED_AT_FIELD, Value::Null)
                    .upsert(),
            )
            .await?;

        if outcome.upserted {
            tracing::debug!("lock document created");
        }
        Ok(())
    }

    /// Tries once to take the lock.
    ///
    /// Returns `true` only if this call flipped the lock from UNLOCKED to LOCKED.
    pub async fn acquire(&self) -> Result<bool> {
        let outcome = self
            .store
            .update_one(
                &self.collection,
                UpdateSpec::new(Self::lock_filter())
                    .filter(STATUS_FIELD, LockStatus::Unlocked.as_str())
                    .set(STATUS_FIELD, LockStatus::Locked.as_str())
                    .set(HOLDER_FIELD, self.token.to_string())
                    .set(ACQUIRED_AT_FIELD, Utc::now().to_rfc3339()),
            )
            .await?;

        let acquired = outcome.matched == 1;
        tracing::debug!(acquired, token = %self.token, "lock acquire attempt");
        Ok(acquired)
    }

    /// Releases the lock if this coordinator holds it. Releasing a lock that is
    /// free or held by another token does nothing.
    pub async fn release(&self) -> Result<bool> {
        let update = UpdateSpec::new(Self::lock_filter())
            .filter(STATUS_FIELD, LockStatus::Locked.as_str())
            .filter(HOLDER_FIELD, self.token.to_string());
        let released = self.unlock(update).await?;
        tracing::debug!(released, token = %self.token, "lock released");
        Ok(released)
    }

    /// Releases the lock whoever holds it.
    pub async fn force_release(&self) -> Result<bool> {
        let update =
            UpdateSpec::new(Self::lock_filter()).filter(STATUS_FIELD, LockStatus::Locked.as_str());
        let released = self.unlock(update).await?;
        if released {
            tracing::warn!(collection = %self.collection, "lock forcibly released");
        }
        Ok(released)
    }

    async fn unlock(&self, update: UpdateSpec) -> Result<bool> {
        let outcome = self
            .store
            .update_one(
                &self.collection,
                update
                    .set(STATUS_FIELD, LockStatus::Unlocked.as_str())
                    .set(HOLDER_FIELD, Value::Null)
                    .set(ACQUIRED_AT_FIELD, Value::Null),
            )
            .await?;
        Ok(outcome.matched == 1)
    }

    /// Reads the lock document, if it exists.
    pub async fn state(&self) -> Result<Option<LockState>> {
        let Some(document) = self
            .store
            .find_one(&self.collection, &Self::lock_filter())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(Value::Object(document))?))
    }

    /// Returns true if the lock is currently held by anyone.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self.state().await?.is_some_and(|state| state.is_locked()))
    }
}

/// How long to keep trying when the lock is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// A single attempt.
    Once,
    /// Poll until acquired.
    Forever,
    /// Poll until the elapsed time exceeds the duration.
    Until(Duration),
}

/// Retry policy wrapped around [`LockCoordinator::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitPolicy {
    /// Delay between two attempts.
    pub interval: Duration,
    pub wait: LockWait,
}

impl LockWaitPolicy {
    /// Builds a policy from a millisecond timeout.
    ///
    /// `None` tries once, zero or negative waits forever, positive waits at
    /// most that long.
    pub fn from_timeout_ms(timeout_ms: Option<i64>, interval: Duration) -> Self {
        let wait = match timeout_ms {
            None => LockWait::Once,
            Some(ms) if ms <= 0 => LockWait::Forever,
            Some(ms) => LockWait::Until(Duration::from_millis(ms.unsigned_abs())),
        };
        Self { interval, wait }
    }

    /// Tries to acquire `lock` under this policy.
    pub async fn acquire<S: DocumentStore>(&self, lock: &LockCoordinator<S>) -> Result<bool> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if lock.acquire().await? {
                return Ok(true);
            }
            metrics::counter!("migration_lock_contention_total").increment(1);

            let keep_waiting = match self.wait {
                LockWait::Once => false,
                LockWait::Forever => true,
                LockWait::Until(timeout) => started.elapsed() <= timeout,
            };
            if !keep_waiting {
                tracing::info!(attempts, "lock still held elsewhere, giving up");
                return Ok(false);
            }

            tracing::info!(
                attempts,
                interval_ms = self.interval.as_millis() as u64,
                "lock held elsewhere, waiting"
            );
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Default for LockWaitPolicy {
    fn default() -> Self {
        Self::from_timeout_ms(None, crate::config::DEFAULT_LOCK_POLL_INTERVAL)
    }
}
