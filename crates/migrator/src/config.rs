//! Migrator configuration loaded from code or environment variables.

use std::time::Duration;

use crate::lock::LockWaitPolicy;

/// Default name of the history collection.
pub const DEFAULT_HISTORY_COLLECTION: &str = "dbchangelog";

/// Default name of the lock collection.
pub const DEFAULT_LOCK_COLLECTION: &str = "migrationlock";

/// Default delay between two lock acquisition attempts.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Migrator configuration.
///
/// Reads from environment variables with [`MigratorConfig::from_env`]:
/// - `DATABASE_URL`: connection string used by [`crate::Migrator::connect`]
/// - `MIGRATE_DATABASE`: target database (schema) name, required
/// - `MIGRATE_HISTORY_COLLECTION`: default `"dbchangelog"`
/// - `MIGRATE_LOCK_COLLECTION`: default `"migrationlock"`
/// - `MIGRATE_ENABLED`: default `true`
/// - `MIGRATE_ROLLBACK_ENABLED`: default `true`
/// - `MIGRATE_FAIL_ON_LOCK`: default `false`
/// - `MIGRATE_LOCK_TIMEOUT_MS`: unset: single attempt; `<= 0`: wait forever
/// - `MIGRATE_LOCK_POLL_INTERVAL_MS`: default `1000`
///
/// Changing either collection name once history exists starts a new, empty
/// tracking namespace: previously applied steps will run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorConfig {
    pub database_url: Option<String>,
    pub database: Option<String>,
    pub history_collection: String,
    pub lock_collection: String,
    pub enabled: bool,
    pub rollback_enabled: bool,
    pub fail_on_lock_contention: bool,
    pub lock_wait_timeout_ms: Option<i64>,
    pub lock_poll_interval: Duration,
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Reads a boolean variable. Unset or unrecognised values keep `default`.
fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    parse_flag(&value).unwrap_or_else(|| {
        tracing::warn!(variable = name, %value, default, "unrecognised flag value, using default");
        default
    })
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl MigratorConfig {
    /// Creates a configuration for `database` with default settings.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_non_empty("DATABASE_URL"),
            database: env_non_empty("MIGRATE_DATABASE"),
            history_collection: env_non_empty("MIGRATE_HISTORY_COLLECTION")
                .unwrap_or(defaults.history_collection),
            lock_collection: env_non_empty("MIGRATE_LOCK_COLLECTION")
                .unwrap_or(defaults.lock_collection),
            enabled: env_flag("MIGRATE_ENABLED", defaults.enabled),
            rollback_enabled: env_flag("MIGRATE_ROLLBACK_ENABLED", defaults.rollback_enabled),
            fail_on_lock_contention: env_flag(
                "MIGRATE_FAIL_ON_LOCK",
                defaults.fail_on_lock_contention,
            ),
            lock_wait_timeout_ms: env_non_empty("MIGRATE_LOCK_TIMEOUT_MS")
                .and_then(|v| v.trim().parse().ok()),
            lock_poll_interval: env_non_empty("MIGRATE_LOCK_POLL_INTERVAL_MS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_poll_interval),
        }
    }

    /// Sets the connection string.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the target database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the history collection name.
    pub fn with_history_collection(mut self, name: impl Into<String>) -> Self {
        self.history_collection = name.into();
        self
    }

    /// Sets the lock collection name.
    pub fn with_lock_collection(mut self, name: impl Into<String>) -> Self {
        self.lock_collection = name.into();
        self
    }

    /// Enables or disables the whole engine.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enables or disables rollback of removed change steps.
    pub fn with_rollback_enabled(mut self, enabled: bool) -> Self {
        self.rollback_enabled = enabled;
        self
    }

    /// Fail with [`crate::MigrationError::LockAcquire`] instead of returning
    /// quietly when the lock is held elsewhere.
    pub fn with_fail_on_lock_contention(mut self, fail: bool) -> Self {
        self.fail_on_lock_contention = fail;
        self
    }

    /// Sets the lock wait timeout in milliseconds.
    ///
    /// `None` tries once, `0` or a negative value waits forever, a positive
    /// value waits at most that long.
    pub fn with_lock_wait_timeout_ms(mut self, timeout: Option<i64>) -> Self {
        self.lock_wait_timeout_ms = timeout;
        self
    }

    /// Sets the delay between lock acquisition attempts.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Returns the lock wait policy derived from the timeout and interval.
    pub fn lock_wait_policy(&self) -> LockWaitPolicy {
        LockWaitPolicy::from_timeout_ms(self.lock_wait_timeout_ms, self.lock_poll_interval)
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database: None,
            history_collection: DEFAULT_HISTORY_COLLECTION.to_string(),
            lock_collection: DEFAULT_LOCK_COLLECTION.to_string(),
            enabled: true,
            rollback_enabled: true,
            fail_on_lock_contention: false,
            lock_wait_timeout_ms: None,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}
