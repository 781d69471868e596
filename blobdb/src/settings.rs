//! Database configuration, modeled on
//! `syncstorage-settings`/`syncserver-settings`: a flat `Deserialize`
//! struct with documented defaults and an explicit validation pass run at
//! construction, rather than validating ad hoc at each call site.

use std::collections::HashSet;
use std::time::Duration;

use blobdb_common::logging::LogLevel;
use blobdb_common::{DbError, DbResult, RetryPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Environment variable prefix for [`Settings::with_env_and_config_file`],
/// e.g. `BLOBDB_LOCK_TIMEOUT_MS=500`.
static PREFIX: &str = "blobdb";

fn default_true() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_max_nested_depth() -> u32 {
    10
}

fn default_supported_operators() -> HashSet<String> {
    ["$eq", "$gt", "$lt", "$and", "$or"].iter().map(|s| s.to_string()).collect()
}

fn default_logical_operators() -> HashSet<String> {
    ["$and", "$or"].iter().map(|s| s.to_string()).collect()
}

fn default_master_index_key() -> String {
    "BLOBDB_MASTER_INDEX".to_owned()
}

/// Minimum permitted `lock_timeout_ms`.
pub const MIN_LOCK_TIMEOUT_MS: u64 = 500;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub root_folder_id: Option<String>,
    #[serde(default = "default_true")]
    pub auto_create_collections: bool,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub lock_retry_backoff_base: f64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(skip)]
    pub log_level: LogLevel,
    #[serde(default = "default_retry_attempts")]
    pub file_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub file_retry_delay_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub file_retry_backoff_base: f64,
    #[serde(default = "default_max_nested_depth")]
    pub query_engine_max_nested_depth: u32,
    #[serde(default = "default_supported_operators")]
    pub query_engine_supported_operators: HashSet<String>,
    #[serde(default = "default_logical_operators")]
    pub query_engine_logical_operators: HashSet<String>,
    #[serde(default = "default_master_index_key")]
    pub master_index_key: String,
    pub backup_on_initialise: bool,
    pub strip_disallowed_collection_name_characters: bool,
    /// Overrides the computed default of `lock_timeout_ms` plus the retry
    /// loop's worst-case backoff; `None` uses the computed default.
    pub coordination_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            root_folder_id: None,
            auto_create_collections: true,
            lock_timeout_ms: default_lock_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            lock_retry_backoff_base: default_backoff_base(),
            cache_enabled: true,
            log_level: LogLevel::default(),
            file_retry_attempts: default_retry_attempts(),
            file_retry_delay_ms: default_retry_delay_ms(),
            file_retry_backoff_base: default_backoff_base(),
            query_engine_max_nested_depth: default_max_nested_depth(),
            query_engine_supported_operators: default_supported_operators(),
            query_engine_logical_operators: default_logical_operators(),
            master_index_key: default_master_index_key(),
            backup_on_initialise: false,
            strip_disallowed_collection_name_characters: false,
            coordination_timeout_ms: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional config file, then layer environment
    /// variable overrides on top (`BLOBDB_FOO__BAR=value` maps to
    /// `foo.bar`), matching the teacher's `syncserver-settings` loader.
    /// Does not call [`Settings::validate`]; callers should do so once
    /// after loading.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();
        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;
        s.try_into()
    }

    /// Validate field invariants. Construction does not call this
    /// automatically so embedders composing settings from multiple
    /// sources can validate once at the end.
    pub fn validate(&self) -> DbResult<()> {
        if self.lock_timeout_ms < MIN_LOCK_TIMEOUT_MS {
            return Err(DbError::configuration_error(format!(
                "lockTimeout must be >= {MIN_LOCK_TIMEOUT_MS}ms, got {}",
                self.lock_timeout_ms
            )));
        }
        if self.retry_attempts == 0 {
            return Err(DbError::configuration_error("retryAttempts must be positive"));
        }
        if self.lock_retry_backoff_base <= 0.0 {
            return Err(DbError::configuration_error("lockRetryBackoffBase must be positive"));
        }
        if self.file_retry_attempts == 0 {
            return Err(DbError::configuration_error("fileRetryAttempts must be positive"));
        }
        if self.file_retry_backoff_base <= 0.0 {
            return Err(DbError::configuration_error("fileRetryBackoffBase must be positive"));
        }
        if self.query_engine_supported_operators.is_empty() {
            return Err(DbError::configuration_error(
                "queryEngineSupportedOperators must be non-empty",
            ));
        }
        if self.query_engine_logical_operators.is_empty() {
            return Err(DbError::configuration_error(
                "queryEngineLogicalOperators must be non-empty",
            ));
        }
        if !self
            .query_engine_logical_operators
            .is_subset(&self.query_engine_supported_operators)
        {
            return Err(DbError::configuration_error(
                "queryEngineLogicalOperators must be a subset of queryEngineSupportedOperators",
            ));
        }
        if self.master_index_key.trim().is_empty() {
            return Err(DbError::configuration_error("masterIndexKey must be non-empty"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay_ms, self.lock_retry_backoff_base)
    }

    pub fn file_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.file_retry_attempts,
            self.file_retry_delay_ms,
            self.file_retry_backoff_base,
        )
    }

    /// The coordinator's overall deadline for one mutating operation:
    /// larger than the lock timeout plus the maximum retry backoff.
    pub fn coordination_timeout(&self) -> Duration {
        if let Some(ms) = self.coordination_timeout_ms {
            return Duration::from_millis(ms);
        }
        let policy = self.lock_retry_policy();
        let max_backoff: Duration = (0..policy.attempts).map(|i| policy.delay_for(i)).sum();
        self.lock_timeout() + max_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_lock_timeout_below_minimum() {
        let mut s = Settings::default();
        s.lock_timeout_ms = 100;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_logical_operators_outside_supported_set() {
        let mut s = Settings::default();
        s.query_engine_logical_operators = ["$xor".to_string()].into_iter().collect();
        assert!(s.validate().is_err());
    }

    #[test]
    fn coordination_timeout_exceeds_lock_timeout() {
        let s = Settings::default();
        assert!(s.coordination_timeout() > s.lock_timeout());
    }

    #[test]
    fn env_override_takes_prefixed_variable() {
        std::env::set_var("BLOBDB_LOCK_TIMEOUT_MS", "5000");
        let s = Settings::with_env_and_config_file(None).unwrap();
        std::env::remove_var("BLOBDB_LOCK_TIMEOUT_MS");
        assert_eq!(s.lock_timeout_ms, 5000);
    }
}
