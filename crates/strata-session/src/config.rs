//! Session configuration.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. `SessionConfig::default()`
//! 2. a JSON document (`SessionConfig::from_json`)
//! 3. `STRATA_*` environment variables (`SessionConfig::apply_env`)

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use strata_core::{Error, Result};

/// When pending changes are written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only on explicit `flush()`.
    Manual,
    /// On explicit `flush()` and at commit.
    Commit,
    /// Additionally before queries whose spaces have pending writes.
    #[default]
    Auto,
    /// Before every query inside a transaction.
    Always,
}

impl FlushMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushMode::Manual => "manual",
            FlushMode::Commit => "commit",
            FlushMode::Auto => "auto",
            FlushMode::Always => "always",
        }
    }

    pub fn flushes_on_commit(self) -> bool {
        self != FlushMode::Manual
    }
}

impl FromStr for FlushMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" | "never" => Ok(FlushMode::Manual),
            "commit" => Ok(FlushMode::Commit),
            "auto" => Ok(FlushMode::Auto),
            "always" => Ok(FlushMode::Always),
            other => Err(Error::config(format!("unknown flush mode: {other}"))),
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a session hands its connection back to the provider.
///
/// `AfterStatement` and `AfterTransaction` both release after
/// non-transactional work and at transaction end; they differ only in that
/// `AfterStatement` also releases after each query outside a transaction
/// even when more work follows in the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionReleaseMode {
    AfterStatement,
    #[default]
    AfterTransaction,
    OnClose,
}

impl FromStr for ConnectionReleaseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "after_statement" => Ok(ConnectionReleaseMode::AfterStatement),
            "after_transaction" => Ok(ConnectionReleaseMode::AfterTransaction),
            "on_close" => Ok(ConnectionReleaseMode::OnClose),
            other => Err(Error::config(format!(
                "unknown connection release mode: {other}"
            ))),
        }
    }
}

/// How the session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only; never populate.
    Get,
    /// Populate only; never read.
    Put,
    /// Populate even when an entry exists; never read.
    Refresh,
    /// Neither read nor write.
    Ignore,
}

impl CacheMode {
    pub fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// How much state a session keeps for the entities it loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Entities stay managed until evicted, cleared or closed.
    Full,
    /// Entities produced by queries and cursors are detached right after
    /// they are handed out; nothing accumulates in the context.
    Reduced,
}

/// Configuration shared by every session a factory opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    pub connection_release_mode: ConnectionReleaseMode,
    /// Whether newly loaded entities start out read-only.
    pub default_read_only: bool,
    /// Group deferred inserts by entity type (dependencies still first).
    pub order_inserts: bool,
    /// Sort updates by entity name and identifier.
    pub order_updates: bool,
    pub batch_size: usize,
    pub plan_cache_size: usize,
    /// Expanded list parameters beyond this size log a warning. 0 disables.
    pub in_expression_limit: usize,
    /// Translate every named query when the factory is built.
    pub validate_named_queries: bool,
    pub use_second_level_cache: bool,
    pub use_query_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            connection_release_mode: ConnectionReleaseMode::AfterTransaction,
            default_read_only: false,
            order_inserts: false,
            order_updates: false,
            batch_size: 0,
            plan_cache_size: 256,
            in_expression_limit: 0,
            validate_named_queries: true,
            use_second_level_cache: true,
            use_query_cache: false,
        }
    }
}

impl SessionConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid session config: {e}")))
    }

    /// Apply `STRATA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("STRATA_FLUSH_MODE") {
            self.flush_mode = v.parse()?;
        }
        if let Some(v) = lookup("STRATA_RELEASE_MODE") {
            self.connection_release_mode = v.parse()?;
        }
        if let Some(v) = lookup("STRATA_PLAN_CACHE_SIZE") {
            self.plan_cache_size = parse_usize("STRATA_PLAN_CACHE_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_BATCH_SIZE") {
            self.batch_size = parse_usize("STRATA_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_DEFAULT_READ_ONLY") {
            self.default_read_only = parse_bool("STRATA_DEFAULT_READ_ONLY", &v)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn connection_release_mode(mut self, mode: ConnectionReleaseMode) -> Self {
        self.connection_release_mode = mode;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    #[must_use]
    pub fn order_inserts(mut self, value: bool) -> Self {
        self.order_inserts = value;
        self
    }

    #[must_use]
    pub fn order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn plan_cache_size(mut self, size: usize) -> Self {
        self.plan_cache_size = size;
        self
    }

    #[must_use]
    pub fn in_expression_limit(mut self, limit: usize) -> Self {
        self.in_expression_limit = limit;
        self
    }

    #[must_use]
    pub fn validate_named_queries(mut self, value: bool) -> Self {
        self.validate_named_queries = value;
        self
    }

    #[must_use]
    pub fn use_second_level_cache(mut self, value: bool) -> Self {
        self.use_second_level_cache = value;
        self
    }

    #[must_use]
    pub fn use_query_cache(mut self, value: bool) -> Self {
        self.use_query_cache = value;
        self
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{name}: expected a non-negative integer, got {value:?}")))
}

/// Recognizes `1`, `true`, `yes`, `on` and their negatives (case-insensitive).
fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{name}: expected a boolean, got {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert_eq!(
            config.connection_release_mode,
            ConnectionReleaseMode::AfterTransaction
        );
        assert!(!config.default_read_only);
        assert_eq!(config.plan_cache_size, 256);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            SessionConfig::from_json(r#"{"flush_mode": "manual", "order_inserts": true}"#).unwrap();
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert!(config.order_inserts);
        assert_eq!(config.plan_cache_size, 256);
    }

    #[test]
    fn test_from_json_rejects_unknown_mode() {
        let err = SessionConfig::from_json(r#"{"flush_mode": "sometimes"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STRATA_FLUSH_MODE", "ALWAYS"),
            ("STRATA_RELEASE_MODE", "on-close"),
            ("STRATA_PLAN_CACHE_SIZE", "8"),
            ("STRATA_DEFAULT_READ_ONLY", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = SessionConfig::new();
        config
            .apply_overrides(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.flush_mode, FlushMode::Always);
        assert_eq!(config.connection_release_mode, ConnectionReleaseMode::OnClose);
        assert_eq!(config.plan_cache_size, 8);
        assert!(config.default_read_only);
    }

    #[test]
    fn test_env_invalid_value_is_config_error() {
        let mut config = SessionConfig::new();
        let err = config
            .apply_overrides(|name| (name == "STRATA_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("STRATA_BATCH_SIZE"));
    }

    #[test]
    fn test_cache_mode_flags() {
        assert!(CacheMode::Normal.is_get_enabled());
        assert!(CacheMode::Normal.is_put_enabled());
        assert!(!CacheMode::Put.is_get_enabled());
        assert!(!CacheMode::Ignore.is_put_enabled());
        assert!(CacheMode::Refresh.is_put_enabled());
    }

    #[test]
    fn test_builder_setters() {
        let config = SessionConfig::new()
            .flush_mode(FlushMode::Commit)
            .order_updates(true)
            .use_query_cache(true);
        assert!(config.flush_mode.flushes_on_commit());
        assert!(config.order_updates);
        assert!(config.use_query_cache);
    }
}
