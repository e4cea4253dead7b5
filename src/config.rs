//! Store configuration.
//!
//! `StoreConfig` selects the persistence backend for visitor cookies and the
//! knobs that go with it. It provides defaults via [`Default`], a fluent
//! [`StoreConfig::builder()`] with validation, and can be read from JSON.
//!
//! # Examples
//!
//! ## Customize with the builder
//! ```rust
//! use visitor_cookie::config::{open_store, BackendKind, StoreConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = StoreConfig::builder()
//!     .backend(BackendKind::InMemory)
//!     .retention_days(90)
//!     .batch_workers(4)
//!     .build()?; // returns Result<StoreConfig, StoreConfigError>
//! let store = open_store(&cfg)?;
//! assert_eq!(store.count()?, 0);
//! # Ok(()) }
//! ```
//!
//! ## From JSON
//! ```rust
//! use visitor_cookie::config::{BackendKind, StoreConfig};
//! let cfg = StoreConfig::from_json_str(
//!     r#"{ "backend": { "kind": "sqlite", "path": "visitors.db" }, "retention_days": 30 }"#,
//! ).unwrap();
//! assert!(matches!(cfg.backend, BackendKind::Sqlite { pool_size: 8, .. }));
//! ```
//!
//! # Fields (summary)
//! - `backend`: which store to open (default: in-memory).
//! - `retention_days`: records not hit for this many days are expired when the
//!   store is opened, and on every [`StoreConfig::expire_stale`] call (default: never).
//! - `batch_workers`: max threads a single batch call may use (default: number of CPUs).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::store::{
    CookieStore, CookieStoreHandle, InMemoryCookieStore, JsonCookieStore, NopCookieStore,
};

/// Default number of pooled connections for the SQLite backend.
pub const DEFAULT_POOL_SIZE: u32 = 8;

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    InMemory,
    Nop,
    Json {
        path: PathBuf,
    },
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_pool_size")]
        pool_size: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub retention_days: Option<u32>,
    pub batch_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            retention_days: None,
            batch_workers: num_cpus::get(),
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, StoreError> {
        let config: StoreConfig = serde_json::from_str(json)?;
        validate(&config)?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Retention window as a duration, if one is configured.
    pub fn retention(&self) -> Option<time::Duration> {
        self.retention_days
            .map(|days| time::Duration::days(i64::from(days)))
    }

    /// Drops records outside the retention window from `store`. Without a
    /// retention window nothing is removed.
    pub fn expire_stale(&self, store: &dyn CookieStore) -> Result<u64, StoreError> {
        let Some(retention) = self.retention() else {
            return Ok(0);
        };
        let removed = store.delete_expired(retention)?;
        log::debug!("Expired {removed} visitor cookies older than {retention}");
        Ok(removed)
    }
}

/// Builder for [`StoreConfig`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    inner: StoreConfig,
}

impl StoreConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut StoreConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn backend(self, backend: BackendKind) -> Self { self.map(|c| c.backend = backend) }
    pub fn in_memory(self) -> Self { self.backend(BackendKind::InMemory) }
    pub fn json<P: Into<PathBuf>>(self, path: P) -> Self { self.backend(BackendKind::Json { path: path.into() }) }
    pub fn sqlite<P: Into<PathBuf>>(self, path: P, pool_size: u32) -> Self { self.backend(BackendKind::Sqlite { path: path.into(), pool_size }) }
    pub fn retention_days(self, days: u32) -> Self { self.map(|c| c.retention_days = Some(days)) }
    pub fn batch_workers(self, n: usize) -> Self { self.map(|c| c.batch_workers = n) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut StoreConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<StoreConfig, StoreConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfigError {
    ZeroBatchWorkers,
    ZeroPoolSize,
    EmptyPath,
}

impl fmt::Display for StoreConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfigError::ZeroBatchWorkers =>
                write!(f, "batch_workers must be at least 1"),
            StoreConfigError::ZeroPoolSize =>
                write!(f, "pool_size must be at least 1"),
            StoreConfigError::EmptyPath =>
                write!(f, "backend path must not be empty"),
        }
    }
}
impl std::error::Error for StoreConfigError {}

fn validate(c: &StoreConfig) -> Result<(), StoreConfigError> {
    if c.batch_workers == 0 {
        return Err(StoreConfigError::ZeroBatchWorkers);
    }
    match &c.backend {
        BackendKind::Json { path } | BackendKind::Sqlite { path, .. }
            if path.as_os_str().is_empty() =>
        {
            return Err(StoreConfigError::EmptyPath);
        }
        BackendKind::Sqlite { pool_size: 0, .. } => return Err(StoreConfigError::ZeroPoolSize),
        _ => {}
    }
    Ok(())
}

/// Opens the backend described by `config` and expires stale records.
pub fn open_store(config: &StoreConfig) -> Result<CookieStoreHandle, StoreError> {
    validate(config)?;

    let store: CookieStoreHandle = match &config.backend {
        BackendKind::InMemory => Arc::new(InMemoryCookieStore::new()),
        BackendKind::Nop => Arc::new(NopCookieStore),
        BackendKind::Json { path } => Arc::new(JsonCookieStore::new(path)?),
        #[cfg(feature = "sqlite_cookie_store")]
        BackendKind::Sqlite { path, pool_size } => Arc::new(
            crate::store::SqliteCookieStore::with_options(path, *pool_size, config.batch_workers)?,
        ),
        #[cfg(not(feature = "sqlite_cookie_store"))]
        BackendKind::Sqlite { .. } => {
            return Err(StoreError::BackendUnavailable(
                "built without the sqlite_cookie_store feature".to_string(),
            ))
        }
    };

    log::debug!("Opened visitor cookie store: {:?}", config.backend);
    config.expire_stale(&*store)?;
    Ok(store)
}
