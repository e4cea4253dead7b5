//! Cookie store infrastructure.
//!
//! A **cookie store** persists encoded [`VisitorCookie`]s keyed by their
//! [`VisitorId`](crate::cookie::VisitorId). Cookies borrow the store they were
//! opened against and call back into it to load and save themselves.
//!
//! This module exports the following implementations:
//! - [`InMemoryCookieStore`]: process-local map, for tests and short-lived setups.
//! - [`NopCookieStore`]: accepts every save and never finds anything.
//! - [`JsonCookieStore`]: file-backed JSON store (good for simple setups).
//! - [`SqliteCookieStore`]: SQLite-backed store (good for concurrency and scale).
//!
//! ## Design notes
//! - Implementations must be `Send + Sync`; one store serves many threads.
//! - Backends keep each record's last hit time next to the encoded blob so
//!   expiry never has to decode anything.
//! - `load` reports a missing record as `Ok(false)`, never as an error.
mod in_memory;
mod json;
mod nop;
#[cfg(feature = "sqlite_cookie_store")]
mod sqlite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::EncodeOptions;
use crate::cookie::VisitorCookie;
use crate::errors::StoreError;

pub use in_memory::InMemoryCookieStore;
pub use json::JsonCookieStore;
pub use nop::NopCookieStore;
#[cfg(feature = "sqlite_cookie_store")]
pub use sqlite::SqliteCookieStore;

/// Shared handle to a store.
pub type CookieStoreHandle = Arc<dyn CookieStore>;

/// Persistence backend for visitor cookies.
///
/// The batch operations have sequential default implementations; backends
/// that can do better (e.g. by fanning out over a connection pool) override
/// them. Either way `on_done` is invoked exactly once per cookie, on the
/// calling thread.
pub trait CookieStore: Send + Sync {
    /// Writes `cookie`, replacing any previous record for its id.
    fn save(&self, cookie: &VisitorCookie<'_>) -> Result<(), StoreError>;

    /// Fills `cookie` from the record stored under its id.
    ///
    /// Returns `Ok(false)` and leaves the cookie untouched if there is none.
    fn load(&self, cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError>;

    /// Removes the record for `cookie`'s id. Returns whether one existed.
    fn delete(&self, cookie: &VisitorCookie<'_>) -> Result<bool, StoreError>;

    /// Removes every record whose last hit time is strictly before `cutoff`
    /// (seconds since the epoch). Returns how many were removed.
    fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError>;

    /// Number of stored records.
    fn count(&self) -> Result<u64, StoreError>;

    /// Record at `index` in the backend's stable enumeration order, bound to
    /// this store. `None` past the end.
    fn get_by_index(&self, index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError>;

    /// Saves every cookie in `cookies`, reporting each outcome through `on_done`.
    ///
    /// Dirty flags are left alone since the cookies are borrowed shared; use
    /// [`VisitorCookie::store_all`] to have successful saves marked clean.
    fn save_all(
        &self,
        cookies: &[&VisitorCookie<'_>],
        on_done: &mut dyn FnMut(&VisitorCookie<'_>, Result<(), StoreError>),
    ) {
        for cookie in cookies {
            let result = self.save(cookie);
            on_done(cookie, result);
        }
    }

    /// Loads every cookie in `cookies`, reporting each outcome through `on_done`.
    fn load_all(
        &self,
        cookies: &mut [&mut VisitorCookie<'_>],
        on_done: &mut dyn FnMut(&VisitorCookie<'_>, Result<bool, StoreError>),
    ) {
        for cookie in cookies.iter_mut() {
            let result = self.load(&mut **cookie);
            on_done(&**cookie, result);
        }
    }

    /// Removes every record not hit within `retention` of now.
    fn delete_expired(&self, retention: time::Duration) -> Result<u64, StoreError> {
        let cutoff = (time::OffsetDateTime::now_utc() - retention).unix_timestamp();
        log::debug!("Expiring visitor cookies last hit before {cutoff}");
        self.delete_older_than(cutoff)
    }
}

/// What backends persist per visitor: the last hit time (kept outside the
/// blob so expiry can filter on it) and the encoded cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredCookie {
    pub last_hit_time_gmt: i64,
    pub payload: Vec<u8>,
}

impl StoredCookie {
    pub(crate) fn encode(cookie: &VisitorCookie<'_>) -> Self {
        Self {
            last_hit_time_gmt: cookie.last_hit_time_gmt(),
            payload: cookie.to_bytes(EncodeOptions {
                include_last_hit_time: false,
            }),
        }
    }

    pub(crate) fn restore(&self, cookie: &mut VisitorCookie<'_>) -> Result<(), StoreError> {
        cookie.restore_from(&self.payload, Some(self.last_hit_time_gmt))?;
        Ok(())
    }
}
