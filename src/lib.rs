//! Per-visitor analytics records ("visitor cookies") and their persistence.
//!
//! - [`cookie`]: the record itself, its relation variables and purchase id ring.
//! - [`codec`]: the versioned binary encoding records are stored in.
//! - [`store`]: the [`CookieStore`] trait and its backends.
//! - [`config`]: backend selection and [`open_store`].

pub mod codec;
pub mod config;
pub mod cookie;
pub mod errors;
pub mod store;

pub use config::{open_store, BackendKind, StoreConfig};
pub use cookie::{AllocationPolicy, RelationId, VisitorCookie, VisitorId};
pub use errors::{DecodeError, StoreError};
pub use store::{CookieStore, CookieStoreHandle};
