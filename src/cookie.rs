//! Visitor cookies: the per-visitor analytics record and its parts.
//!
//! A [`VisitorCookie`] accumulates traffic, e-commerce, merchandising and
//! relation variable (eVar) data for a single [`VisitorId`] across many hits.
//! It is bound to a [`CookieStore`](crate::store::CookieStore) which it loads
//! itself from on creation and saves itself to when flushed.
//!
//! # Ownership model
//! - A cookie exclusively owns its fields and its [`RelationVars`] table.
//! - It *borrows* the store; the store must outlive every cookie bound to it.
//! - Cookies are single-owner and not `Clone`. Stores are shared across threads.
//!
//! # Typical usage
//! ```
//! use visitor_cookie::cookie::{AllocationPolicy, VisitorCookie, VisitorId};
//! use visitor_cookie::store::InMemoryCookieStore;
//!
//! let store = InMemoryCookieStore::new();
//! let id = VisitorId::new(12345, 6789, 9876);
//!
//! let mut cookie = VisitorCookie::open(id, false, &store).unwrap();
//! cookie.set_last_hit_time_gmt(1_700_000_000);
//! cookie.set_var(3, "campaign-a", 1_700_000_000, 1, AllocationPolicy::Last);
//! cookie.close().unwrap();
//! ```

mod identity;
mod purchase_ids;
mod record;
mod relation_vars;

pub use identity::{ParseVisitorIdError, VisitorId};
pub use purchase_ids::{PurchaseIds, NUM_SAVED_PURCHASE_IDS};
pub use record::{DirtyFlags, VisitorCookie};
pub use relation_vars::{
    AllocationPolicy, RelVar, RelationId, RelationVars, VarHandle, INVALID_RELATION_ID,
};
