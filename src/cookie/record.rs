use std::fmt;

use bitflags::bitflags;

use crate::codec::{self, EncodeOptions};
use crate::cookie::identity::VisitorId;
use crate::cookie::purchase_ids::PurchaseIds;
use crate::cookie::relation_vars::{AllocationPolicy, RelVar, RelationId, RelationVars, VarHandle};
use crate::errors::{DecodeError, StoreError};
use crate::store::CookieStore;

bitflags! {
    /// Sections of a cookie that changed since it was last saved.
    #[derive(Default)]
    pub struct DirtyFlags: u8 {
        const TRAFFIC = 0b0001;
        const ECOMMERCE = 0b0010;
        const MERCHANDISING = 0b0100;
        const RELATION_VARS = 0b1000;
    }
}

/// Per-visitor analytics record bound to the store it is persisted in.
///
/// Created with [`open`](Self::open), which loads existing state unless the
/// caller knows the visitor is new. Every mutator marks its section dirty.
/// Persist explicitly with [`store`](Self::store), [`flush`](Self::flush) or
/// [`close`](Self::close); a cookie dropped while dirty flushes itself and
/// logs (but cannot return) any failure.
pub struct VisitorCookie<'s> {
    id: VisitorId,
    new_cookie: bool,
    dirty: DirtyFlags,

    // Traffic
    first_hit_time_gmt: i64,
    last_hit_time_gmt: i64,
    last_hit_time_visitor_local: i64,
    last_visit_num: u32,

    // E-commerce
    last_purchase_time_gmt: i64,
    first_hit_referrer: String,
    first_hit_page_url: String,
    first_hit_pagename: String,
    last_purchase_num: u32,
    purchase_ids: PurchaseIds,

    merchandising: String,

    relation_vars: RelationVars,

    store: &'s dyn CookieStore,
}

impl<'s> VisitorCookie<'s> {
    /// Creates the cookie for `id`, loading it from `store` unless `known_new`.
    ///
    /// A missing record is not an error: the cookie simply starts empty and
    /// [`is_new_cookie`](Self::is_new_cookie) reports `true`. Backend and decode
    /// failures are returned.
    pub fn open(
        id: VisitorId,
        known_new: bool,
        store: &'s dyn CookieStore,
    ) -> Result<Self, StoreError> {
        let mut cookie = Self::blank(id, store);
        if !known_new {
            match store.load(&mut cookie) {
                Ok(found) => cookie.new_cookie = !found,
                Err(e) => {
                    // Nothing the caller wrote yet; don't let drop persist a partial load.
                    cookie.mark_clean();
                    return Err(e);
                }
            }
        }
        cookie.mark_clean();
        Ok(cookie)
    }

    /// An empty, clean cookie for `id` that has not consulted the store.
    pub fn blank(id: VisitorId, store: &'s dyn CookieStore) -> Self {
        Self {
            id,
            new_cookie: true,
            dirty: DirtyFlags::empty(),
            first_hit_time_gmt: 0,
            last_hit_time_gmt: 0,
            last_hit_time_visitor_local: 0,
            last_visit_num: 0,
            last_purchase_time_gmt: 0,
            first_hit_referrer: String::new(),
            first_hit_page_url: String::new(),
            first_hit_pagename: String::new(),
            last_purchase_num: 0,
            purchase_ids: PurchaseIds::new(),
            merchandising: String::new(),
            relation_vars: RelationVars::new(),
            store,
        }
    }

    /// Saves the cookie through its store.
    ///
    /// Dirty flags are cleared only once the save succeeded; on failure they are
    /// kept so a later attempt still writes the pending changes.
    pub fn store(&mut self) -> Result<(), StoreError> {
        let store = self.store;
        store.save(self)?;
        self.mark_clean();
        Ok(())
    }

    /// Saves the cookie if anything changed. Returns whether a save happened.
    pub fn flush(&mut self) -> Result<bool, StoreError> {
        if !self.is_modified() {
            return Ok(false);
        }
        self.store()?;
        Ok(true)
    }

    /// Saves every cookie in `cookies` through `store`'s batch path.
    ///
    /// Each cookie whose save succeeded is marked clean; failed ones keep their
    /// dirty flags. `on_done` sees every outcome, as with
    /// [`CookieStore::save_all`].
    pub fn store_all(
        store: &dyn CookieStore,
        cookies: &mut [&mut VisitorCookie<'_>],
        on_done: &mut dyn FnMut(&VisitorCookie<'_>, Result<(), StoreError>),
    ) {
        let mut saved: Vec<*const ()> = Vec::with_capacity(cookies.len());
        {
            let refs: Vec<&VisitorCookie<'_>> = cookies.iter().map(|c| &**c).collect();
            store.save_all(&refs, &mut |cookie, result| {
                if result.is_ok() {
                    saved.push(cookie as *const VisitorCookie<'_> as *const ());
                }
                on_done(cookie, result);
            });
        }

        for cookie in cookies.iter_mut() {
            let ptr = &**cookie as *const VisitorCookie<'_> as *const ();
            if saved.contains(&ptr) {
                cookie.mark_clean();
            }
        }
    }

    /// Flushes and consumes the cookie, reporting the outcome to the caller.
    pub fn close(mut self) -> Result<(), StoreError> {
        let result = self.flush().map(|_| ());
        // The caller now owns any failure; drop must not retry it.
        self.dirty = DirtyFlags::empty();
        result
    }

    /// Replaces the contents of this cookie with the encoded record in `bytes`.
    ///
    /// For store implementations. `last_hit_time_gmt` overrides the encoded value
    /// for backends that keep it outside the blob. The cookie ends up clean and,
    /// once decoded, no longer new; on a decode failure it is left empty.
    pub fn restore_from(
        &mut self,
        bytes: &[u8],
        last_hit_time_gmt: Option<i64>,
    ) -> Result<(), DecodeError> {
        self.reset();
        let decoded = codec::decode_into(self, bytes);
        match decoded {
            Ok(()) => {
                self.new_cookie = false;
                if let Some(t) = last_hit_time_gmt {
                    self.last_hit_time_gmt = t;
                }
            }
            Err(_) => self.reset(),
        }
        self.mark_clean();
        decoded
    }

    /// Encodes this cookie with [`codec::encode`].
    pub fn to_bytes(&self, options: EncodeOptions) -> Vec<u8> {
        codec::encode(self, options)
    }

    /// Clears every field back to its default. The identity is kept.
    pub fn reset(&mut self) {
        self.first_hit_time_gmt = 0;
        self.last_hit_time_gmt = 0;
        self.last_hit_time_visitor_local = 0;
        self.last_visit_num = 0;

        self.last_purchase_time_gmt = 0;
        self.first_hit_referrer.clear();
        self.first_hit_page_url.clear();
        self.first_hit_pagename.clear();
        self.last_purchase_num = 0;
        self.purchase_ids.clear();

        self.merchandising.clear();

        self.relation_vars.reset();
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = DirtyFlags::empty();
        self.relation_vars.mark_flushed();
    }

    fn touch(&mut self, section: DirtyFlags) {
        self.dirty |= section;
    }

    // ---- state --------------------------------------------------------

    pub fn id(&self) -> VisitorId {
        self.id
    }

    /// True if the visitor had no stored record (or was declared new).
    pub fn is_new_cookie(&self) -> bool {
        self.new_cookie
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn is_modified(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn is_traffic_modified(&self) -> bool {
        self.dirty.contains(DirtyFlags::TRAFFIC)
    }

    pub fn is_ecommerce_modified(&self) -> bool {
        self.dirty.contains(DirtyFlags::ECOMMERCE)
    }

    pub fn is_merchandising_modified(&self) -> bool {
        self.dirty.contains(DirtyFlags::MERCHANDISING)
    }

    pub fn is_relvar_modified(&self) -> bool {
        self.dirty.contains(DirtyFlags::RELATION_VARS)
    }

    // ---- traffic ------------------------------------------------------

    pub fn set_first_hit_time_gmt(&mut self, t: i64) {
        self.touch(DirtyFlags::TRAFFIC);
        self.first_hit_time_gmt = t;
    }

    pub fn set_last_hit_time_gmt(&mut self, t: i64) {
        self.touch(DirtyFlags::TRAFFIC);
        self.last_hit_time_gmt = t;
    }

    pub fn set_last_hit_time_visitor_local(&mut self, t: i64) {
        self.touch(DirtyFlags::TRAFFIC);
        self.last_hit_time_visitor_local = t;
    }

    pub fn set_last_visit_num(&mut self, n: u32) {
        self.touch(DirtyFlags::TRAFFIC);
        self.last_visit_num = n;
    }

    pub fn first_hit_time_gmt(&self) -> i64 {
        self.first_hit_time_gmt
    }

    pub fn last_hit_time_gmt(&self) -> i64 {
        self.last_hit_time_gmt
    }

    pub fn last_hit_time_visitor_local(&self) -> i64 {
        self.last_hit_time_visitor_local
    }

    pub fn last_visit_num(&self) -> u32 {
        self.last_visit_num
    }

    // ---- e-commerce ---------------------------------------------------

    pub fn set_last_purchase_time_gmt(&mut self, t: i64) {
        self.touch(DirtyFlags::ECOMMERCE);
        self.last_purchase_time_gmt = t;
    }

    pub fn set_first_hit_referrer(&mut self, s: &str) {
        self.touch(DirtyFlags::ECOMMERCE);
        self.first_hit_referrer = s.to_string();
    }

    pub fn set_first_hit_url(&mut self, s: &str) {
        self.touch(DirtyFlags::ECOMMERCE);
        self.first_hit_page_url = s.to_string();
    }

    pub fn set_first_hit_pagename(&mut self, s: &str) {
        self.touch(DirtyFlags::ECOMMERCE);
        self.first_hit_pagename = s.to_string();
    }

    pub fn set_last_purchase_num(&mut self, n: u32) {
        self.touch(DirtyFlags::ECOMMERCE);
        self.last_purchase_num = n;
    }

    /// Remembers `purchase_id` as the most recent purchase.
    ///
    /// Returns `false` if it was already known (it becomes the most recent one).
    pub fn set_purchase_id(&mut self, purchase_id: &str) -> bool {
        if self.purchase_ids.is_latest(purchase_id) {
            return false;
        }
        self.touch(DirtyFlags::ECOMMERCE);
        self.purchase_ids.insert(purchase_id)
    }

    pub fn last_purchase_time_gmt(&self) -> i64 {
        self.last_purchase_time_gmt
    }

    pub fn first_hit_referrer(&self) -> &str {
        &self.first_hit_referrer
    }

    pub fn first_hit_url(&self) -> &str {
        &self.first_hit_page_url
    }

    pub fn first_hit_pagename(&self) -> &str {
        &self.first_hit_pagename
    }

    pub fn last_purchase_num(&self) -> u32 {
        self.last_purchase_num
    }

    pub fn purchase_ids(&self) -> &PurchaseIds {
        &self.purchase_ids
    }

    // ---- merchandising ------------------------------------------------

    pub fn set_merchandising(&mut self, s: &str) {
        self.touch(DirtyFlags::MERCHANDISING);
        self.merchandising = s.to_string();
    }

    pub fn merchandising(&self) -> &str {
        &self.merchandising
    }

    // ---- relation variables -------------------------------------------

    /// See [`RelationVars::set_var`]. Marks the cookie dirty only if the table changed.
    pub fn set_var(
        &mut self,
        relation_id: RelationId,
        value: &str,
        timestamp: i64,
        revision: u8,
        policy: AllocationPolicy,
    ) -> Option<VarHandle> {
        let (handle, changed) =
            self.relation_vars
                .write(relation_id, value, timestamp, revision, policy);
        if changed {
            self.touch(DirtyFlags::RELATION_VARS);
        }
        handle
    }

    pub fn clear_var(&mut self, relation_id: RelationId) {
        if self.relation_vars.clear(relation_id) {
            self.touch(DirtyFlags::RELATION_VARS);
        }
    }

    /// See [`RelationVars::add_linear_element`].
    pub fn add_linear_element(
        &mut self,
        handle: VarHandle,
        value: &str,
        timestamp: i64,
        revision: u8,
    ) -> bool {
        let added = self
            .relation_vars
            .add_linear_element(handle, value, timestamp, revision);
        if added {
            self.touch(DirtyFlags::RELATION_VARS);
        }
        added
    }

    pub fn var_element_count(&self, relation_id: RelationId) -> usize {
        self.relation_vars.element_count(relation_id)
    }

    pub fn var(&self, relation_id: RelationId, index: usize) -> Option<&RelVar> {
        self.relation_vars.element_by_id(relation_id, index)
    }

    pub fn relation_vars(&self) -> &RelationVars {
        &self.relation_vars
    }
}

impl Drop for VisitorCookie<'_> {
    fn drop(&mut self) {
        if !self.is_modified() {
            return;
        }
        if let Err(e) = self.store() {
            log::error!(
                "Visitor cookie {} dropped with unsaved changes ({:?}): {e}",
                self.id,
                self.dirty
            );
        }
    }
}

/// Identity, every field, purchase id order and the set relation variables
/// must match. The store binding, dirty state and allocation policies do not
/// take part.
impl PartialEq for VisitorCookie<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.first_hit_time_gmt == other.first_hit_time_gmt
            && self.last_hit_time_gmt == other.last_hit_time_gmt
            && self.last_hit_time_visitor_local == other.last_hit_time_visitor_local
            && self.last_visit_num == other.last_visit_num
            && self.last_purchase_time_gmt == other.last_purchase_time_gmt
            && self.first_hit_referrer == other.first_hit_referrer
            && self.first_hit_page_url == other.first_hit_page_url
            && self.first_hit_pagename == other.first_hit_pagename
            && self.last_purchase_num == other.last_purchase_num
            && self.purchase_ids == other.purchase_ids
            && self.merchandising == other.merchandising
            && self.relation_vars == other.relation_vars
    }
}

impl fmt::Debug for VisitorCookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisitorCookie")
            .field("id", &self.id)
            .field("new_cookie", &self.new_cookie)
            .field("dirty", &self.dirty)
            .field("first_hit_time_gmt", &self.first_hit_time_gmt)
            .field("last_hit_time_gmt", &self.last_hit_time_gmt)
            .field("last_visit_num", &self.last_visit_num)
            .field("purchase_ids", &self.purchase_ids)
            .field("relation_vars", &self.relation_vars.set_ids().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryCookieStore, NopCookieStore, StoredCookie};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store that counts saves and can be told to fail them.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryCookieStore,
        saves: AtomicUsize,
        fail_saves: AtomicBool,
    }

    impl CookieStore for FlakyStore {
        fn save(&self, cookie: &VisitorCookie<'_>) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::BackendUnavailable("connection reset".into()));
            }
            self.inner.save(cookie)
        }

        fn load(&self, cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError> {
            self.inner.load(cookie)
        }

        fn delete(&self, cookie: &VisitorCookie<'_>) -> Result<bool, StoreError> {
            self.inner.delete(cookie)
        }

        fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
            self.inner.delete_older_than(cutoff)
        }

        fn count(&self) -> Result<u64, StoreError> {
            self.inner.count()
        }

        fn get_by_index(&self, index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError> {
            self.inner.get_by_index(index)
        }
    }

    fn id() -> VisitorId {
        VisitorId::new(12345, 6789, 9876)
    }

    fn populate(vc: &mut VisitorCookie<'_>) {
        let t = 1_700_000_000;
        vc.set_first_hit_time_gmt(t - 100_000);
        vc.set_last_hit_time_gmt(t);
        vc.set_last_hit_time_visitor_local(t - 7 * 60 * 60);
        vc.set_last_visit_num(vc.last_visit_num() + 1);

        vc.set_last_purchase_time_gmt(t - 10_000);
        vc.set_first_hit_referrer("Some Site");
        vc.set_first_hit_url("http://www.acme.com/a/b/d/x.html");
        vc.set_first_hit_pagename("Some Page");
        vc.set_last_purchase_num(5);
        vc.set_merchandising("asl;dfkjasd;flkjasdf;lkjasdf;lkajsdf;lkasjdf");

        for pid in ["pid1", "pid2", "pid3", "pid4", "pid5", "pid6"] {
            vc.set_purchase_id(pid);
        }

        for rid in [1u16, 9, 5, 7, 3, 8, 4, 2, 6, 10, 13, 12, 11] {
            vc.set_var(
                rid,
                &format!("Var{rid}"),
                t + rid as i64,
                rid as u8,
                AllocationPolicy::First,
            );
        }
        vc.clear_var(11);

        for (i, suffix) in ["b", "c", "d", "e", "f", "g", "h"].iter().enumerate() {
            vc.set_var(
                9,
                &format!("Var9{suffix}"),
                t + i as i64 * 10,
                19 + i as u8 * 10,
                AllocationPolicy::Linear(5),
            );
        }
    }

    #[test]
    fn known_new_cookie_starts_clean() {
        let store = FlakyStore::default();
        let vc = VisitorCookie::open(id(), true, &store).unwrap();
        assert!(vc.is_new_cookie());
        assert!(!vc.is_modified());
    }

    #[test]
    fn load_miss_behaves_like_new() {
        let store = FlakyStore::default();
        let vc = VisitorCookie::open(id(), false, &store).unwrap();
        assert!(vc.is_new_cookie());
        assert!(!vc.is_modified());
        assert_eq!(vc, VisitorCookie::blank(id(), &store));
    }

    #[test]
    fn mutators_mark_their_sections() {
        let store = FlakyStore::default();
        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();

        vc.set_last_visit_num(3);
        assert_eq!(vc.dirty_flags(), DirtyFlags::TRAFFIC);

        vc.set_purchase_id("p1");
        assert!(vc.is_ecommerce_modified());
        assert!(!vc.is_merchandising_modified());

        vc.set_merchandising("m");
        vc.set_var(1, "a", 0, 0, AllocationPolicy::Last);
        assert_eq!(vc.dirty_flags(), DirtyFlags::all());
        assert!(vc.is_relvar_modified());

        vc.close().unwrap();
    }

    #[test]
    fn ignored_writes_leave_cookie_clean() {
        let store = FlakyStore::default();
        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
        vc.set_var(1, "a", 0, 0, AllocationPolicy::First);
        vc.store().unwrap();

        vc.set_var(1, "b", 0, 0, AllocationPolicy::First);
        vc.clear_var(42);
        vc.set_var(2, "", 0, 0, AllocationPolicy::Linear(3));
        assert!(!vc.is_modified());
    }

    #[test]
    fn saved_cookie_loads_equal_and_clean() {
        let store = FlakyStore::default();
        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
        populate(&mut vc);
        assert!(vc.is_modified());
        vc.store().unwrap();
        assert!(!vc.is_modified());
        assert_eq!(vc.relation_vars().first_modified_id(), None);

        let vc2 = VisitorCookie::open(id(), false, &store).unwrap();
        assert!(!vc2.is_new_cookie());
        assert!(!vc2.is_modified());
        assert_eq!(vc, vc2);
        assert_eq!(vc2.var_element_count(9), 5);
        assert_eq!(vc2.var(9, 0).unwrap().value, "Var9d");
        assert_eq!(vc2.var_element_count(11), 0);
        assert_eq!(vc2.purchase_ids().get(0), Some("pid2"));
    }

    #[test]
    fn flush_of_unmodified_loaded_cookie_does_not_save() {
        let store = FlakyStore::default();
        {
            let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
            populate(&mut vc);
        }
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);

        let mut vc = VisitorCookie::open(id(), false, &store).unwrap();
        assert!(!vc.flush().unwrap());
        vc.close().unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_flushes_dirty_cookie() {
        let store = FlakyStore::default();
        {
            let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
            vc.set_last_hit_time_gmt(77);
        }
        assert_eq!(store.count().unwrap(), 1);
        let vc = VisitorCookie::open(id(), false, &store).unwrap();
        assert_eq!(vc.last_hit_time_gmt(), 77);
    }

    #[test]
    fn failed_store_keeps_changes_pending() {
        let store = FlakyStore::default();
        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
        vc.set_merchandising("pending");

        store.fail_saves.store(true, Ordering::SeqCst);
        let err = vc.store().unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)));
        assert!(vc.is_merchandising_modified());

        store.fail_saves.store(false, Ordering::SeqCst);
        assert!(vc.flush().unwrap());
        assert!(!vc.is_modified());
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_reports_failure_and_drop_does_not_retry() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = FlakyStore::default();
        store.fail_saves.store(true, Ordering::SeqCst);

        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
        vc.set_last_visit_num(1);
        assert!(vc.close().is_err());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_all_marks_saved_cookies_clean() {
        let store = FlakyStore::default();
        let mut a = VisitorCookie::open(VisitorId::new(1, 0, 1), true, &store).unwrap();
        let mut b = VisitorCookie::open(VisitorId::new(1, 0, 2), true, &store).unwrap();
        let mut c = VisitorCookie::open(VisitorId::new(1, 0, 3), true, &store).unwrap();
        a.set_last_visit_num(1);
        b.set_merchandising("b");
        c.set_var(3, "c", 0, 0, AllocationPolicy::Last);

        let mut calls = 0;
        VisitorCookie::store_all(&store, &mut [&mut a, &mut b, &mut c], &mut |_, r| {
            assert!(r.is_ok());
            calls += 1;
        });
        assert_eq!(calls, 3);
        assert!(!a.is_modified() && !b.is_modified() && !c.is_modified());

        a.close().unwrap();
        b.close().unwrap();
        c.close().unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn store_all_keeps_failed_cookies_dirty() {
        let store = FlakyStore::default();
        let mut a = VisitorCookie::open(VisitorId::new(1, 0, 1), true, &store).unwrap();
        let mut b = VisitorCookie::open(VisitorId::new(1, 0, 2), true, &store).unwrap();
        a.set_last_visit_num(1);
        b.set_last_visit_num(2);

        store.fail_saves.store(true, Ordering::SeqCst);
        let mut failures = 0;
        VisitorCookie::store_all(&store, &mut [&mut a, &mut b], &mut |_, r| {
            if r.is_err() {
                failures += 1;
            }
        });
        assert_eq!(failures, 2);
        assert!(a.is_traffic_modified() && b.is_traffic_modified());

        store.fail_saves.store(false, Ordering::SeqCst);
        a.close().unwrap();
        b.close().unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn restored_record_is_not_new() {
        let store = NopCookieStore;
        let mut vc = VisitorCookie::blank(id(), &store);
        populate(&mut vc);
        let bytes = vc.to_bytes(EncodeOptions::default());
        vc.mark_clean();

        let mut back = VisitorCookie::blank(id(), &store);
        assert!(back.is_new_cookie());
        back.restore_from(&bytes, None).unwrap();
        assert!(!back.is_new_cookie());
        assert_eq!(back, vc);

        let mut broken = VisitorCookie::blank(id(), &store);
        assert!(broken.restore_from(&bytes[..3], None).is_err());
        assert!(broken.is_new_cookie());
    }

    #[test]
    fn open_propagates_decode_failure() {
        let store = InMemoryCookieStore::new();
        store.insert_raw(
            id(),
            StoredCookie {
                last_hit_time_gmt: 0,
                payload: vec![0, 0, 0],
            },
        );
        let err = VisitorCookie::open(id(), false, &store).unwrap_err();
        assert!(matches!(err, StoreError::Decode(DecodeError::Truncated { .. })));
    }

    #[test]
    fn reinserting_latest_purchase_id_is_clean() {
        let store = FlakyStore::default();
        let mut vc = VisitorCookie::open(id(), true, &store).unwrap();
        assert!(vc.set_purchase_id("p1"));
        vc.store().unwrap();

        assert!(!vc.set_purchase_id("p1"));
        assert!(!vc.is_modified());
    }

    #[test]
    fn equality_covers_every_section() {
        let store = FlakyStore::default();
        let mut a = VisitorCookie::open(id(), true, &store).unwrap();
        let mut b = VisitorCookie::open(id(), true, &store).unwrap();
        populate(&mut a);
        populate(&mut b);
        assert_eq!(a, b);

        b.set_purchase_id("pid3");
        assert_ne!(a, b);
        a.set_purchase_id("pid3");
        assert_eq!(a, b);

        b.set_var(200, "x", 0, 0, AllocationPolicy::Last);
        assert_ne!(a, b);

        let other = VisitorCookie::open(VisitorId::new(1, 2, 3), true, &store).unwrap();
        assert_ne!(VisitorCookie::blank(id(), &store), other);
    }
}
