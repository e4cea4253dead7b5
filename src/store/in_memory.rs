use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cookie::{VisitorCookie, VisitorId};
use crate::errors::StoreError;
use crate::store::{CookieStore, StoredCookie};

/// Process-local store. Records are enumerated in visitor id order.
#[derive(Default)]
pub struct InMemoryCookieStore {
    records: RwLock<BTreeMap<VisitorId, StoredCookie>>,
}

impl InMemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<VisitorId, StoredCookie>>, StoreError> {
        self.records.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<VisitorId, StoredCookie>>, StoreError> {
        self.records.write().map_err(|_| StoreError::LockPoisoned)
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, id: VisitorId, record: StoredCookie) {
        if let Ok(mut records) = self.records.write() {
            records.insert(id, record);
        }
    }
}

impl CookieStore for InMemoryCookieStore {
    fn save(&self, cookie: &VisitorCookie<'_>) -> Result<(), StoreError> {
        let record = StoredCookie::encode(cookie);
        self.write()?.insert(cookie.id(), record);
        Ok(())
    }

    fn load(&self, cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError> {
        let record = self.read()?.get(&cookie.id()).cloned();
        match record {
            Some(record) => {
                record.restore(cookie)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, cookie: &VisitorCookie<'_>) -> Result<bool, StoreError> {
        Ok(self.write()?.remove(&cookie.id()).is_some())
    }

    fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| r.last_hit_time_gmt >= cutoff);
        Ok((before - records.len()) as u64)
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.len() as u64)
    }

    fn get_by_index(&self, index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError> {
        let entry = {
            let records = self.read()?;
            usize::try_from(index)
                .ok()
                .and_then(|i| records.iter().nth(i))
                .map(|(id, r)| (*id, r.clone()))
        };
        let Some((id, record)) = entry else {
            return Ok(None);
        };

        let mut cookie = VisitorCookie::blank(id, self);
        record.restore(&mut cookie)?;
        Ok(Some(cookie))
    }
}
