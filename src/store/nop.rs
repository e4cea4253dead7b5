use crate::cookie::VisitorCookie;
use crate::errors::StoreError;
use crate::store::CookieStore;

/// Store that persists nothing. Saves succeed, loads never find a record.
///
/// Useful where visitor state should live for a single request only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopCookieStore;

impl CookieStore for NopCookieStore {
    fn save(&self, _cookie: &VisitorCookie<'_>) -> Result<(), StoreError> {
        Ok(())
    }

    fn load(&self, _cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn delete(&self, _cookie: &VisitorCookie<'_>) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn delete_older_than(&self, _cutoff: i64) -> Result<u64, StoreError> {
        Ok(0)
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    fn get_by_index(&self, _index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError> {
        Ok(None)
    }
}
