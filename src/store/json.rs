//! JSON-backed cookie store.
//!
//! `JsonCookieStore` keeps **all** visitor records in a single JSON file on
//! disk, keyed by the visitor id's `user:high:low` form.
//!
//! ### Design
//! - One file for all visitors (`CookieStoreFile { cookies: BTreeMap<String, StoredCookie> }`).
//! - Every operation reads the file, and mutating ones rewrite it in full.
//!   A mutex serializes these read-modify-write cycles within the process.
//!
//! ### Caveats
//! - Cost grows with the number of records; prefer the SQLite store at scale.
//! - File writes are not atomic and other processes are not locked out.
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::cookie::{VisitorCookie, VisitorId};
use crate::errors::{DecodeError, StoreError};
use crate::store::{CookieStore, StoredCookie};

/// On-disk representation of all visitor records.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CookieStoreFile {
    cookies: BTreeMap<String, StoredCookie>,
}

pub struct JsonCookieStore {
    /// Path to the JSON file where records are stored.
    path: PathBuf,
    /// Held for the duration of each file access.
    lock: Mutex<()>,
}

impl JsonCookieStore {
    /// Opens the JSON store at `path`, writing an empty file if none exists.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        if !store.path.exists() {
            store.save_file(&CookieStoreFile::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Loads the full store file. A file removed behind our back reads as empty.
    fn load_file(&self) -> Result<CookieStoreFile, StoreError> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CookieStoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_file(&self, file: &CookieStoreFile) -> Result<(), StoreError> {
        let contents = serde_json::to_vec(file)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    fn update<T>(&self, f: impl FnOnce(&mut CookieStoreFile) -> T) -> Result<T, StoreError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        let out = f(&mut file);
        self.save_file(&file)?;
        Ok(out)
    }
}

impl CookieStore for JsonCookieStore {
    fn save(&self, cookie: &VisitorCookie<'_>) -> Result<(), StoreError> {
        let record = StoredCookie::encode(cookie);
        self.update(|file| {
            file.cookies.insert(cookie.id().to_string(), record);
        })
    }

    fn load(&self, cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError> {
        let record = {
            let _guard = self.lock()?;
            self.load_file()?.cookies.remove(&cookie.id().to_string())
        };
        match record {
            Some(record) => {
                record.restore(cookie)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, cookie: &VisitorCookie<'_>) -> Result<bool, StoreError> {
        let key = cookie.id().to_string();
        self.update(|file| file.cookies.remove(&key).is_some())
    }

    fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        self.update(|file| {
            let before = file.cookies.len();
            file.cookies.retain(|_, r| r.last_hit_time_gmt >= cutoff);
            (before - file.cookies.len()) as u64
        })
    }

    fn count(&self) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        Ok(self.load_file()?.cookies.len() as u64)
    }

    fn get_by_index(&self, index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError> {
        let entry = {
            let _guard = self.lock()?;
            let file = self.load_file()?;
            usize::try_from(index)
                .ok()
                .and_then(|i| file.cookies.into_iter().nth(i))
        };
        let Some((key, record)) = entry else {
            return Ok(None);
        };

        let id: VisitorId = key
            .parse()
            .map_err(|e| DecodeError::Malformed(format!("{e}")))?;
        let mut cookie = VisitorCookie::blank(id, self);
        record.restore(&mut cookie)?;
        Ok(Some(cookie))
    }
}
