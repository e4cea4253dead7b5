//! SQLite-backed cookie store.
//!
//! `SqliteCookieStore` persists every visitor record as one row of a single
//! `visitor_cookies` table: the visitor id columns, the last hit time (indexed,
//! for expiry) and the encoded cookie as a blob.
//!
//! ## Concurrency
//! - Database access goes through an `r2d2` pool, so one store can be shared
//!   by any number of threads behind a [`CookieStoreHandle`](crate::store::CookieStoreHandle).
//! - [`save_all`](CookieStore::save_all) and [`load_all`](CookieStore::load_all)
//!   split the batch over up to `batch_workers` scoped threads, each holding one
//!   pooled connection. Results are handed back to the calling thread, which is
//!   where completion callbacks run and where loaded records are decoded.
//!
//! ## Example
//! ```no_run
//! use visitor_cookie::cookie::{VisitorCookie, VisitorId};
//! use visitor_cookie::store::SqliteCookieStore;
//!
//! let store = SqliteCookieStore::new("visitors.sqlite").unwrap();
//! let mut cookie = VisitorCookie::open(VisitorId::new(1, 2, 3), false, &store).unwrap();
//! cookie.set_last_visit_num(cookie.last_visit_num() + 1);
//! cookie.close().unwrap();
//! ```
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::DEFAULT_POOL_SIZE;
use crate::cookie::{VisitorCookie, VisitorId};
use crate::errors::StoreError;
use crate::store::{CookieStore, StoredCookie};

pub struct SqliteCookieStore {
    /// Connection pool for SQLite database (so it can run multithreaded)
    pool: Pool<SqliteConnectionManager>,
    /// Upper bound on threads used by one batch call.
    batch_workers: usize,
}

impl SqliteCookieStore {
    /// Opens (or creates) the database at `path` with default pool and batch sizes.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_options(path, DEFAULT_POOL_SIZE, num_cpus::get())
    }

    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn with_options(
        path: impl AsRef<Path>,
        pool_size: u32,
        batch_workers: usize,
    ) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE)
            .with_init(|c| {
                c.busy_timeout(Duration::from_millis(500))?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS visitor_cookies (
                        user_id INTEGER NOT NULL,
                        visitor_high INTEGER NOT NULL,
                        visitor_low INTEGER NOT NULL,
                        last_hit_time_gmt INTEGER NOT NULL,
                        payload BLOB NOT NULL,
                        PRIMARY KEY (user_id, visitor_high, visitor_low)
                    );
                    CREATE INDEX IF NOT EXISTS visitor_cookies_last_hit
                        ON visitor_cookies (last_hit_time_gmt);",
                )?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;

        log::debug!(
            "Opened SQLite cookie store at {} (pool {}, batch workers {})",
            path.as_ref().display(),
            pool.max_size(),
            batch_workers
        );

        Ok(Self {
            pool,
            batch_workers: batch_workers.max(1),
        })
    }

    /// Runs `work` for every item on a pooled connection, spreading the items
    /// over scoped worker threads. `on_result` receives `(item index, result)`
    /// on the calling thread in completion order.
    fn fan_out<I, T, F>(&self, items: &[I], work: F, mut on_result: impl FnMut(usize, Result<T, StoreError>))
    where
        I: Sync,
        T: Send,
        F: Fn(&Connection, &I) -> Result<T, StoreError> + Sync,
    {
        if items.is_empty() {
            return;
        }
        let workers = self
            .batch_workers
            .min(self.pool.max_size() as usize)
            .clamp(1, items.len());
        let chunk_len = items.len().div_ceil(workers);

        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            for (n, chunk) in items.chunks(chunk_len).enumerate() {
                let tx = tx.clone();
                let work = &work;
                let pool = &self.pool;
                s.spawn(move || {
                    let base = n * chunk_len;
                    match pool.get() {
                        Ok(conn) => {
                            for (i, item) in chunk.iter().enumerate() {
                                let _ = tx.send((base + i, work(&conn, item)));
                            }
                        }
                        Err(e) => {
                            log::warn!("Batch worker could not get a connection: {e}");
                            let msg = e.to_string();
                            for i in 0..chunk.len() {
                                let _ = tx.send((base + i, Err(StoreError::BackendUnavailable(msg.clone()))));
                            }
                        }
                    }
                });
            }
            drop(tx);

            for (idx, result) in rx {
                on_result(idx, result);
            }
        });
    }
}

fn upsert(conn: &Connection, id: VisitorId, record: &StoredCookie) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO visitor_cookies (user_id, visitor_high, visitor_low, last_hit_time_gmt, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_id, visitor_high, visitor_low) DO UPDATE
         SET last_hit_time_gmt = excluded.last_hit_time_gmt, payload = excluded.payload",
        params![
            id.user_id,
            id.visitor_high as i64,
            id.visitor_low as i64,
            record.last_hit_time_gmt,
            record.payload
        ],
    )?;
    Ok(())
}

fn fetch(conn: &Connection, id: VisitorId) -> Result<Option<StoredCookie>, StoreError> {
    let record = conn
        .query_row(
            "SELECT last_hit_time_gmt, payload FROM visitor_cookies
             WHERE user_id = ?1 AND visitor_high = ?2 AND visitor_low = ?3",
            params![id.user_id, id.visitor_high as i64, id.visitor_low as i64],
            |row| {
                Ok(StoredCookie {
                    last_hit_time_gmt: row.get(0)?,
                    payload: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn restore_into(
    cookie: &mut VisitorCookie<'_>,
    record: Option<StoredCookie>,
) -> Result<bool, StoreError> {
    match record {
        Some(record) => {
            record.restore(cookie)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

impl CookieStore for SqliteCookieStore {
    fn save(&self, cookie: &VisitorCookie<'_>) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        upsert(&conn, cookie.id(), &StoredCookie::encode(cookie))
    }

    fn load(&self, cookie: &mut VisitorCookie<'_>) -> Result<bool, StoreError> {
        let record = {
            let conn = self.pool.get()?;
            fetch(&conn, cookie.id())?
        };
        restore_into(cookie, record)
    }

    fn delete(&self, cookie: &VisitorCookie<'_>) -> Result<bool, StoreError> {
        let id = cookie.id();
        let conn = self.pool.get()?;
        let n = conn.execute(
            "DELETE FROM visitor_cookies
             WHERE user_id = ?1 AND visitor_high = ?2 AND visitor_low = ?3",
            params![id.user_id, id.visitor_high as i64, id.visitor_low as i64],
        )?;
        Ok(n > 0)
    }

    fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "DELETE FROM visitor_cookies WHERE last_hit_time_gmt < ?1",
            params![cutoff],
        )?;
        Ok(n as u64)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM visitor_cookies", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn get_by_index(&self, index: u64) -> Result<Option<VisitorCookie<'_>>, StoreError> {
        let Ok(offset) = i64::try_from(index) else {
            return Ok(None);
        };

        let row = {
            let conn = self.pool.get()?;
            conn.query_row(
                "SELECT user_id, visitor_high, visitor_low, last_hit_time_gmt, payload
                 FROM visitor_cookies
                 ORDER BY user_id, visitor_high, visitor_low
                 LIMIT 1 OFFSET ?1",
                params![offset],
                |row| {
                    let id = VisitorId::new(
                        row.get(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                    );
                    let record = StoredCookie {
                        last_hit_time_gmt: row.get(3)?,
                        payload: row.get(4)?,
                    };
                    Ok((id, record))
                },
            )
            .optional()?
        };
        let Some((id, record)) = row else {
            return Ok(None);
        };

        let mut cookie = VisitorCookie::blank(id, self);
        record.restore(&mut cookie)?;
        Ok(Some(cookie))
    }

    fn save_all(
        &self,
        cookies: &[&VisitorCookie<'_>],
        on_done: &mut dyn FnMut(&VisitorCookie<'_>, Result<(), StoreError>),
    ) {
        let rows: Vec<(VisitorId, StoredCookie)> = cookies
            .iter()
            .map(|c| (c.id(), StoredCookie::encode(c)))
            .collect();

        self.fan_out(
            &rows,
            |conn, (id, record)| upsert(conn, *id, record),
            |idx, result| on_done(cookies[idx], result),
        );
    }

    fn load_all(
        &self,
        cookies: &mut [&mut VisitorCookie<'_>],
        on_done: &mut dyn FnMut(&VisitorCookie<'_>, Result<bool, StoreError>),
    ) {
        let ids: Vec<VisitorId> = cookies.iter().map(|c| c.id()).collect();

        self.fan_out(
            &ids,
            |conn, id| fetch(conn, *id),
            |idx, fetched| {
                let cookie = &mut *cookies[idx];
                let result = fetched.and_then(|record| restore_into(cookie, record));
                on_done(cookie, result);
            },
        );
    }
}
