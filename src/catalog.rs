//! Relational index of acquisitions, look-up tables, and per-tuple stats
//! table bookkeeping: a single `Mutex<Connection>` behind a small struct,
//! idempotent embedded-SQL migrations run on every open, and a CRUD
//! method per resource.

use crate::error::{GlamError, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

pub struct Catalog {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquisitionState {
    pub downloaded: bool,
    pub processed: bool,
    pub stat_gen: bool,
}

impl AcquisitionState {
    pub fn completed(&self) -> bool {
        self.processed && self.stat_gen
    }
}

#[derive(Debug, Clone)]
pub struct StatsTableRef {
    pub stats_id: i64,
    pub name: String,
    pub exists: bool,
}

impl Catalog {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS product_status (
                product    TEXT NOT NULL,
                date       TEXT NOT NULL,
                collection TEXT NOT NULL DEFAULT '',
                downloaded INTEGER NOT NULL DEFAULT 0,
                processed  INTEGER NOT NULL DEFAULT 0,
                stat_gen   INTEGER NOT NULL DEFAULT 0,
                completed  INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                PRIMARY KEY (product, date, collection)
            );
            CREATE INDEX IF NOT EXISTS idx_product_status_pending
                ON product_status(product, completed);

            CREATE TABLE IF NOT EXISTS products (
                product_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                collection TEXT NOT NULL DEFAULT '',
                UNIQUE(name, collection)
            );

            CREATE TABLE IF NOT EXISTS masks (
                mask_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name    TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS regions (
                region_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name      TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS stats (
                stats_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id INTEGER NOT NULL REFERENCES products(product_id),
                mask_id    INTEGER NOT NULL REFERENCES masks(mask_id),
                region_id  INTEGER NOT NULL REFERENCES regions(region_id),
                year       INTEGER NOT NULL,
                table_exists INTEGER NOT NULL DEFAULT 0,
                UNIQUE(product_id, mask_id, region_id, year)
            );
            ",
        )?;
        Ok(())
    }

    // ── product_status ──

    pub fn upsert_pending(&self, product: &str, date: NaiveDate, collection: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO product_status (product, date, collection) VALUES (?1, ?2, ?3)
             ON CONFLICT(product, date, collection) DO NOTHING",
            params![product, date.to_string(), collection],
        )?;
        Ok(())
    }

    pub fn missing_by_product(&self, product: &str, collection: &str) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT date FROM product_status WHERE product = ?1 AND collection = ?2 AND completed = 0 ORDER BY date ASC",
        )?;
        let rows = stmt
            .query_map(params![product, collection], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
            .collect())
    }

    pub fn latest_date(&self, product: &str, collection: &str) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().unwrap();
        let s: Option<String> = conn
            .query_row(
                "SELECT MAX(date) FROM product_status WHERE product = ?1 AND collection = ?2",
                params![product, collection],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(s.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    /// Sets one of `downloaded`/`processed`/`stat_gen` and re-derives
    /// `completed` in the same transaction, keeping invariant I3.
    pub fn set_flag(
        &self,
        product: &str,
        date: NaiveDate,
        collection: &str,
        flag: &str,
        value: bool,
    ) -> Result<()> {
        if !matches!(flag, "downloaded" | "processed" | "stat_gen") {
            return Err(GlamError::BadInput(format!("unknown flag '{flag}'")));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "UPDATE product_status SET {flag} = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
                 WHERE product = ?2 AND date = ?3 AND collection = ?4"
            ),
            params![value, product, date.to_string(), collection],
        )?;
        tx.execute(
            "UPDATE product_status SET completed = (processed = 1 AND stat_gen = 1) \
             WHERE product = ?1 AND date = ?2 AND collection = ?3",
            params![product, date.to_string(), collection],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn state_of(
        &self,
        product: &str,
        date: NaiveDate,
        collection: &str,
    ) -> Result<Option<AcquisitionState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT downloaded, processed, stat_gen FROM product_status \
             WHERE product = ?1 AND date = ?2 AND collection = ?3",
            params![product, date.to_string(), collection],
            |row| {
                Ok(AcquisitionState {
                    downloaded: row.get(0)?,
                    processed: row.get(1)?,
                    stat_gen: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(GlamError::from)
    }

    pub fn delete_acquisition(&self, product: &str, date: NaiveDate, collection: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM product_status WHERE product = ?1 AND date = ?2 AND collection = ?3",
            params![product, date.to_string(), collection],
        )?;
        Ok(())
    }

    // ── look-up tables ──

    pub fn resolve_product_id(&self, name: &str, collection: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (name, collection) VALUES (?1, ?2) \
             ON CONFLICT(name, collection) DO NOTHING",
            params![name, collection],
        )?;
        conn.query_row(
            "SELECT product_id FROM products WHERE name = ?1 AND collection = ?2",
            params![name, collection],
            |row| row.get(0),
        )
        .map_err(GlamError::from)
    }

    pub fn resolve_mask_id(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO masks (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        conn.query_row("SELECT mask_id FROM masks WHERE name = ?1", params![name], |row| {
            row.get(0)
        })
        .map_err(GlamError::from)
    }

    pub fn resolve_region_id(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO regions (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        conn.query_row(
            "SELECT region_id FROM regions WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .map_err(GlamError::from)
    }

    /// Resolves (and creates if absent) the `stats` look-up row for a
    /// (product, collection, mask, region, year) key. Idempotent under
    /// concurrent callers via `INSERT ... ON CONFLICT DO NOTHING` followed
    /// by a select, matching property P2.
    pub fn resolve_stats_table(
        &self,
        product: &str,
        collection: &str,
        mask: &str,
        region: &str,
        year: i32,
    ) -> Result<StatsTableRef> {
        let product_id = self.resolve_product_id(product, collection)?;
        let mask_id = self.resolve_mask_id(mask)?;
        let region_id = self.resolve_region_id(region)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stats (product_id, mask_id, region_id, year) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(product_id, mask_id, region_id, year) DO NOTHING",
            params![product_id, mask_id, region_id, year],
        )?;
        let (stats_id, table_exists): (i64, bool) = conn.query_row(
            "SELECT stats_id, table_exists FROM stats \
             WHERE product_id = ?1 AND mask_id = ?2 AND region_id = ?3 AND year = ?4",
            params![product_id, mask_id, region_id, year],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StatsTableRef {
            stats_id,
            name: format!("stats_{stats_id}"),
            exists: table_exists,
        })
    }

    /// All stats table refs written for `(product, collection)` in `year`,
    /// across every (mask, region) pair — used by the purge path to find
    /// every table a superseded acquisition contributed columns to.
    pub fn stats_tables_for(&self, product: &str, collection: &str, year: i32) -> Result<Vec<StatsTableRef>> {
        let product_id = self.resolve_product_id(product, collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT stats_id, table_exists FROM stats WHERE product_id = ?1 AND year = ?2",
        )?;
        let rows = stmt
            .query_map(params![product_id, year], |row| {
                let stats_id: i64 = row.get(0)?;
                let exists: bool = row.get(1)?;
                Ok(StatsTableRef {
                    stats_id,
                    name: format!("stats_{stats_id}"),
                    exists,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_stats_table_created(&self, stats_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE stats SET table_exists = 1 WHERE stats_id = ?1",
            params![stats_id],
        )?;
        Ok(())
    }

    pub fn all_stats_tables(&self) -> Result<Vec<StatsTableRef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT stats_id, table_exists FROM stats")?;
        let rows = stmt
            .query_map([], |row| {
                let stats_id: i64 = row.get(0)?;
                let exists: bool = row.get(1)?;
                Ok(StatsTableRef {
                    stats_id,
                    name: format!("stats_{stats_id}"),
                    exists,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Exposes the underlying connection so the Materializer can run its
    /// stats-table DDL/DML against the same SQLite file as the catalog
    /// rather than opening a second handle. Crate-private: external
    /// callers go through the methods above.
    pub(crate) fn conn(&self) -> &Mutex<Connection> {
        &self.conn
    }

    pub fn processed_acquisitions(&self) -> Result<Vec<(String, NaiveDate, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT product, date, collection FROM product_status WHERE processed = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(p, d, c)| {
                NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .ok()
                    .map(|date| (p, date, c))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> Catalog {
        Catalog::open(":memory:").unwrap()
    }

    #[test]
    fn resolve_stats_table_is_idempotent() {
        let cat = open_tmp();
        let a = cat.resolve_stats_table("chirps", "", "nomask", "fewsnet", 2019).unwrap();
        let b = cat.resolve_stats_table("chirps", "", "nomask", "fewsnet", 2019).unwrap();
        assert_eq!(a.stats_id, b.stats_id);
        assert_eq!(cat.all_stats_tables().unwrap().len(), 1);
    }

    #[test]
    fn completed_derives_from_processed_and_stat_gen() {
        let cat = open_tmp();
        let date = NaiveDate::from_ymd_opt(2019, 12, 1).unwrap();
        cat.upsert_pending("chirps", date, "").unwrap();
        cat.set_flag("chirps", date, "", "processed", true).unwrap();
        let state = cat.state_of("chirps", date, "").unwrap().unwrap();
        assert!(state.processed);
        assert!(!state.completed());

        cat.set_flag("chirps", date, "", "stat_gen", true).unwrap();
        let state = cat.state_of("chirps", date, "").unwrap().unwrap();
        assert!(state.completed());
    }

    #[test]
    fn upsert_pending_is_idempotent() {
        let cat = open_tmp();
        let date = NaiveDate::from_ymd_opt(2019, 12, 1).unwrap();
        cat.upsert_pending("chirps", date, "").unwrap();
        cat.upsert_pending("chirps", date, "").unwrap();
        assert_eq!(cat.missing_by_product("chirps", "").unwrap().len(), 1);
    }
}
