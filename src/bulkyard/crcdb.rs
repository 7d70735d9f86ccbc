//! Persistent `origin -> CRC32` map used to invalidate cached artifacts
//! when a port's source tree changes.
//!
//! The original keeps this in an ndbm `.dir`/`.pag` pair. A single-table
//! SQLite database (bundled, so there's no host libsqlite3 dependency to
//! coordinate) is a closer match to how this codebase reaches for
//! persistence elsewhere than hand-rolling a second on-disk hash table
//! format.

use std::path::Path;

use rusqlite::{params, Connection};

pub struct CrcDb {
    conn: Connection,
}

impl CrcDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS port_crc (
                origin TEXT PRIMARY KEY,
                crc32  INTEGER NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE port_crc (
                origin TEXT PRIMARY KEY,
                crc32  INTEGER NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    pub fn get(&self, origin: &str) -> anyhow::Result<Option<u32>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT crc32 FROM port_crc WHERE origin = ?1")?;
        let mut rows = stmt.query(params![origin])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, i64>(0)? as u32)),
            None => Ok(None),
        }
    }

    pub fn set(&self, origin: &str, crc: u32) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO port_crc (origin, crc32) VALUES (?1, ?2)
             ON CONFLICT(origin) DO UPDATE SET crc32 = excluded.crc32",
            params![origin, crc as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let db = CrcDb::open_in_memory().unwrap();
        assert_eq!(db.get("devel/foo").unwrap(), None);
        db.set("devel/foo", 0xdead_beef).unwrap();
        assert_eq!(db.get("devel/foo").unwrap(), Some(0xdead_beef));
    }

    #[test]
    fn set_overwrites_prior_value() {
        let db = CrcDb::open_in_memory().unwrap();
        db.set("devel/foo", 1).unwrap();
        db.set("devel/foo", 2).unwrap();
        assert_eq!(db.get("devel/foo").unwrap(), Some(2));
    }
}
