use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::PipelineResult;
use crate::record::Coordinate;

/// Namespace prefix on every stored key, so an unrelated tool sharing the
/// same database file cannot collide with geocode entries.
const KEY_PREFIX: &str = "geocode:";

#[derive(Debug, Serialize, Deserialize)]
struct CachedPayload {
    lat: f64,
    lon: f64,
}

/// Durable key → coordinate store. Entries are authoritative while valid:
/// within the TTL window when one is configured, for the life of the store
/// otherwise. Read/write failures degrade to cache misses; caching is a
/// performance optimization, never a correctness requirement.
pub struct CoordinateCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    ttl: Option<Duration>,
}

impl CoordinateCache {
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        file_name: &str,
        ttl: Option<Duration>,
    ) -> PipelineResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(file_name);
        let connection = Connection::open(&db_path)?;
        run_migrations(&connection)?;
        info!(
            target: "coordinate_cache",
            path = %db_path.display(),
            ttl_secs = ttl.map(|t| t.as_secs()),
            "coordinate cache opened"
        );
        Ok(Self {
            conn: Mutex::new(connection),
            path: Some(db_path),
            ttl,
        })
    }

    pub fn in_memory(ttl: Option<Duration>) -> PipelineResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            conn: Mutex::new(connection),
            path: None,
            ttl,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Never errors; absence is a normal outcome. Expired entries read as a
    /// miss and stay in place until the next successful `set` sweeps them.
    pub fn get(&self, key: &str) -> Option<Coordinate> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = match conn
            .query_row(
                "SELECT payload, created_at FROM geocode_cache WHERE key = ?1",
                [namespaced(key)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        {
            Ok(row) => row,
            Err(err) => {
                warn!(target: "coordinate_cache", key, error = %err, "cache read failed");
                return None;
            }
        };

        let (payload, created_at) = row?;
        if self.is_expired(created_at, Utc::now().timestamp()) {
            return None;
        }

        match serde_json::from_str::<CachedPayload>(&payload) {
            Ok(cached) => Coordinate::validated(cached.lat, cached.lon),
            Err(err) => {
                warn!(target: "coordinate_cache", key, error = %err, "cache entry unreadable");
                None
            }
        }
    }

    /// Overwrites any prior entry for the key. Failures are logged and
    /// swallowed so a full disk never aborts resolution.
    pub fn set(&self, key: &str, coordinate: Coordinate) {
        self.set_at(key, coordinate, Utc::now().timestamp());
    }

    fn set_at(&self, key: &str, coordinate: Coordinate, created_at: i64) {
        let payload = CachedPayload {
            lat: coordinate.lat,
            lon: coordinate.lon,
        };
        let serialized = match serde_json::to_string(&payload) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(target: "coordinate_cache", key, error = %err, "cache entry unserializable");
                return;
            }
        };

        let conn = self.conn.lock();
        let write = conn.execute(
            "INSERT INTO geocode_cache (key, payload, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at",
            (namespaced(key), serialized, created_at),
        );
        if let Err(err) = write {
            warn!(target: "coordinate_cache", key, error = %err, "cache write failed");
            return;
        }

        if let Some(ttl) = self.ttl {
            let cutoff = created_at - ttl.as_secs() as i64;
            if let Err(err) = conn.execute(
                "DELETE FROM geocode_cache WHERE key LIKE ?1 AND created_at < ?2",
                (format!("{KEY_PREFIX}%"), cutoff),
            ) {
                warn!(target: "coordinate_cache", error = %err, "expired-entry sweep failed");
            }
        }
    }

    /// Removes every geocode entry; used at pipeline start when a forced
    /// fresh resolution is requested.
    pub fn clear(&self) -> PipelineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM geocode_cache WHERE key LIKE ?1",
            [format!("{KEY_PREFIX}%")],
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM geocode_cache WHERE key LIKE ?1",
            [format!("{KEY_PREFIX}%")],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count as usize)
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, created_at: i64, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => now - created_at > ttl.as_secs() as i64,
            None => false,
        }
    }
}

fn namespaced(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn run_migrations(connection: &Connection) -> PipelineResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS geocode_cache (
            key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
