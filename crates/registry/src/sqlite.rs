//! SQLite registry backend
//!
//! Resources live in a single `drones` table keyed by id. Reservation is a
//! conditional `UPDATE ... WHERE status = 'available'`, so the database decides
//! the winner of concurrent reservations.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is not `Sync`; the connection sits behind a mutex and
//! every operation is serialized through it.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use firewatch_core::{Coordinate, ResourceRecord, ResourceStatus};

use crate::{RegistryError, ResourceRegistry};

const SELECT_COLUMNS: &str = "SELECT id, latitude, longitude, status FROM drones";

/// Registry stored in a SQLite database
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) a registry database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        // Enable WAL mode for durability
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        info!(path = %path.as_ref().display(), "SQLite registry opened");
        Self::init(conn)
    }

    /// Open a registry that lives only as long as this value
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS drones (
                id TEXT PRIMARY KEY NOT NULL,
                latitude INTEGER NOT NULL,
                longitude INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_drones_status ON drones(status)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|e| RegistryError::Unavailable(format!("Lock error: {}", e)))
    }

    fn query(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ResourceRecord>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn expect_one(id: &str, changed: usize) -> Result<(), RegistryError> {
        if changed == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Row as stored, before the status column is validated
struct RawRecord {
    id: String,
    latitude: i32,
    longitude: i32,
    status: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            status: row.get(3)?,
        })
    }

    fn into_record(self) -> Result<ResourceRecord, RegistryError> {
        let status = ResourceStatus::parse(&self.status).ok_or_else(|| RegistryError::Corrupt {
            id: self.id.clone(),
            reason: format!("unknown status '{}'", self.status),
        })?;
        Ok(ResourceRecord::new(
            self.id,
            Coordinate::new(self.latitude, self.longitude),
            status,
        ))
    }
}

impl ResourceRegistry for SqliteRegistry {
    fn find_available(&self) -> Result<Vec<ResourceRecord>, RegistryError> {
        self.query(
            &format!("{} WHERE status = ?1 ORDER BY id", SELECT_COLUMNS),
            &[&ResourceStatus::Available.as_str()],
        )
    }

    fn find_by_id(&self, id: &str) -> Result<ResourceRecord, RegistryError> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                RawRecord::from_row,
            )
            .optional()?
        };

        raw.ok_or_else(|| RegistryError::NotFound(id.to_string()))?
            .into_record()
    }

    fn find_all(&self) -> Result<Vec<ResourceRecord>, RegistryError> {
        self.query(&format!("{} ORDER BY id", SELECT_COLUMNS), &[])
    }

    fn update_status(&self, id: &str, status: ResourceStatus) -> Result<(), RegistryError> {
        let changed = self.lock()?.execute(
            "UPDATE drones SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Self::expect_one(id, changed)
    }

    fn update_location_and_status(
        &self,
        id: &str,
        location: Coordinate,
        status: ResourceStatus,
    ) -> Result<(), RegistryError> {
        let changed = self.lock()?.execute(
            "UPDATE drones SET latitude = ?2, longitude = ?3, status = ?4 WHERE id = ?1",
            params![id, location.latitude, location.longitude, status.as_str()],
        )?;
        Self::expect_one(id, changed)
    }

    fn try_reserve(&self, id: &str) -> Result<bool, RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE drones SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![
                id,
                ResourceStatus::Busy.as_str(),
                ResourceStatus::Available.as_str()
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM drones WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    fn upsert(&self, record: ResourceRecord) -> Result<(), RegistryError> {
        self.lock()?.execute(
            "INSERT INTO drones (id, latitude, longitude, status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                status = excluded.status",
            params![
                record.id,
                record.location.latitude,
                record.location.longitude,
                record.status.as_str()
            ],
        )?;
        Ok(())
    }

    fn insert_if_absent(&self, record: ResourceRecord) -> Result<bool, RegistryError> {
        let changed = self.lock()?.execute(
            "INSERT INTO drones (id, latitude, longitude, status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                record.id,
                record.location.latitude,
                record.location.longitude,
                record.status.as_str()
            ],
        )?;
        Ok(changed == 1)
    }
}
