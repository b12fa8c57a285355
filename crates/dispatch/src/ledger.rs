//! Registration Ledger - current record of every emergency
//!
//! Consumes the registration topic and keeps one row per assignment in SQLite.
//! An `En curso` milestone inserts a row; an `Extinguido` milestone moves the
//! active row with that name to `Extinguido`.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is not `Sync`; the connection sits behind a mutex.

use bytes::Bytes;
use firewatch_core::{FireStatus, RegistrationEvent};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status stored for an emergency that is still being worked
pub const STATUS_ACTIVE: &str = "En curso";

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection lock poisoned
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One stored emergency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyEntry {
    /// Numeric id assigned at dispatch
    pub emergency_id: u64,
    /// Correlation key
    pub name: String,
    /// Position, first axis
    pub latitude: i32,
    /// Position, second axis
    pub longitude: i32,
    /// Fire size
    pub magnitude: u32,
    /// Assigned resource
    pub resource_id: String,
    /// `En curso` or `Extinguido`
    pub status: String,
}

impl EmergencyEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            emergency_id: row.get::<_, i64>(0)? as u64,
            name: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            magnitude: row.get(4)?,
            resource_id: row.get(5)?,
            status: row.get(6)?,
        })
    }

    /// Check if the emergency is still being worked
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

const SELECT_COLUMNS: &str =
    "SELECT emergency_id, name, latitude, longitude, magnitude, resource_id, status FROM emergencies";

/// SQLite-backed emergency ledger
pub struct EmergencyLedger {
    conn: Mutex<Connection>,
}

impl EmergencyLedger {
    /// Open (or create) a ledger database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        // Enable WAL mode for durability
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        info!(path = %path.as_ref().display(), "Emergency ledger opened");
        Self::init(conn)
    }

    /// Open a ledger that lives only as long as this value
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS emergencies (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                emergency_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                latitude INTEGER NOT NULL,
                longitude INTEGER NOT NULL,
                magnitude INTEGER NOT NULL,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_emergencies_name_status ON emergencies(name, status)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Unavailable(format!("Lock error: {}", e)))
    }

    /// Apply a milestone.
    ///
    /// Returns `false` for an `Extinguido` with no active record of that name.
    pub fn record(&self, event: &RegistrationEvent) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        match event {
            RegistrationEvent::Assigned {
                emergency_id,
                name,
                latitude,
                longitude,
                magnitude,
                resource_id,
            } => {
                conn.execute(
                    "INSERT INTO emergencies
                        (emergency_id, name, latitude, longitude, magnitude, resource_id, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        *emergency_id as i64,
                        name,
                        latitude,
                        longitude,
                        magnitude,
                        resource_id,
                        STATUS_ACTIVE
                    ],
                )?;
                Ok(true)
            }
            RegistrationEvent::Extinguished { name, .. } => {
                let changed = conn.execute(
                    "UPDATE emergencies SET status = ?2 WHERE name = ?1 AND status = ?3",
                    params![name, FireStatus::Extinguished.as_str(), STATUS_ACTIVE],
                )?;
                Ok(changed > 0)
            }
        }
    }

    /// Every record with this name, oldest first
    pub fn find_by_name(&self, name: &str) -> Result<Vec<EmergencyEntry>, LedgerError> {
        self.query(
            &format!("{} WHERE name = ?1 ORDER BY row_id", SELECT_COLUMNS),
            &[&name],
        )
    }

    /// Records still `En curso`
    pub fn active(&self) -> Result<Vec<EmergencyEntry>, LedgerError> {
        self.query(
            &format!("{} WHERE status = ?1 ORDER BY row_id", SELECT_COLUMNS),
            &[&STATUS_ACTIVE],
        )
    }

    /// All records, oldest first
    pub fn all(&self) -> Result<Vec<EmergencyEntry>, LedgerError> {
        self.query(&format!("{} ORDER BY row_id", SELECT_COLUMNS), &[])
    }

    fn query(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<EmergencyEntry>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, EmergencyEntry::from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// Feeds registration messages into an [`EmergencyLedger`]
pub struct LedgerConsumer {
    ledger: Arc<EmergencyLedger>,
    rx: broadcast::Receiver<Bytes>,
}

impl LedgerConsumer {
    /// Create a consumer over an existing registration subscription
    pub fn new(ledger: Arc<EmergencyLedger>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self { ledger, rx }
    }

    /// Decode and apply one message
    pub fn apply(&self, payload: &[u8]) -> Result<bool, LedgerError> {
        let event: RegistrationEvent = serde_json::from_slice(payload)?;
        let applied = self.ledger.record(&event)?;
        match &event {
            RegistrationEvent::Assigned { name, .. } => {
                info!(emergency = %name, "Emergency registered")
            }
            RegistrationEvent::Extinguished { name, .. } if applied => {
                info!(emergency = %name, "Emergency marked extinguished")
            }
            RegistrationEvent::Extinguished { name, .. } => {
                warn!(emergency = %name, "No active emergency to mark extinguished")
            }
        }
        Ok(applied)
    }

    /// Consume until shutdown or until the channel closes.
    ///
    /// Returns the number of messages applied.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        let mut applied = 0;
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Ok(payload) => payload,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Ledger lagged, registration events lost");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            match self.apply(&payload) {
                Ok(_) => applied += 1,
                Err(e) => warn!("Skipping registration message: {}", e),
            }
        }
        debug!(applied, "Ledger consumer stopped");
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firewatch_broadcast::{publish_json, BroadcastChannel, LocalBroadcast};
    use firewatch_core::{Coordinate, EmergencyRequest, REGISTRATION_TOPIC};

    fn assigned(id: u64, name: &str) -> RegistrationEvent {
        let request = EmergencyRequest::new(name, Coordinate::new(4, 5), 3);
        RegistrationEvent::assigned(id, &request, "dron01")
    }

    #[test]
    fn test_assigned_then_extinguished() {
        let ledger = EmergencyLedger::open_in_memory().unwrap();

        assert!(ledger.record(&assigned(1_700_000_000_000_000_000, "fire1")).unwrap());
        let active = ledger.active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].emergency_id, 1_700_000_000_000_000_000);
        assert_eq!(active[0].latitude, 4);
        assert!(active[0].is_active());

        assert!(ledger
            .record(&RegistrationEvent::extinguished("fire1", "dron01"))
            .unwrap());
        let entries = ledger.find_by_name("fire1").unwrap();
        assert_eq!(entries[0].status, "Extinguido");
        assert!(ledger.active().unwrap().is_empty());
    }

    #[test]
    fn test_extinguished_without_active_record() {
        let ledger = EmergencyLedger::open_in_memory().unwrap();

        let updated = ledger
            .record(&RegistrationEvent::extinguished("ghost", "dron01"))
            .unwrap();
        assert!(!updated);
        assert!(ledger.all().unwrap().is_empty());
    }

    #[test]
    fn test_repeated_name_keeps_history() {
        let ledger = EmergencyLedger::open_in_memory().unwrap();

        ledger.record(&assigned(1, "fire1")).unwrap();
        ledger
            .record(&RegistrationEvent::extinguished("fire1", "dron01"))
            .unwrap();
        ledger.record(&assigned(2, "fire1")).unwrap();

        let entries = ledger.find_by_name("fire1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "Extinguido");
        assert_eq!(entries[1].status, STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn test_consumer_applies_and_skips_malformed() {
        let ledger = Arc::new(EmergencyLedger::open_in_memory().unwrap());
        let channel = LocalBroadcast::new(16);
        let consumer = LedgerConsumer::new(
            ledger.clone(),
            channel.subscribe(REGISTRATION_TOPIC).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        publish_json(&channel, REGISTRATION_TOPIC, &assigned(7, "fire1")).unwrap();
        channel
            .publish(REGISTRATION_TOPIC, Bytes::from_static(b"garbage"))
            .unwrap();
        publish_json(
            &channel,
            REGISTRATION_TOPIC,
            &RegistrationEvent::extinguished("fire1", "dron01"),
        )
        .unwrap();
        channel.close();

        let applied = task.await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(ledger.find_by_name("fire1").unwrap()[0].status, "Extinguido");
    }
}
