use crate::config::is_plain_identifier;
use crate::error::PersistenceError;
use crate::models::TelemetryReading;
use log::{error, info};
use rusqlite::{params, Connection};
use std::time::Duration;

/// The store boundary: one parameterized insert per reading.
///
/// Implementations are called from the blocking pool and may block.
pub trait TelemetryStore: Send + Sync + 'static {
    fn insert(&self, vehicle_id: &str, reading: &TelemetryReading) -> Result<(), PersistenceError>;
}

/// SQLite-backed store. Every insert opens its own connection and drops it
/// on return, whatever the outcome.
pub struct SqliteStore {
    db_path: String,
    table: String,
    insert_sql: String,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(db_path: &str, table: &str, busy_timeout: Duration) -> Result<Self, PersistenceError> {
        if !is_plain_identifier(table) {
            return Err(PersistenceError::InvalidTable(table.to_string()));
        }

        Ok(Self {
            db_path: db_path.to_string(),
            table: table.to_string(),
            insert_sql: format!(
                "INSERT INTO {}(VIN, Battery, Kilometers, Latitude, Longitude) VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ),
            busy_timeout,
        })
    }

    fn open(&self) -> Result<Connection, PersistenceError> {
        let conn = Connection::open(&self.db_path).map_err(PersistenceError::Open)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(PersistenceError::Open)?;
        Ok(conn)
    }

    /// Creates the telemetry table when it does not exist yet.
    pub fn ensure_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.open()?;

        info!("Ensuring telemetry table '{}' exists...", self.table);

        match conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                VIN TEXT NOT NULL,
                Battery INTEGER NOT NULL,
                Kilometers INTEGER NOT NULL,
                Latitude REAL NOT NULL,
                Longitude REAL NOT NULL,
                received_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
            self.table
        )) {
            Ok(_) => {
                info!("Telemetry table '{}' ready.", self.table);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create telemetry table '{}': {:?}", self.table, e);
                Err(PersistenceError::Schema(e))
            }
        }
    }
}

impl TelemetryStore for SqliteStore {
    fn insert(&self, vehicle_id: &str, reading: &TelemetryReading) -> Result<(), PersistenceError> {
        let conn = self.open()?;
        conn.execute(
            &self.insert_sql,
            params![
                vehicle_id,
                reading.battery(),
                reading.kilometers(),
                reading.latitude(),
                reading.longitude()
            ],
        )
        .map_err(PersistenceError::Insert)?;
        Ok(())
    }
}
