//! Durable engine state.
//!
//! The engine persists three things: the FOTA/SOTA update plans (opaque,
//! forward-versioned JSON blobs mutated on every state transition), the
//! UID assigned to each instance identity, and the last desired instance
//! list. SQLite in WAL mode backs all of them; an in-memory constructor
//! serves the tests.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use convoy_cloudproto::{InstanceIdent, InstanceRequest};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("instance not exist")]
    InstanceNotFound,
}

/// Persisted UID assignment for one instance identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub ident: InstanceIdent,
    pub uid: u32,
}

/// Persistence for the update state machines and the UM coordinator.
///
/// The blobs are opaque to the store; their schema belongs to the matching
/// state machine and carries its own version field.
pub trait UpdatePlanStore: Send + Sync {
    fn set_firmware_state(&self, state: serde_json::Value) -> Result<(), StoreError>;
    fn firmware_state(&self) -> Result<Option<serde_json::Value>, StoreError>;

    fn set_software_state(&self, state: serde_json::Value) -> Result<(), StoreError>;
    fn software_state(&self) -> Result<Option<serde_json::Value>, StoreError>;

    fn set_um_state(&self, state: serde_json::Value) -> Result<(), StoreError>;
    fn um_state(&self) -> Result<Option<serde_json::Value>, StoreError>;
}

/// Persistence for instance UID assignments and the desired instance list.
pub trait InstanceStore: Send + Sync {
    fn add_instance(&self, record: InstanceRecord) -> Result<(), StoreError>;
    fn remove_instance(&self, ident: &InstanceIdent) -> Result<(), StoreError>;
    fn instance_uid(&self, ident: &InstanceIdent) -> Result<Option<u32>, StoreError>;
    fn instances(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    fn set_desired_instances(&self, instances: &[InstanceRequest]) -> Result<(), StoreError>;
    fn desired_instances(&self) -> Result<Vec<InstanceRequest>, StoreError>;
}

/// SQLite-backed store implementing both storage contracts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS update_state (
                name TEXT PRIMARY KEY,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                service_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                instance INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                PRIMARY KEY (service_id, subject_id, instance)
            );

            CREATE TABLE IF NOT EXISTS desired_instances (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                instances TEXT NOT NULL
            );
            "#,
        )?;

        debug!("state store schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, name: &str, state: serde_json::Value) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO update_state (name, state) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET state = excluded.state",
            params![name, state.to_string()],
        )?;

        Ok(())
    }

    fn state(&self, name: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT state FROM update_state WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

impl UpdatePlanStore for SqliteStore {
    fn set_firmware_state(&self, state: serde_json::Value) -> Result<(), StoreError> {
        self.set_state("fotaState", state)
    }

    fn firmware_state(&self) -> Result<Option<serde_json::Value>, StoreError> {
        self.state("fotaState")
    }

    fn set_software_state(&self, state: serde_json::Value) -> Result<(), StoreError> {
        self.set_state("sotaState", state)
    }

    fn software_state(&self) -> Result<Option<serde_json::Value>, StoreError> {
        self.state("sotaState")
    }

    fn set_um_state(&self, state: serde_json::Value) -> Result<(), StoreError> {
        self.set_state("umState", state)
    }

    fn um_state(&self) -> Result<Option<serde_json::Value>, StoreError> {
        self.state("umState")
    }
}

impl InstanceStore for SqliteStore {
    fn add_instance(&self, record: InstanceRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO instances (service_id, subject_id, instance, uid)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(service_id, subject_id, instance) DO UPDATE SET uid = excluded.uid",
            params![
                record.ident.service_id,
                record.ident.subject_id,
                record.ident.instance as i64,
                record.uid,
            ],
        )?;

        Ok(())
    }

    fn remove_instance(&self, ident: &InstanceIdent) -> Result<(), StoreError> {
        self.lock().execute(
            "DELETE FROM instances WHERE service_id = ?1 AND subject_id = ?2 AND instance = ?3",
            params![ident.service_id, ident.subject_id, ident.instance as i64],
        )?;

        Ok(())
    }

    fn instance_uid(&self, ident: &InstanceIdent) -> Result<Option<u32>, StoreError> {
        let uid: Option<u32> = self
            .lock()
            .query_row(
                "SELECT uid FROM instances
                 WHERE service_id = ?1 AND subject_id = ?2 AND instance = ?3",
                params![ident.service_id, ident.subject_id, ident.instance as i64],
                |row| row.get(0),
            )
            .optional()?;

        Ok(uid)
    }

    fn instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT service_id, subject_id, instance, uid FROM instances
             ORDER BY service_id, subject_id, instance",
        )?;

        let records = stmt
            .query_map([], |row| {
                let instance: i64 = row.get(2)?;

                Ok(InstanceRecord {
                    ident: InstanceIdent {
                        service_id: row.get(0)?,
                        subject_id: row.get(1)?,
                        instance: instance as u64,
                    },
                    uid: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn set_desired_instances(&self, instances: &[InstanceRequest]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(instances)?;

        self.lock().execute(
            "INSERT INTO desired_instances (id, instances) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET instances = excluded.instances",
            params![raw],
        )?;

        Ok(())
    }

    fn desired_instances(&self) -> Result<Vec<InstanceRequest>, StoreError> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT instances FROM desired_instances WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }
}
