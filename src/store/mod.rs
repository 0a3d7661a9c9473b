//! Durable register cache.
//!
//! The cache remembers the last known value of every device register,
//! keyed by `(device name, register address)`, and survives process
//! restarts. The control server writes it from register responses; device
//! models read it instead of round-tripping to the hardware; the
//! periodic poll keeps freshness bounded.
//!
//! Backed by SQLite: one `namespaces` row per device created eagerly at
//! startup and a `registers` table with a composite primary key. Every
//! update is a single atomic upsert; bulk reads are one query and thus a
//! consistent snapshot.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StoreError;
use crate::protocol::Reg;
use crate::types::DeviceName;

/// Durable `(device, addr) → value` register cache.
///
/// Shared across the control server (writes) and device models (reads)
/// behind an `Arc`; writes serialize on the connection lock and stay
/// short.
pub struct RegStore {
    db: Mutex<Connection>,
}

impl RegStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                device TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS registers (
                device TEXT NOT NULL,
                addr   INTEGER NOT NULL,
                value  INTEGER NOT NULL,
                PRIMARY KEY (device, addr)
            );
            "#,
        )?;
        Ok(())
    }

    /// Create the namespace for a device. Idempotent; called once per
    /// configured device at startup.
    pub fn create_namespace(&self, device: &DeviceName) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO namespaces (device) VALUES (?1)",
            params![device.as_str()],
        )?;
        Ok(())
    }

    fn check_namespace(db: &Connection, device: &DeviceName) -> Result<(), StoreError> {
        let exists: Option<String> = db
            .query_row(
                "SELECT device FROM namespaces WHERE device = ?1",
                params![device.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NamespaceMissing(device.to_string()));
        }
        Ok(())
    }

    /// Upsert one register value. A write of the stored value is a no-op.
    pub fn set_reg(&self, device: &DeviceName, reg: Reg) -> Result<(), StoreError> {
        debug!(device = %device, addr = reg.addr, value = reg.value, "set register");
        let db = self.db.lock().unwrap();
        Self::check_namespace(&db, device)?;
        db.execute(
            "INSERT INTO registers (device, addr, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (device, addr) DO UPDATE SET value = excluded.value
             WHERE value <> excluded.value",
            params![device.as_str(), reg.addr, reg.value],
        )?;
        Ok(())
    }

    /// Last stored value of one register, or `None` if never seen.
    pub fn get_reg(&self, device: &DeviceName, addr: u16) -> Result<Option<Reg>, StoreError> {
        let db = self.db.lock().unwrap();
        Self::check_namespace(&db, device)?;
        let value: Option<u16> = db
            .query_row(
                "SELECT value FROM registers WHERE device = ?1 AND addr = ?2",
                params![device.as_str(), addr],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|value| Reg { addr, value }))
    }

    /// All stored registers of a device, sorted by address.
    pub fn get_all(&self, device: &DeviceName) -> Result<Vec<Reg>, StoreError> {
        let db = self.db.lock().unwrap();
        Self::check_namespace(&db, device)?;
        let mut stmt =
            db.prepare("SELECT addr, value FROM registers WHERE device = ?1 ORDER BY addr")?;
        let regs = stmt
            .query_map(params![device.as_str()], |row| {
                Ok(Reg {
                    addr: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(device: &DeviceName) -> RegStore {
        let store = RegStore::in_memory().unwrap();
        store.create_namespace(device).unwrap();
        store
    }

    #[test]
    fn set_then_get() {
        let dev = DeviceName::from("adc-1");
        let store = store_with(&dev);

        store.set_reg(&dev, Reg::new(0x40, 0x8000)).unwrap();
        assert_eq!(
            store.get_reg(&dev, 0x40).unwrap(),
            Some(Reg::new(0x40, 0x8000))
        );

        // Upsert replaces.
        store.set_reg(&dev, Reg::new(0x40, 0x0001)).unwrap();
        assert_eq!(
            store.get_reg(&dev, 0x40).unwrap(),
            Some(Reg::new(0x40, 0x0001))
        );
    }

    #[test]
    fn missing_key_is_absent_not_error() {
        let dev = DeviceName::from("adc-1");
        let store = store_with(&dev);
        assert_eq!(store.get_reg(&dev, 0x99).unwrap(), None);
    }

    #[test]
    fn missing_namespace_is_fatal() {
        let dev = DeviceName::from("adc-1");
        let store = store_with(&dev);
        let ghost = DeviceName::from("ghost");

        assert!(matches!(
            store.get_reg(&ghost, 0x40).unwrap_err(),
            StoreError::NamespaceMissing(_)
        ));
        assert!(matches!(
            store.set_reg(&ghost, Reg::new(0x40, 0)).unwrap_err(),
            StoreError::NamespaceMissing(_)
        ));
    }

    #[test]
    fn namespace_creation_is_idempotent() {
        let dev = DeviceName::from("adc-1");
        let store = store_with(&dev);
        store.create_namespace(&dev).unwrap();
        store.set_reg(&dev, Reg::new(1, 2)).unwrap();
        assert_eq!(store.get_reg(&dev, 1).unwrap(), Some(Reg::new(1, 2)));
    }

    #[test]
    fn get_all_is_addr_sorted() {
        let dev = DeviceName::from("adc-1");
        let store = store_with(&dev);
        for (addr, value) in [(0x104u16, 1u16), (0x40, 2), (0x220, 3), (0x100, 4)] {
            store.set_reg(&dev, Reg::new(addr, value)).unwrap();
        }
        let regs = store.get_all(&dev).unwrap();
        let addrs: Vec<u16> = regs.iter().map(|r| r.addr).collect();
        assert_eq!(addrs, vec![0x40, 0x100, 0x104, 0x220]);
    }

    #[test]
    fn namespaces_are_isolated() {
        let a = DeviceName::from("adc-1");
        let b = DeviceName::from("adc-2");
        let store = store_with(&a);
        store.create_namespace(&b).unwrap();

        store.set_reg(&a, Reg::new(0x40, 0xaaaa)).unwrap();
        store.set_reg(&b, Reg::new(0x40, 0xbbbb)).unwrap();

        assert_eq!(store.get_reg(&a, 0x40).unwrap().unwrap().value, 0xaaaa);
        assert_eq!(store.get_reg(&b, 0x40).unwrap().unwrap().value, 0xbbbb);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registers.db");
        let dev = DeviceName::from("adc-1");

        {
            let store = RegStore::open(&path).unwrap();
            store.create_namespace(&dev).unwrap();
            store.set_reg(&dev, Reg::new(0x40, 0x8000)).unwrap();
        }

        let store = RegStore::open(&path).unwrap();
        assert_eq!(
            store.get_reg(&dev, 0x40).unwrap(),
            Some(Reg::new(0x40, 0x8000))
        );
    }
}
