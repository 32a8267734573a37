//! Device store
//!
//! The store is the only long-lived shared state in the system. Callers
//! treat it as plain CRUD; serialization of concurrent access is the
//! caller's job (the reconciler and request manager hold it behind a lock).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::device::{normalize_address, DeviceId, DeviceRecord, NewDevice};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Device not found: {0}")]
    NotFound(DeviceId),
}

/// CRUD collaborator holding device records
pub trait DeviceStore: Send {
    /// Look up a device by address (normalized before comparison)
    fn find(&self, address: &str) -> Option<DeviceRecord>;

    fn get(&self, id: &DeviceId) -> Option<DeviceRecord>;

    fn list(&self) -> Vec<DeviceRecord>;

    fn create(&mut self, fields: NewDevice) -> DeviceRecord;

    /// Mutate a record in place, returning the updated copy
    fn update(
        &mut self,
        id: &DeviceId,
        apply: &mut dyn FnMut(&mut DeviceRecord),
    ) -> Option<DeviceRecord>;

    fn delete(&mut self, id: &DeviceId) -> bool;

    /// Persist pending changes
    fn save(&mut self) -> Result<(), StoreError>;
}

/// Volatile store; `save` is a no-op
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    devices: BTreeMap<DeviceId, DeviceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            devices: records.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceStore for MemoryStore {
    fn find(&self, address: &str) -> Option<DeviceRecord> {
        let wanted = normalize_address(address);
        self.devices
            .values()
            .find(|d| normalize_address(&d.address) == wanted)
            .cloned()
    }

    fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.get(id).cloned()
    }

    fn list(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    fn create(&mut self, fields: NewDevice) -> DeviceRecord {
        let record = fields.into_record();
        debug!(device = %record.id, address = %record.address, "Created device record");
        self.devices.insert(record.id.clone(), record.clone());
        record
    }

    fn update(
        &mut self,
        id: &DeviceId,
        apply: &mut dyn FnMut(&mut DeviceRecord),
    ) -> Option<DeviceRecord> {
        let record = self.devices.get_mut(id)?;
        apply(record);
        Some(record.clone())
    }

    fn delete(&mut self, id: &DeviceId) -> bool {
        self.devices.remove(id).is_some()
    }

    fn save(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store persisted as a JSON array of records
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonStore {
    /// Load the store at `path`, or start empty if the file doesn't exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let mut records: Vec<DeviceRecord> = serde_json::from_str(&content)?;
            // A crash mid-refresh must not leave devices stuck refreshing
            for record in &mut records {
                record.is_refreshing = false;
            }
            info!(path = %path.display(), count = records.len(), "Loaded device store");
            MemoryStore::from_records(records)
        } else {
            info!(path = %path.display(), "Device store not found, starting empty");
            MemoryStore::new()
        };
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonStore {
    fn find(&self, address: &str) -> Option<DeviceRecord> {
        self.inner.find(address)
    }

    fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.inner.get(id)
    }

    fn list(&self) -> Vec<DeviceRecord> {
        self.inner.list()
    }

    fn create(&mut self, fields: NewDevice) -> DeviceRecord {
        self.inner.create(fields)
    }

    fn update(
        &mut self,
        id: &DeviceId,
        apply: &mut dyn FnMut(&mut DeviceRecord),
    ) -> Option<DeviceRecord> {
        self.inner.update(id, apply)
    }

    fn delete(&mut self, id: &DeviceId) -> bool {
        self.inner.delete(id)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&self.inner.list())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, content)?;
        debug!(path = %self.path.display(), "Saved device store");
        Ok(())
    }
}
