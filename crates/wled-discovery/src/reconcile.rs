//! Merging device sightings into the store
//!
//! Every lookup-then-create/update runs under the store lock, so two
//! sightings of the same address can never both create a record. Refreshes
//! are queued after the lock is released.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wled_core::{
    normalize_address, DeviceId, DeviceRecord, DeviceStore, Info, NewDevice, StoreError,
};

use crate::events::DeviceEvent;
use crate::request::{DeviceRequest, RequestRegistry, SharedStore};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),
    #[error("Device not found: {0}")]
    NotFound(DeviceId),
    /// The in-memory change stands; only persisting it failed
    #[error("Failed to persist device store: {0}")]
    Store(#[from] StoreError),
}

/// What `reconcile` did with a sighting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "device", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created(DeviceRecord),
    Updated(DeviceRecord),
    Unchanged(DeviceRecord),
}

impl ReconcileOutcome {
    pub fn record(&self) -> &DeviceRecord {
        match self {
            ReconcileOutcome::Created(r)
            | ReconcileOutcome::Updated(r)
            | ReconcileOutcome::Unchanged(r) => r,
        }
    }
}

/// Result of one decision made under the store lock
struct Decision {
    outcome: ReconcileOutcome,
    refresh: bool,
    saved: Result<(), StoreError>,
}

pub struct Reconciler {
    store: SharedStore,
    requests: Arc<RequestRegistry>,
    events: broadcast::Sender<DeviceEvent>,
    /// A save failed and no save has succeeded since
    unsaved: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: SharedStore,
        requests: Arc<RequestRegistry>,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            store,
            requests,
            events,
            unsaved: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> &Arc<RequestRegistry> {
        &self.requests
    }

    /// Merge a confirmed sighting of a device at `address` named `name`
    ///
    /// Safe to call repeatedly: a known online device only has its name
    /// refreshed (unless pinned), a known offline device is marked online and
    /// refreshed, an unknown device is created online and refreshed. `info`
    /// is the identity seen by the verifier and is merged into the record.
    ///
    /// After a failed save every call writes the store again, so a retry
    /// keeps reporting `ReconcileError::Store` until a write succeeds.
    pub async fn reconcile(
        &self,
        address: &str,
        name: &str,
        info: Option<&Info>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let address = normalize_address(address);
        if address.is_empty() {
            return Err(ReconcileError::InvalidAddress(address));
        }

        let decision = {
            let mut store = self.store.lock().await;

            let (outcome, refresh) = match store.find(&address) {
                Some(existing) => {
                    let rename = !existing.is_custom_name && !name.is_empty() && existing.name != name;
                    let came_online = !existing.is_online;
                    let refresh = came_online && !existing.is_refreshing;
                    let seeded = info
                        .map(|seen| {
                            let mut merged = existing.info.clone().unwrap_or_default();
                            merged.merge(seen);
                            merged
                        })
                        .filter(|merged| existing.info.as_ref() != Some(merged));
                    let changed = rename || came_online || seeded.is_some();

                    let record = store
                        .update(&existing.id, &mut |d| {
                            if rename {
                                d.name = name.to_string();
                            }
                            if let Some(info) = &seeded {
                                d.info = Some(info.clone());
                            }
                            d.is_online = true;
                            d.touch();
                        })
                        .unwrap_or(existing);

                    if changed {
                        debug!(device = %record.id, address = %address, came_online, "Reconciled known device");
                        (ReconcileOutcome::Updated(record), refresh)
                    } else {
                        (ReconcileOutcome::Unchanged(record), false)
                    }
                }
                None => {
                    let record = store.create(NewDevice {
                        address: address.clone(),
                        name: name.to_string(),
                        is_online: true,
                        info: info.cloned(),
                        ..Default::default()
                    });
                    info!(device = %record.id, address = %address, name = %record.name, "Discovered new device");
                    (ReconcileOutcome::Created(record), true)
                }
            };

            let saved = match &outcome {
                ReconcileOutcome::Unchanged(_) if !self.unsaved.load(Ordering::SeqCst) => Ok(()),
                _ => self.persist(&mut *store),
            };
            Decision {
                outcome,
                refresh,
                saved,
            }
        };

        self.finish(decision).await
    }

    /// Add a device by hand, de-duplicated by address like `reconcile`
    ///
    /// A non-empty `name` pins the display name.
    pub async fn add_manual(
        &self,
        address: &str,
        name: Option<&str>,
        hidden: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let address = normalize_address(address);
        if address.is_empty() {
            return Err(ReconcileError::InvalidAddress(address));
        }
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let decision = {
            let mut store = self.store.lock().await;

            let outcome = match store.find(&address) {
                Some(existing) => {
                    let record = store
                        .update(&existing.id, &mut |d| {
                            if let Some(name) = name {
                                d.name = name.to_string();
                                d.is_custom_name = true;
                            }
                            d.is_hidden = hidden;
                        })
                        .unwrap_or(existing);
                    ReconcileOutcome::Updated(record)
                }
                None => {
                    let record = store.create(NewDevice {
                        address: address.clone(),
                        name: name.unwrap_or(address.as_str()).to_string(),
                        is_custom_name: name.is_some(),
                        is_hidden: hidden,
                        is_online: false,
                        info: None,
                    });
                    info!(device = %record.id, address = %address, "Added device manually");
                    ReconcileOutcome::Created(record)
                }
            };

            let refresh = !outcome.record().is_refreshing;
            Decision {
                outcome,
                refresh,
                saved: self.persist(&mut *store),
            }
        };

        self.finish(decision).await
    }

    /// Set the display name; an empty name unpins it
    pub async fn rename(&self, id: &DeviceId, name: &str) -> Result<DeviceRecord, ReconcileError> {
        let name = name.trim();
        self.edit(id, &mut |d| {
            if name.is_empty() {
                d.is_custom_name = false;
            } else {
                d.name = name.to_string();
                d.is_custom_name = true;
            }
        })
        .await
    }

    pub async fn set_hidden(&self, id: &DeviceId, hidden: bool) -> Result<DeviceRecord, ReconcileError> {
        self.edit(id, &mut |d| d.is_hidden = hidden).await
    }

    /// Delete a device and drop its request queue
    pub async fn remove(&self, id: &DeviceId) -> Result<(), ReconcileError> {
        let saved = {
            let mut store = self.store.lock().await;
            if !store.delete(id) {
                return Err(ReconcileError::NotFound(id.clone()));
            }
            self.persist(&mut *store)
        };

        self.requests.remove(id).await;
        info!(device = %id, "Removed device");
        let _ = self.events.send(DeviceEvent::Removed(id.clone()));

        saved.map_err(|e| {
            warn!(device = %id, error = %e, "Failed to persist device removal");
            ReconcileError::Store(e)
        })
    }

    async fn edit(
        &self,
        id: &DeviceId,
        apply: &mut (dyn FnMut(&mut DeviceRecord) + Send),
    ) -> Result<DeviceRecord, ReconcileError> {
        let (record, saved) = {
            let mut store = self.store.lock().await;
            let record = store
                .update(id, apply)
                .ok_or_else(|| ReconcileError::NotFound(id.clone()))?;
            (record, self.persist(&mut *store))
        };

        let _ = self.events.send(DeviceEvent::Updated(record.clone()));
        match saved {
            Ok(()) => Ok(record),
            Err(e) => {
                warn!(device = %id, error = %e, "Failed to persist device edit");
                Err(ReconcileError::Store(e))
            }
        }
    }

    /// Save the store, remembering whether unsaved changes remain
    fn persist(&self, store: &mut dyn DeviceStore) -> Result<(), StoreError> {
        let saved = store.save();
        self.unsaved.store(saved.is_err(), Ordering::SeqCst);
        saved
    }

    async fn finish(&self, decision: Decision) -> Result<ReconcileOutcome, ReconcileError> {
        let Decision {
            outcome,
            refresh,
            saved,
        } = decision;

        match &outcome {
            ReconcileOutcome::Created(record) => {
                let _ = self.events.send(DeviceEvent::Created(record.clone()));
            }
            ReconcileOutcome::Updated(record) => {
                let _ = self.events.send(DeviceEvent::Updated(record.clone()));
            }
            ReconcileOutcome::Unchanged(_) => {}
        }

        if refresh {
            // Fire and forget; the worker updates the store when it completes
            let _ = self
                .requests
                .enqueue(&outcome.record().id, DeviceRequest::Refresh)
                .await;
        }

        match saved {
            Ok(()) => Ok(outcome),
            Err(e) => {
                warn!(address = %outcome.record().address, error = %e, "Failed to persist device store");
                Err(ReconcileError::Store(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{empty_store, reconciler, FakeApi};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use std::sync::atomic::AtomicUsize;
    use wled_core::MemoryStore;

    /// Store whose first `failures` writes fail
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        saves: Arc<AtomicUsize>,
    }

    impl FlakyStore {
        fn shared(failures: usize) -> (SharedStore, Arc<AtomicUsize>) {
            let saves = Arc::new(AtomicUsize::new(0));
            let store: SharedStore = Arc::new(tokio::sync::Mutex::new(FlakyStore {
                inner: MemoryStore::new(),
                failures,
                saves: saves.clone(),
            }));
            (store, saves)
        }
    }

    impl DeviceStore for FlakyStore {
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
            let attempt = self.saves.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(StoreError::IoError(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            Ok(())
        }
    }

    async fn settle(api: &FakeApi, refreshes: usize) {
        for _ in 0..100 {
            if api.refresh_calls.load(Ordering::SeqCst) >= refreshes {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reconcile_creates_online_device_and_refreshes() {
        let api = Arc::new(FakeApi::new());
        let store = empty_store();
        let (reconciler, mut events) = reconciler(api.clone(), store.clone());

        let outcome = reconciler.reconcile("http://10.0.0.9/", "Porch", None).await.unwrap();
        let ReconcileOutcome::Created(record) = outcome else {
            panic!("expected a new record");
        };
        assert_eq!(record.address, "10.0.0.9");
        assert_eq!(record.name, "Porch");
        assert!(record.is_online);
        assert!(!record.is_hidden);
        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Created(_)));

        settle(&api, 1).await;
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let api = Arc::new(FakeApi::new());
        let store = empty_store();
        let (reconciler, _events) = reconciler(api, store.clone());

        reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();
        let second = reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();

        assert!(matches!(second, ReconcileOutcome::Unchanged(_)));
        assert_eq!(store.lock().await.list().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_creates_one_record() {
        let api = Arc::new(FakeApi::new());
        let store = empty_store();
        let (reconciler, _events) = reconciler(api, store.clone());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let reconciler = reconciler.clone();
            tasks.push(tokio::spawn(async move {
                reconciler.reconcile("10.0.0.9", "Porch", None).await
            }));
        }
        let mut created = 0;
        for task in tasks {
            if let ReconcileOutcome::Created(_) = task.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.lock().await.list().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_device_comes_back_online() {
        let api = Arc::new(FakeApi::new());
        let store = empty_store();
        let (reconciler, _events) = reconciler(api.clone(), store.clone());

        let id = reconciler
            .reconcile("10.0.0.9", "Porch", None)
            .await
            .unwrap()
            .record()
            .id
            .clone();
        // Queued behind the refresh from discovery, so both are done after this
        reconciler.requests().refresh(&id).await.wait().await.unwrap();
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 2);
        store
            .lock()
            .await
            .update(&id, &mut |d| d.is_online = false)
            .unwrap();

        let outcome = reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Updated(ref r) if r.is_online));
        settle(&api, 3).await;
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_name_is_pinned() {
        let api = Arc::new(FakeApi::new());
        let store = empty_store();
        let (reconciler, _events) = reconciler(api, store.clone());

        let record = reconciler
            .add_manual("10.0.0.9", Some("Kitchen"), false)
            .await
            .unwrap()
            .record()
            .clone();
        assert!(record.is_custom_name);

        reconciler.reconcile("10.0.0.9", "WLED-1234", None).await.unwrap();
        assert_eq!(store.lock().await.get(&record.id).unwrap().name, "Kitchen");

        reconciler.rename(&record.id, "").await.unwrap();
        reconciler.reconcile("10.0.0.9", "WLED-1234", None).await.unwrap();
        assert_eq!(store.lock().await.get(&record.id).unwrap().name, "WLED-1234");
    }

    #[tokio::test]
    async fn test_add_manual_rejects_empty_address() {
        let (reconciler, _events) = reconciler(Arc::new(FakeApi::new()), empty_store());
        assert!(matches!(
            reconciler.add_manual("http://", None, false).await,
            Err(ReconcileError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_add_manual_deduplicates() {
        let store = empty_store();
        let (reconciler, _events) = reconciler(Arc::new(FakeApi::new()), store.clone());

        reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();
        let outcome = reconciler
            .add_manual("HTTP://10.0.0.9", None, true)
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Updated(ref r) if r.is_hidden));
        assert_eq!(store.lock().await.list().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_missing_device() {
        let store = empty_store();
        let (reconciler, _events) = reconciler(Arc::new(FakeApi::new()), store.clone());

        let id = reconciler
            .reconcile("10.0.0.9", "Porch", None)
            .await
            .unwrap()
            .record()
            .id
            .clone();
        reconciler.remove(&id).await.unwrap();
        assert!(store.lock().await.list().is_empty());

        assert!(matches!(
            reconciler.remove(&id).await,
            Err(ReconcileError::NotFound(_))
        ));
        assert!(matches!(
            reconciler.set_hidden(&id, true).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_but_not_rolled_back() {
        // Held refreshes never reach their own save
        let api = Arc::new(FakeApi::new().gated());
        let (store, saves) = FlakyStore::shared(usize::MAX);
        let (reconciler, _events) = reconciler(api.clone(), store.clone());

        let err = reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(_)));
        assert!(store.lock().await.find("10.0.0.9").is_some());

        // A retry writes again and keeps failing while the store does
        let retry = reconciler.reconcile("10.0.0.9", "Porch", None).await;
        assert!(matches!(retry, Err(ReconcileError::Store(_))));
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(store.lock().await.list().len(), 1);

        settle(&api, 1).await;
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_persists_after_store_recovers() {
        let (store, saves) = FlakyStore::shared(1);
        let (reconciler, _events) = reconciler(Arc::new(FakeApi::new().gated()), store.clone());

        assert!(reconciler.reconcile("10.0.0.9", "Porch", None).await.is_err());

        let retry = reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();
        assert!(matches!(retry, ReconcileOutcome::Unchanged(_)));
        assert_eq!(saves.load(Ordering::SeqCst), 2);

        // Nothing left to write
        reconciler.reconcile("10.0.0.9", "Porch", None).await.unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_identity_is_recorded() {
        let store = empty_store();
        let (reconciler, _events) = reconciler(Arc::new(FakeApi::new()), store.clone());

        let seen = Info {
            name: Some("Porch".to_string()),
            version: Some("0.14.0".to_string()),
            brand: Some("WLED".to_string()),
            ..Default::default()
        };
        let created = reconciler
            .reconcile("10.0.0.9", "Porch", Some(&seen))
            .await
            .unwrap()
            .record()
            .clone();
        let info = created.info.clone().unwrap();
        assert_eq!(info.version.as_deref(), Some("0.14.0"));
        assert_eq!(info.brand.as_deref(), Some("WLED"));

        // Same identity again changes nothing
        let again = reconciler
            .reconcile("10.0.0.9", "Porch", Some(&seen))
            .await
            .unwrap();
        assert!(matches!(again, ReconcileOutcome::Unchanged(_)));

        let upgraded = Info {
            version: Some("0.15.0".to_string()),
            ..Default::default()
        };
        let outcome = reconciler
            .reconcile("10.0.0.9", "Porch", Some(&upgraded))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Updated(_)));

        let stored = store.lock().await.get(&created.id).unwrap().info.unwrap();
        assert_eq!(stored.version.as_deref(), Some("0.15.0"));
        assert_eq!(stored.brand.as_deref(), Some("WLED"));
    }
}
