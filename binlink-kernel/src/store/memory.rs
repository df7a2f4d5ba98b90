/**
 * MEMORY STORE - Persistance embarquée des bins et mesures
 *
 * FONCTIONNEMENT :
 * - Tout est gardé en mémoire derrière un mutex (opérations atomiques)
 * - Snapshot JSON optionnel : chargé au démarrage, écrit par `flush`
 *   (périodiquement depuis le kernel et à l'arrêt)
 */

use super::{BinStore, StoreError};
use crate::models::{Bin, BinId, DeviceId, Measurement, MeasurementKind, NewBin};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_bin_id: BinId,
    bins: BTreeMap<BinId, Bin>,
    measurements: Vec<Measurement>,
}

pub struct MemoryStore {
    data: Shared<Snapshot>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: new_state(Snapshot { next_bin_id: 1, ..Default::default() }),
            snapshot_path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Store adossé à un fichier JSON, chargé s'il existe déjà
    pub async fn with_snapshot<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let mut store = Self::new();
        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            if !content.trim().is_empty() {
                let mut snapshot: Snapshot = serde_json::from_str(&content)?;
                let max_id = snapshot.bins.keys().max().copied().unwrap_or(0);
                snapshot.next_bin_id = snapshot.next_bin_id.max(max_id + 1);
                info!(
                    path = %path.display(),
                    bins = snapshot.bins.len(),
                    measurements = snapshot.measurements.len(),
                    "loaded store snapshot"
                );
                store.data = new_state(snapshot);
            }
        } else {
            info!(path = %path.display(), "no existing snapshot, starting fresh");
        }
        store.snapshot_path = Some(path);
        Ok(store)
    }

    /// Écrit le snapshot si des modifications sont en attente
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(path) = &self.snapshot_path else { return Ok(false) };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let json = {
            let data = self.data.lock();
            serde_json::to_string_pretty(&*data)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if let Err(e) = tokio::fs::write(path, json).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        debug!(path = %path.display(), "store snapshot written");
        Ok(true)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BinStore for MemoryStore {
    async fn find_bin(&self, id: BinId) -> Result<Option<Bin>, StoreError> {
        Ok(self.data.lock().bins.get(&id).cloned())
    }

    async fn find_all_bins(&self) -> Result<Vec<Bin>, StoreError> {
        Ok(self.data.lock().bins.values().cloned().collect())
    }

    async fn insert_bin(&self, bin: NewBin) -> Result<Bin, StoreError> {
        let bin = {
            let mut data = self.data.lock();
            let id = data.next_bin_id;
            data.next_bin_id += 1;
            let bin = Bin {
                id,
                location: bin.location,
                capacity: bin.capacity,
                fill_threshold: bin.fill_threshold,
                device_id: bin.device_id,
                provenance: bin.provenance,
                emptied_last: None,
                pick_up_time: None,
            };
            data.bins.insert(id, bin.clone());
            bin
        };
        self.touch();
        Ok(bin)
    }

    async fn save_bin(&self, bin: &Bin) -> Result<(), StoreError> {
        {
            let mut data = self.data.lock();
            let slot = data.bins.get_mut(&bin.id).ok_or(StoreError::NotFound(bin.id))?;
            *slot = bin.clone();
        }
        self.touch();
        Ok(())
    }

    async fn delete_bin(&self, id: BinId) -> Result<bool, StoreError> {
        let removed = {
            let mut data = self.data.lock();
            let removed = data.bins.remove(&id).is_some();
            if removed {
                data.measurements.retain(|m| m.bin_id != id);
            }
            removed
        };
        if removed {
            self.touch();
        }
        Ok(removed)
    }

    async fn append_measurement(&self, measurement: Measurement) -> Result<(), StoreError> {
        {
            let mut data = self.data.lock();
            if !data.bins.contains_key(&measurement.bin_id) {
                return Err(StoreError::NotFound(measurement.bin_id));
            }
            data.measurements.push(measurement);
        }
        self.touch();
        Ok(())
    }

    async fn recent_measurements(&self, bin: BinId, kind: MeasurementKind) -> Result<Vec<Measurement>, StoreError> {
        let mut series: Vec<Measurement> = self
            .data
            .lock()
            .measurements
            .iter()
            .filter(|m| m.bin_id == bin && m.kind == kind)
            .cloned()
            .collect();
        // à timestamp égal, la dernière insérée reste en tête
        series.reverse();
        series.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(series)
    }

    async fn find_bin_by_device(&self, device: DeviceId) -> Result<Option<Bin>, StoreError> {
        Ok(self.data.lock().bins.values().find(|b| b.device_id == Some(device)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Location, Provenance};
    use time::{Duration, OffsetDateTime};

    fn new_bin(device: Option<u32>) -> NewBin {
        NewBin {
            location: Location { longitude: 2.35, latitude: 48.85 },
            capacity: 240.0,
            fill_threshold: 80.0,
            device_id: device.map(DeviceId),
            provenance: Provenance::Device,
        }
    }

    fn measurement(bin_id: BinId, value: f64, age_secs: i64) -> Measurement {
        Measurement {
            bin_id,
            kind: MeasurementKind::Humidity,
            value,
            timestamp: OffsetDateTime::now_utc() - Duration::seconds(age_secs),
            provenance: Provenance::Device,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.insert_bin(new_bin(Some(1))).await.unwrap();
        let b = store.insert_bin(new_bin(None)).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.find_bin_by_device(DeviceId(1)).await.unwrap().unwrap().id, 1);
        assert!(store.find_bin_by_device(DeviceId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_measurements_newest_first() {
        let store = MemoryStore::new();
        let bin = store.insert_bin(new_bin(None)).await.unwrap();
        store.append_measurement(measurement(bin.id, 10.0, 300)).await.unwrap();
        store.append_measurement(measurement(bin.id, 30.0, 10)).await.unwrap();
        store.append_measurement(measurement(bin.id, 20.0, 100)).await.unwrap();

        let values: Vec<f64> = store
            .recent_measurements(bin.id, MeasurementKind::Humidity)
            .await
            .unwrap()
            .iter()
            .map(|m| m.value)
            .collect();
        assert_eq!(values, vec![30.0, 20.0, 10.0]);
        assert!(store.recent_measurements(bin.id, MeasurementKind::Level).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_measurement_and_unknown_save_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.append_measurement(measurement(99, 1.0, 0)).await,
            Err(StoreError::NotFound(99))
        ));
        let mut bin = store.insert_bin(new_bin(None)).await.unwrap();
        bin.id = 42;
        assert!(matches!(store.save_bin(&bin).await, Err(StoreError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("bins.json");

        let store = MemoryStore::with_snapshot(&path).await.unwrap();
        assert!(!store.flush().await.unwrap());
        let bin = store.insert_bin(new_bin(Some(3))).await.unwrap();
        store.append_measurement(measurement(bin.id, 55.5, 5)).await.unwrap();
        assert!(store.flush().await.unwrap());

        let reloaded = MemoryStore::with_snapshot(&path).await.unwrap();
        assert_eq!(reloaded.find_bin(bin.id).await.unwrap(), Some(bin));
        let latest = reloaded.latest_measurement(1, MeasurementKind::Humidity).await.unwrap().unwrap();
        assert_eq!(latest.value, 55.5);
        assert_eq!(reloaded.insert_bin(new_bin(None)).await.unwrap().id, 2);
    }
}
