/**
 * STORE - Interface de persistance consommée par le bridge
 *
 * RÔLE :
 * Le stockage des bins et des mesures est un collaborateur externe.
 * Le kernel ne dépend que de ce trait ; `MemoryStore` en est
 * l'implémentation embarquée (mémoire + snapshot JSON optionnel).
 *
 * CONTRAT :
 * - `save_bin` est atomique
 * - `recent_measurements` renvoie les mesures les plus récentes d'abord
 * - les mesures sont append-only
 */

pub mod memory;

pub use memory::MemoryStore;

use crate::models::{Bin, BinId, DeviceId, Measurement, MeasurementKind, NewBin};
use async_trait::async_trait;

/// Erreurs possibles côté persistance
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bin not found: {0}")]
    NotFound(BinId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BinStore: Send + Sync {
    async fn find_bin(&self, id: BinId) -> Result<Option<Bin>, StoreError>;

    async fn find_all_bins(&self) -> Result<Vec<Bin>, StoreError>;

    /// Persiste un nouveau bin et lui attribue son id
    async fn insert_bin(&self, bin: NewBin) -> Result<Bin, StoreError>;

    /// Écrase un bin existant
    async fn save_bin(&self, bin: &Bin) -> Result<(), StoreError>;

    /// Supprime le bin et son historique ; renvoie false s'il n'existait pas
    async fn delete_bin(&self, id: BinId) -> Result<bool, StoreError>;

    async fn append_measurement(&self, measurement: Measurement) -> Result<(), StoreError>;

    /// Série d'un type de mesure, la plus récente en tête
    async fn recent_measurements(&self, bin: BinId, kind: MeasurementKind) -> Result<Vec<Measurement>, StoreError>;

    async fn find_bin_by_device(&self, device: DeviceId) -> Result<Option<Bin>, StoreError> {
        Ok(self.find_all_bins().await?.into_iter().find(|b| b.device_id == Some(device)))
    }

    async fn latest_measurement(&self, bin: BinId, kind: MeasurementKind) -> Result<Option<Measurement>, StoreError> {
        Ok(self.recent_measurements(bin, kind).await?.into_iter().next())
    }
}
