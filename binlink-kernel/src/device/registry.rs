/**
 * CONNECTION REGISTRY - Pool des connexions devices vivantes
 *
 * RÔLE : Map DeviceId -> DeviceConnection partagée entre le listener
 * (écriture à la connexion) et le bridge (lecture à chaque commande).
 *
 * INVARIANT : au plus une connexion par identité.
 * Lectures concurrentes, mutations exclusives (RwLock, jamais tenu à travers un await).
 */

use crate::device::connection::DeviceConnection;
use crate::models::DeviceId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("device identity {0} is already registered")]
    DuplicateIdentity(DeviceId),
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<DeviceId, DeviceConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute une connexion ; refuse une identité déjà présente sans toucher à l'existante
    pub fn register(&self, conn: DeviceConnection) -> Result<(), RegistryError> {
        let id = conn.id();
        let mut map = self.connections.write();
        if map.contains_key(&id) {
            return Err(RegistryError::DuplicateIdentity(id));
        }
        map.insert(id, conn);
        info!(device = %id, online = map.len(), "device registered");
        Ok(())
    }

    /// Retire et ferme la connexion ; no-op si absente
    pub fn unregister(&self, id: DeviceId) -> Option<DeviceConnection> {
        let removed = self.connections.write().remove(&id);
        if let Some(conn) = &removed {
            conn.close();
            info!(device = %id, "device unregistered");
        }
        removed
    }

    /// Retire `conn` seulement si c'est bien elle qui occupe son identité.
    /// Utilisé après une panne : une connexion plus récente n'est jamais évincée.
    pub fn evict(&self, conn: &DeviceConnection) -> bool {
        conn.close();
        let mut map = self.connections.write();
        match map.get(&conn.id()) {
            Some(current) if current.same_as(conn) => {
                map.remove(&conn.id());
                debug!(device = %conn.id(), "evicted dead connection");
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, id: DeviceId) -> Option<DeviceConnection> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot trié par identité
    pub fn list_all(&self) -> Vec<DeviceConnection> {
        let mut all: Vec<DeviceConnection> = self.connections.read().values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ferme toutes les connexions (arrêt du process)
    pub fn close_all(&self) -> usize {
        let drained: Vec<DeviceConnection> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }
}
