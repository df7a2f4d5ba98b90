/**
 * DEVICE BRIDGE - Pont requêtes bin ↔ commandes device
 *
 * RÔLE :
 * Traduit les opérations orientées "bin" en commandes vers le device assigné,
 * interprète les réponses et persiste les résultats.
 *
 * FONCTIONNEMENT :
 * - Lecture : mesure servie depuis le store si plus jeune que la fenêtre de fraîcheur,
 *   sinon lecture sur le device puis persistance (une seule commande en vol par bin)
 * - Écriture : télémétrie `humid:/level:/tempe:` rattachée au bin du device
 * - Mise à jour : validation complète AVANT toute écriture ; persistance d'abord,
 *   notification device ensuite (best effort, sans rollback)
 * - Provisioning : device vivant non assigné, sinon identité simulée + historique fabriqué
 *
 * Une panne transport (I/O, timeout) évince la connexion du registry et se traduit
 * par un résultat "unavailable", jamais par une erreur brute.
 */

use crate::device::{ConnectionRegistry, DeviceConnection, DeviceError, TelemetryFrame};
use crate::health::HealthTracker;
use crate::models::{Bin, BinId, DeviceId, Location, Measurement, MeasurementKind, NewBin, Provenance};
use crate::protocol::{self, Command, ProtocolError, Telemetry};
use crate::state::KeyedLocks;
use crate::store::{BinStore, StoreError};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Nombre de mesures d'humidité fabriquées pour un bin simulé
pub const SIMULATED_SEED_COUNT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bin not found: {0}")]
    BinNotFound(BinId),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("device unavailable for bin {0}")]
    DeviceUnavailable(BinId),
    #[error("malformed device payload: {0}")]
    MalformedReply(#[from] ProtocolError),
    #[error("no free identity left in the simulated device range")]
    SimulatedRangeExhausted,
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Résultat d'une lecture de mesure courante
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "measurement", rename_all = "snake_case")]
pub enum CurrentReading {
    /// Mesure stockée encore fraîche
    Cached(Measurement),
    /// Mesure lue sur le device et persistée
    Fetched(Measurement),
    NoData,
    Unavailable,
}

impl CurrentReading {
    pub fn measurement(&self) -> Option<&Measurement> {
        match self {
            CurrentReading::Cached(m) | CurrentReading::Fetched(m) => Some(m),
            CurrentReading::NoData | CurrentReading::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinUpdate {
    pub longitude: f64,
    pub latitude: f64,
    pub fill_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinSpec {
    pub location: Location,
    pub capacity: f64,
    pub fill_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub bin: Bin,
    pub device_notified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinStatus {
    pub bin: Bin,
    pub online: bool,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub freshness_window: Duration,
    pub simulated_ids: RangeInclusive<u32>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self { freshness_window: Duration::seconds(3600), simulated_ids: 1000..=1999 }
    }
}

/// Une mesure est fraîche tant que son âge reste strictement sous la fenêtre
pub fn is_fresh(taken: OffsetDateTime, now: OffsetDateTime, window: Duration) -> bool {
    now - taken < window
}

pub struct DeviceBridge {
    registry: ConnectionRegistry,
    store: Arc<dyn BinStore>,
    health: HealthTracker,
    settings: BridgeSettings,
    bin_locks: KeyedLocks<BinId>,
    provisioning: tokio::sync::Mutex<()>,
}

impl DeviceBridge {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn BinStore>,
        health: HealthTracker,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            registry,
            store,
            health,
            settings,
            bin_locks: KeyedLocks::new(),
            provisioning: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get_current_humidity(&self, bin_id: BinId) -> Result<CurrentReading, BridgeError> {
        self.current_reading(bin_id, MeasurementKind::Humidity).await
    }

    /// Mesure courante d'un bin : cache si fraîche, device sinon.
    /// Sérialisé par bin : deux lectures périmées simultanées n'émettent qu'une commande.
    pub async fn current_reading(&self, bin_id: BinId, kind: MeasurementKind) -> Result<CurrentReading, BridgeError> {
        let _guard = self.bin_locks.lock(&bin_id).await;

        let bin = self.load_bin(bin_id).await?;
        let Some(latest) = self.store.latest_measurement(bin_id, kind).await? else {
            return Ok(CurrentReading::NoData);
        };
        if is_fresh(latest.timestamp, OffsetDateTime::now_utc(), self.settings.freshness_window) {
            debug!(bin = bin_id, %kind, "serving cached measurement");
            return Ok(CurrentReading::Cached(latest));
        }

        let Some(conn) = self.connection_for(&bin) else {
            debug!(bin = bin_id, device = ?bin.device_id, "stale measurement and device offline");
            return Ok(CurrentReading::Unavailable);
        };
        let Ok(reply) = self.send(&conn, Command::read(kind)).await else {
            return Ok(CurrentReading::Unavailable);
        };
        let value = match protocol::parse_measurement_reply(kind, &reply) {
            Ok(value) => value,
            Err(e) => {
                warn!(bin = bin_id, device = %conn.id(), error = %e, "malformed reply, nothing persisted");
                return Ok(CurrentReading::Unavailable);
            }
        };

        let measurement = Measurement {
            bin_id,
            kind,
            value,
            timestamp: OffsetDateTime::now_utc(),
            provenance: Provenance::Device,
        };
        self.store.append_measurement(measurement.clone()).await?;
        info!(bin = bin_id, device = %conn.id(), %kind, value, "fetched fresh measurement");
        Ok(CurrentReading::Fetched(measurement))
    }

    /// Télémétrie d'un device : `humid:25.0`, `level:80.0`, `tempe:12.5`.
    /// Tag inconnu ou device sans bin : ignoré (Ok(None)).
    pub async fn record_reading(&self, device: DeviceId, raw: &str) -> Result<Option<Measurement>, BridgeError> {
        let reading = match Telemetry::decode(raw)? {
            Telemetry::Reading(reading) => reading,
            Telemetry::Unrecognized(tag) => {
                debug!(%device, %tag, "unrecognized telemetry dropped");
                return Ok(None);
            }
        };
        let Some(bin) = self.store.find_bin_by_device(device).await? else {
            debug!(%device, "telemetry from unassigned device dropped");
            return Ok(None);
        };
        if bin.provenance == Provenance::Simulated {
            warn!(%device, bin = bin.id, "telemetry for a simulated bin dropped");
            return Ok(None);
        }

        let measurement = Measurement {
            bin_id: bin.id,
            kind: reading.kind,
            value: reading.value,
            timestamp: OffsetDateTime::now_utc(),
            provenance: Provenance::Device,
        };
        self.store.append_measurement(measurement.clone()).await?;
        debug!(%device, bin = bin.id, kind = %reading.kind, value = reading.value, "telemetry recorded");
        Ok(Some(measurement))
    }

    /// Valide tout, persiste le bin, puis informe le device du nouveau seuil.
    pub async fn update_bin(&self, bin_id: BinId, update: BinUpdate) -> Result<UpdateOutcome, BridgeError> {
        validate_location(update.longitude, update.latitude)?;
        validate_threshold(update.fill_threshold)?;

        let _guard = self.bin_locks.lock(&bin_id).await;

        let mut bin = self.load_bin(bin_id).await?;
        if let Some(level) = self.store.latest_measurement(bin_id, MeasurementKind::Level).await? {
            if update.fill_threshold < level.value {
                return Err(BridgeError::InvalidField {
                    field: "fill_threshold",
                    reason: format!("threshold below current level ({})", level.value),
                });
            }
        }

        bin.location = Location { longitude: update.longitude, latitude: update.latitude };
        bin.fill_threshold = update.fill_threshold;
        self.store.save_bin(&bin).await?;
        info!(bin = bin_id, threshold = update.fill_threshold, "bin updated");

        let device_notified = self.notify_threshold(&bin).await;
        Ok(UpdateOutcome { bin, device_notified })
    }

    async fn notify_threshold(&self, bin: &Bin) -> bool {
        let Some(conn) = self.connection_for(bin) else {
            debug!(bin = bin.id, "device offline, threshold not pushed");
            return false;
        };
        match self.send(&conn, Command::SetFillThreshold(bin.fill_threshold)).await {
            Ok(reply) => match protocol::expect_ack(&reply, protocol::THRESHOLD_SET) {
                Ok(()) => true,
                Err(e) => {
                    warn!(bin = bin.id, device = %conn.id(), error = %e, "threshold not acknowledged");
                    false
                }
            },
            // déjà loggé et évincé par `send`
            Err(_) => false,
        }
    }

    /// Crée un bin et lui assigne un device vivant libre, ou à défaut un device simulé
    pub async fn create_bin(&self, spec: BinSpec) -> Result<Bin, BridgeError> {
        validate_location(spec.location.longitude, spec.location.latitude)?;
        validate_threshold(spec.fill_threshold)?;
        if !spec.capacity.is_finite() || spec.capacity <= 0.0 {
            return Err(BridgeError::InvalidField { field: "capacity", reason: "must be positive".into() });
        }

        // deux créations concurrentes ne doivent pas prendre le même device
        let _guard = self.provisioning.lock().await;

        let assigned: HashSet<DeviceId> = self
            .store
            .find_all_bins()
            .await?
            .into_iter()
            .filter_map(|b| b.device_id)
            .collect();

        let live = self
            .registry
            .list_all()
            .into_iter()
            .map(|c| c.id())
            .find(|id| !assigned.contains(id));

        if let Some(device) = live {
            let bin = self
                .store
                .insert_bin(NewBin {
                    location: spec.location,
                    capacity: spec.capacity,
                    fill_threshold: spec.fill_threshold,
                    device_id: Some(device),
                    provenance: Provenance::Device,
                })
                .await?;
            info!(bin = bin.id, %device, "bin provisioned with live device");
            return Ok(bin);
        }

        let device = self.pick_simulated_identity(&assigned)?;
        let bin = self
            .store
            .insert_bin(NewBin {
                location: spec.location,
                capacity: spec.capacity,
                fill_threshold: spec.fill_threshold,
                device_id: Some(device),
                provenance: Provenance::Simulated,
            })
            .await?;

        let now = OffsetDateTime::now_utc();
        let values: Vec<f64> = {
            let mut rng = rand::thread_rng();
            (0..SIMULATED_SEED_COUNT)
                .map(|_| (rng.gen_range(20.0..80.0_f64) * 10.0).round() / 10.0)
                .collect()
        };
        for (i, value) in values.into_iter().enumerate() {
            self.store
                .append_measurement(Measurement {
                    bin_id: bin.id,
                    kind: MeasurementKind::Humidity,
                    value,
                    timestamp: now - Duration::seconds(i as i64),
                    provenance: Provenance::Simulated,
                })
                .await?;
        }
        info!(bin = bin.id, %device, "no free live device, bin provisioned with simulated device");
        Ok(bin)
    }

    fn pick_simulated_identity(&self, assigned: &HashSet<DeviceId>) -> Result<DeviceId, BridgeError> {
        let free: Vec<DeviceId> = self
            .settings
            .simulated_ids
            .clone()
            .map(DeviceId)
            .filter(|id| !assigned.contains(id) && !self.registry.contains(*id))
            .collect();
        free.choose(&mut rand::thread_rng())
            .copied()
            .ok_or(BridgeError::SimulatedRangeExhausted)
    }

    pub async fn list_bins(&self) -> Result<Vec<BinStatus>, BridgeError> {
        Ok(self
            .store
            .find_all_bins()
            .await?
            .into_iter()
            .map(|bin| {
                let online = self.connection_for(&bin).is_some();
                BinStatus { bin, online }
            })
            .collect())
    }

    pub async fn get_bin(&self, bin_id: BinId) -> Result<BinStatus, BridgeError> {
        let bin = self.load_bin(bin_id).await?;
        let online = self.connection_for(&bin).is_some();
        Ok(BinStatus { bin, online })
    }

    /// Supprime le bin ; son device redevient disponible pour le provisioning
    pub async fn delete_bin(&self, bin_id: BinId) -> Result<(), BridgeError> {
        // ordre : provisioning puis bin (jamais l'inverse)
        let _provisioning = self.provisioning.lock().await;
        let _guard = self.bin_locks.lock(&bin_id).await;
        if !self.store.delete_bin(bin_id).await? {
            return Err(BridgeError::BinNotFound(bin_id));
        }
        info!(bin = bin_id, "bin deleted");
        Ok(())
    }

    pub async fn device_status(&self, bin_id: BinId) -> Result<String, BridgeError> {
        let reply = self.command(bin_id, Command::GetStatus).await?;
        Ok(protocol::parse_status_reply(&reply)?)
    }

    pub async fn serial_number(&self, bin_id: BinId) -> Result<u64, BridgeError> {
        let reply = self.command(bin_id, Command::GetSerialNumber).await?;
        Ok(protocol::parse_serial_reply(&reply)?)
    }

    pub async fn calibrate(&self, bin_id: BinId) -> Result<(), BridgeError> {
        let reply = self.command(bin_id, Command::CalibrateDevice).await?;
        Ok(protocol::expect_ack(&reply, protocol::OK)?)
    }

    pub async fn activate_buzzer(&self, bin_id: BinId) -> Result<(), BridgeError> {
        let reply = self.command(bin_id, Command::ActivateBuzzer).await?;
        Ok(protocol::expect_ack(&reply, protocol::OK)?)
    }

    async fn command(&self, bin_id: BinId, command: Command) -> Result<String, BridgeError> {
        let _guard = self.bin_locks.lock(&bin_id).await;

        let bin = self.load_bin(bin_id).await?;
        let conn = self.connection_for(&bin).ok_or(BridgeError::DeviceUnavailable(bin_id))?;
        self.send(&conn, command).await.map_err(|_| BridgeError::DeviceUnavailable(bin_id))
    }

    async fn load_bin(&self, bin_id: BinId) -> Result<Bin, BridgeError> {
        self.store.find_bin(bin_id).await?.ok_or(BridgeError::BinNotFound(bin_id))
    }

    /// Connexion vivante du bin ; jamais pour un bin simulé
    fn connection_for(&self, bin: &Bin) -> Option<DeviceConnection> {
        if bin.provenance == Provenance::Simulated {
            return None;
        }
        bin.device_id.and_then(|id| self.registry.lookup(id))
    }

    /// Requête device ; en cas de panne la connexion est évincée du registry
    async fn send(&self, conn: &DeviceConnection, command: Command) -> Result<String, DeviceError> {
        match conn.request(&command).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.health.record_device_failure();
                self.registry.evict(conn);
                warn!(device = %conn.id(), %command, error = %e, "device unavailable, connection removed");
                Err(e)
            }
        }
    }
}

fn validate_location(longitude: f64, latitude: f64) -> Result<(), BridgeError> {
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(BridgeError::InvalidField { field: "longitude", reason: format!("{longitude} not in [-180, 180]") });
    }
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(BridgeError::InvalidField { field: "latitude", reason: format!("{latitude} not in [-90, 90]") });
    }
    Ok(())
}

fn validate_threshold(threshold: f64) -> Result<(), BridgeError> {
    if !(0.0..=100.0).contains(&threshold) {
        return Err(BridgeError::InvalidField {
            field: "fill_threshold",
            reason: format!("{threshold} not in [0, 100]"),
        });
    }
    Ok(())
}

/// Consomme la télémétrie spontanée des devices pour toute la durée du process
pub fn spawn_telemetry_sink(bridge: Arc<DeviceBridge>, mut frames: mpsc::UnboundedReceiver<TelemetryFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = bridge.record_reading(frame.device, &frame.payload).await {
                warn!(device = %frame.device, payload = %frame.payload, error = %e, "telemetry rejected");
            }
        }
        debug!("telemetry channel closed");
    })
}
