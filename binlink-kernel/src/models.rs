/**
 * MODÈLES - Entités persistées et identités des devices
 *
 * RÔLE : Bin, Measurement et types associés, partagés par le store,
 * le bridge et l'API admin.
 *
 * PROVENANCE : chaque bin et chaque mesure indique si elle vient d'un
 * device réel ou du fallback de provisioning simulé.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Identité d'une connexion device (séquentielle, non persistée entre redémarrages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type BinId = u64;

/// Origine d'une donnée : device réel ou fallback simulé
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Device,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub id: BinId,
    pub location: Location,
    pub capacity: f64,
    /// Seuil de remplissage en pourcentage (0..=100)
    pub fill_threshold: f64,
    /// Référence faible vers le registry : lookup seulement
    pub device_id: Option<DeviceId>,
    pub provenance: Provenance,
    pub emptied_last: Option<OffsetDateTime>,
    pub pick_up_time: Option<OffsetDateTime>,
}

/// Bin pas encore persisté (l'id est attribué par le store)
#[derive(Debug, Clone, PartialEq)]
pub struct NewBin {
    pub location: Location,
    pub capacity: f64,
    pub fill_threshold: f64,
    pub device_id: Option<DeviceId>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Humidity,
    Level,
    Temperature,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 3] = [
        MeasurementKind::Humidity,
        MeasurementKind::Level,
        MeasurementKind::Temperature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Humidity => "humidity",
            MeasurementKind::Level => "level",
            MeasurementKind::Temperature => "temperature",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mesure append-only, jamais modifiée après création
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub bin_id: BinId,
    pub kind: MeasurementKind,
    pub value: f64,
    pub timestamp: OffsetDateTime,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(MeasurementKind::parse("level"), Some(MeasurementKind::Level));
        assert_eq!(MeasurementKind::parse("pressure"), None);
        assert_eq!(DeviceId(7).to_string(), "7");
    }
}
