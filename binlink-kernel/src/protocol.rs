/**
 * PROTOCOLE DEVICE - Vocabulaire texte des poubelles connectées
 *
 * RÔLE :
 * Encode les commandes envoyées aux devices et décode leurs réponses,
 * une seule fois, à la frontière du protocole.
 *
 * FORMAT :
 * - Une trame texte = un message logique (pas de newline, pas d'échappement)
 * - Réponses de mesure préfixées par un tag de 5 caractères : `humid:`, `level:`, `tempe:`
 * - Télémétrie spontanée : même format que les réponses de mesure
 *
 * EXEMPLE :
 * ```text
 * kernel → device : getHumidity
 * device → kernel : humid:25.0
 * ```
 */

use crate::models::MeasurementKind;
use std::fmt;

/// Longueur fixe du tag en tête des trames de mesure
pub const TAG_LEN: usize = 5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("expected reply prefix {expected:?}, got {reply:?}")]
    UnexpectedPrefix { expected: &'static str, reply: String },
    #[error("invalid numeric payload {0:?}")]
    InvalidNumber(String),
    #[error("unexpected reply {reply:?} (wanted {expected:?})")]
    UnexpectedReply { expected: &'static str, reply: String },
}

/// Commandes supportées par les devices
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    GetHumidity,
    GetTemperature,
    GetCurrentLevel,
    GetStatus,
    GetSerialNumber,
    SetFillThreshold(f64),
    CalibrateDevice,
    ActivateBuzzer,
}

impl Command {
    /// Commande de lecture associée à un type de mesure
    pub fn read(kind: MeasurementKind) -> Self {
        match kind {
            MeasurementKind::Humidity => Command::GetHumidity,
            MeasurementKind::Level => Command::GetCurrentLevel,
            MeasurementKind::Temperature => Command::GetTemperature,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetHumidity => f.write_str("getHumidity"),
            Command::GetTemperature => f.write_str("getTemperature"),
            Command::GetCurrentLevel => f.write_str("getCurrentLevel"),
            Command::GetStatus => f.write_str("getStatus"),
            Command::GetSerialNumber => f.write_str("getSerialNumber"),
            Command::SetFillThreshold(value) => write!(f, "setFillThreshold:{value}"),
            Command::CalibrateDevice => f.write_str("calibrateDevice"),
            Command::ActivateBuzzer => f.write_str("activateBuzzer"),
        }
    }
}

pub const THRESHOLD_SET: &str = "Threshold set";
pub const OK: &str = "OK";

fn tag(kind: MeasurementKind) -> &'static str {
    match kind {
        MeasurementKind::Humidity => "humid",
        MeasurementKind::Level => "level",
        MeasurementKind::Temperature => "tempe",
    }
}

fn kind_for_tag(tag: &str) -> Option<MeasurementKind> {
    MeasurementKind::ALL.into_iter().find(|k| self::tag(*k) == tag)
}

fn parse_value(raw: &str) -> Result<f64, ProtocolError> {
    let raw = raw.trim();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ProtocolError::InvalidNumber(raw.to_string())),
    }
}

/// Décode la réponse à une commande de lecture (`humid:25.0` pour Humidity...)
pub fn parse_measurement_reply(kind: MeasurementKind, reply: &str) -> Result<f64, ProtocolError> {
    let expected = match kind {
        MeasurementKind::Humidity => "humid:",
        MeasurementKind::Level => "level:",
        MeasurementKind::Temperature => "tempe:",
    };
    let payload = reply.strip_prefix(expected).ok_or_else(|| ProtocolError::UnexpectedPrefix {
        expected,
        reply: reply.to_string(),
    })?;
    parse_value(payload)
}

/// Décode `statu:<token>` ; le token (`OK` ou code d'erreur) est renvoyé tel quel
pub fn parse_status_reply(reply: &str) -> Result<String, ProtocolError> {
    reply
        .strip_prefix("statu:")
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ProtocolError::UnexpectedPrefix { expected: "statu:", reply: reply.to_string() })
}

pub fn parse_serial_reply(reply: &str) -> Result<u64, ProtocolError> {
    reply
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidNumber(reply.to_string()))
}

/// Vérifie une réponse d'acquittement exacte (`OK`, `Threshold set`)
pub fn expect_ack(reply: &str, expected: &'static str) -> Result<(), ProtocolError> {
    if reply == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedReply { expected, reply: reply.to_string() })
    }
}

/// Lecture décodée depuis une trame de télémétrie
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub kind: MeasurementKind,
    pub value: f64,
}

/// Résultat du décodage d'une trame de télémétrie
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Reading(Reading),
    /// Tag inconnu : télémétrie non reconnue, ignorée par l'appelant
    Unrecognized(String),
}

impl Telemetry {
    /// Sélectionne le type de mesure d'après le tag de 5 caractères,
    /// le reste (après un éventuel `:`) est parsé en flottant.
    pub fn decode(raw: &str) -> Result<Telemetry, ProtocolError> {
        let raw = raw.trim();
        let Some(tag) = raw.get(..TAG_LEN) else {
            return Ok(Telemetry::Unrecognized(raw.to_string()));
        };
        let Some(kind) = kind_for_tag(tag) else {
            return Ok(Telemetry::Unrecognized(tag.to_string()));
        };
        let rest = &raw[TAG_LEN..];
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        Ok(Telemetry::Reading(Reading { kind, value: parse_value(rest)? }))
    }
}
