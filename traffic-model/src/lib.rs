//! Shared remote-traffic definitions used by the sync engine, the host
//! protocol crate and the replay tool.
//!
//! Units are fixed per field name: degrees, feet and knots.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest callsign the host accepts for an AI object.
pub const MAX_HOST_CALLSIGN_LEN: usize = 12;

/// Model string used for terrain elevation probes.
pub const TERRAIN_PROBE_MODEL: &str = "TerrainProbe0";

/// Below this ground speed an entity counts as standing still.
pub const MOVING_THRESHOLD_KTS: f64 = 1.0;

// ── Callsign ──────────────────────────────────────────────────────────────────

/// Roster key of a remote aircraft. Stored trimmed and upper case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Callsign(String);

impl Callsign {
    pub fn new(raw: &str) -> Self {
        Callsign(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The callsign as handed to the host, cut to [`MAX_HOST_CALLSIGN_LEN`].
    pub fn host_str(&self) -> String {
        self.0.chars().take(MAX_HOST_CALLSIGN_LEN).collect()
    }
}

impl From<String> for Callsign {
    fn from(raw: String) -> Self {
        Callsign::new(&raw)
    }
}

impl From<&str> for Callsign {
    fn from(raw: &str) -> Self {
        Callsign::new(raw)
    }
}

impl From<Callsign> for String {
    fn from(cs: Callsign) -> Self {
        cs.0
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Situation ─────────────────────────────────────────────────────────────────

/// Position, attitude and motion of one aircraft at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Situation {
    // ── Position ──────────────────────────────────────────────────────────────
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Altitude above mean sea level, `None` while unknown.
    pub altitude_ft: Option<f64>,

    // ── Attitude ──────────────────────────────────────────────────────────────
    pub pitch_deg: f64,
    pub bank_deg: f64,
    pub heading_deg: f64,

    // ── Motion ────────────────────────────────────────────────────────────────
    /// Negative for pushback and some helicopters.
    pub ground_speed_kts: f64,
    /// `None` until the roster has ground information for this aircraft.
    pub on_ground: Option<bool>,
    /// Terrain elevation below the aircraft, when known.
    pub ground_elevation_ft: Option<f64>,
}

impl Situation {
    /// No usable position or altitude: the host cannot place an object here.
    pub fn is_position_or_altitude_null(&self) -> bool {
        let Some(alt) = self.altitude_ft else { return true };
        if !alt.is_finite() || !self.latitude_deg.is_finite() || !self.longitude_deg.is_finite() {
            return true;
        }
        self.latitude_deg == 0.0 && self.longitude_deg == 0.0
    }

    pub fn is_moving(&self) -> bool {
        self.ground_speed_kts.abs() >= MOVING_THRESHOLD_KTS
    }

    /// Height above the known terrain, if both altitude and elevation exist.
    pub fn above_ground_ft(&self) -> Option<f64> {
        Some(self.altitude_ft? - self.ground_elevation_ft?)
    }
}

// ── Lights ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lights {
    pub strobe: bool,
    pub landing: bool,
    pub taxi: bool,
    pub beacon: bool,
    pub nav: bool,
    pub logo: bool,
    pub recognition: bool,
    pub cabin: bool,
}

impl Lights {
    pub fn all_on() -> Self {
        Lights {
            strobe: true,
            landing: true,
            taxi: true,
            beacon: true,
            nav: true,
            logo: true,
            recognition: true,
            cabin: true,
        }
    }
}

// ── Parts ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Parts {
    /// 0 (retracted) to 100 (fully extended).
    pub flaps_percent: f64,
    pub gear_down: bool,
    pub spoilers_out: bool,
    /// Combustion state per engine, index 0 is engine 1.
    pub engines_on: Vec<bool>,
    pub lights: Lights,
}

impl Parts {
    pub fn is_any_engine_on(&self) -> bool {
        self.engines_on.iter().any(|on| *on)
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// The host model an entity is rendered with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AircraftModel {
    pub model_string: String,
    pub livery: String,
}

impl AircraftModel {
    pub fn new(model_string: &str, livery: &str) -> Self {
        AircraftModel {
            model_string: model_string.trim().to_string(),
            livery: livery.trim().to_string(),
        }
    }

    pub fn has_model_string(&self) -> bool {
        !self.model_string.trim().is_empty()
    }
}

// ── Entity ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Aircraft,
    TerrainProbe,
}

/// One remote aircraft as the roster knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub callsign: Callsign,
    #[serde(default)]
    pub model: AircraftModel,
    #[serde(default)]
    pub situation: Situation,
    #[serde(default)]
    pub parts: Option<Parts>,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Entity {
    pub fn aircraft(callsign: &str, model: AircraftModel, situation: Situation) -> Self {
        Entity {
            callsign: Callsign::new(callsign),
            model,
            situation,
            parts: None,
            kind: EntityKind::Aircraft,
            enabled: true,
        }
    }

    /// A pseudo aircraft placed at `altitude_ft` to read back terrain elevation.
    pub fn terrain_probe(number: u32, latitude_deg: f64, longitude_deg: f64, altitude_ft: f64) -> Self {
        Entity {
            callsign: Callsign::new(&format!("PROBE{number}")),
            model: AircraftModel::new(TERRAIN_PROBE_MODEL, ""),
            situation: Situation {
                latitude_deg,
                longitude_deg,
                altitude_ft: Some(altitude_ft),
                on_ground: Some(false),
                ..Situation::default()
            },
            parts: None,
            kind: EntityKind::TerrainProbe,
            enabled: true,
        }
    }

    pub fn is_terrain_probe(&self) -> bool {
        self.kind == EntityKind::TerrainProbe
    }
}

// ── Interpolation ─────────────────────────────────────────────────────────────

/// Output of the roster's interpolator for one callsign and one instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Interpolation {
    /// `None` when no valid situation could be computed.
    pub situation: Option<Situation>,
    pub parts: Option<Parts>,
    /// Parts are the same snapshot as in the previous call.
    pub parts_reused: bool,
}

impl Interpolation {
    pub fn invalid() -> Self {
        Interpolation::default()
    }

    pub fn has_valid_situation(&self) -> bool {
        self.situation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callsign_is_normalized() {
        assert_eq!(Callsign::new("  dlh400 ").as_str(), "DLH400");
        let cs: Callsign = serde_json::from_str("\"baw123\"").unwrap();
        assert_eq!(cs, Callsign::new("BAW123"));
    }

    #[test]
    fn host_callsign_is_truncated() {
        let cs = Callsign::new("ABCDEFGHIJKLMNOP");
        assert_eq!(cs.host_str(), "ABCDEFGHIJKL");
    }

    #[test]
    fn situation_without_altitude_is_null() {
        let s = Situation { latitude_deg: 50.0, longitude_deg: 8.5, ..Situation::default() };
        assert!(s.is_position_or_altitude_null());

        let s = Situation { altitude_ft: Some(364.0), ..s };
        assert!(!s.is_position_or_altitude_null());
    }

    #[test]
    fn above_ground_needs_elevation() {
        let mut s = Situation { altitude_ft: Some(1200.0), ..Situation::default() };
        assert_eq!(s.above_ground_ft(), None);
        s.ground_elevation_ft = Some(1000.0);
        assert_eq!(s.above_ground_ft(), Some(200.0));
    }

    #[test]
    fn probe_callsign_and_model() {
        let probe = Entity::terrain_probe(3, 47.0, 11.0, 50_000.0);
        assert_eq!(probe.callsign.as_str(), "PROBE3");
        assert_eq!(probe.model.model_string, TERRAIN_PROBE_MODEL);
        assert!(probe.is_terrain_probe());
    }

    #[test]
    fn entity_defaults_to_enabled_aircraft() {
        let json = r#"{"callsign":"afr12","model":{"model_string":"A320"}}"#;
        let e: Entity = serde_json::from_str(json).unwrap();
        assert!(e.enabled);
        assert_eq!(e.kind, EntityKind::Aircraft);
        assert_eq!(e.callsign.as_str(), "AFR12");
    }
}
