//! Messages exchanged with the simulator host.
//!
//! Outbound calls are [`HostRequest`]s, inbound notifications are
//! [`HostEvent`]s. Both serialize as one JSON object per line:
//! ```text
//! {"request":"remove_object","object_id":42,"request_id":1007}
//! {"event":"object_removed","object_id":42}
//! ```
//! Blank lines and lines starting with `#` are skipped on decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use traffic_model::{Lights, Parts};

/// Object id assigned by the host once a creation completes.
pub type ObjectId = u32;
/// Id chosen by the client for a request; echoed back in completions.
pub type RequestId = u32;
/// Host-side serial number of an outbound packet, reported in exceptions.
pub type SendId = u32;

/// Upper bound of the flaps handle event value.
pub const FLAPS_HANDLE_MAX: u32 = 16_383;

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Which telemetry block a data subscription refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Position,
    Lights,
    Model,
}

/// How often the host reports a subscribed data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPeriod {
    #[default]
    Never,
    Once,
    VisualFrame,
    SimFrame,
    Second,
}

/// Client events sent to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "snake_case")]
pub enum ClientEvent {
    FreezeLatLng(bool),
    FreezeAltitude(bool),
    FreezeAttitude(bool),
    /// Flaps handle, `0..=FLAPS_HANDLE_MAX`.
    FlapsSet(u32),
    LandingLightsSet(bool),
    StrobesSet(bool),
    ToggleTaxiLights,
    ToggleNavLights,
    ToggleBeaconLights,
    ToggleLogoLights,
    ToggleRecognitionLights,
    ToggleCabinLights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostException {
    CreateObjectFailed,
    UnrecognizedId,
    Other,
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Absolute placement of an object, as the host expects it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InitPosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_ft: f64,
    /// Host convention: positive is nose down.
    pub pitch_deg: f64,
    /// Host convention: positive is left wing down.
    pub bank_deg: f64,
    pub heading_deg: f64,
    pub on_ground: bool,
    pub airspeed_kts: u32,
}

/// Parts block written in one absolute write (lights go separately).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PartsPayload {
    pub flaps_lead_percent: f64,
    pub flaps_trail_percent: f64,
    pub gear_handle_down: bool,
    pub spoilers_handle_percent: f64,
    pub engines_on: [bool; 4],
}

impl From<&Parts> for PartsPayload {
    fn from(parts: &Parts) -> Self {
        let mut engines_on = [false; 4];
        for (slot, on) in engines_on.iter_mut().zip(parts.engines_on.iter()) {
            *slot = *on;
        }
        let flaps = parts.flaps_percent.clamp(0.0, 100.0);
        PartsPayload {
            flaps_lead_percent: flaps,
            flaps_trail_percent: flaps,
            gear_handle_down: parts.gear_down,
            spoilers_handle_percent: if parts.spoilers_out { 100.0 } else { 0.0 },
            engines_on,
        }
    }
}

/// Flaps percentage mapped onto the flaps handle event range.
pub fn flaps_handle_value(flaps_percent: f64) -> u32 {
    let scaled = (flaps_percent.clamp(0.0, 100.0) / 100.0 * FLAPS_HANDLE_MAX as f64).round();
    (scaled as u32).min(FLAPS_HANDLE_MAX)
}

/// Position block reported by the host for an object it simulates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionReport {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_ft: f64,
    pub elevation_ft: f64,
    pub cg_to_ground_ft: f64,
    pub on_ground: bool,
}

impl PositionReport {
    pub fn above_ground_ft(&self) -> f64 {
        self.altitude_ft - self.elevation_ft
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum HostRequest {
    /// Non-ATC AI aircraft.
    CreateAircraft {
        model: String,
        livery: String,
        callsign: String,
        position: InitPosition,
        request_id: RequestId,
    },
    /// Plain simulated object, used as a fallback and for probes on some hosts.
    CreateSimulatedObject {
        model: String,
        livery: String,
        callsign: String,
        position: InitPosition,
        request_id: RequestId,
    },
    RemoveObject {
        object_id: ObjectId,
        request_id: RequestId,
    },
    ReleaseControl {
        object_id: ObjectId,
        request_id: RequestId,
    },
    SetPosition {
        object_id: ObjectId,
        position: InitPosition,
    },
    SetParts {
        object_id: ObjectId,
        parts: PartsPayload,
    },
    Event {
        object_id: ObjectId,
        event: ClientEvent,
    },
    RequestData {
        object_id: ObjectId,
        request_id: RequestId,
        kind: DataKind,
        period: DataPeriod,
    },
}

impl HostRequest {
    /// Object the request targets; `None` for creations.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::CreateAircraft { .. } | Self::CreateSimulatedObject { .. } => None,
            Self::RemoveObject { object_id, .. }
            | Self::ReleaseControl { object_id, .. }
            | Self::SetPosition { object_id, .. }
            | Self::SetParts { object_id, .. }
            | Self::Event { object_id, .. }
            | Self::RequestData { object_id, .. } => Some(*object_id),
        }
    }

    pub fn is_creation(&self) -> bool {
        matches!(self, Self::CreateAircraft { .. } | Self::CreateSimulatedObject { .. })
    }

    /// Short name used in logs and traces.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateAircraft { .. } => "create_aircraft",
            Self::CreateSimulatedObject { .. } => "create_simulated_object",
            Self::RemoveObject { .. } => "remove_object",
            Self::ReleaseControl { .. } => "release_control",
            Self::SetPosition { .. } => "set_position",
            Self::SetParts { .. } => "set_parts",
            Self::Event { .. } => "event",
            Self::RequestData { .. } => "request_data",
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// A creation request completed; the host names the new object.
    ObjectIdAssigned {
        request_id: RequestId,
        object_id: ObjectId,
    },
    ObjectRemoved {
        object_id: ObjectId,
    },
    /// Asynchronous failure of an earlier packet, identified only by send id.
    Exception {
        send_id: SendId,
        exception: HostException,
        #[serde(default)]
        index: u32,
    },
    PositionData {
        object_id: ObjectId,
        data: PositionReport,
    },
    LightsData {
        object_id: ObjectId,
        lights: Lights,
    },
    ModelData {
        object_id: ObjectId,
        title: String,
        #[serde(default)]
        livery: String,
        cg_to_ground_ft: f64,
    },
    Quit,
}

// ── ProtocolError ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encode one message as a single JSON line (no trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode every non-blank, non-comment line of `text`.
///
/// Line numbers in errors are 1-based.
pub fn decode_lines<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, ProtocolError> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let msg = serde_json::from_str(line)
            .map_err(|source| ProtocolError::Malformed { line: idx + 1, source })?;
        out.push(msg);
    }
    Ok(out)
}

/// Decode a single host event.
pub fn decode_event(line: &str) -> Result<HostEvent, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Malformed { line: 1, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flaps_handle_is_scaled_and_clamped() {
        assert_eq!(flaps_handle_value(0.0), 0);
        assert_eq!(flaps_handle_value(50.0), 8192);
        assert_eq!(flaps_handle_value(100.0), FLAPS_HANDLE_MAX);
        assert_eq!(flaps_handle_value(140.0), FLAPS_HANDLE_MAX);
        assert_eq!(flaps_handle_value(-5.0), 0);
    }

    #[test]
    fn parts_payload_copies_first_four_engines() {
        let parts = Parts {
            flaps_percent: 25.0,
            gear_down: true,
            spoilers_out: true,
            engines_on: vec![true, false, true, true, true],
            ..Parts::default()
        };
        let payload = PartsPayload::from(&parts);
        assert_eq!(payload.engines_on, [true, false, true, true]);
        assert!(payload.gear_handle_down);
        assert!((payload.spoilers_handle_percent - 100.0).abs() < f64::EPSILON);
        assert!((payload.flaps_trail_percent - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_event_reads_tagged_json() {
        let ev = decode_event(r#"{"event":"object_id_assigned","request_id":1000,"object_id":42}"#).unwrap();
        assert_eq!(ev, HostEvent::ObjectIdAssigned { request_id: 1000, object_id: 42 });

        let ev = decode_event(r#"{"event":"exception","send_id":7,"exception":"create_object_failed"}"#).unwrap();
        assert_eq!(
            ev,
            HostEvent::Exception { send_id: 7, exception: HostException::CreateObjectFailed, index: 0 }
        );
    }

    #[test]
    fn decode_lines_skips_comments_and_reports_line_numbers() {
        let text = "# recorded session\n\n{\"event\":\"quit\"}\n{\"event\":\"object_removed\"}\n";
        let err = decode_lines::<HostEvent>(text).unwrap_err();
        match err {
            ProtocolError::Malformed { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error {other}"),
        }

        let events: Vec<HostEvent> = decode_lines("# only\n{\"event\":\"quit\"}\n").unwrap();
        assert_eq!(events, vec![HostEvent::Quit]);
    }

    #[test]
    fn encoded_request_is_single_line() {
        let req = HostRequest::Event { object_id: 42, event: ClientEvent::FlapsSet(8192) };
        let line = encode_line(&req).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"request\":\"event\""));
        assert!(line.contains("\"flaps_set\""));
    }

    #[test]
    fn request_object_id_and_name() {
        let req = HostRequest::RemoveObject { object_id: 42, request_id: 1001 };
        assert_eq!(req.object_id(), Some(42));
        assert_eq!(req.name(), "remove_object");
        assert!(!req.is_creation());
    }

    #[test]
    fn malformed_lines_never_panic() {
        for bad in ["", "{", "null", "[1,2]", "{\"event\":\"unknown\"}", "\u{0}\u{1}"] {
            assert!(decode_event(bad).is_err(), "accepted {bad:?}");
        }
    }
}
