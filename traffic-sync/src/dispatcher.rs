//! Position and parts writes for confirmed proxies.
//!
//! One pass per tick. Each proxy is written when its interpolated situation
//! or parts changed, and unconditionally every `full_refresh_ticks` passes
//! (staggered by the proxy's position in the pass).

use serde::Serialize;
use tracing::{debug, trace};
use traffic_model::{Callsign, Lights, Parts, Situation};

use host_protocol::{
    flaps_handle_value, ClientEvent, DataKind, DataPeriod, InitPosition, ObjectId, PartsPayload, PositionReport,
};

use crate::config::EngineConfig;
use crate::engine::SyncEngine;
use crate::registry::{ProxyKind, ProxyState};
use crate::roster::RemoteAircraftProvider;
use crate::scheduler::{Deferred, Millis};

/// Adjustment applied while converting a situation for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AltitudeCorrection {
    None,
    /// Raised to elevation + ground clearance.
    Underflow,
    /// On-ground situation placed exactly on the ground.
    DraggedToGround,
    /// No ground flag known and (nearly) standing still.
    ForcedGroundFlag,
}

/// Convert a roster situation into the host's placement block.
///
/// Ground elevation comes from the situation, ground clearance from the host
/// model. With both known the written altitude is never below
/// elevation + clearance.
pub fn situation_to_init_position(
    situation: &Situation,
    ground_clearance_ft: Option<f64>,
    config: &EngineConfig,
    force_underflow_detection: bool,
) -> (InitPosition, AltitudeCorrection) {
    let mut altitude_ft = situation.altitude_ft.unwrap_or(0.0);
    let mut correction = AltitudeCorrection::None;

    if let (Some(elevation), Some(clearance)) = (situation.ground_elevation_ft, ground_clearance_ft) {
        let ground_level = elevation + clearance;
        if situation.on_ground == Some(true) {
            if altitude_ft != ground_level {
                altitude_ft = ground_level;
                correction = AltitudeCorrection::DraggedToGround;
            }
        } else if altitude_ft < ground_level {
            altitude_ft = ground_level;
            correction = AltitudeCorrection::Underflow;
        }
    }

    let mut on_ground = config.send_ground_flag && situation.on_ground == Some(true);
    let detect = force_underflow_detection || config.underflow_detection;
    if detect
        && correction == AltitudeCorrection::None
        && situation.on_ground.is_none()
        && situation.ground_speed_kts.max(0.0) < config.underflow_speed_kts
    {
        on_ground = true;
        correction = AltitudeCorrection::ForcedGroundFlag;
    }

    let airspeed_kts = if situation.ground_speed_kts < 0.0 { 0 } else { situation.ground_speed_kts.round() as u32 };

    let position = InitPosition {
        latitude_deg: situation.latitude_deg,
        longitude_deg: situation.longitude_deg,
        altitude_ft,
        pitch_deg: -situation.pitch_deg,
        bank_deg: -situation.bank_deg,
        heading_deg: situation.heading_deg,
        on_ground,
        airspeed_kts,
    };
    (position, correction)
}

impl<R: RemoteAircraftProvider> SyncEngine<R> {
    /// One dispatcher pass.
    pub(crate) fn update_remote_aircraft(&mut self, now: Millis) {
        if self.roster.in_range_callsigns().is_empty() {
            self.runs = 0;
            return;
        }
        let update_all = std::mem::take(&mut self.update_all);
        let ready: Vec<(Callsign, ObjectId)> = self
            .registry
            .iter()
            .filter(|p| p.is_aircraft() && p.is_ready_to_send() && p.current_lights().is_some())
            .filter_map(|p| Some((p.callsign().clone(), p.object_id()?)))
            .collect();

        for (object_number, (cs, object_id)) in (0u64..).zip(ready) {
            let slow_update = (self.runs + object_number) % self.config.full_refresh_ticks == 0;
            let force = slow_update || update_all;

            let interpolation = self.roster.interpolate(&cs, now, object_number);
            let Some(situation) = interpolation.situation else {
                trace!(callsign = %cs, "no valid situation");
                continue;
            };
            self.update_position(&cs, object_id, situation, force, now);

            if let Some(parts) = interpolation.parts {
                if force || !interpolation.parts_reused {
                    self.update_parts(&cs, object_id, &parts, force, now);
                }
            }
        }
        self.runs += 1;
    }

    fn update_position(&mut self, cs: &Callsign, object_id: ObjectId, situation: Situation, force: bool, now: Millis) {
        let Some(proxy) = self.registry.by_callsign(cs) else { return };
        if !force && proxy.last_sent_situation == Some(situation) {
            return;
        }
        let mut placed = situation;
        if placed.ground_elevation_ft.is_none() {
            placed.ground_elevation_ft = proxy.ground_elevation_ft;
        }
        let (position, correction) =
            situation_to_init_position(&placed, proxy.ground_clearance_ft, &self.config, false);
        if correction != AltitudeCorrection::None {
            trace!(callsign = %cs, ?correction, altitude_ft = position.altitude_ft, "altitude corrected");
        }

        let request_id = proxy.request_id();
        let result = self.host.write_position(object_id, position);
        if self.traced(result, cs, Some(object_id), request_id, "position", now) {
            self.stats.position_writes += 1;
            self.registry.modify(cs, now, |p| p.last_sent_situation = Some(situation));
        }
    }

    pub(crate) fn update_parts(&mut self, cs: &Callsign, object_id: ObjectId, parts: &Parts, force: bool, now: Millis) {
        let Some(proxy) = self.registry.by_callsign(cs) else { return };
        if !force && proxy.last_sent_parts.as_ref() == Some(parts) {
            return;
        }
        let kind = proxy.kind();
        let request_id = proxy.request_id();

        if kind != ProxyKind::AircraftSimulatedObject {
            let result = self.host.write_parts(object_id, PartsPayload::from(parts));
            self.traced(result, cs, Some(object_id), request_id, "parts", now);
        }
        for event in [
            ClientEvent::FlapsSet(flaps_handle_value(parts.flaps_percent)),
            ClientEvent::LandingLightsSet(parts.lights.landing),
            ClientEvent::StrobesSet(parts.lights.strobe),
        ] {
            let result = self.host.transmit_event(object_id, event);
            self.traced(result, cs, Some(object_id), request_id, "parts event", now);
        }
        self.send_toggled_lights(cs, object_id, parts.lights, force, now);

        self.stats.parts_writes += 1;
        let sent = parts.clone();
        self.registry.modify(cs, now, |p| p.last_sent_parts = Some(sent));
    }

    /// Lights without a "set" event are flipped with toggles, which needs the
    /// host's current state. Without it the wanted state is remembered and
    /// re-sent later.
    pub(crate) fn send_toggled_lights(
        &mut self,
        cs: &Callsign,
        object_id: ObjectId,
        wanted: Lights,
        force: bool,
        now: Millis,
    ) {
        let Some(proxy) = self.registry.by_callsign(cs) else { return };
        let current = proxy.current_lights();
        if current == Some(wanted) {
            return;
        }
        if !force && proxy.lights_as_sent() == Some(wanted) {
            return;
        }
        let request_id = proxy.request_id();
        self.registry.modify(cs, now, |p| p.lights_as_sent = Some(wanted));

        let Some(current) = current else {
            debug!(callsign = %cs, "host lights unknown, re-sending later");
            self.scheduler.schedule(
                now,
                self.config.light_resend_ms,
                Deferred::ResendLights { callsign: cs.clone(), lights: wanted },
            );
            return;
        };

        for (want, have, event) in [
            (wanted.taxi, current.taxi, ClientEvent::ToggleTaxiLights),
            (wanted.nav, current.nav, ClientEvent::ToggleNavLights),
            (wanted.beacon, current.beacon, ClientEvent::ToggleBeaconLights),
            (wanted.logo, current.logo, ClientEvent::ToggleLogoLights),
            (wanted.recognition, current.recognition, ClientEvent::ToggleRecognitionLights),
            (wanted.cabin, current.cabin, ClientEvent::ToggleCabinLights),
        ] {
            if want != have {
                let result = self.host.transmit_event(object_id, event);
                self.traced(result, cs, Some(object_id), request_id, "toggle light", now);
            }
        }
    }

    /// Re-send only if nothing newer was sent in the meantime.
    pub(crate) fn resend_lights(&mut self, cs: &Callsign, lights: Lights, now: Millis) {
        let Some(proxy) = self.registry.by_callsign(cs) else { return };
        if proxy.is_pending_removed() || proxy.lights_as_sent() != Some(lights) {
            return;
        }
        let Some(object_id) = proxy.object_id() else { return };
        self.send_toggled_lights(cs, object_id, lights, true, now);
    }

    // ── Telemetry ─────────────────────────────────────────────────────────────

    /// Change the position subscription period; no request if unchanged.
    pub(crate) fn request_position_data(&mut self, cs: &Callsign, period: DataPeriod, now: Millis) -> bool {
        let Some(proxy) = self.registry.by_callsign(cs) else { return false };
        if proxy.sim_data_period() == period {
            return true;
        }
        let Some(object_id) = proxy.object_id() else { return false };
        let request_id = proxy.request_id();
        let result = self.host.request_data(object_id, request_id, DataKind::Position, period);
        if !self.traced(result, cs, Some(object_id), request_id, "request position", now) {
            return false;
        }
        self.registry.modify(cs, now, |p| p.sim_data_period = period);
        true
    }

    pub(crate) fn on_position_data(&mut self, object_id: ObjectId, data: PositionReport, now: Millis) {
        let Some(proxy) = self.registry.by_object_id(object_id) else { return };
        let cs = proxy.callsign().clone();

        if proxy.is_terrain_probe() {
            if proxy.is_pending_removed() {
                return;
            }
            debug!(callsign = %cs, elevation_ft = data.elevation_ft, "probe elevation");
            self.roster.elevation_received(&cs, data.elevation_ft);
            self.remove_terrain_probe(&cs, object_id, now);
            return;
        }
        if proxy.is_pending_removed() {
            return;
        }

        let moving = proxy.last_sent_situation.is_some_and(|s| s.is_moving());
        let above_ground_ft = data.above_ground_ft();
        if above_ground_ft < self.config.remember_elevation_ft {
            self.registry.modify(&cs, now, |p| {
                p.ground_elevation_ft = Some(data.elevation_ft);
                p.ground_clearance_ft = Some(data.cg_to_ground_ft);
            });
        }

        let period = if moving && above_ground_ft <= self.config.near_ground_ft {
            DataPeriod::VisualFrame
        } else {
            DataPeriod::Second
        };
        self.request_position_data(&cs, period, now);
    }

    pub(crate) fn on_lights_data(&mut self, object_id: ObjectId, lights: Lights, now: Millis) {
        let Some(cs) = self.registry.by_object_id(object_id).map(|p| p.callsign().clone()) else {
            return;
        };
        self.registry.modify(&cs, now, |p| {
            p.current_lights = Some(lights);
            if p.lights_as_sent.is_none() {
                p.lights_as_sent = Some(lights);
            }
        });
    }

    fn remove_terrain_probe(&mut self, cs: &Callsign, object_id: ObjectId, now: Millis) {
        let request_id = self.request_ids.next_probe();
        self.registry.modify(cs, now, |p| p.state = ProxyState::PendingRemoved);
        let result = self.host.remove_object(object_id, request_id);
        self.traced(result, cs, Some(object_id), request_id, "remove probe", now);
    }
}
