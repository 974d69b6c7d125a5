//! Interface to the authoritative roster of remote aircraft.
//!
//! The engine never owns entity data; it asks the roster what should exist,
//! where it is right now, and reports back what the host actually shows.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use traffic_model::{Callsign, Entity, Interpolation, Parts, Situation};

use crate::scheduler::Millis;

/// Outcome of a failed add, surfaced once per failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub callsign: Callsign,
    pub model: String,
    pub reason: String,
    /// The entity has been disabled and will not be retried.
    pub is_final: bool,
}

pub trait RemoteAircraftProvider {
    /// Callsigns that should currently exist in the host.
    fn in_range_callsigns(&self) -> BTreeSet<Callsign>;

    fn is_in_range(&self, callsign: &Callsign) -> bool {
        self.in_range_callsigns().contains(callsign)
    }

    fn entity(&self, callsign: &Callsign) -> Option<Entity>;

    /// Situation and parts for `callsign` at `now`. `object_number` spreads
    /// expensive work over ticks.
    fn interpolate(&mut self, callsign: &Callsign, now: Millis, object_number: u64) -> Interpolation;

    /// Returns `true` when the flag changed.
    fn set_rendered(&mut self, callsign: &Callsign, rendered: bool) -> bool;

    fn set_enabled(&mut self, callsign: &Callsign, enabled: bool);

    fn report_failure(&mut self, report: FailureReport);

    /// `false` means the model can never be created and the entity is dropped
    /// on its first failure.
    fn verify_model(&self, _model_string: &str) -> bool {
        true
    }

    /// Ground elevation read back by a terrain probe.
    fn elevation_received(&mut self, _callsign: &Callsign, _elevation_ft: f64) {}
}

// ── InMemoryRoster ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RosterEntry {
    entity: Entity,
    in_range: bool,
    rendered: bool,
    parts_served: bool,
}

/// Roster holding entities in a map. Interpolation returns the latest
/// situation unchanged; the first call after a parts update returns fresh
/// parts, later calls mark them reused.
#[derive(Debug, Default)]
pub struct InMemoryRoster {
    entries: BTreeMap<Callsign, RosterEntry>,
    failures: Vec<FailureReport>,
    elevations: Vec<(Callsign, f64)>,
    invalid_models: BTreeSet<String>,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity; it is in range.
    pub fn upsert(&mut self, entity: Entity) {
        let cs = entity.callsign.clone();
        let rendered = self.entries.get(&cs).is_some_and(|e| e.rendered);
        self.entries.insert(cs, RosterEntry { entity, in_range: true, rendered, parts_served: false });
    }

    pub fn remove(&mut self, callsign: &Callsign) -> Option<Entity> {
        self.entries.remove(callsign).map(|e| e.entity)
    }

    pub fn set_in_range(&mut self, callsign: &Callsign, in_range: bool) {
        if let Some(e) = self.entries.get_mut(callsign) {
            e.in_range = in_range;
        }
    }

    pub fn set_situation(&mut self, callsign: &Callsign, situation: Situation) {
        if let Some(e) = self.entries.get_mut(callsign) {
            e.entity.situation = situation;
        }
    }

    pub fn set_parts(&mut self, callsign: &Callsign, parts: Parts) {
        if let Some(e) = self.entries.get_mut(callsign) {
            e.entity.parts = Some(parts);
            e.parts_served = false;
        }
    }

    /// Models rejected by [`RemoteAircraftProvider::verify_model`].
    pub fn reject_model(&mut self, model_string: &str) {
        self.invalid_models.insert(model_string.to_string());
    }

    pub fn is_rendered(&self, callsign: &Callsign) -> bool {
        self.entries.get(callsign).is_some_and(|e| e.rendered)
    }

    pub fn is_enabled(&self, callsign: &Callsign) -> bool {
        self.entries.get(callsign).is_some_and(|e| e.entity.enabled)
    }

    pub fn failures(&self) -> &[FailureReport] {
        &self.failures
    }

    pub fn final_failures(&self) -> impl Iterator<Item = &FailureReport> {
        self.failures.iter().filter(|f| f.is_final)
    }

    pub fn elevations(&self) -> &[(Callsign, f64)] {
        &self.elevations
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RemoteAircraftProvider for InMemoryRoster {
    fn in_range_callsigns(&self) -> BTreeSet<Callsign> {
        self.entries
            .iter()
            .filter(|(_, e)| e.in_range)
            .map(|(cs, _)| cs.clone())
            .collect()
    }

    fn is_in_range(&self, callsign: &Callsign) -> bool {
        self.entries.get(callsign).is_some_and(|e| e.in_range)
    }

    fn entity(&self, callsign: &Callsign) -> Option<Entity> {
        self.entries.get(callsign).map(|e| e.entity.clone())
    }

    fn interpolate(&mut self, callsign: &Callsign, _now: Millis, _object_number: u64) -> Interpolation {
        let Some(e) = self.entries.get_mut(callsign) else {
            return Interpolation::invalid();
        };
        if e.entity.situation.is_position_or_altitude_null() {
            return Interpolation::invalid();
        }
        let parts_reused = e.parts_served;
        e.parts_served = true;
        Interpolation {
            situation: Some(e.entity.situation),
            parts: e.entity.parts.clone(),
            parts_reused,
        }
    }

    fn set_rendered(&mut self, callsign: &Callsign, rendered: bool) -> bool {
        match self.entries.get_mut(callsign) {
            Some(e) if e.rendered != rendered => {
                e.rendered = rendered;
                true
            }
            _ => false,
        }
    }

    fn set_enabled(&mut self, callsign: &Callsign, enabled: bool) {
        if let Some(e) = self.entries.get_mut(callsign) {
            e.entity.enabled = enabled;
        }
    }

    fn report_failure(&mut self, report: FailureReport) {
        self.failures.push(report);
    }

    fn verify_model(&self, model_string: &str) -> bool {
        !self.invalid_models.contains(model_string)
    }

    fn elevation_received(&mut self, callsign: &Callsign, elevation_ft: f64) {
        self.elevations.push((callsign.clone(), elevation_ft));
    }
}
