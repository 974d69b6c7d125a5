//! Proxy registry and pending-add queue.
//!
//! The registry is the engine's table of host-side objects, keyed by callsign
//! with lookups by object id and request id. The pending queue holds entities
//! that could not be created yet. Both carry [`FailureCounters`] so failure
//! history survives the pending → live → pending round trip.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use serde::Serialize;
use traffic_model::{Callsign, Entity, Lights, Parts, Situation};

use host_protocol::{DataPeriod, ObjectId, RequestId};

use crate::scheduler::Millis;

/// Request ids used for aircraft creations and per-aircraft requests.
pub const AIRCRAFT_REQUEST_IDS: RangeInclusive<RequestId> = 1_000..=49_999;
/// Request ids used for terrain probes.
pub const TERRAIN_PROBE_REQUEST_IDS: RangeInclusive<RequestId> = 50_000..=59_999;

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    PendingAdded,
    ConfirmedAdded,
    PendingRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    AircraftNonAtc,
    /// Fallback after a non-ATC creation failed; takes no absolute parts write.
    AircraftSimulatedObject,
    TerrainProbe,
}

impl ProxyKind {
    pub fn is_aircraft(self) -> bool {
        !matches!(self, ProxyKind::TerrainProbe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FailureCounters {
    pub adding_exceptions: u32,
    pub adding_directly_removed: u32,
}

impl FailureCounters {
    /// Field-wise maximum, so merging two histories never loses a failure.
    pub fn merge(self, other: FailureCounters) -> FailureCounters {
        FailureCounters {
            adding_exceptions: self.adding_exceptions.max(other.adding_exceptions),
            adding_directly_removed: self.adding_directly_removed.max(other.adding_directly_removed),
        }
    }
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

/// Bookkeeping for one host-side object.
#[derive(Debug, Clone, Serialize)]
pub struct Proxy {
    pub(crate) entity: Entity,
    pub(crate) request_id: RequestId,
    pub(crate) object_id: Option<ObjectId>,
    pub(crate) state: ProxyState,
    pub(crate) removed_while_adding: bool,
    pub(crate) kind: ProxyKind,
    pub(crate) counters: FailureCounters,
    pub(crate) last_activity: Millis,

    // ── Host telemetry ────────────────────────────────────────────────────────
    pub(crate) ground_clearance_ft: Option<f64>,
    pub(crate) ground_elevation_ft: Option<f64>,
    pub(crate) reported_model: Option<String>,
    pub(crate) current_lights: Option<Lights>,
    pub(crate) lights_as_sent: Option<Lights>,
    pub(crate) sim_data_period: DataPeriod,

    // ── Dispatcher caches ─────────────────────────────────────────────────────
    pub(crate) last_sent_situation: Option<Situation>,
    pub(crate) last_sent_parts: Option<Parts>,
}

impl Proxy {
    fn new(entity: Entity, request_id: RequestId, kind: ProxyKind, counters: FailureCounters, now: Millis) -> Self {
        Proxy {
            entity,
            request_id,
            object_id: None,
            state: ProxyState::PendingAdded,
            removed_while_adding: false,
            kind,
            counters,
            last_activity: now,
            ground_clearance_ft: None,
            ground_elevation_ft: None,
            reported_model: None,
            current_lights: None,
            lights_as_sent: None,
            sim_data_period: DataPeriod::Never,
            last_sent_situation: None,
            last_sent_parts: None,
        }
    }

    pub fn callsign(&self) -> &Callsign {
        &self.entity.callsign
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn model_string(&self) -> &str {
        &self.entity.model.model_string
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn counters(&self) -> FailureCounters {
        self.counters
    }

    pub fn last_activity(&self) -> Millis {
        self.last_activity
    }

    pub fn current_lights(&self) -> Option<Lights> {
        self.current_lights
    }

    pub fn lights_as_sent(&self) -> Option<Lights> {
        self.lights_as_sent
    }

    pub fn sim_data_period(&self) -> DataPeriod {
        self.sim_data_period
    }

    pub fn ground_clearance_ft(&self) -> Option<f64> {
        self.ground_clearance_ft
    }

    pub fn is_removed_while_adding(&self) -> bool {
        self.removed_while_adding
    }

    pub fn is_pending_added(&self) -> bool {
        self.state == ProxyState::PendingAdded
    }

    pub fn is_confirmed_added(&self) -> bool {
        self.state == ProxyState::ConfirmedAdded
    }

    pub fn is_pending_removed(&self) -> bool {
        self.state == ProxyState::PendingRemoved
    }

    pub fn is_terrain_probe(&self) -> bool {
        self.kind == ProxyKind::TerrainProbe
    }

    pub fn is_aircraft(&self) -> bool {
        self.kind.is_aircraft()
    }

    pub fn has_valid_ids(&self) -> bool {
        self.request_id != 0 && self.object_id.is_some()
    }

    /// Confirmed, addressed and not on its way out.
    pub fn is_ready_to_send(&self) -> bool {
        self.is_confirmed_added() && self.object_id.is_some()
    }

    pub fn is_outdated_pending_added(&self, now: Millis, threshold_ms: Millis) -> bool {
        self.is_pending_added() && now.saturating_sub(self.last_activity) > threshold_ms
    }

    /// Marks the proxy confirmed. Refused while the host id is unknown.
    pub(crate) fn confirm(&mut self) -> bool {
        if self.object_id.is_none() {
            return false;
        }
        self.state = ProxyState::ConfirmedAdded;
        true
    }
}

// ── ProxyRegistry ─────────────────────────────────────────────────────────────

/// One proxy per callsign. Every mutating call stamps `last_activity`.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: BTreeMap<Callsign, Proxy>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `PendingAdded` proxy, or reset the existing one for the
    /// same callsign in place. Counters of an existing proxy are kept.
    pub fn insert(
        &mut self,
        entity: Entity,
        request_id: RequestId,
        kind: ProxyKind,
        counters: FailureCounters,
        now: Millis,
    ) -> &Proxy {
        let callsign = entity.callsign.clone();
        let counters = match self.proxies.get(&callsign) {
            Some(existing) => counters.merge(existing.counters),
            None => counters,
        };
        let proxy = Proxy::new(entity, request_id, kind, counters, now);
        self.proxies.insert(callsign.clone(), proxy);
        &self.proxies[&callsign]
    }

    pub fn by_callsign(&self, callsign: &Callsign) -> Option<&Proxy> {
        self.proxies.get(callsign)
    }

    pub fn by_object_id(&self, object_id: ObjectId) -> Option<&Proxy> {
        self.proxies.values().find(|p| p.object_id == Some(object_id))
    }

    pub fn by_request_id(&self, request_id: RequestId) -> Option<&Proxy> {
        self.proxies.values().find(|p| p.request_id == request_id)
    }

    /// Apply `f` to the proxy for `callsign` and stamp its activity time.
    pub fn modify<T>(&mut self, callsign: &Callsign, now: Millis, f: impl FnOnce(&mut Proxy) -> T) -> Option<T> {
        let proxy = self.proxies.get_mut(callsign)?;
        proxy.last_activity = now;
        Some(f(proxy))
    }

    /// Record the host id for a pending creation. Late completions for
    /// requests that are no longer pending return `None`.
    pub fn set_object_id_for_request(
        &mut self,
        request_id: RequestId,
        object_id: ObjectId,
        now: Millis,
    ) -> Option<Callsign> {
        let proxy = self
            .proxies
            .values_mut()
            .find(|p| p.request_id == request_id && p.object_id.is_none() && p.is_pending_added())?;
        proxy.object_id = Some(object_id);
        proxy.last_activity = now;
        Some(proxy.entity.callsign.clone())
    }

    pub fn remove(&mut self, callsign: &Callsign) -> Option<Proxy> {
        self.proxies.remove(callsign)
    }

    pub fn contains(&self, callsign: &Callsign) -> bool {
        self.proxies.contains_key(callsign)
    }

    pub fn callsigns(&self) -> BTreeSet<Callsign> {
        self.proxies.keys().cloned().collect()
    }

    /// Remove and return every proxy that has been pending-added for longer
    /// than `threshold_ms`. `kind` narrows the sweep to one proxy kind.
    pub fn reap_outdated_pending(&mut self, kind: Option<ProxyKind>, now: Millis, threshold_ms: Millis) -> Vec<Proxy> {
        let outdated: Vec<Callsign> = self
            .proxies
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind == k))
            .filter(|p| p.is_outdated_pending_added(now, threshold_ms))
            .map(|p| p.entity.callsign.clone())
            .collect();
        outdated.iter().filter_map(|cs| self.proxies.remove(cs)).collect()
    }

    pub fn contains_pending_added(&self) -> bool {
        self.proxies.values().any(Proxy::is_pending_added)
    }

    pub fn count_pending_added(&self) -> usize {
        self.proxies.values().filter(|p| p.is_pending_added()).count()
    }

    pub fn pending_added_callsigns(&self) -> Vec<Callsign> {
        self.proxies
            .values()
            .filter(|p| p.is_pending_added())
            .map(|p| p.entity.callsign.clone())
            .collect()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values().filter(|p| p.is_confirmed_added())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn clear(&mut self) {
        self.proxies.clear();
    }
}

// ── PendingQueue ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub entity: Entity,
    pub counters: FailureCounters,
    /// Time the entry was parked or last refreshed.
    pub since: Millis,
}

/// Entities waiting to be created.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeMap<Callsign, PendingEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `entity`, replacing an existing entry for the same callsign.
    /// Counters are merged and the timestamp refreshed.
    pub fn park(&mut self, entity: Entity, counters: FailureCounters, now: Millis) {
        let callsign = entity.callsign.clone();
        let counters = match self.entries.get(&callsign) {
            Some(old) => counters.merge(old.counters),
            None => counters,
        };
        self.entries.insert(callsign, PendingEntry { entity, counters, since: now });
    }

    pub fn take(&mut self, callsign: &Callsign) -> Option<PendingEntry> {
        self.entries.remove(callsign)
    }

    pub fn get(&self, callsign: &Callsign) -> Option<&PendingEntry> {
        self.entries.get(callsign)
    }

    pub fn contains(&self, callsign: &Callsign) -> bool {
        self.entries.contains_key(callsign)
    }

    /// Entry parked longest ago; ties resolve by callsign.
    pub fn oldest(&self) -> Option<&PendingEntry> {
        self.entries.values().min_by_key(|e| (e.since, e.entity.callsign.clone()))
    }

    pub fn callsigns(&self) -> Vec<Callsign> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Request ids ───────────────────────────────────────────────────────────────

/// Monotonic request ids, wrapping inside a fixed range per kind.
#[derive(Debug, Clone)]
pub struct RequestIdAllocator {
    next_aircraft: RequestId,
    next_probe: RequestId,
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        RequestIdAllocator {
            next_aircraft: *AIRCRAFT_REQUEST_IDS.start(),
            next_probe: *TERRAIN_PROBE_REQUEST_IDS.start(),
        }
    }
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_aircraft(&mut self) -> RequestId {
        Self::next_in(&mut self.next_aircraft, &AIRCRAFT_REQUEST_IDS)
    }

    pub fn next_probe(&mut self) -> RequestId {
        Self::next_in(&mut self.next_probe, &TERRAIN_PROBE_REQUEST_IDS)
    }

    fn next_in(counter: &mut RequestId, range: &RangeInclusive<RequestId>) -> RequestId {
        let id = *counter;
        *counter = if id >= *range.end() { *range.start() } else { id + 1 };
        id
    }
}
