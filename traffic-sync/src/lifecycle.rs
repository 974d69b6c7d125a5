//! Per-callsign lifecycle: creation, confirmation, removal and failure
//! handling.
//!
//! ```text
//!  ∅ ──create──▶ PendingAdded ──id assigned──▶ ConfirmedAdded
//!                    │                               │
//!              failure/timeout                    remove
//!                    ▼                               ▼
//!             pending queue ◀──unsolicited── PendingRemoved ──removed──▶ ∅
//! ```

use tracing::{debug, info, warn};
use traffic_model::{Callsign, Entity};

use host_protocol::{ClientEvent, DataKind, DataPeriod, HostException, ObjectId, RequestId, SendId};

use crate::dispatcher::situation_to_init_position;
use crate::engine::SyncEngine;
use crate::registry::{FailureCounters, Proxy, ProxyKind, ProxyState};
use crate::roster::RemoteAircraftProvider;
use crate::scheduler::{AddMode, Deferred, Millis};

impl<R: RemoteAircraftProvider> SyncEngine<R> {
    // ── Public entry points ───────────────────────────────────────────────────

    /// Create a proxy for the roster entity `callsign`. Returns `true` when a
    /// creation was started or an identical proxy already exists.
    pub fn add_remote_aircraft(&mut self, callsign: &Callsign, now: Millis) -> bool {
        let Some(entity) = self.roster.entity(callsign) else {
            debug!(callsign = %callsign, "not in roster, nothing to add");
            return false;
        };
        self.physically_add(entity, AddMode::ExternalCall, FailureCounters::default(), now)
    }

    /// Offer every in-range roster entity. Only one creation is in flight at
    /// a time, the rest are parked and picked up by the pending pass.
    pub fn add_all_in_range(&mut self, now: Millis) -> usize {
        let mut started = 0;
        for cs in self.roster.in_range_callsigns() {
            if self.registry.contains(&cs) {
                continue;
            }
            if self.add_remote_aircraft(&cs, now) {
                started += 1;
            }
        }
        started
    }

    /// Place a terrain probe to read back ground elevation at a position.
    pub fn add_terrain_probe(&mut self, number: u32, latitude_deg: f64, longitude_deg: f64, now: Millis) -> bool {
        let probe = Entity::terrain_probe(number, latitude_deg, longitude_deg, self.config.probe_altitude_ft);
        self.physically_add(probe, AddMode::ExternalCall, FailureCounters::default(), now)
    }

    /// Remove the proxy for `callsign` and forget any queued re-add.
    pub fn remove_remote_aircraft(&mut self, callsign: &Callsign, now: Millis) -> bool {
        self.pending.take(callsign);
        self.add_again.remove(callsign);
        self.remove_proxy(callsign, now)
    }

    /// Remove proxies whose callsign left the roster. Returns the callsigns
    /// for which a removal was started or deferred by this call.
    pub fn reconcile(&mut self, now: Millis) -> Vec<Callsign> {
        let in_range = self.roster.in_range_callsigns();
        let stale: Vec<Callsign> = self
            .registry
            .iter()
            .filter(|p| p.is_aircraft() && !p.is_pending_removed() && !p.is_removed_while_adding())
            .filter(|p| !in_range.contains(p.callsign()))
            .map(|p| p.callsign().clone())
            .collect();
        for cs in &stale {
            info!(callsign = %cs, "no longer in roster, removing");
            self.remove_remote_aircraft(cs, now);
        }
        stale
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    pub(crate) fn physically_add(
        &mut self,
        entity: Entity,
        mode: AddMode,
        counters: FailureCounters,
        now: Millis,
    ) -> bool {
        let cs = entity.callsign.clone();
        if cs.is_empty() {
            warn!("entity without callsign ignored");
            return false;
        }
        if !entity.model.has_model_string() {
            warn!(callsign = %cs, "no model string, not adding");
            return false;
        }

        let counters = counters.merge(self.failure_counters(&cs));

        let live_same_model = self.registry.by_callsign(&cs).filter(|p| {
            !p.is_pending_removed()
                && p.model_string() == entity.model.model_string
                && !p.is_outdated_pending_added(now, self.config.outdated_pending_ms)
        });
        if let Some(existing) = live_same_model {
            if existing.is_confirmed_added() {
                self.roster.set_rendered(&cs, true);
            }
            return true;
        }

        if self.reap_outdated_pending(now).contains(&cs) {
            debug!(callsign = %cs, "pending creation just timed out, add aborted");
            return false;
        }

        if let Some(existing) = self.registry.by_callsign(&cs) {
            if existing.is_pending_removed() {
                debug!(callsign = %cs, "removal in flight, re-adding afterwards");
                self.add_again.insert(cs, entity);
                return false;
            }
            info!(
                callsign = %cs,
                old = existing.model_string(),
                new = %entity.model.model_string,
                "model changed, replacing proxy"
            );
            self.add_again.insert(cs.clone(), entity);
            self.remove_proxy(&cs, now);
            return false;
        }

        let mut can_add = self.host.is_simulating() && !self.registry.contains_pending_added();
        if entity.situation.is_position_or_altitude_null() {
            can_add = false;
        }
        if !can_add {
            debug!(callsign = %cs, mode = mode.as_str(), "cannot add now, parked");
            self.pending.park(entity, counters, now);
            return false;
        }

        let counters = match self.pending.take(&cs) {
            Some(previous) => counters.merge(previous.counters),
            None => counters,
        };

        let probe = entity.is_terrain_probe();
        if !probe {
            if !self.roster.is_in_range(&cs) {
                debug!(callsign = %cs, "out of range, not adding");
                return false;
            }
            if !self.roster.entity(&cs).is_some_and(|e| e.enabled) {
                debug!(callsign = %cs, "disabled, not adding");
                return false;
            }
        }

        let request_id = if probe { self.request_ids.next_probe() } else { self.request_ids.next_aircraft() };
        let (position, _) = situation_to_init_position(&entity.situation, None, &self.config, true);
        let kind = if probe {
            ProxyKind::TerrainProbe
        } else if self.config.add_as_simulated_object && counters.adding_exceptions > 0 {
            ProxyKind::AircraftSimulatedObject
        } else {
            ProxyKind::AircraftNonAtc
        };

        let host_callsign = cs.host_str();
        let as_simulated_object = match kind {
            ProxyKind::TerrainProbe => self.config.host_flavor.probe_as_simulated_object(),
            ProxyKind::AircraftSimulatedObject => true,
            ProxyKind::AircraftNonAtc => false,
        };
        let result = if as_simulated_object {
            self.host.create_simulated_object(&entity.model, &host_callsign, position, request_id)
        } else {
            self.host.create_aircraft(&entity.model, &host_callsign, position, request_id)
        };

        match result {
            Ok(send_id) => {
                info!(
                    callsign = %cs,
                    model = %entity.model.model_string,
                    request_id,
                    kind = ?kind,
                    mode = mode.as_str(),
                    "creating proxy"
                );
                self.registry.insert(entity, request_id, kind, counters, now);
                self.trace_creation(send_id, &cs, request_id);
                self.stats.creations += 1;
                true
            }
            Err(err) => {
                warn!(callsign = %cs, request_id, error = %err, "host refused creation");
                if !probe {
                    self.adding_failed(entity, counters, &format!("creation refused: {err}"), now);
                }
                false
            }
        }
    }

    /// Drop outdated pending creations. Each one counts as a failed attempt
    /// and goes back to the pending queue, or is disabled at the bound.
    pub(crate) fn reap_outdated_pending(&mut self, now: Millis) -> Vec<Callsign> {
        let reaped = self.registry.reap_outdated_pending(None, now, self.config.outdated_pending_ms);
        let mut callsigns = Vec::with_capacity(reaped.len());
        for proxy in reaped {
            let cs = proxy.callsign().clone();
            warn!(callsign = %cs, request_id = proxy.request_id(), "pending creation timed out");
            if let Some(object_id) = proxy.object_id() {
                let request_id = self.request_ids.next_aircraft();
                let result = self.host.remove_object(object_id, request_id);
                self.traced(result, &cs, Some(object_id), request_id, "remove timed out object", now);
            }
            callsigns.push(cs.clone());

            if proxy.is_terrain_probe() || !self.roster.is_in_range(&cs) {
                self.add_again.remove(&cs);
                continue;
            }
            let mut counters = proxy.counters().merge(self.failure_counters(&cs));
            counters.adding_exceptions += 1;
            self.failure_history.insert(cs.clone(), counters);
            let model = proxy.model_string().to_string();
            if counters.adding_exceptions >= self.config.max_add_failures {
                self.disable(&cs, &model, "creation timed out too often");
                continue;
            }
            let entity = self.add_again.remove(&cs).unwrap_or(proxy.entity);
            self.pending.park(entity, counters, now);
        }
        callsigns
    }

    /// Creation refused or rejected by the host.
    pub(crate) fn adding_failed(&mut self, entity: Entity, counters: FailureCounters, reason: &str, now: Millis) {
        let cs = entity.callsign.clone();
        self.registry.remove(&cs);
        if entity.is_terrain_probe() {
            return;
        }
        self.pending.take(&cs);
        self.add_again.remove(&cs);
        self.stats.creation_failures += 1;

        let mut counters = counters.merge(self.failure_counters(&cs));
        counters.adding_exceptions += 1;
        self.failure_history.insert(cs.clone(), counters);
        let model = entity.model.model_string.clone();

        if !self.roster.verify_model(&model) {
            self.disable(&cs, &model, &format!("{reason}, model cannot be created"));
            return;
        }
        if counters.adding_exceptions >= self.config.max_add_failures {
            let reason = format!("{reason} ({} attempts)", counters.adding_exceptions);
            self.disable(&cs, &model, &reason);
            return;
        }
        warn!(
            callsign = %cs,
            model = %model,
            attempts = counters.adding_exceptions,
            "creation failed, retrying"
        );
        self.scheduler.schedule(now, self.config.retry_delay_ms, Deferred::Requeue { entity, counters });
    }

    // ── Host events ───────────────────────────────────────────────────────────

    pub(crate) fn on_object_id_assigned(&mut self, request_id: RequestId, object_id: ObjectId, now: Millis) {
        let Some(cs) = self.registry.set_object_id_for_request(request_id, object_id, now) else {
            debug!(request_id, object_id, "completion for unknown or stale request ignored");
            return;
        };

        let is_probe = self.registry.by_callsign(&cs).is_some_and(Proxy::is_terrain_probe);
        if is_probe {
            self.registry.modify(&cs, now, Proxy::confirm);
            let result = self.host.request_data(object_id, request_id, DataKind::Position, DataPeriod::Once);
            if self.traced(result, &cs, Some(object_id), request_id, "probe position", now) {
                self.registry.modify(&cs, now, |p| p.sim_data_period = DataPeriod::Once);
            }
            debug!(callsign = %cs, object_id, "terrain probe placed");
            return;
        }

        if !self.release_control(&cs, object_id, now) {
            let model = self.registry.by_callsign(&cs).map(|p| p.model_string().to_string()).unwrap_or_default();
            warn!(callsign = %cs, object_id, "cannot release AI control");
            self.report(&cs, &model, "cannot release AI control", false);
            return;
        }

        self.registry.modify(&cs, now, Proxy::confirm);
        self.stats.confirmations += 1;

        self.request_position_data(&cs, DataPeriod::Second, now);
        let result = self.host.request_data(object_id, request_id, DataKind::Lights, DataPeriod::Second);
        self.traced(result, &cs, Some(object_id), request_id, "request lights", now);
        let result = self.host.request_data(object_id, request_id, DataKind::Model, DataPeriod::Once);
        self.traced(result, &cs, Some(object_id), request_id, "request model", now);

        self.roster.set_rendered(&cs, true);
        self.scheduler.cancel(|t| matches!(t, Deferred::VerifyAdded { callsign, .. } if *callsign == cs));
        self.scheduler.schedule(
            now,
            self.config.verify_delay(),
            Deferred::VerifyAdded { callsign: cs.clone(), object_id },
        );
        info!(callsign = %cs, object_id, request_id, "proxy confirmed");
    }

    fn release_control(&mut self, cs: &Callsign, object_id: ObjectId, now: Millis) -> bool {
        let request_id = self.request_ids.next_aircraft();
        let result = self.host.release_control(object_id, request_id);
        if !self.traced(result, cs, Some(object_id), request_id, "release control", now) {
            return false;
        }
        for event in [
            ClientEvent::FreezeLatLng(true),
            ClientEvent::FreezeAltitude(true),
            ClientEvent::FreezeAttitude(true),
        ] {
            let result = self.host.transmit_event(object_id, event);
            if !self.traced(result, cs, Some(object_id), request_id, "freeze", now) {
                return false;
            }
        }
        true
    }

    pub(crate) fn on_exception(&mut self, send_id: SendId, exception: HostException, index: u32, now: Millis) {
        let trace = self.traces.find(send_id).cloned();
        match (exception, trace) {
            (HostException::CreateObjectFailed, Some(trace)) => {
                let current = self
                    .registry
                    .by_callsign(&trace.callsign)
                    .is_some_and(|p| p.request_id() == trace.request_id);
                if !current {
                    debug!(send_id, callsign = %trace.callsign, "creation failure for a superseded request");
                    return;
                }
                if let Some(proxy) = self.registry.remove(&trace.callsign) {
                    warn!(send_id, callsign = %trace.callsign, request_id = trace.request_id, "host rejected creation");
                    self.adding_failed(proxy.entity, proxy.counters, "host rejected creation", now);
                }
            }
            (HostException::CreateObjectFailed, None) => {
                warn!(send_id, "creation failed for an untraced send id");
            }
            (other, trace) => {
                warn!(
                    send_id,
                    index,
                    exception = ?other,
                    callsign = trace.as_ref().map(|t| t.callsign.as_str()).unwrap_or("-"),
                    comment = trace.as_ref().map(|t| t.comment.as_str()).unwrap_or("-"),
                    "host exception"
                );
            }
        }
    }

    pub(crate) fn on_model_data(
        &mut self,
        object_id: ObjectId,
        title: String,
        livery: String,
        cg_to_ground_ft: f64,
        now: Millis,
    ) {
        let Some(cs) = self.registry.by_object_id(object_id).map(|p| p.callsign().clone()) else {
            return;
        };
        debug!(callsign = %cs, object_id, title = %title, livery = %livery, cg_to_ground_ft, "model data");
        self.registry.modify(&cs, now, |p| {
            p.reported_model = Some(title);
            p.ground_clearance_ft = Some(cg_to_ground_ft);
        });
    }

    // ── Removal ───────────────────────────────────────────────────────────────

    pub(crate) fn remove_proxy(&mut self, cs: &Callsign, now: Millis) -> bool {
        let Some(proxy) = self.registry.by_callsign(cs) else {
            return false;
        };
        if proxy.is_pending_removed() {
            return true;
        }
        if proxy.is_terrain_probe() {
            return false;
        }

        let object_id = proxy.object_id();
        if !proxy.is_removed_while_adding() && (proxy.is_pending_added() || proxy.current_lights().is_none()) {
            debug!(callsign = %cs, "still adding, removal deferred");
            self.registry.modify(cs, now, |p| p.removed_while_adding = true);
            self.scheduler.schedule(now, self.config.removal_retry_ms, Deferred::RetryRemoval { callsign: cs.clone() });
            return false;
        }
        let Some(object_id) = object_id else {
            self.scheduler.schedule(now, self.config.removal_retry_ms, Deferred::RetryRemoval { callsign: cs.clone() });
            return false;
        };

        let request_id = self.registry.by_callsign(cs).map_or(0, Proxy::request_id);
        for kind in [DataKind::Position, DataKind::Lights] {
            let result = self.host.request_data(object_id, request_id, kind, DataPeriod::Never);
            self.traced(result, cs, Some(object_id), request_id, "stop data", now);
        }
        self.registry.modify(cs, now, |p| {
            p.state = ProxyState::PendingRemoved;
            p.sim_data_period = DataPeriod::Never;
        });

        let remove_id = self.request_ids.next_aircraft();
        let result = self.host.remove_object(object_id, remove_id);
        let ok = self.traced(result, cs, Some(object_id), remove_id, "remove", now);
        self.stats.removals += 1;
        self.roster.set_rendered(cs, false);
        info!(callsign = %cs, object_id, "removing proxy");
        ok
    }

    pub(crate) fn retry_removal(&mut self, cs: &Callsign, now: Millis) {
        if !self.registry.contains(cs) {
            return;
        }
        if !self.add_again.contains_key(cs) && self.roster.is_in_range(cs) {
            debug!(callsign = %cs, "back in range, deferred removal cancelled");
            self.registry.modify(cs, now, |p| p.removed_while_adding = false);
            return;
        }
        self.remove_proxy(cs, now);
    }

    pub(crate) fn on_object_removed(&mut self, object_id: ObjectId, now: Millis) {
        let Some(cs) = self.registry.by_object_id(object_id).map(|p| p.callsign().clone()) else {
            debug!(object_id, "removal of unknown object ignored");
            return;
        };
        let Some(proxy) = self.registry.remove(&cs) else {
            return;
        };
        self.roster.set_rendered(&cs, false);
        self.scheduler.cancel(|t| matches!(t, Deferred::VerifyAdded { object_id: id, .. } if *id == object_id));

        if let Some(entity) = self.add_again.remove(&cs) {
            debug!(callsign = %cs, "old proxy gone, re-adding");
            self.scheduler.schedule(
                now,
                self.config.readd_after_removal_ms,
                Deferred::AddEntity { entity, mode: AddMode::AfterRemoved, counters: FailureCounters::default() },
            );
            return;
        }
        if proxy.is_pending_removed() {
            debug!(callsign = %cs, object_id, "proxy removed");
            return;
        }
        if proxy.is_terrain_probe() {
            return;
        }

        self.stats.unsolicited_removals += 1;
        let Some(entity) = self.roster.entity(&cs) else {
            debug!(callsign = %cs, object_id, "host removed an object that already left the roster");
            return;
        };
        let counters = proxy.counters().merge(self.failure_counters(&cs));
        if proxy.entity.model.has_model_string() && counters.adding_directly_removed < self.config.max_directly_removed {
            let counters = FailureCounters {
                adding_directly_removed: counters.adding_directly_removed + 1,
                ..counters
            };
            self.failure_history.insert(cs.clone(), counters);
            warn!(
                callsign = %cs,
                object_id,
                times = counters.adding_directly_removed,
                "host removed the object, re-adding"
            );
            self.pending.park(entity, counters, now);
        } else {
            self.disable(&cs, proxy.model_string(), "removed by the host too often");
        }
    }

    // ── Pending pass ──────────────────────────────────────────────────────────

    /// Drop stale pending entries and schedule the oldest remaining one.
    pub(crate) fn add_pending(&mut self, mode: AddMode, now: Millis) {
        if self.pending.is_empty() {
            return;
        }
        let in_range = self.roster.in_range_callsigns();
        let stale: Vec<Callsign> = self
            .pending
            .iter()
            .filter(|e| !e.entity.is_terrain_probe() && !in_range.contains(&e.entity.callsign))
            .map(|e| e.entity.callsign.clone())
            .collect();
        for cs in stale {
            debug!(callsign = %cs, "left range while pending");
            self.pending.take(&cs);
            self.add_again.remove(&cs);
        }
        let no_model: Vec<Callsign> = self
            .pending
            .iter()
            .filter(|e| !e.entity.model.has_model_string())
            .map(|e| e.entity.callsign.clone())
            .collect();
        for cs in no_model {
            warn!(callsign = %cs, "pending entry without model string discarded");
            self.pending.take(&cs);
        }

        if self.registry.contains_pending_added() || !self.host.is_simulating() {
            return;
        }
        let already_scheduled: Vec<Callsign> = self
            .scheduler
            .pending()
            .filter_map(|t| match t {
                Deferred::AddEntity { entity, .. } => Some(entity.callsign.clone()),
                _ => None,
            })
            .collect();
        let Some(oldest) = self
            .pending
            .iter()
            .filter(|e| !already_scheduled.contains(&e.entity.callsign))
            .min_by_key(|e| (e.since, e.entity.callsign.clone()))
            .cloned()
        else {
            return;
        };

        let entity = if oldest.entity.is_terrain_probe() {
            oldest.entity
        } else {
            self.roster.entity(&oldest.entity.callsign).unwrap_or(oldest.entity)
        };
        debug!(callsign = %entity.callsign, mode = mode.as_str(), "adding pending entity");
        self.scheduler.schedule(
            now,
            self.config.pending_add_delay_ms,
            Deferred::AddEntity { entity, mode, counters: oldest.counters },
        );
    }
}
