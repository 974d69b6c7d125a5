//! `SyncEngine`: owns every piece of synchronization state.
//!
//! The engine is driven entirely from the outside. The caller pushes host
//! events through [`SyncEngine::handle_host_event`] and calls
//! [`SyncEngine::tick`] on its update cadence with the current time. Work that
//! must not run inside an event handler goes through the [`Scheduler`].
//!
//! Behaviour is split over several files, each adding an `impl` block:
//! `lifecycle` (add/remove/failures), `dispatcher` (position and parts
//! writes), `diagnostics` (verification, send-id traces, consistency).

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};
use traffic_model::{Callsign, Entity};

use host_protocol::{HostEvent, ObjectId, RequestId, SendId};

use crate::config::EngineConfig;
use crate::diagnostics::{SendIdTraces, TraceEntry};
use crate::error::{ConfigError, HostError};
use crate::host_shim::HostChannel;
use crate::registry::{FailureCounters, PendingQueue, ProxyRegistry, RequestIdAllocator};
use crate::roster::{FailureReport, RemoteAircraftProvider};
use crate::scheduler::{AddMode, Deferred, Millis, Scheduler};

/// Counters for the replay summary and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub creations: u64,
    pub creation_failures: u64,
    pub confirmations: u64,
    pub removals: u64,
    pub unsolicited_removals: u64,
    pub position_writes: u64,
    pub parts_writes: u64,
    pub verification_failures: u64,
    pub disabled: u64,
}

pub struct SyncEngine<R: RemoteAircraftProvider> {
    pub(crate) config: EngineConfig,
    pub(crate) host: Box<dyn HostChannel>,
    pub(crate) roster: R,

    pub(crate) registry: ProxyRegistry,
    pub(crate) pending: PendingQueue,
    /// Entities whose model changed, re-added once the old proxy is gone.
    pub(crate) add_again: BTreeMap<Callsign, Entity>,
    /// Failure counters per callsign. Survives proxy removal and queued
    /// retries, so every creation attempt starts from the full history.
    pub(crate) failure_history: BTreeMap<Callsign, FailureCounters>,

    pub(crate) scheduler: Scheduler,
    pub(crate) request_ids: RequestIdAllocator,
    pub(crate) traces: SendIdTraces,
    pub(crate) stats: EngineStats,

    /// Dispatcher passes since the roster last had in-range aircraft.
    pub(crate) runs: u64,
    pub(crate) update_all: bool,
    pub(crate) next_pending_pass: Millis,
    connected: bool,
}

impl<R: RemoteAircraftProvider> SyncEngine<R> {
    pub fn new(config: EngineConfig, host: Box<dyn HostChannel>, roster: R) -> Result<Self, ConfigError> {
        config.validate()?;
        let traces = SendIdTraces::new(config.send_id_trace_capacity, config.trace_send_ids);
        Ok(SyncEngine {
            config,
            host,
            roster,
            registry: ProxyRegistry::new(),
            pending: PendingQueue::new(),
            add_again: BTreeMap::new(),
            failure_history: BTreeMap::new(),
            scheduler: Scheduler::new(),
            request_ids: RequestIdAllocator::new(),
            traces,
            stats: EngineStats::default(),
            runs: 0,
            update_all: false,
            next_pending_pass: 0,
            connected: false,
        })
    }

    // ── Connection ────────────────────────────────────────────────────────────

    pub fn connect(&mut self, now: Millis) -> Result<(), HostError> {
        self.host.open()?;
        self.connected = true;
        self.next_pending_pass = now.saturating_add(self.config.add_pending_interval_ms);
        info!(flavor = ?self.config.host_flavor, "host channel connected");
        Ok(())
    }

    /// Drop all proxies and queued work and close the host channel.
    pub fn disconnect(&mut self) {
        for cs in self.registry.callsigns() {
            self.roster.set_rendered(&cs, false);
        }
        self.registry.clear();
        self.pending.clear();
        self.add_again.clear();
        self.failure_history.clear();
        self.scheduler.clear();
        self.runs = 0;
        if self.connected {
            self.host.close();
            self.connected = false;
            info!("host channel disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn roster(&self) -> &R {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut R {
        &mut self.roster
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn add_again_callsigns(&self) -> Vec<Callsign> {
        self.add_again.keys().cloned().collect()
    }

    /// Accumulated failures for `callsign`, zero when it never failed.
    pub fn failure_counters(&self, callsign: &Callsign) -> FailureCounters {
        self.failure_history.get(callsign).copied().unwrap_or_default()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn send_id_traces(&self) -> &SendIdTraces {
        &self.traces
    }

    pub fn set_tracing_send_id(&mut self, enabled: bool) {
        self.traces.set_enabled(enabled);
    }

    /// Force a full position and parts write on the next tick.
    pub fn request_update_all(&mut self) {
        self.update_all = true;
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Run due deferred work, the periodic pending/reconcile pass and one
    /// dispatcher pass.
    pub fn tick(&mut self, now: Millis) {
        if !self.connected {
            return;
        }
        while let Some(task) = self.scheduler.pop_due(now) {
            self.run_deferred(task, now);
        }
        if now >= self.next_pending_pass {
            self.next_pending_pass = now.saturating_add(self.config.add_pending_interval_ms);
            self.reap_outdated_pending(now);
            self.add_pending(AddMode::ByTimer, now);
            self.reconcile(now);
        }
        self.update_remote_aircraft(now);
    }

    pub fn handle_host_event(&mut self, event: HostEvent, now: Millis) {
        match event {
            HostEvent::ObjectIdAssigned { request_id, object_id } => {
                self.on_object_id_assigned(request_id, object_id, now)
            }
            HostEvent::ObjectRemoved { object_id } => self.on_object_removed(object_id, now),
            HostEvent::Exception { send_id, exception, index } => {
                self.on_exception(send_id, exception, index, now)
            }
            HostEvent::PositionData { object_id, data } => self.on_position_data(object_id, data, now),
            HostEvent::LightsData { object_id, lights } => self.on_lights_data(object_id, lights, now),
            HostEvent::ModelData { object_id, title, livery, cg_to_ground_ft } => {
                self.on_model_data(object_id, title, livery, cg_to_ground_ft, now)
            }
            HostEvent::Quit => {
                info!("host quit");
                self.disconnect();
            }
        }
    }

    fn run_deferred(&mut self, task: Deferred, now: Millis) {
        match task {
            Deferred::VerifyAdded { callsign, object_id } => self.verify_added(&callsign, object_id, now),
            Deferred::AddEntity { entity, mode, counters } => {
                self.physically_add(entity, mode, counters, now);
            }
            Deferred::Requeue { entity, counters } => {
                if self.registry.contains(&entity.callsign) {
                    debug!(callsign = %entity.callsign, "already live again, not re-queued");
                    return;
                }
                if !self.roster.entity(&entity.callsign).is_some_and(|e| e.enabled) {
                    debug!(callsign = %entity.callsign, "disabled or gone, not re-queued");
                    return;
                }
                debug!(callsign = %entity.callsign, "re-queued after failure");
                self.pending.park(entity, counters, now);
                self.add_pending(AddMode::ByTimer, now);
            }
            Deferred::RetryRemoval { callsign } => self.retry_removal(&callsign, now),
            Deferred::ResendLights { callsign, lights } => self.resend_lights(&callsign, lights, now),
        }
    }

    // ── Helpers shared by the impl blocks ─────────────────────────────────────

    /// Log a refused call, or trace an accepted one when tracing is active.
    /// Returns whether the host accepted the call.
    pub(crate) fn traced(
        &mut self,
        result: Result<SendId, HostError>,
        callsign: &Callsign,
        object_id: Option<ObjectId>,
        request_id: RequestId,
        comment: &str,
        now: Millis,
    ) -> bool {
        match result {
            Ok(send_id) => {
                if self.traces.is_active(now) {
                    self.traces.record(TraceEntry {
                        send_id,
                        callsign: callsign.clone(),
                        object_id,
                        request_id,
                        comment: comment.to_string(),
                    });
                }
                true
            }
            Err(err) => {
                warn!(callsign = %callsign, ?object_id, request_id, error = %err, "{comment} failed");
                false
            }
        }
    }

    pub(crate) fn report(&mut self, callsign: &Callsign, model: &str, reason: &str, is_final: bool) {
        self.roster.report_failure(FailureReport {
            callsign: callsign.clone(),
            model: model.to_string(),
            reason: reason.to_string(),
            is_final,
        });
    }

    /// Stop retrying an entity for good.
    pub(crate) fn disable(&mut self, callsign: &Callsign, model: &str, reason: &str) {
        warn!(callsign = %callsign, model, reason, "disabling aircraft");
        self.pending.take(callsign);
        self.add_again.remove(callsign);
        self.roster.set_enabled(callsign, false);
        self.roster.set_rendered(callsign, false);
        self.stats.disabled += 1;
        self.report(callsign, model, reason, true);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use traffic_model::{AircraftModel, Entity, Lights, Situation};

    use host_protocol::{HostEvent, HostRequest, ObjectId};

    use super::SyncEngine;
    use crate::config::EngineConfig;
    use crate::host_shim::{HostChannel, MockHost};
    use crate::roster::InMemoryRoster;

    pub(crate) type TestEngine = SyncEngine<InMemoryRoster>;

    pub(crate) fn make_situation(lat: f64, lon: f64, alt: f64) -> Situation {
        Situation {
            latitude_deg: lat,
            longitude_deg: lon,
            altitude_ft: Some(alt),
            heading_deg: 250.0,
            ground_speed_kts: 140.0,
            on_ground: Some(false),
            ..Situation::default()
        }
    }

    pub(crate) fn make_entity(cs: &str, model: &str) -> Entity {
        Entity::aircraft(cs, AircraftModel::new(model, ""), make_situation(50.03, 8.57, 3000.0))
    }

    pub(crate) fn make_engine_with(config: EngineConfig, entities: &[Entity]) -> (TestEngine, MockHost) {
        let mock = MockHost::new();
        let mut roster = InMemoryRoster::new();
        for e in entities {
            roster.upsert(e.clone());
        }
        let host: Box<dyn HostChannel> = Box::new(mock.clone());
        let mut engine = SyncEngine::new(config, host, roster).unwrap();
        engine.connect(0).unwrap();
        (engine, mock)
    }

    pub(crate) fn make_engine(entities: &[Entity]) -> (TestEngine, MockHost) {
        make_engine_with(EngineConfig::default(), entities)
    }

    /// Request id of the most recent creation request.
    pub(crate) fn last_creation_request_id(mock: &MockHost) -> u32 {
        match mock.creations().last().map(|(_, r)| r.clone()) {
            Some(HostRequest::CreateAircraft { request_id, .. })
            | Some(HostRequest::CreateSimulatedObject { request_id, .. }) => request_id,
            other => panic!("no creation recorded: {other:?}"),
        }
    }

    /// Complete the last creation with `object_id` and deliver host lights.
    pub(crate) fn confirm_last(engine: &mut TestEngine, mock: &MockHost, object_id: ObjectId, now: u64) {
        let request_id = last_creation_request_id(mock);
        engine.handle_host_event(HostEvent::ObjectIdAssigned { request_id, object_id }, now);
        engine.handle_host_event(HostEvent::LightsData { object_id, lights: Lights::default() }, now);
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;
    use traffic_model::Lights;

    use host_protocol::{ClientEvent, DataKind, DataPeriod, HostException, HostRequest};

    use crate::host_shim::MockHost;
    use crate::roster::InMemoryRoster;

    #[test]
    fn dlh400_full_lifecycle() {
        let entity = make_entity("DLH400", "A320");
        let (mut engine, mock) = make_engine(&[entity]);
        let cs = Callsign::new("DLH400");

        assert!(engine.add_remote_aircraft(&cs, 0));
        assert_eq!(mock.creations().len(), 1);
        assert!(engine.registry().by_callsign(&cs).unwrap().is_pending_added());

        let request_id = last_creation_request_id(&mock);
        engine.handle_host_event(HostEvent::ObjectIdAssigned { request_id, object_id: 42 }, 10);

        let proxy = engine.registry().by_callsign(&cs).unwrap();
        assert!(proxy.is_confirmed_added());
        assert_eq!(proxy.object_id(), Some(42));
        assert!(engine.roster().is_rendered(&cs));

        let to_42 = mock.requests_for(42);
        assert!(matches!(to_42[0], HostRequest::ReleaseControl { object_id: 42, .. }));
        let events = mock.events_for(42);
        assert!(events.contains(&ClientEvent::FreezeLatLng(true)));
        assert!(events.contains(&ClientEvent::FreezeAltitude(true)));
        assert!(events.contains(&ClientEvent::FreezeAttitude(true)));
        assert!(to_42.iter().any(|r| matches!(
            r,
            HostRequest::RequestData { kind: DataKind::Position, period: DataPeriod::Second, .. }
        )));

        // Lights arrive, the aircraft leaves the roster.
        engine.handle_host_event(HostEvent::LightsData { object_id: 42, lights: Lights::default() }, 20);
        engine.roster_mut().remove(&cs);
        assert!(engine.remove_remote_aircraft(&cs, 30));

        let proxy = engine.registry().by_callsign(&cs).unwrap();
        assert!(proxy.is_pending_removed());
        let tail: Vec<_> = mock.requests_for(42).into_iter().rev().take(3).collect();
        assert!(matches!(tail[0], HostRequest::RemoveObject { object_id: 42, .. }));
        assert!(tail[1..].iter().all(|r| matches!(r, HostRequest::RequestData { period: DataPeriod::Never, .. })));

        engine.handle_host_event(HostEvent::ObjectRemoved { object_id: 42 }, 40);
        assert!(engine.registry().is_empty());
        assert!(!engine.roster().is_rendered(&cs));
        assert!(engine.check_consistency().is_empty());
    }

    #[test]
    fn baw123_disabled_after_three_failures() {
        let entity = make_entity("BAW123", "B744");
        let (mut engine, mock) = make_engine(&[entity]);
        let cs = Callsign::new("BAW123");

        engine.add_remote_aircraft(&cs, 0);
        let mut now = 0;
        for attempt in 1..=3 {
            let creations = mock.creations();
            assert_eq!(creations.len(), attempt, "attempt {attempt}");
            let (send_id, _) = creations.last().cloned().unwrap();
            engine.handle_host_event(
                HostEvent::Exception { send_id, exception: HostException::CreateObjectFailed, index: 0 },
                now,
            );
            assert!(engine.registry().by_callsign(&cs).is_none());

            // retry delay, then the pending-add delay
            for _ in 0..30 {
                now += 100;
                engine.tick(now);
            }
        }

        assert_eq!(mock.creations().len(), 3);
        assert!(!engine.roster().is_enabled(&cs));
        let finals: Vec<_> = engine.roster().final_failures().collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].callsign, cs);
        assert!(engine.pending().is_empty());
        assert_eq!(engine.stats().creation_failures, 3);

        // a fourth "in range" event for a disabled aircraft creates nothing
        assert!(!engine.add_remote_aircraft(&cs, now));
        assert_eq!(engine.add_all_in_range(now), 0);
        for _ in 0..30 {
            now += 100;
            engine.tick(now);
        }
        assert_eq!(mock.creations().len(), 3);
    }

    #[test]
    fn roster_events_between_failures_keep_counting() {
        let entity = make_entity("BAW123", "B744");
        let (mut engine, mock) = make_engine(&[entity]);
        let cs = Callsign::new("BAW123");

        engine.add_remote_aircraft(&cs, 0);
        let mut now = 0;
        for _ in 0..6 {
            let (send_id, _) = mock.creations().last().cloned().unwrap();
            engine.handle_host_event(
                HostEvent::Exception { send_id, exception: HostException::CreateObjectFailed, index: 0 },
                now,
            );
            // the roster offers the aircraft again inside the retry delay
            now += 10;
            engine.add_remote_aircraft(&cs, now);
        }
        for _ in 0..50 {
            now += 100;
            engine.tick(now);
        }

        assert_eq!(mock.creations().len(), 3);
        assert!(!engine.roster().is_enabled(&cs));
        assert_eq!(engine.roster().final_failures().count(), 1);
        assert_eq!(engine.failure_counters(&cs).adding_exceptions, 3);
        assert!(engine.pending().is_empty());
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn quit_clears_everything() {
        let (mut engine, mock) = make_engine(&[make_entity("AFR12", "A320")]);
        let cs = Callsign::new("AFR12");
        engine.add_remote_aircraft(&cs, 0);
        confirm_last(&mut engine, &mock, 7, 5);
        assert!(engine.roster().is_rendered(&cs));

        engine.handle_host_event(HostEvent::Quit, 10);
        assert!(!engine.is_connected());
        assert!(engine.registry().is_empty());
        assert!(engine.scheduler().is_empty());
        assert!(!engine.roster().is_rendered(&cs));
        assert!(!mock.is_open());
    }

    #[test]
    fn ticks_before_connect_do_nothing() {
        let mock = MockHost::new();
        let roster = InMemoryRoster::new();
        let mut engine = SyncEngine::new(EngineConfig::default(), Box::new(mock.clone()), roster).unwrap();
        engine.tick(10_000);
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig { full_refresh_ticks: 0, ..EngineConfig::default() };
        let roster = InMemoryRoster::new();
        let result = SyncEngine::new(config, Box::new(MockHost::new()), roster);
        assert!(matches!(result, Err(ConfigError::Zero { field: "full_refresh_ticks" })));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
        Complete,
        HostRemoved(u32),
        Fail,
        Tick(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..4).prop_map(Op::Add),
            (0usize..4).prop_map(Op::Remove),
            Just(Op::Complete),
            (1u32..6).prop_map(Op::HostRemoved),
            Just(Op::Fail),
            (1u64..3000).prop_map(Op::Tick),
        ]
    }

    proptest! {
        /// Under arbitrary churn no callsign is ever live twice, object ids
        /// stay unique, and confirmed proxies always carry an object id.
        #[test]
        fn prop_registry_stays_consistent(ops in proptest::collection::vec(op(), 1..60)) {
            let names = ["DLH400", "BAW123", "AFR12", "KLM7"];
            let entities: Vec<_> = names.iter().map(|n| make_entity(n, "A320")).collect();
            let (mut engine, mock) = make_engine(&entities);
            let mut now = 0;
            let mut next_object = 100;

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let cs = Callsign::new(names[i]);
                        if engine.roster().entity(&cs).is_none() {
                            engine.roster_mut().upsert(entities[i].clone());
                        }
                        engine.add_remote_aircraft(&cs, now);
                    }
                    Op::Remove(i) => {
                        let cs = Callsign::new(names[i]);
                        engine.roster_mut().remove(&cs);
                        engine.remove_remote_aircraft(&cs, now);
                    }
                    Op::Complete => {
                        let pending: Vec<_> = engine.registry().iter()
                            .filter(|p| p.is_pending_added() && p.object_id().is_none())
                            .map(|p| p.request_id())
                            .collect();
                        if let Some(request_id) = pending.first() {
                            next_object += 1;
                            engine.handle_host_event(
                                HostEvent::ObjectIdAssigned { request_id: *request_id, object_id: next_object }, now);
                            engine.handle_host_event(
                                HostEvent::LightsData { object_id: next_object, lights: Lights::default() }, now);
                        }
                    }
                    Op::HostRemoved(k) => {
                        engine.handle_host_event(HostEvent::ObjectRemoved { object_id: 100 + k }, now);
                    }
                    Op::Fail => {
                        if let Some((send_id, _)) = mock.creations().last().cloned() {
                            engine.handle_host_event(HostEvent::Exception {
                                send_id, exception: HostException::CreateObjectFailed, index: 0 }, now);
                        }
                    }
                    Op::Tick(dt) => {
                        now += dt;
                        engine.tick(now);
                    }
                }
                let issues = engine.check_consistency();
                prop_assert!(issues.is_empty(), "{:?}", issues);
            }
        }
    }
}
