//! Deferred verification, send-id tracing and registry consistency checks.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use traffic_model::Callsign;

use host_protocol::{ObjectId, RequestId, SendId};

use crate::engine::SyncEngine;
use crate::registry::{FailureCounters, ProxyKind};
use crate::roster::RemoteAircraftProvider;
use crate::scheduler::{AddMode, Deferred, Millis};

// ── Send-id traces ────────────────────────────────────────────────────────────

/// What an outbound packet was about, so a later exception carrying only
/// the send id can be attributed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub send_id: SendId,
    pub callsign: Callsign,
    pub object_id: Option<ObjectId>,
    pub request_id: RequestId,
    pub comment: String,
}

/// Bounded ring buffer of recent traces, most recent first.
#[derive(Debug)]
pub struct SendIdTraces {
    entries: VecDeque<TraceEntry>,
    capacity: usize,
    enabled: bool,
    auto_until: Option<Millis>,
}

impl SendIdTraces {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        SendIdTraces { entries: VecDeque::with_capacity(capacity), capacity, enabled, auto_until: None }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.auto_until = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Trace everything until `now + window_ms`.
    pub fn enable_auto(&mut self, now: Millis, window_ms: Millis) {
        self.auto_until = Some(now.saturating_add(window_ms));
    }

    pub fn is_active(&self, now: Millis) -> bool {
        self.enabled || self.auto_until.is_some_and(|until| now < until)
    }

    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn find(&self, send_id: SendId) -> Option<&TraceEntry> {
        self.entries.iter().find(|e| e.send_id == send_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
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

// ── Consistency ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    MissingCallsign { request_id: RequestId },
    ConfirmedWithoutObjectId { callsign: Callsign },
    DuplicateObjectId { object_id: ObjectId, callsigns: Vec<Callsign> },
    MultiplePendingAdded { callsigns: Vec<Callsign> },
    PendingAlsoLive { callsign: Callsign },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::MissingCallsign { request_id } => write!(f, "proxy for request {request_id} has no callsign"),
            Inconsistency::ConfirmedWithoutObjectId { callsign } => {
                write!(f, "{callsign} is confirmed without object id")
            }
            Inconsistency::DuplicateObjectId { object_id, callsigns } => {
                write!(f, "object id {object_id} used by {callsigns:?}")
            }
            Inconsistency::MultiplePendingAdded { callsigns } => {
                write!(f, "more than one creation in flight: {callsigns:?}")
            }
            Inconsistency::PendingAlsoLive { callsign } => write!(f, "{callsign} is both pending and live"),
        }
    }
}

impl<R: RemoteAircraftProvider> SyncEngine<R> {
    /// Re-check a proxy some time after its confirmation.
    pub(crate) fn verify_added(&mut self, cs: &Callsign, object_id: ObjectId, now: Millis) {
        self.check_added(cs, object_id, now);
        if !self.pending.is_empty() {
            self.add_pending(AddMode::AfterAdded, now);
        }
    }

    fn check_added(&mut self, cs: &Callsign, object_id: ObjectId, now: Millis) {
        let replacement_queued = self.pending.contains(cs)
            || self.add_again.contains_key(cs)
            || self.scheduler.pending().any(|t| matches!(t, Deferred::AddEntity { entity, .. } if entity.callsign == *cs));

        let Some(proxy) = self.registry.by_callsign(cs) else {
            if replacement_queued {
                debug!(callsign = %cs, object_id, "proxy replaced before verification");
            } else if let Some(entity) = self.roster.entity(cs).filter(|_| self.roster.is_in_range(cs)) {
                let reason = "proxy vanished before verification";
                self.verification_failed(cs, &entity.model.model_string, object_id, reason);
                self.adding_failed(entity, FailureCounters::default(), reason, now);
            } else {
                self.pending.take(cs);
                self.add_again.remove(cs);
            }
            return;
        };

        if !proxy.has_valid_ids() || proxy.is_pending_removed() || proxy.object_id() != Some(object_id) {
            if replacement_queued || proxy.is_pending_removed() {
                return;
            }
            let reason = "proxy invalid at verification";
            let model = proxy.model_string().to_string();
            self.verification_failed(cs, &model, object_id, reason);
            if let Some(proxy) = self.registry.remove(cs) {
                if let Some(stale) = proxy.object_id() {
                    let request_id = self.request_ids.next_aircraft();
                    let result = self.host.remove_object(stale, request_id);
                    self.traced(result, cs, Some(stale), request_id, "remove unverified object", now);
                }
                self.roster.set_rendered(cs, false);
                self.adding_failed(proxy.entity, proxy.counters, reason, now);
            }
            return;
        }

        let kind = proxy.kind();
        debug!(callsign = %cs, object_id, "proxy verified");
        if kind == ProxyKind::AircraftSimulatedObject {
            self.registry.modify(cs, now, |p| {
                p.counters.adding_exceptions = p.counters.adding_exceptions.saturating_sub(1);
            });
            if let Some(counters) = self.registry.by_callsign(cs).map(|p| p.counters) {
                self.failure_history.insert(cs.clone(), counters);
            }
            self.traces.enable_auto(now, self.config.auto_trace_ms);
        }
        if kind.is_aircraft() {
            if let Some(parts) = self.roster.entity(cs).and_then(|e| e.parts) {
                self.update_parts(cs, object_id, &parts, true, now);
            }
        }
    }

    fn verification_failed(&mut self, cs: &Callsign, model: &str, object_id: ObjectId, reason: &str) {
        warn!(callsign = %cs, object_id, reason, "verification failed");
        self.stats.verification_failures += 1;
        self.report(cs, model, reason, false);
    }

    /// Check the registry invariants. Violations are logged and returned.
    pub fn check_consistency(&self) -> Vec<Inconsistency> {
        let mut issues = Vec::new();
        let mut by_object: BTreeMap<ObjectId, Vec<Callsign>> = BTreeMap::new();

        for proxy in self.registry.iter() {
            if proxy.callsign().is_empty() {
                issues.push(Inconsistency::MissingCallsign { request_id: proxy.request_id() });
            }
            if proxy.is_confirmed_added() && proxy.object_id().is_none() {
                issues.push(Inconsistency::ConfirmedWithoutObjectId { callsign: proxy.callsign().clone() });
            }
            if let Some(object_id) = proxy.object_id() {
                by_object.entry(object_id).or_default().push(proxy.callsign().clone());
            }
            if self.pending.contains(proxy.callsign()) {
                issues.push(Inconsistency::PendingAlsoLive { callsign: proxy.callsign().clone() });
            }
        }
        for (object_id, callsigns) in by_object {
            if callsigns.len() > 1 {
                issues.push(Inconsistency::DuplicateObjectId { object_id, callsigns });
            }
        }
        if self.registry.count_pending_added() > 1 {
            issues.push(Inconsistency::MultiplePendingAdded { callsigns: self.registry.pending_added_callsigns() });
        }

        for issue in &issues {
            warn!(%issue, "registry inconsistency");
        }
        issues
    }

    /// Record the creation for `callsign` regardless of the tracing switch.
    pub(crate) fn trace_creation(&mut self, send_id: SendId, cs: &Callsign, request_id: RequestId) {
        self.traces.record(TraceEntry {
            send_id,
            callsign: cs.clone(),
            object_id: None,
            request_id,
            comment: "create".to_string(),
        });
    }

    /// Traces touching `callsign`, most recent first.
    pub fn traces_for(&self, cs: &Callsign) -> Vec<&TraceEntry> {
        self.traces.iter().filter(|t| t.callsign == *cs).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::fixtures::*;
    use host_protocol::{HostEvent, HostException, HostRequest};
    use traffic_model::{Lights, Parts};

    fn make_trace(send_id: SendId, cs: &str) -> TraceEntry {
        TraceEntry { send_id, callsign: Callsign::new(cs), object_id: None, request_id: 1000, comment: "create".into() }
    }

    #[test]
    fn trace_buffer_is_bounded_and_most_recent_first() {
        let mut traces = SendIdTraces::new(3, true);
        for id in 1..=5 {
            traces.record(make_trace(id, "DLH400"));
        }
        let ids: Vec<_> = traces.iter().map(|t| t.send_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert!(traces.find(1).is_none());
        assert_eq!(traces.find(4).map(|t| t.send_id), Some(4));
    }

    #[test]
    fn auto_tracing_expires() {
        let mut traces = SendIdTraces::new(10, false);
        assert!(!traces.is_active(0));
        traces.enable_auto(100, 60_000);
        assert!(traces.is_active(100));
        assert!(traces.is_active(60_099));
        assert!(!traces.is_active(60_100));
    }

    #[test]
    fn creations_are_traced_even_when_tracing_is_off() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        assert!(!engine.send_id_traces().is_enabled());
        engine.add_remote_aircraft(&cs, 0);

        let (send_id, _) = mock.creations()[0].clone();
        let trace = engine.send_id_traces().find(send_id).unwrap();
        assert_eq!(trace.callsign, cs);
        assert_eq!(engine.traces_for(&cs).len(), 1);
    }

    #[test]
    fn enabled_tracing_records_every_call() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        engine.set_tracing_send_id(true);
        engine.add_remote_aircraft(&Callsign::new("DLH400"), 0);
        confirm_last(&mut engine, &mock, 42, 10);
        assert_eq!(engine.send_id_traces().len(), mock.sent().len());
    }

    #[test]
    fn verification_pushes_initial_parts() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        let parts = Parts { gear_down: true, lights: Lights { nav: true, ..Lights::default() }, ..Parts::default() };
        engine.roster_mut().set_parts(&cs, parts);
        engine.add_remote_aircraft(&cs, 0);
        confirm_last(&mut engine, &mock, 42, 10);
        mock.clear();

        engine.verify_added(&cs, 42, 1010);
        assert_eq!(mock.count("set_parts"), 1);
        assert!(mock.events_for(42).contains(&host_protocol::ClientEvent::ToggleNavLights));
        assert_eq!(engine.stats().verification_failures, 0);
    }

    #[test]
    fn vanished_proxy_fails_verification() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        engine.add_remote_aircraft(&cs, 0);
        confirm_last(&mut engine, &mock, 42, 10);
        engine.registry.remove(&cs);

        engine.verify_added(&cs, 42, 1010);
        assert_eq!(engine.stats().verification_failures, 1);
        assert_eq!(engine.stats().creation_failures, 1);
        assert_eq!(engine.failure_counters(&cs).adding_exceptions, 1);
        assert!(engine.scheduler().pending().any(|t| matches!(t, Deferred::Requeue { .. })));
        let failures = engine.roster().failures();
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].is_final);
    }

    #[test]
    fn object_id_mismatch_fails_verification() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        engine.add_remote_aircraft(&cs, 0);
        confirm_last(&mut engine, &mock, 42, 10);
        mock.clear();

        engine.verify_added(&cs, 41, 1010);
        assert_eq!(engine.stats().verification_failures, 1);
        assert_eq!(engine.failure_counters(&cs).adding_exceptions, 1);
        assert!(engine.registry().by_callsign(&cs).is_none());
        assert!(!engine.roster().is_rendered(&cs));
        assert!(matches!(&mock.requests_for(42)[..], [HostRequest::RemoveObject { object_id: 42, .. }]));
        assert!(engine.scheduler().pending().any(|t| matches!(t, Deferred::Requeue { .. })));
    }

    #[test]
    fn repeated_verification_failures_disable_the_aircraft() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        let mut now = 0;
        for attempt in 0..3 {
            assert!(engine.add_remote_aircraft(&cs, now), "attempt {attempt}");
            confirm_last(&mut engine, &mock, 42 + attempt, now + 10);
            engine.verify_added(&cs, 999, now + 20);
            now += 100;
        }

        assert_eq!(mock.creations().len(), 3);
        assert_eq!(mock.count("remove_object"), 3);
        assert!(!engine.roster().is_enabled(&cs));
        assert_eq!(engine.roster().final_failures().count(), 1);

        assert!(!engine.add_remote_aircraft(&cs, now));
        assert_eq!(mock.creations().len(), 3);
    }

    #[test]
    fn host_removal_cancels_pending_verification() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        engine.add_remote_aircraft(&cs, 0);
        confirm_last(&mut engine, &mock, 42, 10);
        engine.handle_host_event(HostEvent::ObjectRemoved { object_id: 42 }, 20);

        // re-created right away, still waiting for its object id
        assert!(engine.add_remote_aircraft(&cs, 30));
        engine.tick(10 + engine.config().verify_delay());

        assert_eq!(engine.stats().verification_failures, 0);
        assert!(engine.registry().by_callsign(&cs).unwrap().is_pending_added());
        assert_eq!(engine.failure_counters(&cs).adding_exceptions, 0);
    }

    #[test]
    fn simulated_object_verification_enables_auto_trace() {
        let config = EngineConfig { add_as_simulated_object: true, ..EngineConfig::default() };
        let (mut engine, mock) = make_engine_with(config, &[make_entity("DLH400", "A320")]);
        let cs = Callsign::new("DLH400");
        engine.add_remote_aircraft(&cs, 0);
        let (send_id, _) = mock.creations()[0].clone();
        engine.handle_host_event(
            HostEvent::Exception { send_id, exception: HostException::CreateObjectFailed, index: 0 },
            5,
        );
        engine.tick(2005);
        engine.tick(2105);
        confirm_last(&mut engine, &mock, 42, 2200);
        assert!(!engine.send_id_traces().is_active(2200));

        engine.tick(2200 + engine.config().verify_delay());
        assert!(engine.send_id_traces().is_active(3300));
        assert_eq!(engine.registry().by_callsign(&cs).unwrap().counters().adding_exceptions, 0);
    }

    #[test]
    fn consistency_flags_duplicate_ids_and_double_pending() {
        let (mut engine, mock) = make_engine(&[make_entity("DLH400", "A320"), make_entity("AFR12", "A320")]);
        engine.add_remote_aircraft(&Callsign::new("DLH400"), 0);
        confirm_last(&mut engine, &mock, 42, 10);
        engine.add_remote_aircraft(&Callsign::new("AFR12"), 20);
        confirm_last(&mut engine, &mock, 43, 30);
        assert!(engine.check_consistency().is_empty());

        engine.registry.modify(&Callsign::new("AFR12"), 40, |p| p.object_id = Some(42));
        let issues = engine.check_consistency();
        assert!(matches!(&issues[..], [Inconsistency::DuplicateObjectId { object_id: 42, .. }]));

        engine.registry.modify(&Callsign::new("AFR12"), 50, |p| {
            p.object_id = None;
            p.state = crate::registry::ProxyState::PendingAdded;
        });
        engine.registry.modify(&Callsign::new("DLH400"), 50, |p| p.state = crate::registry::ProxyState::PendingAdded);
        let issues = engine.check_consistency();
        assert!(issues.iter().any(|i| matches!(i, Inconsistency::MultiplePendingAdded { callsigns } if callsigns.len() == 2)));
    }
}
