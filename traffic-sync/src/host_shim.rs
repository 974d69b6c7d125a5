//! Host abstraction layer.
//!
//! Every simulator call goes through the `HostChannel` trait so the engine can
//! run against `MockHost` in tests and in the replay tool. A concrete host
//! transport implements `open`, `close`, `is_simulating` and `submit`; the
//! typed helpers are provided on top of `submit`.

use host_protocol::{
    ClientEvent, DataKind, DataPeriod, HostRequest, InitPosition, ObjectId, PartsPayload,
    RequestId, SendId,
};
use traffic_model::AircraftModel;

use crate::error::HostError;

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Outbound half of the host API. Calls return as soon as the request is
/// queued; completions come back as `HostEvent`s.
pub trait HostChannel: Send {
    fn open(&self) -> Result<(), HostError>;
    fn close(&self);
    fn is_open(&self) -> bool;
    /// `false` while the host is paused in a menu or loading a flight.
    fn is_simulating(&self) -> bool;
    fn submit(&self, request: HostRequest) -> Result<SendId, HostError>;

    fn create_aircraft(
        &self,
        model: &AircraftModel,
        callsign: &str,
        position: InitPosition,
        request_id: RequestId,
    ) -> Result<SendId, HostError> {
        self.submit(HostRequest::CreateAircraft {
            model: model.model_string.clone(),
            livery: model.livery.clone(),
            callsign: callsign.to_string(),
            position,
            request_id,
        })
    }

    fn create_simulated_object(
        &self,
        model: &AircraftModel,
        callsign: &str,
        position: InitPosition,
        request_id: RequestId,
    ) -> Result<SendId, HostError> {
        self.submit(HostRequest::CreateSimulatedObject {
            model: model.model_string.clone(),
            livery: model.livery.clone(),
            callsign: callsign.to_string(),
            position,
            request_id,
        })
    }

    fn remove_object(&self, object_id: ObjectId, request_id: RequestId) -> Result<SendId, HostError> {
        self.submit(HostRequest::RemoveObject { object_id, request_id })
    }

    fn release_control(&self, object_id: ObjectId, request_id: RequestId) -> Result<SendId, HostError> {
        self.submit(HostRequest::ReleaseControl { object_id, request_id })
    }

    fn write_position(&self, object_id: ObjectId, position: InitPosition) -> Result<SendId, HostError> {
        self.submit(HostRequest::SetPosition { object_id, position })
    }

    fn write_parts(&self, object_id: ObjectId, parts: PartsPayload) -> Result<SendId, HostError> {
        self.submit(HostRequest::SetParts { object_id, parts })
    }

    fn transmit_event(&self, object_id: ObjectId, event: ClientEvent) -> Result<SendId, HostError> {
        self.submit(HostRequest::Event { object_id, event })
    }

    fn request_data(
        &self,
        object_id: ObjectId,
        request_id: RequestId,
        kind: DataKind,
        period: DataPeriod,
    ) -> Result<SendId, HostError> {
        self.submit(HostRequest::RequestData { object_id, request_id, kind, period })
    }
}

// ── MockHost ──────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "mock_host"))]
pub use mock::MockHost;

#[cfg(any(test, feature = "mock_host"))]
mod mock {
    use std::sync::{Arc, Mutex};

    use host_protocol::{ClientEvent, HostRequest, ObjectId, SendId};

    use super::HostChannel;
    use crate::error::HostError;

    struct MockInner {
        open: bool,
        simulating: bool,
        next_send_id: SendId,
        /// every accepted request with the send id it got
        sent: Vec<(SendId, HostRequest)>,
        /// request names refused synchronously
        refused: Vec<&'static str>,
    }

    /// Test implementation: accepts everything, records each request.
    ///
    /// Clones share state, so a test can keep one handle while the engine
    /// owns another.
    #[derive(Clone)]
    pub struct MockHost {
        inner: Arc<Mutex<MockInner>>,
    }

    impl MockHost {
        pub fn new() -> Self {
            MockHost {
                inner: Arc::new(Mutex::new(MockInner {
                    open: false,
                    simulating: true,
                    next_send_id: 1,
                    sent: Vec::new(),
                    refused: Vec::new(),
                })),
            }
        }

        pub fn set_simulating(&self, simulating: bool) {
            self.inner.lock().unwrap().simulating = simulating;
        }

        /// Refuse (or stop refusing) every request with the given name.
        pub fn refuse(&self, request_name: &'static str, refuse: bool) {
            let mut g = self.inner.lock().unwrap();
            g.refused.retain(|r| *r != request_name);
            if refuse {
                g.refused.push(request_name);
            }
        }

        /// Snapshot of all accepted requests with their send ids.
        pub fn sent(&self) -> Vec<(SendId, HostRequest)> {
            self.inner.lock().unwrap().sent.clone()
        }

        pub fn requests(&self) -> Vec<HostRequest> {
            self.sent().into_iter().map(|(_, r)| r).collect()
        }

        /// Number of accepted requests with the given name.
        pub fn count(&self, request_name: &str) -> usize {
            self.inner
                .lock()
                .unwrap()
                .sent
                .iter()
                .filter(|(_, r)| r.name() == request_name)
                .count()
        }

        pub fn creations(&self) -> Vec<(SendId, HostRequest)> {
            self.sent().into_iter().filter(|(_, r)| r.is_creation()).collect()
        }

        pub fn requests_for(&self, object_id: ObjectId) -> Vec<HostRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.object_id() == Some(object_id))
                .collect()
        }

        pub fn events_for(&self, object_id: ObjectId) -> Vec<ClientEvent> {
            self.requests_for(object_id)
                .into_iter()
                .filter_map(|r| match r {
                    HostRequest::Event { event, .. } => Some(event),
                    _ => None,
                })
                .collect()
        }

        /// Drop the recorded log, keep settings.
        pub fn clear(&self) {
            self.inner.lock().unwrap().sent.clear();
        }

        /// Remove and return everything recorded so far.
        pub fn drain(&self) -> Vec<(SendId, HostRequest)> {
            std::mem::take(&mut self.inner.lock().unwrap().sent)
        }
    }

    impl Default for MockHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HostChannel for MockHost {
        fn open(&self) -> Result<(), HostError> {
            self.inner.lock().unwrap().open = true;
            Ok(())
        }

        fn close(&self) {
            self.inner.lock().unwrap().open = false;
        }

        fn is_open(&self) -> bool {
            self.inner.lock().unwrap().open
        }

        fn is_simulating(&self) -> bool {
            let g = self.inner.lock().unwrap();
            g.open && g.simulating
        }

        fn submit(&self, request: HostRequest) -> Result<SendId, HostError> {
            let mut g = self.inner.lock().unwrap();
            if !g.open {
                return Err(HostError::Closed);
            }
            let name = request.name();
            if g.refused.contains(&name) {
                return Err(HostError::Refused { request: name, reason: "refused by mock".into() });
            }
            let send_id = g.next_send_id;
            g.next_send_id += 1;
            g.sent.push((send_id, request));
            Ok(send_id)
        }
    }
}
