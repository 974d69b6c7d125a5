//! Keeps simulator-side proxy objects in step with a remote-aircraft roster.
//!
//! [`SyncEngine`] is single threaded and driven from outside: the caller
//! forwards host events, calls [`SyncEngine::tick`] on its update cadence and
//! tells the engine when roster entities appear or leave. All simulator calls
//! go through [`HostChannel`]; unit tests and the replay tool use `MockHost`.

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod host_shim;
mod lifecycle;
pub mod registry;
pub mod roster;
pub mod scheduler;

// ── Re-exports ────────────────────────────────────────────────────────────────

pub use config::{EngineConfig, HostFlavor};
pub use diagnostics::{Inconsistency, SendIdTraces, TraceEntry};
pub use dispatcher::{situation_to_init_position, AltitudeCorrection};
pub use engine::{EngineStats, SyncEngine};
pub use error::{ConfigError, HostError};
pub use host_shim::HostChannel;
#[cfg(any(test, feature = "mock_host"))]
pub use host_shim::MockHost;
pub use registry::{FailureCounters, PendingQueue, Proxy, ProxyKind, ProxyRegistry, ProxyState};
pub use roster::{FailureReport, InMemoryRoster, RemoteAircraftProvider};
pub use scheduler::{AddMode, Millis};
