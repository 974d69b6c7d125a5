// traffic-replay/src/main.rs
// Replays a recorded roster scenario through the sync engine against a mock
// host that answers like a simulator would, then prints a JSON summary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use host_protocol::{
    decode_lines, encode_line, DataKind, DataPeriod, HostEvent, HostException, HostRequest, InitPosition, ObjectId,
    PositionReport, SendId,
};
use traffic_model::{Callsign, Entity, Lights, Parts, Situation};
use traffic_sync::{
    EngineConfig, EngineStats, FailureReport, HostChannel, InMemoryRoster, Inconsistency, MockHost, ProxyKind,
    ProxyState, SyncEngine,
};

// ---------------------------------------------------------------------------
// CLI args
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "traffic-replay", about = "Replay a traffic scenario against a simulated host")]
struct Args {
    /// Scenario file, one JSON step per line
    #[arg(short, long)]
    scenario: PathBuf,

    /// Engine config (JSON); defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write every host request as a JSON line to this file
    #[arg(long)]
    host_log: Option<PathBuf>,

    /// Engine tick interval in milliseconds
    #[arg(long, default_value_t = 20)]
    tick_ms: u64,

    /// Keep running this long after the last step
    #[arg(long, default_value_t = 10_000)]
    tail_ms: u64,

    /// Terrain elevation reported by the simulated host
    #[arg(long, default_value_t = 0.0)]
    ground_elevation_ft: f64,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// First object id handed out by the simulated host.
const FIRST_OBJECT_ID: ObjectId = 100;
/// CG-to-ground distance reported for every model.
const CG_TO_GROUND_FT: f64 = 8.0;

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Step {
    at_ms: u64,
    #[serde(flatten)]
    action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    /// Entity enters the roster (or changes) and is offered to the engine.
    Upsert { entity: Entity },
    /// Entity leaves the roster.
    Leave { callsign: Callsign },
    Move { callsign: Callsign, situation: Situation },
    Parts { callsign: Callsign, parts: Parts },
    Probe { number: u32, latitude_deg: f64, longitude_deg: f64 },
    /// The host rejects the next `times` creations for this callsign.
    FailCreation { callsign: Callsign, times: u32 },
    /// The host drops the object on its own.
    HostRemove { callsign: Callsign },
    Simulating { on: bool },
    /// Raw event pushed to the engine as is.
    Event { event: HostEvent },
    UpdateAll,
}

fn load_scenario(path: &Path) -> Result<Vec<Step>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let mut steps: Vec<Step> =
        decode_lines(&text).with_context(|| format!("Invalid scenario {}", path.display()))?;
    anyhow::ensure!(!steps.is_empty(), "Scenario {} has no steps", path.display());
    steps.sort_by_key(|s| s.at_ms);
    Ok(steps)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    EngineConfig::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
}

// ---------------------------------------------------------------------------
// Simulated host
// ---------------------------------------------------------------------------

/// Answers drained requests with the events a simulator would send. Answers
/// are delivered on the following tick.
struct Responder {
    next_object_id: ObjectId,
    ground_elevation_ft: f64,
    failures: HashMap<Callsign, u32>,
    positions: HashMap<ObjectId, InitPosition>,
    models: HashMap<ObjectId, String>,
    live: BTreeSet<ObjectId>,
    outbox: Vec<HostEvent>,
}

impl Responder {
    fn new(ground_elevation_ft: f64) -> Self {
        Responder {
            next_object_id: FIRST_OBJECT_ID,
            ground_elevation_ft,
            failures: HashMap::new(),
            positions: HashMap::new(),
            models: HashMap::new(),
            live: BTreeSet::new(),
            outbox: Vec::new(),
        }
    }

    fn fail_next(&mut self, callsign: Callsign, times: u32) {
        self.failures.insert(callsign, times);
    }

    fn answer(&mut self, send_id: SendId, request: &HostRequest) {
        match request {
            HostRequest::CreateAircraft { callsign, position, request_id, model, .. }
            | HostRequest::CreateSimulatedObject { callsign, position, request_id, model, .. } => {
                let cs = Callsign::new(callsign);
                if let Some(left) = self.failures.get_mut(&cs).filter(|n| **n > 0) {
                    *left -= 1;
                    self.outbox.push(HostEvent::Exception {
                        send_id,
                        exception: HostException::CreateObjectFailed,
                        index: 0,
                    });
                    return;
                }
                let object_id = self.next_object_id;
                self.next_object_id += 1;
                self.positions.insert(object_id, *position);
                self.models.insert(object_id, model.clone());
                self.live.insert(object_id);
                self.outbox.push(HostEvent::ObjectIdAssigned { request_id: *request_id, object_id });
            }
            HostRequest::RemoveObject { object_id, .. } => {
                if self.live.remove(object_id) {
                    self.positions.remove(object_id);
                    self.models.remove(object_id);
                    self.outbox.push(HostEvent::ObjectRemoved { object_id: *object_id });
                }
            }
            HostRequest::SetPosition { object_id, position } => {
                self.positions.insert(*object_id, *position);
            }
            HostRequest::RequestData { object_id, kind: DataKind::Lights, period, .. }
                if *period != DataPeriod::Never && self.live.contains(object_id) =>
            {
                self.outbox.push(HostEvent::LightsData { object_id: *object_id, lights: Lights::default() });
            }
            HostRequest::RequestData { object_id, kind: DataKind::Model, period, .. } if *period != DataPeriod::Never => {
                if let Some(title) = self.models.get(object_id) {
                    self.outbox.push(HostEvent::ModelData {
                        object_id: *object_id,
                        title: title.clone(),
                        livery: String::new(),
                        cg_to_ground_ft: CG_TO_GROUND_FT,
                    });
                }
            }
            HostRequest::RequestData { object_id, kind: DataKind::Position, period, .. }
                if *period != DataPeriod::Never =>
            {
                if let Some(pos) = self.positions.get(object_id) {
                    self.outbox.push(HostEvent::PositionData {
                        object_id: *object_id,
                        data: PositionReport {
                            latitude_deg: pos.latitude_deg,
                            longitude_deg: pos.longitude_deg,
                            altitude_ft: pos.altitude_ft,
                            elevation_ft: self.ground_elevation_ft,
                            cg_to_ground_ft: CG_TO_GROUND_FT,
                            on_ground: pos.on_ground,
                        },
                    });
                }
            }
            _ => {}
        }
    }

    /// The host removes `object_id` without being asked.
    fn drop_object(&mut self, object_id: ObjectId) {
        if self.live.remove(&object_id) {
            self.positions.remove(&object_id);
            self.models.remove(&object_id);
            self.outbox.push(HostEvent::ObjectRemoved { object_id });
        }
    }

    fn take_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.outbox)
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ProxySummary {
    callsign: Callsign,
    model: String,
    state: ProxyState,
    kind: ProxyKind,
    object_id: Option<ObjectId>,
}

#[derive(Debug, Serialize)]
struct Summary {
    end_ms: u64,
    stats: EngineStats,
    proxies: Vec<ProxySummary>,
    pending: Vec<Callsign>,
    failures: Vec<FailureReport>,
    elevations: Vec<(Callsign, f64)>,
    host_calls: BTreeMap<&'static str, usize>,
    inconsistencies: Vec<Inconsistency>,
}

// ---------------------------------------------------------------------------
// Replay loop
// ---------------------------------------------------------------------------

struct Replay {
    engine: SyncEngine<InMemoryRoster>,
    mock: MockHost,
    responder: Responder,
    host_log: Vec<(SendId, HostRequest)>,
}

impl Replay {
    fn new(config: EngineConfig, ground_elevation_ft: f64) -> Result<Self> {
        let mock = MockHost::new();
        let host: Box<dyn HostChannel> = Box::new(mock.clone());
        let mut engine = SyncEngine::new(config, host, InMemoryRoster::new()).context("Invalid engine config")?;
        engine.connect(0).context("Cannot open host channel")?;
        Ok(Replay { engine, mock, responder: Responder::new(ground_elevation_ft), host_log: Vec::new() })
    }

    fn apply(&mut self, action: Action, now: u64) {
        debug!(at_ms = now, ?action, "step");
        match action {
            Action::Upsert { entity } => {
                let cs = entity.callsign.clone();
                self.engine.roster_mut().upsert(entity);
                self.engine.add_remote_aircraft(&cs, now);
            }
            Action::Leave { callsign } => {
                self.engine.roster_mut().remove(&callsign);
                self.engine.remove_remote_aircraft(&callsign, now);
            }
            Action::Move { callsign, situation } => self.engine.roster_mut().set_situation(&callsign, situation),
            Action::Parts { callsign, parts } => self.engine.roster_mut().set_parts(&callsign, parts),
            Action::Probe { number, latitude_deg, longitude_deg } => {
                self.engine.add_terrain_probe(number, latitude_deg, longitude_deg, now);
            }
            Action::FailCreation { callsign, times } => self.responder.fail_next(callsign, times),
            Action::HostRemove { callsign } => {
                if let Some(object_id) = self.engine.registry().by_callsign(&callsign).and_then(|p| p.object_id()) {
                    self.responder.drop_object(object_id);
                }
            }
            Action::Simulating { on } => self.mock.set_simulating(on),
            Action::Event { event } => self.engine.handle_host_event(event, now),
            Action::UpdateAll => self.engine.request_update_all(),
        }
    }

    fn pump_host(&mut self) {
        for (send_id, request) in self.mock.drain() {
            self.responder.answer(send_id, &request);
            self.host_log.push((send_id, request));
        }
    }

    fn run(&mut self, steps: Vec<Step>, tick_ms: u64, tail_ms: u64) -> u64 {
        let end_ms = steps.last().map_or(0, |s| s.at_ms).saturating_add(tail_ms);
        let mut steps = steps.into_iter().peekable();
        let tick_ms = tick_ms.max(1);
        let mut now = 0;

        while now <= end_ms {
            for event in self.responder.take_events() {
                self.engine.handle_host_event(event, now);
            }
            while let Some(step) = steps.next_if(|s| s.at_ms <= now) {
                self.apply(step.action, now);
            }
            self.engine.tick(now);
            self.pump_host();
            if !self.engine.is_connected() {
                info!(at_ms = now, "host quit, stopping replay");
                break;
            }
            now += tick_ms;
        }
        end_ms.min(now)
    }

    fn summary(&self, end_ms: u64) -> Summary {
        let mut host_calls = BTreeMap::new();
        for (_, request) in &self.host_log {
            *host_calls.entry(request.name()).or_insert(0) += 1;
        }
        Summary {
            end_ms,
            stats: self.engine.stats().clone(),
            proxies: self
                .engine
                .registry()
                .iter()
                .map(|p| ProxySummary {
                    callsign: p.callsign().clone(),
                    model: p.model_string().to_string(),
                    state: p.state(),
                    kind: p.kind(),
                    object_id: p.object_id(),
                })
                .collect(),
            pending: self.engine.pending().callsigns(),
            failures: self.engine.roster().failures().to_vec(),
            elevations: self.engine.roster().elevations().to_vec(),
            host_calls,
            inconsistencies: self.engine.check_consistency(),
        }
    }

    fn write_host_log(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for (send_id, request) in &self.host_log {
            let line = encode_line(request).context("Cannot encode host request")?;
            out.push_str(&format!("{{\"send_id\":{send_id},\"message\":{line}}}\n"));
        }
        std::fs::write(path, out).with_context(|| format!("Cannot write {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let steps = load_scenario(&args.scenario)?;
    info!(steps = steps.len(), scenario = %args.scenario.display(), "replaying");

    let mut replay = Replay::new(config, args.ground_elevation_ft)?;
    let end_ms = replay.run(steps, args.tick_ms, args.tail_ms);

    if let Some(path) = &args.host_log {
        replay.write_host_log(path)?;
        eprintln!("Host log written to {}", path.display());
    }

    let summary = replay.summary(end_ms);
    println!("{}", serde_json::to_string_pretty(&summary).context("Cannot encode summary")?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_replay() -> Replay {
        Replay::new(EngineConfig::default(), 364.0).unwrap()
    }

    fn steps(text: &str) -> Vec<Step> {
        let mut steps: Vec<Step> = decode_lines(text).unwrap();
        steps.sort_by_key(|s| s.at_ms);
        steps
    }

    const DLH400: &str = r#"{"callsign":"DLH400","model":{"model_string":"A320"},"situation":{"latitude_deg":50.03,"longitude_deg":8.57,"altitude_ft":3000.0,"ground_speed_kts":150.0,"on_ground":false}}"#;

    #[test]
    fn scenario_step_parses_flattened_action() {
        let parsed = steps(&format!(
            "# arrival\n{{\"at_ms\":0,\"action\":\"upsert\",\"entity\":{DLH400}}}\n{{\"at_ms\":500,\"action\":\"leave\",\"callsign\":\"dlh400\"}}\n"
        ));
        assert_eq!(parsed.len(), 2);
        assert!(matches!(&parsed[0].action, Action::Upsert { entity } if entity.callsign.as_str() == "DLH400"));
        assert_eq!(parsed[1].action, Action::Leave { callsign: Callsign::new("DLH400") });
    }

    #[test]
    fn aircraft_is_created_and_removed() {
        let mut replay = make_replay();
        let scenario = steps(&format!(
            "{{\"at_ms\":0,\"action\":\"upsert\",\"entity\":{DLH400}}}\n{{\"at_ms\":3000,\"action\":\"leave\",\"callsign\":\"DLH400\"}}\n"
        ));
        let end = replay.run(scenario, 20, 3000);
        let summary = replay.summary(end);

        assert_eq!(summary.stats.creations, 1);
        assert_eq!(summary.stats.removals, 1);
        assert!(summary.proxies.is_empty());
        assert!(summary.inconsistencies.is_empty());
        assert!(summary.host_calls.get("set_position").copied().unwrap_or(0) >= 1);
    }

    #[test]
    fn repeated_failures_end_in_disablement() {
        let mut replay = make_replay();
        let scenario = steps(&format!(
            "{{\"at_ms\":0,\"action\":\"fail_creation\",\"callsign\":\"DLH400\",\"times\":5}}\n{{\"at_ms\":0,\"action\":\"upsert\",\"entity\":{DLH400}}}\n"
        ));
        let end = replay.run(scenario, 20, 20_000);
        let summary = replay.summary(end);

        assert_eq!(summary.host_calls.get("create_aircraft"), Some(&3));
        assert_eq!(summary.failures.iter().filter(|f| f.is_final).count(), 1);
        assert!(summary.proxies.is_empty());
    }

    #[test]
    fn host_removal_is_recovered() {
        let mut replay = make_replay();
        let scenario = steps(&format!(
            "{{\"at_ms\":0,\"action\":\"upsert\",\"entity\":{DLH400}}}\n{{\"at_ms\":2000,\"action\":\"host_remove\",\"callsign\":\"DLH400\"}}\n"
        ));
        let end = replay.run(scenario, 20, 8000);
        let summary = replay.summary(end);

        assert_eq!(summary.stats.unsolicited_removals, 1);
        assert_eq!(summary.stats.creations, 2);
        assert!(matches!(
            summary.proxies.as_slice(),
            [ProxySummary { state: ProxyState::ConfirmedAdded, .. }]
        ));
    }

    #[test]
    fn probe_reports_ground_elevation() {
        let mut replay = make_replay();
        let scenario = steps("{\"at_ms\":0,\"action\":\"probe\",\"number\":1,\"latitude_deg\":50.0,\"longitude_deg\":8.5}\n");
        let end = replay.run(scenario, 20, 1000);
        let summary = replay.summary(end);
        assert_eq!(summary.elevations, vec![(Callsign::new("PROBE1"), 364.0)]);
        assert!(summary.proxies.is_empty());
    }

    #[test]
    fn quit_event_stops_the_replay() {
        let mut replay = make_replay();
        let scenario = steps("{\"at_ms\":200,\"action\":\"event\",\"event\":{\"event\":\"quit\"}}\n");
        let end = replay.run(scenario, 20, 10_000);
        assert_eq!(end, 200);
        assert!(!replay.engine.is_connected());
    }
}
