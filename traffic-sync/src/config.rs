//! Engine tunables.
//!
//! Every threshold and delay of the engine lives here. Values are read from
//! JSON; missing fields fall back to [`EngineConfig::default`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::Millis;

/// Host variant. Differences between hosts are limited to what is listed in
/// the methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFlavor {
    #[default]
    Msfs2024,
    Fsx,
}

impl HostFlavor {
    /// Delay between confirmation and the deferred verification.
    pub fn verify_delay_ms(self) -> Millis {
        match self {
            HostFlavor::Msfs2024 => 1000,
            HostFlavor::Fsx => 500,
        }
    }

    /// Terrain probes are created as plain simulated objects on FSX.
    pub fn probe_as_simulated_object(self) -> bool {
        matches!(self, HostFlavor::Fsx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub host_flavor: HostFlavor,

    // ── Retry bounds ──────────────────────────────────────────────────────────
    /// Creation failures after which an entity is disabled (K).
    pub max_add_failures: u32,
    /// Unsolicited removals tolerated before the entity is disabled.
    pub max_directly_removed: u32,
    /// Fall back to a plain simulated object after a failed creation.
    pub add_as_simulated_object: bool,

    // ── Timing (ms) ───────────────────────────────────────────────────────────
    pub outdated_pending_ms: Millis,
    pub retry_delay_ms: Millis,
    /// Overrides the flavor's verification delay.
    pub verify_delay_ms: Option<Millis>,
    pub pending_add_delay_ms: Millis,
    pub add_pending_interval_ms: Millis,
    pub light_resend_ms: Millis,
    pub readd_after_removal_ms: Millis,
    pub removal_retry_ms: Millis,
    pub auto_trace_ms: Millis,

    // ── Dispatcher ────────────────────────────────────────────────────────────
    /// Every n-th run an entity is written even if unchanged.
    pub full_refresh_ticks: u64,
    pub send_ground_flag: bool,
    pub underflow_detection: bool,
    pub underflow_speed_kts: f64,
    /// Fast position telemetry below this height when moving.
    pub near_ground_ft: f64,
    /// Host reported elevation is remembered below this height.
    pub remember_elevation_ft: f64,

    // ── Diagnostics ───────────────────────────────────────────────────────────
    pub send_id_trace_capacity: usize,
    pub trace_send_ids: bool,
    pub probe_altitude_ft: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_flavor: HostFlavor::Msfs2024,
            max_add_failures: 3,
            max_directly_removed: 2,
            add_as_simulated_object: false,
            outdated_pending_ms: 5000,
            retry_delay_ms: 2000,
            verify_delay_ms: None,
            pending_add_delay_ms: 100,
            add_pending_interval_ms: 2500,
            light_resend_ms: 2500,
            readd_after_removal_ms: 2500,
            removal_retry_ms: 2000,
            auto_trace_ms: 60_000,
            full_refresh_ticks: 40,
            send_ground_flag: true,
            underflow_detection: true,
            underflow_speed_kts: 2.0,
            near_ground_ft: 100.0,
            remember_elevation_ft: 250.0,
            send_id_trace_capacity: 200,
            trace_send_ids: false,
            probe_altitude_ft: 50_000.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_add_failures == 0 {
            return Err(ConfigError::Zero { field: "max_add_failures" });
        }
        if self.full_refresh_ticks == 0 {
            return Err(ConfigError::Zero { field: "full_refresh_ticks" });
        }
        if self.send_id_trace_capacity == 0 {
            return Err(ConfigError::Zero { field: "send_id_trace_capacity" });
        }
        if self.add_pending_interval_ms == 0 {
            return Err(ConfigError::Zero { field: "add_pending_interval_ms" });
        }
        Ok(())
    }

    pub fn verify_delay(&self) -> Millis {
        self.verify_delay_ms.unwrap_or_else(|| self.host_flavor.verify_delay_ms())
    }
}
