use std::sync::{Arc, Mutex};

use {
    serde::Serialize,
    tokio::time::Instant,
};

use clawport_config::ClawportConfig;

use crate::{
    channel_events::{LoggingTurnHandler, TurnHandler},
    command_queue::CommandQueue,
    http_guard::GuardStats,
    plugin_routes::PluginRouteRegistry,
    restart::RestartAuthority,
    signals::SignalSender,
};

/// Produces the configuration for the next epoch. Called once per start and
/// again by the control API before it accepts a restart.
pub type ConfigSource = Arc<dyn Fn() -> anyhow::Result<ClawportConfig> + Send + Sync>;

/// Process-wide state shared by every epoch.
pub struct GatewayState {
    pub version: &'static str,
    pub queue: CommandQueue,
    pub authority: Arc<RestartAuthority>,
    pub signals: SignalSender,
    pub guard_stats: Arc<GuardStats>,
    pub turns: Arc<dyn TurnHandler>,
    config_source: ConfigSource,
}

impl GatewayState {
    pub fn new(signals: SignalSender, config_source: ConfigSource) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            queue: CommandQueue::new(),
            authority: Arc::new(RestartAuthority::default()),
            signals,
            guard_stats: Arc::new(GuardStats::default()),
            turns: Arc::new(LoggingTurnHandler),
            config_source,
        }
    }

    /// State that always serves the same configuration.
    pub fn with_fixed_config(signals: SignalSender, config: ClawportConfig) -> Self {
        let state = Self::new(signals, Arc::new(move || Ok(config.clone())));
        if let Ok(config) = state.load_config() {
            state
                .authority
                .set_external_allowed(config.gateway.restart.allow_external_signal);
        }
        state
    }

    #[must_use]
    pub fn with_turn_handler(mut self, turns: Arc<dyn TurnHandler>) -> Self {
        self.turns = turns;
        self
    }

    pub fn load_config(&self) -> anyhow::Result<ClawportConfig> {
        (self.config_source)()
    }
}

/// Where an epoch is in its lifecycle, as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EpochPhase {
    Running,
    Draining,
    Closing {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        restart_expected_ms: Option<u64>,
    },
}

/// State owned by one listener epoch.
pub struct EpochState {
    pub epoch: u64,
    pub routes: PluginRouteRegistry,
    started: Instant,
    phase: Mutex<EpochPhase>,
}

impl EpochState {
    pub fn new(epoch: u64, routes: PluginRouteRegistry) -> Self {
        Self {
            epoch,
            routes,
            started: Instant::now(),
            phase: Mutex::new(EpochPhase::Running),
        }
    }

    #[must_use]
    pub fn phase(&self) -> EpochPhase {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_phase(&self, phase: EpochPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
