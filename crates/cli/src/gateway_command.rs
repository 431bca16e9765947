use std::{process::ExitCode, sync::Arc};

use {
    anyhow::{Context, Result},
    tracing::{debug, error, info, warn},
};

use {
    clawport_config::{ClawportConfig, Severity, find_config_file, load_config, validate},
    clawport_gateway::{
        GatewayRunLoop, RunLoopConfig,
        instance_lock::InstanceLock,
        respawn::RespawnEngine,
        server::GatewayServer,
        signals,
        state::{ConfigSource, GatewayState},
    },
};

/// Command-line overrides applied on top of every configuration load.
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

impl ServerOverrides {
    fn apply(&self, config: &mut ClawportConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

/// Load the on-disk config (or defaults) with overrides applied. A broken
/// file is an error, never a silent fallback to defaults.
fn load_effective(overrides: &ServerOverrides) -> Result<ClawportConfig> {
    let mut config = match find_config_file() {
        Some(path) => {
            load_config(&path).with_context(|| format!("failed to load {}", path.display()))?
        },
        None => ClawportConfig::default(),
    };
    overrides.apply(&mut config);
    Ok(config)
}

pub async fn run(overrides: ServerOverrides) -> Result<ExitCode> {
    info!(version = env!("CARGO_PKG_VERSION"), "clawport starting");

    let config = load_effective(&overrides)?;
    let validation = validate(&config);
    for d in &validation.diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
            Severity::Info => debug!(path = %d.path, "{}", d.message),
        }
    }
    if validation.has_errors() {
        anyhow::bail!(
            "configuration has {} error(s), refusing to start",
            validation.count(Severity::Error)
        );
    }

    let data_dir = clawport_config::data_dir();
    let lock = InstanceLock::acquire(&data_dir, config.gateway.lock_wait())
        .await
        .context("another gateway owns the data directory")?;

    let (sender, hub) = signals::channel();
    let hub = hub
        .with_os_signals()
        .context("failed to install signal handlers")?;

    let source_overrides = overrides.clone();
    let config_source: ConfigSource = Arc::new(move || load_effective(&source_overrides));
    // Each epoch re-reads the config and refreshes the restart settings.
    let state = Arc::new(GatewayState::new(sender, config_source));

    let respawner = RespawnEngine::from_process_env();
    info!(mode = ?respawner.mode(), "respawn mode");

    let run_loop = GatewayRunLoop::new(
        Arc::new(GatewayServer::new(Arc::clone(&state))),
        Arc::new(state.queue.clone()),
        Arc::clone(&state.authority) as _,
        Arc::new(respawner),
        Box::new(hub),
        RunLoopConfig::from(&config.gateway.restart),
    );
    let result = run_loop.run().await;

    // A successor is already waiting on the lock.
    lock.release();

    let exit = result?;
    info!(exit = ?exit, code = exit.exit_code(), "gateway exiting");
    Ok(ExitCode::from(exit.exit_code()))
}
