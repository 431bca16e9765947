//! Start / drain / close / respawn orchestration.
//!
//! One [`GatewayRunLoop`] runs per process. Each iteration starts an epoch,
//! waits for a lifecycle signal, drains in-flight work, closes the epoch and
//! then either exits or starts the next epoch in place. Restart handling is
//! strictly sequential: signals that arrive mid-sequence stay queued in the
//! signal source until the next epoch is running.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    tokio::sync::watch,
    tracing::{debug, info, warn},
};

use clawport_config::RestartConfig;

use crate::{
    lifecycle::{
        LifecycleSignal, RestartAuthorization, ServerHandle, ServerStarter, SignalSource,
        TaskAccounting,
    },
    respawn::{RespawnDecision, Respawner},
};

/// Observable run-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Starting,
    Running,
    Draining,
    Closing,
    Restarting,
    Exiting,
}

/// Why [`GatewayRunLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Shutdown was requested.
    Shutdown,
    /// A detached successor took over.
    HandedOff { pid: u32 },
    /// A supervisor will relaunch the process.
    Supervised,
}

impl RunExit {
    /// Process exit code. A supervisor only relaunches on a non-zero exit.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Shutdown | Self::HandedOff { .. } => 0,
            Self::Supervised => 1,
        }
    }
}

/// Timing knobs for the restart sequence. The run loop starts from its own
/// copy and switches to whatever each epoch reports through
/// [`ServerHandle::restart_timings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLoopConfig {
    pub drain_timeout: Duration,
    /// Hint passed to `close` on restart.
    pub restart_expected: Duration,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl From<&RestartConfig> for RunLoopConfig {
    fn from(config: &RestartConfig) -> Self {
        Self {
            drain_timeout: config.drain_timeout(),
            restart_expected: config.restart_expected(),
        }
    }
}

pub struct GatewayRunLoop {
    starter: Arc<dyn ServerStarter>,
    tasks: Arc<dyn TaskAccounting>,
    authorization: Arc<dyn RestartAuthorization>,
    respawner: Arc<dyn Respawner>,
    signals: Box<dyn SignalSource>,
    config: RunLoopConfig,
    state_tx: watch::Sender<RunState>,
}

impl GatewayRunLoop {
    pub fn new(
        starter: Arc<dyn ServerStarter>,
        tasks: Arc<dyn TaskAccounting>,
        authorization: Arc<dyn RestartAuthorization>,
        respawner: Arc<dyn Respawner>,
        signals: Box<dyn SignalSource>,
        config: RunLoopConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunState::Starting);
        Self {
            starter,
            tasks,
            authorization,
            respawner,
            signals,
            config,
            state_tx,
        }
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RunState) {
        self.state_tx.send_replace(state);
        debug!(state = ?state, "run loop state");
    }

    /// Run until shutdown or hand-off. Fails only if an epoch cannot start.
    pub async fn run(mut self) -> anyhow::Result<RunExit> {
        let mut epoch = 0u64;
        loop {
            epoch += 1;
            self.set_state(RunState::Starting);
            let handle = self
                .starter
                .start(epoch)
                .await
                .with_context(|| format!("failed to start gateway epoch {epoch}"))?;
            let timings = handle.restart_timings().unwrap_or(self.config);
            self.set_state(RunState::Running);
            info!(epoch, "gateway running");

            let signal = self.next_signal().await;

            self.set_state(RunState::Draining);
            self.drain(handle.as_ref(), timings.drain_timeout).await;

            self.set_state(RunState::Closing);
            let (reason, restart_expected) = match signal {
                LifecycleSignal::Restart => {
                    ("gateway restarting", Some(timings.restart_expected))
                },
                LifecycleSignal::Shutdown => ("gateway stopping", None),
            };
            if let Err(e) = handle.close(reason, restart_expected).await {
                warn!(epoch, error = %e, "gateway epoch did not close cleanly");
            }

            if signal == LifecycleSignal::Shutdown {
                self.set_state(RunState::Exiting);
                info!(epoch, "gateway stopped");
                return Ok(RunExit::Shutdown);
            }

            self.authorization.mark_restart_handled();
            self.tasks.reset_all_lanes();

            let decision = self.respawner.decide_and_act();
            info!(epoch, decision = decision.as_str(), "restart decision");
            match decision {
                RespawnDecision::Disabled | RespawnDecision::Failed { .. } => {
                    self.set_state(RunState::Restarting);
                },
                RespawnDecision::Supervised => {
                    self.set_state(RunState::Exiting);
                    return Ok(RunExit::Supervised);
                },
                RespawnDecision::Spawned { pid } => {
                    self.set_state(RunState::Exiting);
                    return Ok(RunExit::HandedOff { pid });
                },
            }
        }
    }

    /// Wait for the next signal that should act. Unauthorized restarts are
    /// dropped here; a closed source counts as shutdown.
    async fn next_signal(&mut self) -> LifecycleSignal {
        loop {
            match self.signals.recv().await {
                None => {
                    info!("signal source closed, shutting down");
                    return LifecycleSignal::Shutdown;
                },
                Some(LifecycleSignal::Shutdown) => return LifecycleSignal::Shutdown,
                Some(LifecycleSignal::Restart) => {
                    if self.authorization.consume_restart_authorization()
                        || self.authorization.is_restart_externally_allowed()
                    {
                        return LifecycleSignal::Restart;
                    }
                    debug!("ignoring unauthorized restart signal");
                },
            }
        }
    }

    async fn drain(&self, handle: &dyn ServerHandle, drain_timeout: Duration) {
        handle.mark_draining();
        let active = self.tasks.active_task_count();
        if active == 0 {
            return;
        }
        let timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX);
        info!(active, timeout_ms, "waiting for active tasks");
        let outcome = self
            .tasks
            .wait_for_active_tasks(drain_timeout)
            .await;
        if !outcome.drained {
            warn!(
                remaining = self.tasks.active_task_count(),
                timeout_ms,
                "drain timed out, closing with tasks still active"
            );
        }
    }
}
