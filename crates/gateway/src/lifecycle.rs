//! Seams between the run loop and the rest of the gateway.
//!
//! The run loop only talks to these traits, so the restart/shutdown state
//! machine can be driven by fakes in tests and by the real listener,
//! command queue and signal handlers in production.

use std::time::Duration;

use async_trait::async_trait;

use crate::run_loop::RunLoopConfig;

/// Result of waiting for in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// `false` when the wait gave up with work still active.
    pub drained: bool,
}

/// Accounting for in-flight agent/command work.
#[async_trait]
pub trait TaskAccounting: Send + Sync {
    /// Running plus queued tasks.
    fn active_task_count(&self) -> usize;

    /// Resolve once the active count reaches zero or `timeout` elapses.
    async fn wait_for_active_tasks(&self, timeout: Duration) -> DrainOutcome;

    /// Forget every lane so a restarted epoch starts from zero.
    fn reset_all_lanes(&self);
}

/// Source of truth for whether a restart request is legitimate.
pub trait RestartAuthorization: Send + Sync {
    /// Take the one-shot authorization, if set.
    fn consume_restart_authorization(&self) -> bool;

    /// Whether unsolicited restart signals are honored.
    fn is_restart_externally_allowed(&self) -> bool;

    /// Record that a restart went through its full sequence.
    fn mark_restart_handled(&self);
}

/// One started epoch of the gateway server.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Stop accepting new plugin traffic while in-flight work drains.
    fn mark_draining(&self) {}

    /// Drain and restart timings loaded for this epoch. `None` keeps the
    /// run loop's own settings.
    fn restart_timings(&self) -> Option<RunLoopConfig> {
        None
    }

    /// Close the epoch. `restart_expected` is the client-facing hint for how
    /// soon the gateway will be back; `None` means it is going away.
    async fn close(
        self: Box<Self>,
        reason: &str,
        restart_expected: Option<Duration>,
    ) -> anyhow::Result<()>;
}

/// Starts a new epoch of the gateway server.
#[async_trait]
pub trait ServerStarter: Send + Sync {
    async fn start(&self, epoch: u64) -> anyhow::Result<Box<dyn ServerHandle>>;
}

/// Lifecycle request delivered to the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Restart,
    Shutdown,
}

/// Where lifecycle requests come from (OS signals, the control API, tests).
#[async_trait]
pub trait SignalSource: Send {
    /// Next request, or `None` once no more can arrive.
    async fn recv(&mut self) -> Option<LifecycleSignal>;
}
