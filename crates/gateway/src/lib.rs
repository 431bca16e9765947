//! Gateway process lifecycle: the shared webhook listener, the restart and
//! shutdown state machine, in-flight work accounting and successor-process
//! hand-off.
//!
//! Lifecycle:
//! 1. Acquire the single-instance lock ([`instance_lock`])
//! 2. Start an epoch: bind the listener, start channel accounts
//! 3. Wait for an authorized restart or a shutdown ([`run_loop`])
//! 4. Drain active tasks, close the epoch, then respawn or start again

pub mod channel_events;
pub mod command_queue;
pub mod error;
pub mod http_guard;
pub mod instance_lock;
pub mod lifecycle;
pub mod plugin_routes;
pub mod respawn;
pub mod restart;
pub mod run_loop;
pub mod server;
pub mod signals;
pub mod state;

pub use {
    error::LockError,
    run_loop::{GatewayRunLoop, RunExit, RunLoopConfig, RunState},
};
