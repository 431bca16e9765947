use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::info;

use crate::lifecycle::RestartAuthorization;

/// One-shot restart authorization plus the external allow flag.
///
/// The control API calls [`RestartAuthority::authorize`] before raising a
/// restart signal; the run loop consumes it when the signal arrives. With
/// `allow_external` set, bare SIGUSR1 restarts are honored too.
#[derive(Debug, Default)]
pub struct RestartAuthority {
    authorized: AtomicBool,
    allow_external: AtomicBool,
    handled: AtomicU64,
    last_handled_ms: AtomicU64,
}

impl RestartAuthority {
    #[must_use]
    pub fn new(allow_external: bool) -> Self {
        Self {
            allow_external: AtomicBool::new(allow_external),
            ..Default::default()
        }
    }

    /// Arm the next restart signal.
    pub fn authorize(&self) {
        self.authorized.store(true, Ordering::Release);
    }

    pub fn set_external_allowed(&self, allowed: bool) {
        self.allow_external.store(allowed, Ordering::Release);
    }

    /// Restarts that completed their full sequence.
    #[must_use]
    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::Acquire)
    }

    /// Unix time (ms) of the last handled restart, if any.
    #[must_use]
    pub fn last_handled_ms(&self) -> Option<u64> {
        match self.last_handled_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }
}

impl RestartAuthorization for RestartAuthority {
    fn consume_restart_authorization(&self) -> bool {
        self.authorized.swap(false, Ordering::AcqRel)
    }

    fn is_restart_externally_allowed(&self) -> bool {
        self.allow_external.load(Ordering::Acquire)
    }

    fn mark_restart_handled(&self) {
        let count = self.handled.fetch_add(1, Ordering::AcqRel) + 1;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        self.last_handled_ms.store(now_ms, Ordering::Release);
        info!(restarts_handled = count, "restart handled");
    }
}
