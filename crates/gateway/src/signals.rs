//! Lifecycle signal sources: OS signals and in-process requests.

use {async_trait::async_trait, tokio::sync::mpsc, tracing::info};

use crate::lifecycle::{LifecycleSignal, SignalSource};

/// OS signal listeners. SIGTERM/SIGINT request shutdown, SIGUSR1 a restart.
/// On non-Unix targets only Ctrl-C is observed.
pub struct OsSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    user1: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Register the handlers. They are removed when the value is dropped.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) -> LifecycleSignal {
        tokio::select! {
            _ = self.terminate.recv() => {
                info!(signal = "SIGTERM", "received shutdown signal");
                LifecycleSignal::Shutdown
            },
            _ = self.interrupt.recv() => {
                info!(signal = "SIGINT", "received shutdown signal");
                LifecycleSignal::Shutdown
            },
            _ = self.user1.recv() => {
                info!(signal = "SIGUSR1", "received restart signal");
                LifecycleSignal::Restart
            },
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> LifecycleSignal {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "received shutdown signal");
            return LifecycleSignal::Shutdown;
        }
        std::future::pending().await
    }
}

/// Raises lifecycle requests from inside the process (control API, tests).
#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<LifecycleSignal>,
}

impl SignalSender {
    /// Returns `false` once the run loop has gone away.
    pub fn restart(&self) -> bool {
        self.tx.send(LifecycleSignal::Restart).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(LifecycleSignal::Shutdown).is_ok()
    }
}

/// Merged signal source handed to the run loop.
///
/// Requests that arrive while the loop is busy restarting stay queued here
/// until the loop asks for the next one.
pub struct SignalHub {
    os: Option<OsSignals>,
    rx: mpsc::UnboundedReceiver<LifecycleSignal>,
}

/// Create an in-process signal pair with no OS handlers attached.
#[must_use]
pub fn channel() -> (SignalSender, SignalHub) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, SignalHub { os: None, rx })
}

impl SignalHub {
    /// Also listen for OS signals.
    pub fn with_os_signals(mut self) -> std::io::Result<Self> {
        self.os = Some(OsSignals::install()?);
        Ok(self)
    }
}

#[async_trait]
impl SignalSource for SignalHub {
    async fn recv(&mut self) -> Option<LifecycleSignal> {
        match self.os.as_mut() {
            Some(os) => tokio::select! {
                signal = os.next() => Some(signal),
                Some(signal) = self.rx.recv() => Some(signal),
            },
            None => self.rx.recv().await,
        }
    }
}
