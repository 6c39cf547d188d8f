//! Global shutdown coordination.
//!
//! Shutdown runs once: stop accepting, cancel and join every registered
//! relay worker, then let the caller drop the remaining resources and exit
//! with the status derived from the trigger. A second trigger while this is
//! in progress is logged and ignored.

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::WorkerRegistry;

/// What started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// A termination signal, by number.
    Signal(i32),
    /// A programmatic request.
    Requested,
}

impl ShutdownTrigger {
    /// Process exit status for this trigger.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownTrigger::Signal(signo) => u8::try_from(*signo).unwrap_or(1),
            ShutdownTrigger::Requested => 0,
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Signal(signo) => write!(f, "signal {signo}"),
            ShutdownTrigger::Requested => write!(f, "request"),
        }
    }
}

/// Owns the shutdown sequence for one proxy instance.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    registry: Arc<WorkerRegistry>,
    trigger: OnceLock<ShutdownTrigger>,
    accepting: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            trigger: OnceLock::new(),
            accepting: CancellationToken::new(),
        }
    }

    /// Token cancelled when the listener must close.
    pub fn listener_token(&self) -> CancellationToken {
        self.accepting.clone()
    }

    /// Start the shutdown. Returns false if one is already under way.
    pub fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        match self.trigger.set(trigger) {
            Ok(()) => {
                info!(trigger = %trigger, "Shutdown started");
                self.accepting.cancel();
                true
            }
            Err(_) => {
                warn!(
                    component = "shutdown",
                    trigger = %trigger,
                    "Shutdown already in progress, ignoring"
                );
                false
            }
        }
    }

    /// The trigger of the shutdown in progress, if any.
    pub fn triggered(&self) -> Option<ShutdownTrigger> {
        self.trigger.get().copied()
    }

    /// Resolves once a shutdown has been triggered.
    pub async fn wait(&self) {
        self.accepting.cancelled().await;
    }

    /// Cancel and join every registered worker. Returns how many were swept.
    pub async fn drain(&self) -> usize {
        let drained = self.registry.cancel_all().await;
        info!(workers = drained, "Relay workers drained");
        drained
    }

    /// Translate SIGINT and SIGTERM into shutdown triggers.
    ///
    /// The handlers are installed before this returns and stay installed for
    /// the life of the process, so a repeated signal during the drain is
    /// ignored instead of killing it. Must be called inside a tokio runtime.
    pub fn watch_signals(self: Arc<Self>) -> io::Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let signo = tokio::select! {
                    Some(()) = interrupt.recv() => libc::SIGINT,
                    Some(()) = terminate.recv() => libc::SIGTERM,
                    else => return,
                };
                info!(signal = signo, "Received termination signal");
                self.trigger(ShutdownTrigger::Signal(signo));
            }
        }))
    }
}
