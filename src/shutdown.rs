//! Bounded, idempotent shutdown of all stream workers.

use crate::worker::{JoinOutcome, WorkerHandle};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    WindowClose,
    Terminate,
    Interrupt,
    Suspend,
}

impl ShutdownTrigger {
    pub const fn label(self) -> &'static str {
        match self {
            Self::WindowClose => "window close",
            Self::Terminate => "terminate",
            Self::Interrupt => "interrupt",
            Self::Suspend => "suspend",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<usize>,
    pub abandoned: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed(ShutdownReport),
    AlreadyClosed,
}

pub struct ShutdownSequencer {
    closing: AtomicBool,
    workers: Mutex<Vec<WorkerHandle>>,
    join_timeout: Duration,
}

impl ShutdownSequencer {
    pub fn new(workers: Vec<WorkerHandle>) -> Self {
        Self {
            closing: AtomicBool::new(false),
            workers: Mutex::new(workers),
            join_timeout: JOIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Stops every worker, then runs `teardown`. Only the first call does
    /// anything; later calls return [`ShutdownOutcome::AlreadyClosed`].
    ///
    /// All stop tokens are cancelled before the first join so workers unwind
    /// concurrently. A worker that misses its deadline is abandoned.
    pub async fn shutdown<F>(&self, trigger: ShutdownTrigger, teardown: F) -> ShutdownOutcome
    where
        F: FnOnce(),
    {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!(trigger = trigger.label(), "shutdown already in progress");
            return ShutdownOutcome::AlreadyClosed;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        info!(
            trigger = trigger.label(),
            workers = workers.len(),
            "shutting down"
        );

        for worker in &workers {
            worker.signal_stop();
        }

        let mut report = ShutdownReport::default();
        for worker in workers {
            let slot = worker.slot();
            match worker.join(self.join_timeout).await {
                JoinOutcome::Stopped => report.stopped.push(slot),
                JoinOutcome::TimedOut => {
                    warn!(
                        slot,
                        timeout_ms = self.join_timeout.as_millis() as u64,
                        "worker did not stop in time, abandoning it"
                    );
                    report.abandoned.push(slot);
                }
            }
        }

        teardown();
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "shutdown complete"
        );
        ShutdownOutcome::Completed(report)
    }
}

/// Forwards OS signals to `triggers` until the receiver is dropped.
pub fn listen_for_signals(triggers: mpsc::UnboundedSender<ShutdownTrigger>) -> Result<()> {
    let mut signals = OsSignals::install()?;
    tokio::spawn(async move {
        while let Some(trigger) = signals.next().await {
            debug!(trigger = trigger.label(), "signal received");
            if triggers.send(trigger).is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(unix)]
struct OsSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    suspend: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate =
            signal(SignalKind::terminate()).context("failed installing SIGTERM handler")?;
        let interrupt =
            signal(SignalKind::interrupt()).context("failed installing SIGINT handler")?;
        let hangup = signal(SignalKind::hangup()).context("failed installing SIGHUP handler")?;
        let suspend = signal(SignalKind::from_raw(signal_hook::consts::SIGTSTP))
            .context("failed installing SIGTSTP handler")?;

        Ok(Self {
            terminate,
            interrupt,
            hangup,
            suspend,
        })
    }

    async fn next(&mut self) -> Option<ShutdownTrigger> {
        tokio::select! {
            received = self.terminate.recv() => received.map(|()| ShutdownTrigger::Terminate),
            received = self.interrupt.recv() => received.map(|()| ShutdownTrigger::Interrupt),
            received = self.hangup.recv() => received.map(|()| ShutdownTrigger::WindowClose),
            received = self.suspend.recv() => received.map(|()| ShutdownTrigger::Suspend),
        }
    }
}

#[cfg(not(unix))]
struct OsSignals;

#[cfg(not(unix))]
impl OsSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<ShutdownTrigger> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|()| ShutdownTrigger::Interrupt)
    }
}
