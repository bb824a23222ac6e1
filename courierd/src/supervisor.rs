//! Unit supervision.
//!
//! The supervisor owns a registry of running units (the broker and its
//! workers), each paired with a shutdown token and join handle. Signal
//! handling is reduced to a single channel send; all waiting and joining
//! happens on the supervising flow, never in signal context.
//!
//! Shutdown runs in three phases: request stop on every unit, drain
//! against a deadline, then abandon whatever is left. Units are never
//! restarted.

use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info, warn};

use courier_common::ShutdownToken;

const REGISTRY_POLL: Duration = Duration::from_millis(50);
const DEFAULT_DRAIN: Duration = Duration::from_secs(5);

struct Unit {
    name: String,
    token: ShutdownToken,
    handle: JoinHandle<courier_common::Result<()>>,
}

/// Supervises a set of unit threads and coordinates their shutdown.
pub struct Supervisor {
    units: Vec<Unit>,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
    drain: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = bounded(1);
        Self {
            units: Vec::new(),
            signal_tx,
            signal_rx,
            drain: DEFAULT_DRAIN,
        }
    }

    /// How long the drain phase waits before abandoning stragglers.
    pub fn with_drain_deadline(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    /// Routes interrupt/terminate signals into the supervising flow. The
    /// handler does nothing but a non-blocking channel send.
    pub fn install_signal_handler(&self) -> Result<()> {
        let tx = self.signal_tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        })
        .context("failed to install termination signal handler")
    }

    /// Programmatic equivalent of a termination signal.
    pub fn request_shutdown(&self) {
        let _ = self.signal_tx.try_send(());
    }

    /// Registers and starts a unit.
    pub fn spawn<F>(&mut self, name: &str, unit: F) -> Result<()>
    where
        F: FnOnce(ShutdownToken) -> courier_common::Result<()> + Send + 'static,
    {
        let token = ShutdownToken::new();
        let unit_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || unit(unit_token))
            .with_context(|| format!("failed to start unit '{name}'"))?;

        info!(unit = name, "unit started");
        self.units.push(Unit {
            name: name.to_string(),
            token,
            handle,
        });
        Ok(())
    }

    /// Blocks until a termination signal arrives or every unit has exited
    /// by itself, then runs the shutdown phases. Returns an error if any
    /// unit failed or had to be abandoned.
    pub fn wait(self) -> Result<()> {
        loop {
            match self.signal_rx.recv_timeout(REGISTRY_POLL) {
                Ok(()) => {
                    info!("termination signal received");
                    break;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.units.iter().all(|u| u.handle.is_finished()) {
                        info!("all units exited on their own");
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Phase 1: stop accepting new work.
        for unit in &self.units {
            unit.token.trigger();
        }

        // Phase 2: drain against the deadline.
        let deadline = Instant::now() + self.drain;
        while Instant::now() < deadline {
            if self.units.iter().all(|u| u.handle.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        // Phase 3: abandon stragglers, join the rest.
        let mut failures = Vec::new();
        for unit in self.units {
            if !unit.handle.is_finished() {
                error!(unit = %unit.name, "unit did not stop within the drain deadline");
                failures.push(format!("{} abandoned", unit.name));
                continue;
            }
            match unit.handle.join() {
                Ok(Ok(())) => info!(unit = %unit.name, "unit stopped"),
                Ok(Err(e)) => {
                    warn!(unit = %unit.name, %e, "unit exited with error");
                    failures.push(format!("{}: {e}", unit.name));
                }
                Err(_) => {
                    error!(unit = %unit.name, "unit panicked");
                    failures.push(format!("{} panicked", unit.name));
                }
            }
        }

        if failures.is_empty() {
            info!("shutdown complete");
            Ok(())
        } else {
            Err(anyhow!("shutdown was not clean: {}", failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obedient_unit(token: ShutdownToken) -> courier_common::Result<()> {
        while !token.is_triggered() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn shutdown_stops_every_registered_unit() {
        let mut sup = Supervisor::new();
        sup.spawn("unit-a", obedient_unit).unwrap();
        sup.spawn("unit-b", obedient_unit).unwrap();

        sup.request_shutdown();
        sup.wait().unwrap();
    }

    #[test]
    fn wait_returns_when_all_units_exit_on_their_own() {
        let mut sup = Supervisor::new();
        sup.spawn("short-lived", |_token| Ok(())).unwrap();
        sup.wait().unwrap();
    }

    #[test]
    fn failed_unit_makes_shutdown_unclean() {
        let mut sup = Supervisor::new();
        sup.spawn("doomed", |_token| {
            Err(courier_common::Error::Config("broken on purpose".into()))
        })
        .unwrap();

        assert!(sup.wait().is_err());
    }

    #[test]
    fn stragglers_are_abandoned_after_the_drain_deadline() {
        let mut sup = Supervisor::new().with_drain_deadline(Duration::from_millis(100));
        sup.spawn("stubborn", |_token| {
            thread::sleep(Duration::from_secs(10));
            Ok(())
        })
        .unwrap();

        sup.request_shutdown();
        assert!(sup.wait().is_err());
    }
}
