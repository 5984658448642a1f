//! Supervisor for the dockwall daemon
//!
//! Owns the pid lock and the rule list for the current cycle, applies the
//! policy on start, re-verifies it on a fixed interval and reacts to
//! control signals. Lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running -> Reloading -> Starting
//!                                -> Draining  -> Stopped
//! ```
//!
//! Chain driver calls block, so they run on tokio's blocking pool; the loop
//! awaits each one before looking at the next event.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use dockwall_policy::{ReconciliationEngine, Rule, RuleSource};

use crate::pidfile::PidLock;
use crate::signals::ControlSignal;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Draining,
}

pub struct Supervisor {
    engine: ReconciliationEngine,
    source: Arc<dyn RuleSource>,
    pid_path: PathBuf,
    poll_interval: Duration,
    state: SupervisorState,
    lock: Option<PidLock>,
    rules: Arc<Vec<Rule>>,
}

impl Supervisor {
    pub fn new(
        engine: ReconciliationEngine,
        source: Arc<dyn RuleSource>,
        pid_path: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            source,
            pid_path,
            poll_interval,
            state: SupervisorState::Stopped,
            lock: None,
            rules: Arc::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run an engine operation on the blocking pool and wait for it.
    async fn engine_call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&ReconciliationEngine) -> dockwall_policy::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        let result = tokio::task::spawn_blocking(move || op(&engine))
            .await
            .context("Chain driver task failed")?;
        Ok(result?)
    }

    /// Lock, load rules, apply. Any failure after the lock is taken clears
    /// the chain and releases the lock before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        self.state = SupervisorState::Starting;
        info!("Starting dockwall");

        if self.lock.is_none() {
            // Nothing touched yet, and the chain may belong to the live holder.
            match PidLock::acquire(&self.pid_path) {
                Ok(lock) => {
                    debug!("Holding pid lock {}", lock.path().display());
                    self.lock = Some(lock);
                }
                Err(e) => {
                    self.state = SupervisorState::Stopped;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.load_and_apply().await {
            error!("Startup failed: {e:#}");
            self.drain().await;
            return Err(e);
        }

        self.state = SupervisorState::Running;
        Ok(())
    }

    async fn load_and_apply(&mut self) -> Result<()> {
        let rules = self
            .source
            .load()
            .with_context(|| format!("Failed to load rules from {}", self.source.describe()))?;
        let rules = Arc::new(rules);

        info!("Applying rules");
        let to_apply = Arc::clone(&rules);
        let installed = self
            .engine_call(move |engine| engine.apply(&to_apply))
            .await
            .context("Failed to apply rules")?;
        info!(rules = rules.len(), predicates = installed, "Rules applied");

        self.rules = rules;
        Ok(())
    }

    /// One poll tick: verify, and re-apply on drift or on a failed check.
    /// An error means the re-apply itself failed.
    pub async fn reconcile(&mut self) -> Result<()> {
        let rules = Arc::clone(&self.rules);
        match self.engine_call(move |engine| engine.verify(&rules)).await {
            Ok(true) => {
                debug!("Chain verified");
                return Ok(());
            }
            Ok(false) => warn!("Chain drifted from policy, applying rules again"),
            Err(e) => warn!("Verification failed: {e:#}, applying rules again"),
        }

        let rules = Arc::clone(&self.rules);
        self.engine_call(move |engine| engine.apply(&rules))
            .await
            .context("Failed to re-apply rules")?;
        info!("Rules re-applied");
        Ok(())
    }

    /// React to one signal. Returns the exit code when the daemon must stop.
    pub async fn handle_signal(&mut self, signal: ControlSignal) -> Option<i32> {
        match signal {
            ControlSignal::Reload => {
                info!("Reloading configuration");
                self.state = SupervisorState::Reloading;
                self.unwind().await;
                match self.start().await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Reload failed: {e:#}");
                        Some(EXIT_FAILURE)
                    }
                }
            }
            ControlSignal::Terminate | ControlSignal::Quit => {
                info!("Stopping the service");
                self.drain().await;
                Some(EXIT_OK)
            }
            ControlSignal::Other(_) => {
                warn!("Unexpected signal {}, stopping", signal.name());
                self.drain().await;
                Some(EXIT_FAILURE)
            }
        }
    }

    /// Clear the chain and release the lock.
    pub async fn drain(&mut self) {
        self.state = SupervisorState::Draining;
        self.unwind().await;
        self.state = SupervisorState::Stopped;
    }

    async fn unwind(&mut self) {
        if let Err(e) = self.engine_call(|engine| engine.clear()).await {
            error!("Failed to clear chain: {e:#}");
        }
        self.lock = None;
    }

    /// Start, then serve signals and poll ticks until told to stop.
    pub async fn run(mut self, mut signals: mpsc::Receiver<ControlSignal>) -> i32 {
        if self.start().await.is_err() {
            return EXIT_FAILURE;
        }

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.poll_interval, "Entering supervisor loop");

        loop {
            tokio::select! {
                received = signals.recv() => {
                    let Some(signal) = received else {
                        error!("Signal listener stopped");
                        self.drain().await;
                        return EXIT_FAILURE;
                    };
                    info!("Received signal: {}", signal.name());
                    if let Some(code) = self.handle_signal(signal).await {
                        info!(code, "Supervisor exiting");
                        return code;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!("Something went wrong: {e:#}");
                        self.drain().await;
                        return EXIT_FAILURE;
                    }
                }
            }
        }
    }
}
