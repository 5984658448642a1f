//! OS signal wiring for the supervisor
//!
//! A single listener task turns Unix signals into `ControlSignal`s on a
//! bounded channel. The supervisor drains the channel one signal at a time,
//! so signals arriving during a reconciliation wait their turn.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SIGNAL_QUEUE_DEPTH: usize = 16;

/// What the supervisor was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGHUP: re-read rules and re-apply.
    Reload,
    /// SIGTERM: stop cleanly.
    Terminate,
    /// SIGQUIT: stop cleanly.
    Quit,
    /// Any other subscribed signal, carrying its number.
    Other(i32),
}

impl ControlSignal {
    pub fn name(&self) -> String {
        match self {
            Self::Reload => "SIGHUP".into(),
            Self::Terminate => "SIGTERM".into(),
            Self::Quit => "SIGQUIT".into(),
            Self::Other(num) => nix::sys::signal::Signal::try_from(*num)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("signal {num}")),
        }
    }
}

/// Subscribe to HUP, TERM, QUIT, INT, USR1 and USR2 and forward them.
pub fn listen() -> Result<mpsc::Receiver<ControlSignal>> {
    let mut hup = signal(SignalKind::hangup()).context("Failed to register SIGHUP")?;
    let mut term = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut quit = signal(SignalKind::quit()).context("Failed to register SIGQUIT")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("Failed to register SIGUSR1")?;
    let mut usr2 = signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2")?;

    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = hup.recv() => ControlSignal::Reload,
                _ = term.recv() => ControlSignal::Terminate,
                _ = quit.recv() => ControlSignal::Quit,
                _ = int.recv() => ControlSignal::Other(nix::libc::SIGINT),
                _ = usr1.recv() => ControlSignal::Other(nix::libc::SIGUSR1),
                _ = usr2.recv() => ControlSignal::Other(nix::libc::SIGUSR2),
            };
            debug!("Forwarding {}", received.name());
            if tx.send(received).await.is_err() {
                warn!("Supervisor gone, dropping {}", received.name());
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(ControlSignal::Reload.name(), "SIGHUP");
        assert_eq!(ControlSignal::Terminate.name(), "SIGTERM");
        assert_eq!(ControlSignal::Quit.name(), "SIGQUIT");
        assert_eq!(ControlSignal::Other(nix::libc::SIGUSR1).name(), "SIGUSR1");
        assert_eq!(ControlSignal::Other(9999).name(), "signal 9999");
    }
}
