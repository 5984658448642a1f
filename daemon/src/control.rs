//! One-shot commands: stop a running daemon, verify the live chain, and
//! print the compiled plan.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use dockwall_policy::{MemoryChain, PolicySet, Predicate, ReconciliationEngine, RuleSource};

use crate::pidfile::{process_alive, read_pid, LifecycleError};

const STOP_POLL: Duration = Duration::from_millis(100);

/// Ask the daemon recorded at `pid_path` to stop and wait until it has let
/// go of the chain. When it cannot be signalled, or died without cleaning
/// up, the chain is cleared here and the stale pid file removed.
pub fn stop(pid_path: &Path, timeout: Duration, engine: &ReconciliationEngine) -> Result<()> {
    let pid = match read_pid(pid_path) {
        Ok(Some(pid)) => pid,
        Ok(None) => {
            info!("dockwall is not running (no {})", pid_path.display());
            return Ok(());
        }
        Err(e @ LifecycleError::CorruptPidFile { .. }) => {
            warn!("{e}");
            return release_stale(pid_path, engine);
        }
        Err(e) => return Err(e.into()),
    };

    info!("Stopping dockwall (pid {pid})");
    if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("{}", LifecycleError::SignalDelivery { pid, source: errno });
        return release_stale(pid_path, engine);
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !pid_path.exists() {
            info!("dockwall stopped");
            return Ok(());
        }
        if !process_alive(pid) {
            warn!("dockwall (pid {pid}) exited without releasing the chain");
            return release_stale(pid_path, engine);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("dockwall (pid {pid}) did not stop within {timeout:?}");
        }
        std::thread::sleep(STOP_POLL);
    }
}

fn release_stale(pid_path: &Path, engine: &ReconciliationEngine) -> Result<()> {
    engine.clear().context("Failed to clear chain")?;
    match std::fs::remove_file(pid_path) {
        Ok(()) => info!("Removed stale pid file {}", pid_path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", pid_path.display()))
        }
    }
    Ok(())
}

/// Compare the live chain with the rule file. Returns the predicates that
/// are missing; empty means in sync.
pub fn verify(source: &dyn RuleSource, engine: &ReconciliationEngine) -> Result<Vec<Predicate>> {
    let rules = source
        .load()
        .with_context(|| format!("Failed to load rules from {}", source.describe()))?;
    let missing = engine
        .missing(&rules)
        .with_context(|| format!("Failed to query {}/{}", engine.table(), engine.chain()))?;
    Ok(missing)
}

/// Compiled policy plus the chain it produces, top to bottom.
#[derive(Debug, Serialize)]
pub struct Plan {
    pub table: String,
    pub chain: String,
    pub policy: PolicySet,
    pub live: Vec<Predicate>,
}

/// Compile the rules and replay `apply` against an in-memory chain.
pub fn plan(source: &dyn RuleSource, table: &str, chain: &str) -> Result<Plan> {
    let rules = source
        .load()
        .with_context(|| format!("Failed to load rules from {}", source.describe()))?;
    let policy = PolicySet::from_rules(&rules)?;

    let memory = Arc::new(MemoryChain::new());
    ReconciliationEngine::new(memory.clone(), table, chain).apply(&rules)?;

    Ok(Plan {
        table: table.to_string(),
        chain: chain.to_string(),
        policy,
        live: memory.rules(table, chain),
    })
}

impl Plan {
    /// Human readable listing in `iptables -S` style.
    pub fn render(&self) -> String {
        let mut out = format!("# policy ({} predicates)\n", self.policy.len());
        for (i, predicate) in self.policy.iter().enumerate() {
            out.push_str(&format!("{:>3}  {predicate}\n", i + 1));
        }
        out.push_str(&format!("# {}/{} after apply\n", self.table, self.chain));
        for predicate in &self.live {
            out.push_str(&format!("-A {} {predicate}\n", self.chain));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockwall_policy::{FileRuleSource, DOCKER_USER_CHAIN, FILTER_TABLE};
    use std::fs;

    fn engine() -> (Arc<MemoryChain>, ReconciliationEngine) {
        let chain = Arc::new(MemoryChain::new());
        (chain.clone(), ReconciliationEngine::docker_user(chain))
    }

    fn source(dir: &tempfile::TempDir, yaml: &str) -> FileRuleSource {
        let path = dir.path().join("config.yml");
        fs::write(&path, yaml).unwrap();
        FileRuleSource::new(path)
    }

    #[test]
    fn test_stop_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, engine) = engine();
        stop(&dir.path().join("dockwall.pid"), Duration::from_secs(1), &engine).unwrap();
        assert_eq!(chain.insert_count(), 0);
    }

    #[test]
    fn test_stop_unreachable_pid_clears_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("dockwall.pid");
        fs::write(&pid_path, "999999999").unwrap();
        let (chain, engine) = engine();
        engine.apply(&[]).unwrap();

        stop(&pid_path, Duration::from_secs(1), &engine).unwrap();
        assert!(!pid_path.exists());
        assert_eq!(
            chain.rules(FILTER_TABLE, DOCKER_USER_CHAIN),
            vec![Predicate::return_baseline()]
        );
    }

    #[test]
    fn test_stop_corrupt_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("dockwall.pid");
        fs::write(&pid_path, "garbage").unwrap();
        let (_, engine) = engine();

        stop(&pid_path, Duration::from_secs(1), &engine).unwrap();
        assert!(!pid_path.exists());
    }

    #[test]
    fn test_stop_process_that_exits_without_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("dockwall.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&pid_path, child.id().to_string()).unwrap();
        let reaper = std::thread::spawn(move || child.wait());
        let (chain, engine) = engine();

        stop(&pid_path, Duration::from_secs(5), &engine).unwrap();
        assert!(reaper.join().unwrap().is_ok());
        assert!(!pid_path.exists());
        assert_eq!(
            chain.rules(FILTER_TABLE, DOCKER_USER_CHAIN),
            vec![Predicate::return_baseline()]
        );
    }

    #[test]
    fn test_verify_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let rules = source(&dir, "config:\n  rules:\n  - port: 8080\n");
        let (chain, engine) = engine();

        engine.clear().unwrap();
        assert_eq!(verify(&rules, &engine).unwrap().len(), 2 + 2);

        engine.apply(&rules.load().unwrap()).unwrap();
        assert!(verify(&rules, &engine).unwrap().is_empty());

        chain.fail_queries(true);
        assert!(verify(&rules, &engine).is_err());
    }

    #[test]
    fn test_plan_replays_apply() {
        let dir = tempfile::tempdir().unwrap();
        let rules = source(&dir, "config:\n  rules:\n  - interface: [docker_gwbridge]\n");

        let plan = plan(&rules, FILTER_TABLE, DOCKER_USER_CHAIN).unwrap();
        assert_eq!(plan.policy.len(), 3);
        assert_eq!(plan.live, plan.policy.chain_order());

        let text = plan.render();
        assert!(text.contains("# policy (3 predicates)"));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "  1  -j DROP");
        assert_eq!(lines[5], "-A DOCKER-USER -i docker_gwbridge -j RETURN");
        assert!(lines[6].starts_with("-A DOCKER-USER -m conntrack"));
        assert!(text.ends_with("-A DOCKER-USER -j RETURN\n"));

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["chain"], "DOCKER-USER");
        assert_eq!(json["live"][0][1], "docker_gwbridge");
        assert_eq!(json["policy"]["predicates"][0][1], "DROP");
    }

    #[test]
    fn test_plan_without_rule_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileRuleSource::new(dir.path().join("config.yml"));
        assert!(plan(&missing, FILTER_TABLE, DOCKER_USER_CHAIN).is_err());
    }
}
