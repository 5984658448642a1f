//! In-memory chain driver
//!
//! Behaves like a filter table that only this process can see. Supports
//! fault injection and out-of-band edits so tests can simulate a failing
//! iptables binary or another administrator touching the chain.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::ChainDriver;
use crate::compiler::Predicate;
use crate::error::{PolicyError, Result};

#[derive(Debug, Default)]
struct State {
    chains: HashMap<(String, String), Vec<Predicate>>,
    /// Inserts left before every further insert fails.
    insert_budget: Option<usize>,
    fail_queries: bool,
    fail_clear: bool,
    inserts: usize,
}

#[derive(Debug, Default)]
pub struct MemoryChain {
    state: Mutex<State>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of a chain, top to bottom.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Predicate> {
        self.lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Let `n` more inserts succeed, then fail every insert.
    pub fn fail_inserts_after(&self, n: usize) {
        self.lock().insert_budget = Some(n);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    pub fn fail_clear(&self, fail: bool) {
        self.lock().fail_clear = fail;
    }

    /// Remove every fault injected so far.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.insert_budget = None;
        state.fail_queries = false;
        state.fail_clear = false;
    }

    /// Total successful inserts since creation.
    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    /// Delete the first occurrence of `rule`, as `iptables -D` would.
    pub fn remove(&self, table: &str, chain: &str, rule: &Predicate) -> bool {
        let mut state = self.lock();
        let Some(rules) = state.chains.get_mut(&(table.to_string(), chain.to_string())) else {
            return false;
        };
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Append `rule` at the bottom, as `iptables -A` would.
    pub fn append(&self, table: &str, chain: &str, rule: Predicate) {
        self.lock()
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule);
    }
}

impl ChainDriver for MemoryChain {
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_clear {
            return Err(PolicyError::driver("flush", table, chain, "injected failure"));
        }
        state
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .clear();
        Ok(())
    }

    fn insert_at_top(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.insert_budget {
            Some(0) => {
                return Err(PolicyError::driver("insert into", table, chain, "injected failure"))
            }
            Some(n) => state.insert_budget = Some(n - 1),
            None => {}
        }
        let Some(rules) = state.chains.get_mut(&(table.to_string(), chain.to_string())) else {
            return Err(PolicyError::driver("insert into", table, chain, "No chain by that name"));
        };
        rules.insert(0, Predicate::new(rule.iter().cloned()));
        state.inserts += 1;
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let state = self.lock();
        if state.fail_queries {
            return Err(PolicyError::driver("check", table, chain, "injected failure"));
        }
        let Some(rules) = state.chains.get(&(table.to_string(), chain.to_string())) else {
            return Err(PolicyError::driver("check", table, chain, "No chain by that name"));
        };
        Ok(rules.iter().any(|r| r.tokens() == rule))
    }
}
