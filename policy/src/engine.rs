//! Reconciliation engine: installs a PolicySet into the managed chain
//!
//! The chain is never edited incrementally: `apply` flushes it and rebuilds
//! it from scratch, `verify` only reads, `clear` leaves it fail-open.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compiler::{PolicySet, Predicate};
use crate::driver::ChainDriver;
use crate::error::Result;
use crate::rule::Rule;
use crate::{DOCKER_USER_CHAIN, FILTER_TABLE};

/// Keeps one chain of one table in sync with a rule list.
#[derive(Clone)]
pub struct ReconciliationEngine {
    driver: Arc<dyn ChainDriver>,
    table: String,
    chain: String,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("table", &self.table)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    pub fn new(driver: Arc<dyn ChainDriver>, table: &str, chain: &str) -> Self {
        Self {
            driver,
            table: table.to_string(),
            chain: chain.to_string(),
        }
    }

    /// Engine for `filter/DOCKER-USER`.
    pub fn docker_user(driver: Arc<dyn ChainDriver>) -> Self {
        Self::new(driver, FILTER_TABLE, DOCKER_USER_CHAIN)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Replace the chain contents with the policy for `rules`.
    ///
    /// Predicates are inserted at position 1 in policy order on top of the
    /// return baseline, so the finished chain holds the policy reversed
    /// (see [`PolicySet::chain_order`]): later rules first, then the
    /// established fast-accept, the drop-catch and the trailing RETURN.
    /// The first failing insert aborts the apply and leaves the chain
    /// partially built. Returns the number of policy predicates installed.
    pub fn apply(&self, rules: &[Rule]) -> Result<usize> {
        let policy = PolicySet::from_rules(rules)?;
        info!(
            table = %self.table,
            chain = %self.chain,
            rules = rules.len(),
            predicates = policy.len(),
            "Applying policy"
        );

        self.reset()?;
        for predicate in policy.iter() {
            debug!(predicate = %predicate, "Inserting");
            self.driver
                .insert_at_top(&self.table, &self.chain, predicate.tokens())?;
        }

        info!(chain = %self.chain, predicates = policy.len(), "Policy applied");
        Ok(policy.len())
    }

    /// Policy predicates absent from the chain, in policy order.
    pub fn missing(&self, rules: &[Rule]) -> Result<Vec<Predicate>> {
        let policy = PolicySet::from_rules(rules)?;
        let mut missing = Vec::new();
        for predicate in policy.iter() {
            if !self
                .driver
                .exists(&self.table, &self.chain, predicate.tokens())?
            {
                missing.push(predicate.clone());
            }
        }
        Ok(missing)
    }

    /// True when every policy predicate is present. Position is not checked.
    pub fn verify(&self, rules: &[Rule]) -> Result<bool> {
        let missing = self.missing(rules)?;
        for predicate in &missing {
            warn!(chain = %self.chain, predicate = %predicate, "Predicate missing from chain");
        }
        Ok(missing.is_empty())
    }

    /// Empty the chain down to the return baseline, letting all traffic
    /// through to Docker's own rules.
    pub fn clear(&self) -> Result<()> {
        info!(table = %self.table, chain = %self.chain, "Clearing chain");
        self.reset()
    }

    fn reset(&self) -> Result<()> {
        self.driver.clear_chain(&self.table, &self.chain)?;
        self.driver.insert_at_top(
            &self.table,
            &self.chain,
            Predicate::return_baseline().tokens(),
        )
    }
}
