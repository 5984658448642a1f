//! dockwall policy core
//!
//! Compiles declarative allow rules into iptables predicates and keeps the
//! `DOCKER-USER` chain of the `filter` table in sync with them:
//!   - `rule`      rule model and rule-file loading
//!   - `compiler`  rule → predicate expansion, PolicySet construction
//!   - `driver`    the chain capability (iptables binary, in-memory chain)
//!   - `engine`    apply / verify / clear against a driver

pub mod compiler;
pub mod driver;
pub mod engine;
pub mod error;
pub mod rule;

pub use compiler::{compile, PolicySet, Predicate};
pub use driver::{ChainDriver, IptablesDriver, MemoryChain};
pub use engine::ReconciliationEngine;
pub use error::{PolicyError, Result};
pub use rule::{load_rules, FileRuleSource, Rule, RuleSource, RULES_FILE};

/// Table the managed chain lives in.
pub const FILTER_TABLE: &str = "filter";

/// Chain Docker consults before its own forwarding rules.
pub const DOCKER_USER_CHAIN: &str = "DOCKER-USER";

/// Target used for "leave this chain and continue normal forwarding".
pub const RETURN_TARGET: &str = "RETURN";
