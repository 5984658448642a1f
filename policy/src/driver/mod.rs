//! Chain drivers: the three primitives the engine needs from a filter table.
//!
//! `IptablesDriver` runs the `iptables` binary; `MemoryChain` keeps chains in
//! process memory for tests and offline planning.

pub mod iptables;
pub mod memory;

pub use iptables::IptablesDriver;
pub use memory::MemoryChain;

use crate::error::Result;

/// Access to a live, externally shared chain. Implementations must not
/// assume exclusive ownership of the chain.
pub trait ChainDriver: Send + Sync {
    /// Empty the chain, creating it first if it does not exist.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Insert `rule` at position 1.
    fn insert_at_top(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;

    /// Whether a rule with exactly this specification is present.
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool>;
}
