//! Rule compiler: expands declarative rules into iptables predicates
//!
//! Every rule fans out over three dimensions, enumerated interface-outer,
//! protocol-next, address-inner:
//!
//! ```text
//! for interface in interfaces (or "any")
//!   for protocol in protocols (given, tcp+udp when port or allow is set, or "any")
//!     for source in allow (or "any")
//!       [-i IFACE] [-p PROTO -m PROTO] [--dport PORT] [-s SRC] -j RETURN
//! ```
//!
//! Order matters: predicates are installed in a first-match chain.

use serde::Serialize;
use std::fmt;

use crate::error::{PolicyError, Result};
use crate::rule::Rule;
use crate::RETURN_TARGET;

/// Transports a port-only rule is expanded over, in this order.
pub const TRANSPORT_PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// One concrete iptables rule specification, e.g.
/// `-i eth0 -p tcp -m tcp --dport 8080 -s 10.1.1.1 -j RETURN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Predicate(Vec<String>);

impl Predicate {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Unconditional drop-catch.
    pub fn baseline_drop() -> Self {
        Self::new(["-j", "DROP"])
    }

    /// Fast path for traffic belonging to a tracked connection.
    pub fn baseline_established() -> Self {
        Self::new([
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            RETURN_TARGET,
        ])
    }

    /// The lone rule left in a cleared chain.
    pub fn return_baseline() -> Self {
        Self::new(["-j", RETURN_TARGET])
    }

    /// Tokens come in flag/value pairs and the last pair is a jump.
    fn is_well_formed(&self) -> bool {
        let n = self.0.len();
        n >= 2 && n % 2 == 0 && self.0[n - 2] == "-j" && !self.0[n - 1].is_empty()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

fn dimension(values: &[String]) -> Vec<Option<&str>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().map(|v| Some(v.as_str())).collect()
    }
}

/// Expand one rule into its predicates.
pub fn compile(rule: &Rule) -> Vec<Predicate> {
    let port = rule.port();
    // An unset protocol means both transports, except for rules that only
    // name interfaces (or nothing at all).
    let fan_out = port.is_some() || !rule.allow.is_empty();
    let protocols: Vec<Option<String>> = match rule.protocol() {
        Some(protocol) => vec![Some(protocol)],
        None if fan_out => TRANSPORT_PROTOCOLS
            .iter()
            .map(|p| Some(p.to_string()))
            .collect(),
        None => vec![None],
    };
    let interfaces = dimension(&rule.interfaces);
    let sources = dimension(&rule.allow);

    let mut predicates = Vec::with_capacity(interfaces.len() * protocols.len() * sources.len());
    for interface in &interfaces {
        for protocol in &protocols {
            for source in &sources {
                let mut tokens: Vec<String> = Vec::new();
                if let Some(interface) = interface {
                    tokens.extend(["-i".to_string(), interface.to_string()]);
                }
                if let Some(protocol) = protocol {
                    tokens.extend([
                        "-p".to_string(),
                        protocol.clone(),
                        "-m".to_string(),
                        protocol.clone(),
                    ]);
                }
                if let Some(port) = port {
                    tokens.extend(["--dport".to_string(), port.to_string()]);
                }
                if let Some(source) = source {
                    tokens.extend(["-s".to_string(), source.to_string()]);
                }
                tokens.extend(["-j".to_string(), RETURN_TARGET.to_string()]);
                predicates.push(Predicate(tokens));
            }
        }
    }
    predicates
}

/// Full ordered predicate list for a rule list: the two baselines followed by
/// every rule's predicates in rule order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySet {
    predicates: Vec<Predicate>,
}

impl PolicySet {
    pub const BASELINE_LEN: usize = 2;

    pub fn from_rules(rules: &[Rule]) -> Result<Self> {
        let mut predicates = vec![Predicate::baseline_drop(), Predicate::baseline_established()];
        for (index, rule) in rules.iter().enumerate() {
            let compiled = compile(rule);
            if compiled.is_empty() {
                return Err(PolicyError::CompileInvariantViolation(format!(
                    "rule #{index} expanded to no predicates"
                )));
            }
            if let Some(bad) = compiled.iter().find(|p| !p.is_well_formed()) {
                return Err(PolicyError::CompileInvariantViolation(format!(
                    "rule #{index} produced malformed predicate `{bad}`"
                )));
            }
            predicates.extend(compiled);
        }
        Ok(Self { predicates })
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Predicates contributed by rules, baselines excluded.
    pub fn rule_predicates(&self) -> &[Predicate] {
        &self.predicates[Self::BASELINE_LEN..]
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> {
        self.predicates.iter()
    }

    /// Chain contents left by `ReconciliationEngine::apply`: every predicate
    /// was inserted at position 1 in policy order, on top of the return
    /// baseline, so the policy appears reversed.
    pub fn chain_order(&self) -> Vec<Predicate> {
        let mut chain: Vec<Predicate> = self.predicates.iter().rev().cloned().collect();
        chain.push(Predicate::return_baseline());
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compiled predicates as `iptables -S` style strings.
    fn rendered(rule: &Rule) -> Vec<String> {
        compile(rule).iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_port_only_expands_tcp_then_udp() {
        let rule = Rule::default().with_port(8080);
        assert_eq!(
            compile(&rule)[0].tokens(),
            ["-p", "tcp", "-m", "tcp", "--dport", "8080", "-j", "RETURN"]
        );
        assert_eq!(
            rendered(&rule),
            [
                "-p tcp -m tcp --dport 8080 -j RETURN",
                "-p udp -m udp --dport 8080 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_interface_outer_address_inner() {
        let rule = Rule::default()
            .with_interfaces(["eth0", "eth1"])
            .with_protocol("tcp")
            .with_port(8080)
            .with_allow(["10.1.1.1", "192.168.10.11"]);
        assert_eq!(
            rendered(&rule),
            [
                "-i eth0 -p tcp -m tcp --dport 8080 -s 10.1.1.1 -j RETURN",
                "-i eth0 -p tcp -m tcp --dport 8080 -s 192.168.10.11 -j RETURN",
                "-i eth1 -p tcp -m tcp --dport 8080 -s 10.1.1.1 -j RETURN",
                "-i eth1 -p tcp -m tcp --dport 8080 -s 192.168.10.11 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_protocol_varies_slower_than_address() {
        let rule = Rule::default()
            .with_port(8080)
            .with_allow(["10.1.1.1", "10.2.1.2"]);
        assert_eq!(
            rendered(&rule),
            [
                "-p tcp -m tcp --dport 8080 -s 10.1.1.1 -j RETURN",
                "-p tcp -m tcp --dport 8080 -s 10.2.1.2 -j RETURN",
                "-p udp -m udp --dport 8080 -s 10.1.1.1 -j RETURN",
                "-p udp -m udp --dport 8080 -s 10.2.1.2 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_allow_only_expands_tcp_then_udp() {
        let rule = Rule::default().with_allow(["10.1.1.1", "10.0.0.0/8"]);
        assert_eq!(
            compile(&rule)[0].tokens(),
            ["-p", "tcp", "-m", "tcp", "-s", "10.1.1.1", "-j", "RETURN"]
        );
        assert_eq!(
            rendered(&rule),
            [
                "-p tcp -m tcp -s 10.1.1.1 -j RETURN",
                "-p tcp -m tcp -s 10.0.0.0/8 -j RETURN",
                "-p udp -m udp -s 10.1.1.1 -j RETURN",
                "-p udp -m udp -s 10.0.0.0/8 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_interface_and_allow_expand_tcp_then_udp() {
        let rule = Rule::default()
            .with_interfaces(["eth0"])
            .with_allow(["10.1.1.1", "10.2.1.2"]);
        assert_eq!(
            rendered(&rule),
            [
                "-i eth0 -p tcp -m tcp -s 10.1.1.1 -j RETURN",
                "-i eth0 -p tcp -m tcp -s 10.2.1.2 -j RETURN",
                "-i eth0 -p udp -m udp -s 10.1.1.1 -j RETURN",
                "-i eth0 -p udp -m udp -s 10.2.1.2 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_interface_only() {
        let rule = Rule::default().with_interfaces(["docker_gwbridge", "eth1"]);
        assert_eq!(
            rendered(&rule),
            ["-i docker_gwbridge -j RETURN", "-i eth1 -j RETURN"]
        );
    }

    #[test]
    fn test_empty_rule_is_decision_only() {
        assert_eq!(compile(&Rule::default())[0].tokens(), ["-j", "RETURN"]);
        assert_eq!(compile(&Rule::default()).len(), 1);
    }

    #[test]
    fn test_explicit_protocol_without_port() {
        let rule = Rule::default().with_protocol("UDP");
        assert_eq!(rendered(&rule), ["-p udp -m udp -j RETURN"]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let rule = Rule::default()
            .with_interfaces(["eth0", "eth1"])
            .with_port(53)
            .with_allow(["10.1.1.1", "10.2.1.2", "172.18.9.5"]);
        let twin = rule.clone();
        assert_eq!(compile(&rule), compile(&rule));
        assert_eq!(compile(&rule), compile(&twin));
        assert_eq!(compile(&rule).len(), 2 * 2 * 3);
    }

    #[test]
    fn test_policy_set_layout() {
        let rules = vec![
            Rule::default().with_port(8080),
            Rule::default().with_interfaces(["eth0"]),
        ];
        let policy = PolicySet::from_rules(&rules).unwrap();
        assert_eq!(policy.len(), 5);
        assert_eq!(policy.predicates()[0], Predicate::baseline_drop());
        assert_eq!(policy.predicates()[1], Predicate::baseline_established());
        assert_eq!(policy.rule_predicates()[2].to_string(), "-i eth0 -j RETURN");
    }

    #[test]
    fn test_empty_rule_list_is_baseline_only() {
        let policy = PolicySet::from_rules(&[]).unwrap();
        assert_eq!(policy.len(), PolicySet::BASELINE_LEN);
        assert!(policy.rule_predicates().is_empty());
    }

    #[test]
    fn test_chain_order_reverses_policy() {
        let rules = [Rule::default().with_interfaces(["eth0"])];
        let policy = PolicySet::from_rules(&rules).unwrap();
        let chain: Vec<String> = policy.chain_order().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            chain,
            vec![
                "-i eth0 -j RETURN",
                "-m conntrack --ctstate RELATED,ESTABLISHED -j RETURN",
                "-j DROP",
                "-j RETURN",
            ]
        );
    }

    #[test]
    fn test_well_formed_check() {
        assert!(Predicate::baseline_drop().is_well_formed());
        assert!(Predicate::baseline_established().is_well_formed());
        assert!(!Predicate::new(["-s", "10.1.1.1"]).is_well_formed());
        assert!(!Predicate::new(["-j"]).is_well_formed());
    }
}
