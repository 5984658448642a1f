//! iptables chain driver: shells out to the iptables binary

use std::process::{Command, Output};
use tracing::debug;

use super::ChainDriver;
use crate::error::{PolicyError, Result};

/// Exit status `iptables -C` uses for "no matching rule".
const CHECK_MISSING_STATUS: i32 = 1;

/// Drives a chain through the `iptables` command line.
#[derive(Debug, Clone)]
pub struct IptablesDriver {
    binary: String,
}

impl Default for IptablesDriver {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesDriver {
    /// `binary` is the program to run, e.g. `iptables` or `iptables-legacy`.
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Argument vector for one invocation: `--wait -t TABLE <op...>`.
    fn args(table: &str, op: &[&str], rule: &[String]) -> Vec<String> {
        let mut args = vec!["--wait".to_string(), "-t".to_string(), table.to_string()];
        args.extend(op.iter().map(|s| s.to_string()));
        args.extend(rule.iter().cloned());
        args
    }

    fn run(
        &self,
        operation: &'static str,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<Output> {
        debug!(binary = %self.binary, args = %args.join(" "), "Running iptables");
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| {
                PolicyError::driver(
                    operation,
                    table,
                    chain,
                    format!("failed to execute {}: {e}", self.binary),
                )
            })
    }

    fn failure(operation: &'static str, table: &str, chain: &str, output: &Output) -> PolicyError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        PolicyError::driver(
            operation,
            table,
            chain,
            format!("{} ({})", stderr.trim(), output.status),
        )
    }
}

impl ChainDriver for IptablesDriver {
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        let create = self.run("create", table, chain, &Self::args(table, &["-N", chain], &[]))?;
        if !create.status.success() {
            let stderr = String::from_utf8_lossy(&create.stderr);
            if !stderr.contains("already exists") {
                return Err(Self::failure("create", table, chain, &create));
            }
        }

        let flush = self.run("flush", table, chain, &Self::args(table, &["-F", chain], &[]))?;
        if !flush.status.success() {
            return Err(Self::failure("flush", table, chain, &flush));
        }
        Ok(())
    }

    fn insert_at_top(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let output = self.run(
            "insert into",
            table,
            chain,
            &Self::args(table, &["-I", chain, "1"], rule),
        )?;
        if !output.status.success() {
            return Err(Self::failure("insert into", table, chain, &output));
        }
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let output = self.run("check", table, chain, &Self::args(table, &["-C", chain], rule))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(CHECK_MISSING_STATUS) => Ok(false),
            _ => Err(Self::failure("check", table, chain, &output)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_args() {
        let rule: Vec<String> = ["-p", "tcp", "-m", "tcp", "--dport", "8080", "-j", "RETURN"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let args = IptablesDriver::args("filter", &["-I", "DOCKER-USER", "1"], &rule);
        assert_eq!(
            args.join(" "),
            "--wait -t filter -I DOCKER-USER 1 -p tcp -m tcp --dport 8080 -j RETURN"
        );
    }

    #[test]
    fn test_check_args() {
        let rule = ["-j".to_string(), "DROP".to_string()];
        let args = IptablesDriver::args("filter", &["-C", "DOCKER-USER"], &rule);
        assert_eq!(args.join(" "), "--wait -t filter -C DOCKER-USER -j DROP");
    }

    #[test]
    fn test_missing_binary_is_driver_error() {
        let driver = IptablesDriver::new("/nonexistent/iptables");
        let err = driver.clear_chain("filter", "DOCKER-USER").unwrap_err();
        assert!(err.is_driver_error());
        assert!(err.to_string().contains("/nonexistent/iptables"));

        let err = driver
            .exists("filter", "DOCKER-USER", &["-j".into(), "DROP".into()])
            .unwrap_err();
        assert!(err.is_driver_error());
    }

    #[test]
    fn test_default_binary() {
        assert_eq!(IptablesDriver::default().binary(), "iptables");
    }
}
