use std::time::Duration;

use clap::Parser;

use crate::server::CoordinatorSettings;

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "coordinator", about = "Single-permit lock coordinator")]
pub struct CoordinatorConfig {
    /// Address the permit protocol listens on.
    #[arg(long, env = "COORDINATOR_BIND", default_value = "0.0.0.0:6000")]
    pub bind: String,

    /// Lease time-to-live; a holder that neither releases nor disconnects
    /// within this window loses the permit.
    #[arg(long = "lease-ms", env = "COORDINATOR_LEASE_MS", default_value_t = 120_000)]
    pub lease_ms: u64,

    #[arg(
        long = "socket-timeout-secs",
        env = "COORDINATOR_SOCKET_TIMEOUT_SECS",
        default_value_t = 30
    )]
    pub socket_timeout_secs: u64,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bind.trim().is_empty() {
            return Err("bind address is empty".to_string());
        }
        if self.lease_ms == 0 {
            return Err("--lease-ms must be > 0".to_string());
        }
        if self.socket_timeout_secs == 0 {
            return Err("--socket-timeout-secs must be > 0".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            lease_ttl: Duration::from_millis(self.lease_ms),
            socket_timeout: Duration::from_secs(self.socket_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_ports() {
        let config = CoordinatorConfig::try_parse_from(["coordinator"]).unwrap();
        assert_eq!(config.bind, "0.0.0.0:6000");
        assert!(config.validate().is_ok());
        assert_eq!(config.settings(), CoordinatorSettings::default());
    }

    #[test]
    fn cli_overrides_apply() {
        let config = CoordinatorConfig::try_parse_from([
            "coordinator",
            "--bind",
            "127.0.0.1:7000",
            "--lease-ms=2500",
        ])
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:7000");
        assert_eq!(config.settings().lease_ttl, Duration::from_millis(2500));
    }

    #[test]
    fn zero_lease_is_rejected() {
        let config = CoordinatorConfig::try_parse_from(["coordinator", "--lease-ms", "0"]).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("lease"));
    }
}
