use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};

const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "aggregator",
    about = "Collects sensor payloads and releases per-metric batches downstream"
)]
pub struct AggregatorConfig {
    /// Address sensor sources connect to.
    #[arg(long = "ingest-bind", env = "AGGREGATOR_INGEST_BIND", default_value = "0.0.0.0:5000")]
    pub ingest_bind: String,

    #[arg(
        long = "coordinator-addr",
        env = "AGGREGATOR_COORDINATOR_ADDR",
        default_value = "127.0.0.1:6000"
    )]
    pub coordinator_addr: String,

    #[arg(
        long = "collector-addr",
        env = "AGGREGATOR_COLLECTOR_ADDR",
        default_value = "127.0.0.1:6050"
    )]
    pub collector_addr: String,

    /// Root for `received/` (raw payload archive) and `outbound/` (metric
    /// accumulations).
    #[arg(long = "data-dir", env = "AGGREGATOR_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(
        long = "release-interval-secs",
        env = "AGGREGATOR_RELEASE_INTERVAL_SECS",
        default_value_t = 300
    )]
    pub release_interval_secs: u64,

    #[arg(
        long = "socket-timeout-secs",
        env = "AGGREGATOR_SOCKET_TIMEOUT_SECS",
        default_value_t = 30
    )]
    pub socket_timeout_secs: u64,

    #[arg(
        long = "max-payload-bytes",
        env = "AGGREGATOR_MAX_PAYLOAD_BYTES",
        default_value_t = DEFAULT_MAX_PAYLOAD_BYTES
    )]
    pub max_payload_bytes: u64,

    /// How long a granted permit is worked under before the work is cut off.
    /// Keep it below the coordinator's lease TTL.
    #[arg(
        long = "lease-budget-ms",
        env = "AGGREGATOR_LEASE_BUDGET_MS",
        default_value_t = 90_000
    )]
    pub lease_budget_ms: u64,

    /// Hold the coordinator permit while archiving and reshaping each payload.
    #[arg(
        long = "ingest-requires-permit",
        env = "AGGREGATOR_INGEST_REQUIRES_PERMIT",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub ingest_requires_permit: bool,
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (flag, value) in [
            ("--ingest-bind", &self.ingest_bind),
            ("--coordinator-addr", &self.coordinator_addr),
            ("--collector-addr", &self.collector_addr),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{flag} is empty"));
            }
        }
        if self.release_interval_secs == 0 {
            return Err("--release-interval-secs must be > 0".to_string());
        }
        if self.socket_timeout_secs == 0 {
            return Err("--socket-timeout-secs must be > 0".to_string());
        }
        if self.max_payload_bytes == 0 {
            return Err("--max-payload-bytes must be > 0".to_string());
        }
        if self.lease_budget_ms == 0 {
            return Err("--lease-budget-ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            ingest_bind: self.ingest_bind.clone(),
            coordinator_addr: self.coordinator_addr.clone(),
            collector_addr: self.collector_addr.clone(),
            data_dir: self.data_dir.clone(),
            release_interval: Duration::from_secs(self.release_interval_secs),
            socket_timeout: Duration::from_secs(self.socket_timeout_secs),
            max_payload_bytes: self.max_payload_bytes,
            lease_budget: Duration::from_millis(self.lease_budget_ms),
            ingest_requires_permit: self.ingest_requires_permit,
        }
    }
}

/// Runtime settings, decoupled from the CLI so tests can build them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub ingest_bind: String,
    pub coordinator_addr: String,
    pub collector_addr: String,
    pub data_dir: PathBuf,
    pub release_interval: Duration,
    pub socket_timeout: Duration,
    pub max_payload_bytes: u64,
    pub lease_budget: Duration,
    pub ingest_requires_permit: bool,
}

impl AggregatorSettings {
    pub fn received_dir(&self) -> PathBuf {
        self.data_dir.join("received")
    }

    pub fn outbound_dir(&self) -> PathBuf {
        self.data_dir.join("outbound")
    }
}
