pub mod config;
pub mod error;
pub mod ingest;
pub mod release;
pub mod reshape;
pub mod runtime;
pub mod stats;

pub use config::{AggregatorConfig, AggregatorSettings};
pub use error::{IngestError, ReleaseError};
pub use ingest::{IngestEndpoint, IngestOutcome};
pub use release::{BatchReleaser, CycleOutcome, CycleReport, run_release_timer};
pub use reshape::{ReshapeReport, Reshaper};
pub use runtime::AggregatorRuntime;
pub use stats::{AggregatorStats, StatsSnapshot};
