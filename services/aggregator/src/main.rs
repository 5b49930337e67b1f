use aggregator::{AggregatorConfig, AggregatorRuntime};
use clap::Parser;
use tracing::error;

fn main() {
    telemetry::init_logging("info");
    if let Err(err) = run() {
        error!("aggregator failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = AggregatorConfig::parse();
    config.validate()?;
    let settings = config.settings();

    let runtime = AggregatorRuntime::open(settings.clone())
        .map_err(|err| format!("cannot open data dir '{}': {err}", settings.data_dir.display()))?;
    runtime
        .serve()
        .map_err(|err| format!("cannot serve on '{}': {err}", settings.ingest_bind))
}
