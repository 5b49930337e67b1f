use std::{net::TcpListener, sync::Arc};

use clap::Parser;
use coordinator::{CoordinatorConfig, PermitTable, serve};
use tracing::error;

fn main() {
    telemetry::init_logging("info");
    if let Err(err) = run() {
        error!("coordinator failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = CoordinatorConfig::parse();
    config.validate()?;
    let settings = config.settings();

    let listener = TcpListener::bind(&config.bind)
        .map_err(|err| format!("cannot bind '{}': {err}", config.bind))?;
    let table = Arc::new(PermitTable::new(settings.lease_ttl));
    serve(listener, table, settings).map_err(|err| err.to_string())
}
