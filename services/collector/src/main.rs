use std::net::TcpListener;

use clap::Parser;
use collector::{CollectorConfig, DirectorySink, serve};
use tracing::error;

fn main() {
    telemetry::init_logging("info");
    if let Err(err) = run() {
        error!("collector failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = CollectorConfig::parse();
    config.validate()?;

    let sink = DirectorySink::open(&config.out_dir)
        .map_err(|err| format!("cannot open '{}': {err}", config.out_dir.display()))?;
    let listener = TcpListener::bind(&config.bind)
        .map_err(|err| format!("cannot bind '{}': {err}", config.bind))?;
    serve(listener, sink, config.socket_timeout()).map_err(|err| err.to_string())
}
