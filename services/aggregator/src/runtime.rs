use std::{
    net::TcpListener,
    sync::{Arc, mpsc},
};

use protocol::PermitClient;
use store::{AccumulationStore, PayloadArchive, StoreError};
use tracing::{info, warn};

use crate::{
    config::AggregatorSettings,
    ingest::IngestEndpoint,
    release::{BatchReleaser, run_release_timer},
    reshape::Reshaper,
    stats::{AggregatorStats, StatsSnapshot},
};

/// Everything one aggregator process runs: the ingest endpoint and the
/// batch releaser, sharing one accumulation store.
#[derive(Debug)]
pub struct AggregatorRuntime {
    settings: AggregatorSettings,
    store: Arc<AccumulationStore>,
    ingest: IngestEndpoint,
    releaser: BatchReleaser,
    stats: Arc<AggregatorStats>,
}

impl AggregatorRuntime {
    pub fn open(settings: AggregatorSettings) -> Result<Self, StoreError> {
        let store = Arc::new(AccumulationStore::open(settings.outbound_dir())?);
        let archive = PayloadArchive::open(settings.received_dir())?;
        let retained = archive.retained()?;
        if !retained.is_empty() {
            warn!(
                count = retained.len(),
                dir = %archive.dir().display(),
                "archived payloads left over from earlier runs"
            );
        }

        let stats = Arc::new(AggregatorStats::default());
        let permits = PermitClient::new(settings.coordinator_addr.clone(), settings.socket_timeout)
            .with_lease_budget(settings.lease_budget);
        let ingest = IngestEndpoint::new(
            archive,
            Reshaper::new(Arc::clone(&store)),
            settings.ingest_requires_permit.then(|| permits.clone()),
            settings.socket_timeout,
            settings.max_payload_bytes,
            Arc::clone(&stats),
        );
        let releaser = BatchReleaser::new(
            Arc::clone(&store),
            permits,
            settings.collector_addr.clone(),
            settings.socket_timeout,
            Arc::clone(&stats),
        );
        Ok(Self {
            settings,
            store,
            ingest,
            releaser,
            stats,
        })
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<AccumulationStore> {
        &self.store
    }

    pub fn ingest(&self) -> &IngestEndpoint {
        &self.ingest
    }

    pub fn releaser(&self) -> &BatchReleaser {
        &self.releaser
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.settings.ingest_bind)?;
        self.serve_on(listener)
    }

    /// Runs the release timer and the ingest accept loop until the listener
    /// stops yielding connections.
    pub fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            coordinator = %self.settings.coordinator_addr,
            collector = %self.settings.collector_addr,
            release_interval_secs = self.settings.release_interval.as_secs(),
            ingest_requires_permit = self.settings.ingest_requires_permit,
            "aggregator listening"
        );
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.settings.release_interval;

        std::thread::scope(|scope| {
            scope.spawn(move || run_release_timer(&self.releaser, interval, &shutdown_rx));
            self.ingest.serve(&listener);
            let _ = shutdown_tx.send(());
        });
        Ok(())
    }
}
