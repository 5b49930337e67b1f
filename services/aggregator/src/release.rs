use std::{
    net::TcpStream,
    sync::{Arc, Mutex, TryLockError, mpsc},
    time::Duration,
};

use protocol::{
    Delivery, PermitClient, PermitGuard, PermitOutcome, ProtocolError, TransferSession,
    connect_with_timeout,
};
use schema::Metric;
use store::{AccumulationStore, DrainDecision};
use tracing::{debug, error, info, warn};

use crate::{error::ReleaseError, stats::AggregatorStats};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Confirmed by the downstream and cleared locally.
    pub delivered: Vec<Metric>,
    /// Answered with something other than `RECEBIDO`; kept for the next cycle.
    pub rejected: Vec<Metric>,
    /// The session broke before every accumulation was attempted.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already in flight.
    Skipped,
    /// Every accumulation was header-only; nothing touched the network.
    Idle,
    Denied,
    Completed(CycleReport),
}

/// Periodically ships non-empty metric accumulations to the downstream
/// collector while holding the coordinator permit.
#[derive(Debug)]
pub struct BatchReleaser {
    store: Arc<AccumulationStore>,
    permits: PermitClient,
    collector_addr: String,
    socket_timeout: Duration,
    cycle_lock: Mutex<()>,
    stats: Arc<AggregatorStats>,
}

impl BatchReleaser {
    pub fn new(
        store: Arc<AccumulationStore>,
        permits: PermitClient,
        collector_addr: impl Into<String>,
        socket_timeout: Duration,
        stats: Arc<AggregatorStats>,
    ) -> Self {
        Self {
            store,
            permits,
            collector_addr: collector_addr.into(),
            socket_timeout,
            cycle_lock: Mutex::new(()),
            stats,
        }
    }

    pub fn run_cycle(&self) -> Result<CycleOutcome, ReleaseError> {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("release cycle already in flight, skipping");
                return Ok(CycleOutcome::Skipped);
            }
        };

        if self.store.all_empty()? {
            self.stats.observe_cycle_idle();
            debug!("all accumulations empty, nothing to release");
            return Ok(CycleOutcome::Idle);
        }

        let permit = match self.permits.acquire().map_err(ReleaseError::Permit)? {
            PermitOutcome::Granted(guard) => guard,
            PermitOutcome::Denied => {
                self.stats.observe_cycle_denied();
                warn!("permit denied, release deferred to next cycle");
                return Ok(CycleOutcome::Denied);
            }
        };

        let result = self.transfer_all(&permit);
        if let Err(err) = permit.release() {
            warn!(error = %err, "permit release failed, coordinator will reclaim on expiry");
        }

        match &result {
            Ok(report) => {
                self.stats
                    .observe_cycle_completed(report.delivered.len(), report.rejected.len());
                info!(
                    delivered = report.delivered.len(),
                    rejected = report.rejected.len(),
                    interrupted = report.interrupted,
                    stats = ?self.stats.snapshot(),
                    "release cycle finished"
                );
            }
            Err(_) => self.stats.observe_cycle_failed(),
        }
        result.map(CycleOutcome::Completed)
    }

    /// Every exchange with the collector is bounded by what is left of the
    /// lease, so the session stops before the coordinator can hand the
    /// permit to someone else.
    fn transfer_all(&self, permit: &PermitGuard) -> Result<CycleReport, ReleaseError> {
        let timeout = self.lease_bounded_timeout(permit)?;
        let stream = connect_with_timeout(&self.collector_addr, timeout)?;
        let mut session = TransferSession::open(stream)?;
        let mut report = CycleReport::default();

        for metric in Metric::ALL {
            let drained = self.store.drain_with(metric, |contents| {
                let timeout = self.lease_bounded_timeout(permit)?;
                bound_exchange(session.get_ref(), timeout)?;
                let delivery = session.send_file(metric.file_name(), contents)?;
                let decision = match delivery {
                    Delivery::Confirmed => DrainDecision::Clear,
                    Delivery::Rejected(_) => DrainDecision::Keep,
                };
                Ok::<_, ReleaseError>((delivery, decision))
            });
            match drained {
                Ok(None) => {}
                Ok(Some(Delivery::Confirmed)) => {
                    info!(metric = %metric, file = metric.file_name(), "accumulation delivered");
                    report.delivered.push(metric);
                }
                Ok(Some(Delivery::Rejected(reply))) => {
                    warn!(metric = %metric, %reply, "delivery not confirmed, keeping accumulation");
                    report.rejected.push(metric);
                }
                Err(ReleaseError::Store(err)) => {
                    error!(metric = %metric, error = %err, "accumulation unavailable this cycle");
                }
                Err(ReleaseError::LeaseExpired) => {
                    warn!(metric = %metric, "lease budget spent, remaining accumulations kept");
                    report.interrupted = true;
                    return Ok(report);
                }
                Err(err) => {
                    error!(metric = %metric, error = %err, "transfer session broken");
                    report.interrupted = true;
                    return Ok(report);
                }
            }
        }

        match self.lease_bounded_timeout(permit) {
            Ok(timeout) => {
                if let Err(err) = bound_exchange(session.get_ref(), timeout)
                    .and_then(|()| session.finish())
                {
                    warn!(error = %err, "failed to send end-of-transfer marker");
                }
            }
            Err(_) => warn!("lease budget spent, end-of-transfer marker not sent"),
        }
        Ok(report)
    }

    /// Socket timeout for the next exchange, capped by the time left on the
    /// lease.
    fn lease_bounded_timeout(&self, permit: &PermitGuard) -> Result<Duration, ReleaseError> {
        permit
            .remaining()
            .map(|left| left.min(self.socket_timeout))
            .ok_or(ReleaseError::LeaseExpired)
    }
}

fn bound_exchange(stream: &TcpStream, timeout: Duration) -> Result<(), ProtocolError> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Fires [`BatchReleaser::run_cycle`] every `interval` until `shutdown`
/// receives a message or its sender is dropped. The first cycle runs after
/// one full interval.
pub fn run_release_timer(
    releaser: &BatchReleaser,
    interval: Duration,
    shutdown: &mpsc::Receiver<()>,
) {
    loop {
        match shutdown.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => match releaser.run_cycle() {
                Ok(outcome) => debug!(?outcome, "release timer tick"),
                Err(err) => error!(error = %err, "release cycle failed"),
            },
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("release timer stopped");
                return;
            }
        }
    }
}
