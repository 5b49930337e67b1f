use std::{
    io::{ErrorKind, Read},
    net::{TcpListener, TcpStream},
    sync::Arc,
    time::Duration,
};

use protocol::{PermitClient, PermitGuard, PermitOutcome};
use store::PayloadArchive;
use tracing::{debug, error, info, warn};

use crate::{
    error::IngestError,
    reshape::{ReshapeReport, Reshaper},
    stats::AggregatorStats,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed(ReshapeReport),
    /// The coordinator refused the permit; the payload was not read.
    PermitDenied,
    /// The peer closed without sending anything.
    Empty,
}

/// Accepts raw sensor payloads, one per connection.
#[derive(Debug)]
pub struct IngestEndpoint {
    archive: PayloadArchive,
    reshaper: Reshaper,
    permits: Option<PermitClient>,
    socket_timeout: Duration,
    max_payload_bytes: u64,
    stats: Arc<AggregatorStats>,
}

impl IngestEndpoint {
    pub fn new(
        archive: PayloadArchive,
        reshaper: Reshaper,
        permits: Option<PermitClient>,
        socket_timeout: Duration,
        max_payload_bytes: u64,
        stats: Arc<AggregatorStats>,
    ) -> Self {
        Self {
            archive,
            reshaper,
            permits,
            socket_timeout,
            max_payload_bytes,
            stats,
        }
    }

    pub fn archive(&self) -> &PayloadArchive {
        &self.archive
    }

    /// Runs the accept loop. Each connection is served on its own scoped
    /// thread; no per-connection failure ends the loop.
    pub fn serve(&self, listener: &TcpListener) {
        std::thread::scope(|scope| {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        scope.spawn(move || self.serve_connection(stream));
                    }
                    Err(err) => error!(error = %err, "ingest accept error"),
                }
            }
        });
    }

    fn serve_connection(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        match self.handle_connection(stream) {
            Ok(IngestOutcome::Processed(report)) => info!(
                %peer,
                rows_appended = report.rows_appended,
                rows_skipped = report.rows_skipped,
                "payload processed, queued for next release cycle"
            ),
            Ok(IngestOutcome::PermitDenied) => {
                warn!(%peer, "permit denied by coordinator, payload dropped")
            }
            Ok(IngestOutcome::Empty) => debug!(%peer, "empty payload ignored"),
            Err(err) => {
                self.stats.observe_payload_failed();
                error!(%peer, error = %err, "payload ingest failed");
            }
        }
    }

    /// Handles one single-shot connection: optional permit, read to EOF,
    /// archive, reshape, delete the archive copy.
    pub fn handle_connection(&self, mut stream: TcpStream) -> Result<IngestOutcome, IngestError> {
        let permit = match self.acquire_permit()? {
            Some(PermitOutcome::Denied) => {
                self.stats.observe_payload_denied();
                return Ok(IngestOutcome::PermitDenied);
            }
            Some(PermitOutcome::Granted(guard)) => Some(guard),
            None => None,
        };

        let payload = self.read_payload(&mut stream, permit.as_ref())?;
        drop(stream);
        if payload.is_empty() {
            return Ok(IngestOutcome::Empty);
        }
        if permit.as_ref().is_some_and(|permit| permit.remaining().is_none()) {
            return Err(IngestError::LeaseExpired);
        }

        let archived = match self.archive.archive(&payload) {
            Ok(archived) => {
                debug!(path = %archived.path.display(), "payload archived");
                Some(archived)
            }
            Err(err) => {
                error!(error = %err, "payload archive write failed, continuing");
                None
            }
        };

        let text = String::from_utf8_lossy(&payload);
        let report = match self.reshaper.reshape(&text) {
            Ok(report) => report,
            Err(err) => {
                if let Some(archived) = &archived {
                    warn!(
                        path = %archived.path.display(),
                        "reshape failed, archived payload kept for inspection"
                    );
                }
                return Err(err.into());
            }
        };
        self.stats
            .observe_payload(report.rows_appended, report.rows_skipped);

        if let Some(archived) = archived
            && let Err(err) = self.archive.remove(&archived)
        {
            error!(error = %err, "failed to delete processed payload archive");
        }
        Ok(IngestOutcome::Processed(report))
    }

    fn acquire_permit(&self) -> Result<Option<PermitOutcome>, IngestError> {
        match &self.permits {
            Some(permits) => permits.acquire().map(Some).map_err(IngestError::Permit),
            None => Ok(None),
        }
    }

    /// Reads to EOF. Under a permit every read is bounded by what is left of
    /// the lease, so a slow sender cannot keep the worker busy past it.
    fn read_payload(
        &self,
        stream: &mut TcpStream,
        permit: Option<&PermitGuard>,
    ) -> Result<Vec<u8>, IngestError> {
        let limit = self.max_payload_bytes;
        let mut payload = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            let timeout = match permit {
                Some(permit) => permit
                    .remaining()
                    .ok_or(IngestError::LeaseExpired)?
                    .min(self.socket_timeout),
                None => self.socket_timeout,
            };
            stream.set_read_timeout(Some(timeout))?;
            let read = match stream.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // Lease-capped wait ran out; the next pass decides.
                Err(err)
                    if permit.is_some()
                        && timeout < self.socket_timeout
                        && matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Ok(payload);
            }
            if (payload.len() + read) as u64 > limit {
                return Err(IngestError::PayloadTooLarge { limit });
            }
            payload.extend_from_slice(&chunk[..read]);
        }
    }
}
