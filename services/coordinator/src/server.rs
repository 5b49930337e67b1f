use std::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use protocol::{
    MAX_CONTROL_LINE_BYTES, PermitReply, PermitRequest, ProtocolError, read_line, write_line,
};
use tracing::{debug, error, info, warn};

use crate::permit::{AcquireOutcome, Lease, PermitTable, ReleaseOutcome};

const MIN_RELEASE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub lease_ttl: Duration,
    pub socket_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            socket_timeout: Duration::from_secs(30),
        }
    }
}

/// How one coordinator connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Closed,
    Denied,
    Released,
    /// Granted, but the holder went away (or stalled past its lease) without
    /// releasing. The lease is reclaimed on expiry.
    Abandoned,
    StaleRelease,
    Rejected,
}

/// Accept loop. Every connection gets its own thread; accept errors are
/// logged and never end the loop.
pub fn serve(
    listener: TcpListener,
    table: Arc<PermitTable>,
    settings: CoordinatorSettings,
) -> std::io::Result<()> {
    info!(
        addr = %listener.local_addr()?,
        lease_ms = settings.lease_ttl.as_millis() as u64,
        "coordinator listening"
    );
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "coordinator accept error");
                continue;
            }
        };
        let table = Arc::clone(&table);
        let spawned = std::thread::Builder::new()
            .name("permit-conn".into())
            .spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                match handle_connection(&table, stream, settings) {
                    Ok(outcome) => debug!(%peer, ?outcome, "coordinator connection finished"),
                    Err(err) => warn!(%peer, error = %err, "coordinator connection failed"),
                }
            });
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn coordinator connection thread");
        }
    }
    Ok(())
}

/// Serves exactly one permit request on `stream`.
pub fn handle_connection(
    table: &PermitTable,
    stream: TcpStream,
    settings: CoordinatorSettings,
) -> Result<ConnectionOutcome, ProtocolError> {
    stream.set_read_timeout(Some(settings.socket_timeout))?;
    stream.set_write_timeout(Some(settings.socket_timeout))?;
    let mut reader = BufReader::new(stream);

    let Some(line) = read_line(&mut reader, MAX_CONTROL_LINE_BYTES)? else {
        return Ok(ConnectionOutcome::Closed);
    };
    match PermitRequest::parse(&line) {
        Some(PermitRequest::Acquire) => {}
        Some(PermitRequest::Release) => {
            warn!("release received on a connection that holds no permit; ignored");
            return Ok(ConnectionOutcome::Rejected);
        }
        None => {
            warn!(request = %line, "unknown coordinator request");
            return Ok(ConnectionOutcome::Rejected);
        }
    }

    let lease = match table.try_acquire() {
        AcquireOutcome::Granted { lease, reclaimed } => {
            if let Some(previous) = reclaimed {
                warn!(previous = %previous, "expired permit reclaimed");
            }
            lease
        }
        AcquireOutcome::Denied { holder, remaining } => {
            write_line(reader.get_mut(), PermitReply::Denied.as_line())?;
            info!(
                holder = %holder,
                remaining_ms = remaining.as_millis() as u64,
                "permit denied, resource in use"
            );
            return Ok(ConnectionOutcome::Denied);
        }
    };

    if let Err(err) = write_line(reader.get_mut(), PermitReply::Granted.as_line()) {
        // The requester never learned about the grant.
        table.release(lease.holder);
        return Err(err);
    }
    info!(holder = %lease.holder, "permit granted");

    Ok(await_release(table, &mut reader, lease))
}

fn await_release(
    table: &PermitTable,
    reader: &mut BufReader<TcpStream>,
    lease: Lease,
) -> ConnectionOutcome {
    let wait = lease.remaining_at(Instant::now()).max(MIN_RELEASE_WAIT);
    if let Err(err) = reader.get_ref().set_read_timeout(Some(wait)) {
        warn!(holder = %lease.holder, error = %err, "could not bound release wait");
    }

    match read_line(reader, MAX_CONTROL_LINE_BYTES) {
        Ok(Some(line)) if PermitRequest::parse(&line) == Some(PermitRequest::Release) => {
            match table.release(lease.holder) {
                ReleaseOutcome::Released => {
                    info!(holder = %lease.holder, "permit released");
                    ConnectionOutcome::Released
                }
                ReleaseOutcome::Stale => {
                    warn!(holder = %lease.holder, "late release ignored, lease already reclaimed");
                    ConnectionOutcome::StaleRelease
                }
            }
        }
        Ok(Some(line)) => {
            warn!(
                holder = %lease.holder,
                message = %line,
                "unexpected message while holding permit"
            );
            ConnectionOutcome::Abandoned
        }
        Ok(None) => {
            warn!(holder = %lease.holder, "holder disconnected without releasing permit");
            ConnectionOutcome::Abandoned
        }
        Err(err) => {
            warn!(holder = %lease.holder, error = %err, "release wait failed");
            ConnectionOutcome::Abandoned
        }
    }
}
