pub mod config;
pub mod permit;
pub mod server;

pub use config::CoordinatorConfig;
pub use permit::{AcquireOutcome, HolderId, Lease, PermitTable, ReleaseOutcome};
pub use server::{ConnectionOutcome, CoordinatorSettings, handle_connection, serve};

use std::{net::TcpListener, sync::Arc, thread::JoinHandle};

/// Binds `addr` and runs the coordinator on a background thread. Returns the
/// bound address together with the thread handle.
pub fn spawn_coordinator(
    addr: &str,
    settings: CoordinatorSettings,
) -> std::io::Result<(std::net::SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    let table = Arc::new(PermitTable::new(settings.lease_ttl));
    let handle = std::thread::Builder::new()
        .name("coordinator".into())
        .spawn(move || serve(listener, table, settings))?;
    Ok((local_addr, handle))
}
