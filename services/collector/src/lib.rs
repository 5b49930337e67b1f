//! Reference downstream server for the batch transfer protocol. Stores every
//! received file under a unique name in one directory.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use protocol::{FileHeader, FileSink, MAX_TRANSFER_FILE_BYTES, serve_transfer_session};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "collector", about = "Receives metric batches from aggregators")]
pub struct CollectorConfig {
    #[arg(long = "bind", env = "COLLECTOR_BIND", default_value = "0.0.0.0:6050")]
    pub bind: String,

    #[arg(long = "out-dir", env = "COLLECTOR_OUT_DIR", default_value = "./collected")]
    pub out_dir: PathBuf,

    #[arg(
        long = "socket-timeout-secs",
        env = "COLLECTOR_SOCKET_TIMEOUT_SECS",
        default_value_t = 30
    )]
    pub socket_timeout_secs: u64,
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bind.trim().is_empty() {
            return Err("--bind is empty".to_string());
        }
        if self.socket_timeout_secs == 0 {
            return Err("--socket-timeout-secs must be > 0".to_string());
        }
        Ok(())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Writes each received file to `<dir>/<stem>_<unix_ms>_<seq>.csv`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    next_sequence: Arc<AtomicU64>,
}

impl DirectorySink {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_sequence: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn target_path(&self, name: &str) -> PathBuf {
        let stem = name.strip_suffix(".csv").unwrap_or(name);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            "{}_{}_{sequence}.csv",
            sanitize_file_stem(stem),
            unix_timestamp_millis()
        ))
    }
}

impl FileSink for DirectorySink {
    fn accept_file(&mut self, header: &FileHeader, payload: &[u8]) -> io::Result<()> {
        let path = self.target_path(&header.name);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(payload)?;
        file.sync_data()?;
        info!(file = %header.name, path = %path.display(), bytes = payload.len(), "file stored");
        Ok(())
    }
}

pub fn sanitize_file_stem(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept loop; one thread per transfer session.
pub fn serve(
    listener: TcpListener,
    sink: DirectorySink,
    socket_timeout: Duration,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, dir = %sink.dir().display(), "collector listening");
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "collector accept error");
                continue;
            }
        };
        let sink = sink.clone();
        let spawned = std::thread::Builder::new()
            .name("collector-conn".into())
            .spawn(move || handle_connection(stream, sink, socket_timeout));
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn collector connection thread");
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, mut sink: DirectorySink, socket_timeout: Duration) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = stream.set_read_timeout(Some(socket_timeout)) {
        error!(%peer, error = %err, "failed to set read timeout");
        return;
    }
    match serve_transfer_session(stream, &mut sink, MAX_TRANSFER_FILE_BYTES) {
        Ok(summary) if summary.completed => info!(
            %peer,
            files_received = summary.files_received,
            files_failed = summary.files_failed,
            "transfer session completed"
        ),
        Ok(summary) => warn!(
            %peer,
            files_received = summary.files_received,
            "transfer session ended without end marker"
        ),
        Err(err) => error!(%peer, error = %err, "transfer session failed"),
    }
}

/// Binds `addr` and runs the collector on a background thread.
pub fn spawn_collector(
    addr: &str,
    out_dir: impl AsRef<Path>,
) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    let sink = DirectorySink::open(out_dir)?;
    let handle = std::thread::Builder::new()
        .name("collector".into())
        .spawn(move || serve(listener, sink, Duration::from_secs(30)))?;
    Ok((local_addr, handle))
}
