use std::{
    fs::{File, OpenOptions, create_dir_all, read_dir},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use schema::{ACCUMULATION_HEADER, Metric, MetricSample, SensorRow, is_header_only};
use thiserror::Error;
use tracing::{debug, warn};

const ARCHIVE_PREFIX: &str = "Recebido_";
const ARCHIVE_SUFFIX: &str = ".csv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("accumulation lock poisoned for metric {0}")]
    Poisoned(Metric),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether a drained accumulation is truncated back to its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainDecision {
    Clear,
    Keep,
}

// ---------------------------------------------------------------------------
// Metric accumulations
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Accumulation {
    metric: Metric,
    path: PathBuf,
    lock: Mutex<()>,
}

impl Accumulation {
    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Poisoned(self.metric))
    }

    /// Creates the file with its header when it is missing. Caller holds the lock.
    fn ensure_file(&self) -> Result<(), StoreError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => file
                .write_all(ACCUMULATION_HEADER.as_bytes())
                .map_err(|err| StoreError::io(&self.path, err)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(StoreError::io(&self.path, err)),
        }
    }

    fn read_contents(&self) -> Result<Vec<u8>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StoreError::io(&self.path, err)),
        }
    }

    fn truncate_to_header(&self) -> Result<(), StoreError> {
        let mut file = File::create(&self.path).map_err(|err| StoreError::io(&self.path, err))?;
        file.write_all(ACCUMULATION_HEADER.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|err| StoreError::io(&self.path, err))
    }
}

/// Durable append-only buffers, one file per metric, each behind its own lock.
///
/// Appends and the read-transfer-clear step of the releaser serialize on the
/// same per-metric lock, so rows appended while a transfer is in flight land
/// after the truncation and are kept for the next cycle.
#[derive(Debug)]
pub struct AccumulationStore {
    dir: PathBuf,
    slots: Vec<Accumulation>,
}

impl AccumulationStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        let slots = Metric::ALL
            .into_iter()
            .map(|metric| Accumulation {
                metric,
                path: dir.join(metric.file_name()),
                lock: Mutex::new(()),
            })
            .collect::<Vec<_>>();
        for slot in &slots {
            let _guard = slot.guard()?;
            slot.ensure_file()?;
        }
        Ok(Self { dir, slots })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, metric: Metric) -> &Path {
        &self.slot(metric).path
    }

    fn slot(&self, metric: Metric) -> &Accumulation {
        &self.slots[metric.ordinal()]
    }

    /// Appends samples in order. Returns the number of records written.
    pub fn append(&self, metric: Metric, samples: &[MetricSample]) -> Result<usize, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let slot = self.slot(metric);
        let _guard = slot.guard()?;
        slot.ensure_file()?;
        let encoded: String = samples.iter().map(MetricSample::to_csv_line).collect();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&slot.path)
            .map_err(|err| StoreError::io(&slot.path, err))?;
        file.write_all(encoded.as_bytes())
            .map_err(|err| StoreError::io(&slot.path, err))?;
        Ok(samples.len())
    }

    /// Appends one record per row to every metric accumulation.
    pub fn append_rows(&self, rows: &[SensorRow]) -> Result<usize, StoreError> {
        for metric in Metric::ALL {
            let samples: Vec<MetricSample> = rows.iter().map(|row| row.sample(metric)).collect();
            self.append(metric, &samples)?;
        }
        Ok(rows.len())
    }

    pub fn is_empty(&self, metric: Metric) -> Result<bool, StoreError> {
        let slot = self.slot(metric);
        let _guard = slot.guard()?;
        Ok(is_header_only(&slot.read_contents()?))
    }

    pub fn all_empty(&self) -> Result<bool, StoreError> {
        for metric in Metric::ALL {
            if !self.is_empty(metric)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn contents(&self, metric: Metric) -> Result<Vec<u8>, StoreError> {
        let slot = self.slot(metric);
        let _guard = slot.guard()?;
        slot.read_contents()
    }

    pub fn samples(&self, metric: Metric) -> Result<Vec<MetricSample>, StoreError> {
        let contents = self.contents(metric)?;
        let text = String::from_utf8_lossy(&contents);
        Ok(text
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut parts = line.splitn(3, ',');
                Some(MetricSample {
                    id: parts.next()?.to_string(),
                    timestamp: parts.next()?.to_string(),
                    value: parts.next()?.to_string(),
                })
            })
            .collect())
    }

    /// Runs `f` over the full contents of a non-empty accumulation while
    /// holding its lock, then clears it if `f` asks for it.
    ///
    /// Returns `Ok(None)` without calling `f` when the accumulation is
    /// header-only.
    pub fn drain_with<T, E, F>(&self, metric: Metric, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&[u8]) -> Result<(T, DrainDecision), E>,
        E: From<StoreError>,
    {
        let slot = self.slot(metric);
        let _guard = slot.guard()?;
        let contents = slot.read_contents()?;
        if is_header_only(&contents) {
            return Ok(None);
        }
        let (value, decision) = f(&contents)?;
        if decision == DrainDecision::Clear {
            slot.truncate_to_header()?;
            debug!(metric = %metric, bytes = contents.len(), "accumulation cleared");
        }
        Ok(Some(value))
    }
}

// ---------------------------------------------------------------------------
// Raw payload archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPayload {
    pub sequence: u64,
    pub path: PathBuf,
}

/// Sequentially numbered archival copies of raw ingest payloads.
#[derive(Debug)]
pub struct PayloadArchive {
    dir: PathBuf,
    last_sequence: AtomicU64,
}

impl PayloadArchive {
    /// Opens the archive directory. Numbering resumes after the highest
    /// sequence already on disk so retained payloads are never overwritten.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        let last_sequence = list_archived(&dir)?
            .iter()
            .map(|archived| archived.sequence)
            .max()
            .unwrap_or(0);
        Ok(Self {
            dir,
            last_sequence: AtomicU64::new(last_sequence),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive(&self, payload: &[u8]) -> Result<ArchivedPayload, StoreError> {
        loop {
            let sequence = self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let path = self.dir.join(archive_file_name(sequence));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    write_or_discard(file, &path, payload)?;
                    return Ok(ArchivedPayload { sequence, path });
                }
                // A file dropped in by hand after startup; take the next number.
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(StoreError::io(&path, err)),
            }
        }
    }

    pub fn remove(&self, archived: &ArchivedPayload) -> Result<(), StoreError> {
        std::fs::remove_file(&archived.path).map_err(|err| StoreError::io(&archived.path, err))
    }

    /// Archived payloads still on disk, oldest first.
    pub fn retained(&self) -> Result<Vec<ArchivedPayload>, StoreError> {
        list_archived(&self.dir)
    }
}

/// Writes `payload` to a freshly created file, removing the file again if the
/// write fails so no truncated archive is left for the next startup to find.
fn write_or_discard(mut file: impl Write, path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    let Err(err) = file.write_all(payload) else {
        return Ok(());
    };
    drop(file);
    if let Err(cleanup) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %cleanup, "partial archive left behind");
    }
    Err(StoreError::io(path, err))
}

pub fn archive_file_name(sequence: u64) -> String {
    format!("{ARCHIVE_PREFIX}{sequence:03}{ARCHIVE_SUFFIX}")
}

fn parse_archive_sequence(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(ARCHIVE_PREFIX)?
        .strip_suffix(ARCHIVE_SUFFIX)?
        .parse::<u64>()
        .ok()
}

fn list_archived(dir: &Path) -> Result<Vec<ArchivedPayload>, StoreError> {
    let entries = read_dir(dir).map_err(|err| StoreError::io(dir, err))?;
    let mut archived = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        let file_name = entry.file_name();
        if let Some(sequence) = file_name.to_str().and_then(parse_archive_sequence) {
            archived.push(ArchivedPayload {
                sequence,
                path: entry.path(),
            });
        }
    }
    archived.sort_by_key(|entry| entry.sequence);
    Ok(archived)
}
