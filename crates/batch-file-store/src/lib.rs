//! BatchFileStore: crash-safe batch files in a single working directory.
//!
//! Every persisted batch is one file named after a random id. The file name
//! extension is the batch's state:
//!
//! - `{id}.ai`: fresh, a delivery attempt is in progress
//! - `{id}.ai.fail`: quarantined, waiting for the backlog sweeper
//!
//! State transitions are renames inside the same directory, which are atomic
//! on a single volume. Moving the directory across volumes is not supported.
//! Writes go through a hidden `.{id}.ai.tmp` file that is renamed into place
//! only after its contents are synced, so a fresh file is never observed
//! half-written.
//!
//! A retry claims a quarantined file with an exclusive advisory lock on an
//! open handle (see [`BatchFileStore::open`]). Another process or channel
//! sharing the directory skips a claimed file instead of sending it too.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Extension of a fresh batch file.
pub const FRESH_EXTENSION: &str = "ai";
/// Marker appended to a fresh file name to quarantine it.
pub const QUARANTINE_MARKER: &str = "fail";
/// Marker of an in-progress atomic write.
const TEMP_MARKER: &str = "tmp";

#[derive(thiserror::Error, Debug)]
pub enum BatchFileError {
    #[error("batch file not found: {0}")]
    NotFound(PathBuf),
    #[error("batch file is claimed by another handle: {0}")]
    Locked(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type BatchFileResult<T> = Result<T, BatchFileError>;

/// Lifecycle state of a batch file, encoded in its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchFileState {
    Fresh,
    Quarantined,
}

/// Handle to one batch file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    id: String,
    state: BatchFileState,
    path: PathBuf,
}

impl BatchFile {
    fn new(dir: &Path, id: &str, state: BatchFileState) -> Self {
        Self {
            id: id.to_string(),
            state,
            path: dir.join(file_name_for(id, state)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> BatchFileState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without the directory.
    pub fn file_name(&self) -> String {
        file_name_for(&self.id, self.state)
    }
}

/// File name of batch `id` in `state`.
pub fn file_name_for(id: &str, state: BatchFileState) -> String {
    match state {
        BatchFileState::Fresh => format!("{id}.{FRESH_EXTENSION}"),
        BatchFileState::Quarantined => format!("{id}.{FRESH_EXTENSION}.{QUARANTINE_MARKER}"),
    }
}

/// Parse a batch file name into its id and state.
///
/// Hidden files (including in-progress temporaries) are never batch files.
pub fn parse_file_name(name: &str) -> Option<(&str, BatchFileState)> {
    if name.starts_with('.') {
        return None;
    }
    let quarantined_suffix = format!(".{FRESH_EXTENSION}.{QUARANTINE_MARKER}");
    let fresh_suffix = format!(".{FRESH_EXTENSION}");

    let (id, state) = if let Some(id) = name.strip_suffix(&quarantined_suffix) {
        (id, BatchFileState::Quarantined)
    } else if let Some(id) = name.strip_suffix(&fresh_suffix) {
        (id, BatchFileState::Fresh)
    } else {
        return None;
    };

    if id.is_empty() || id.contains('.') {
        return None;
    }
    Some((id, state))
}

fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(&format!(".{FRESH_EXTENSION}.{TEMP_MARKER}"))
}

/// Counts of batch files per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub fresh: usize,
    pub quarantined: usize,
}

/// Outcome of the startup recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Fresh files renamed to quarantined.
    pub quarantined: usize,
    /// Abandoned temporaries removed.
    pub temp_removed: usize,
    /// Entries that could not be read, renamed or removed.
    pub failures: usize,
}

/// Batch files in one working directory.
#[derive(Debug, Clone)]
pub struct BatchFileStore {
    dir: PathBuf,
}

impl BatchFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed. Returns `true` when it already existed.
    pub fn ensure_dir(&self) -> BatchFileResult<bool> {
        if self.dir.is_dir() {
            return Ok(true);
        }
        fs::create_dir_all(&self.dir)?;
        Ok(false)
    }

    /// Durably write `payload` as a new fresh batch file under a random id.
    pub fn write_fresh(&self, payload: &[u8]) -> BatchFileResult<BatchFile> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let file = BatchFile::new(&self.dir, &id, BatchFileState::Fresh);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}", file.file_name(), TEMP_MARKER));

        let write_result = (|| -> io::Result<()> {
            let mut handle = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            handle.write_all(payload)?;
            handle.sync_all()?;
            drop(handle);

            fs::rename(&tmp_path, file.path())?;
            sync_dir(&self.dir);
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        debug!(batch_file = %file.file_name(), bytes = payload.len(), "Wrote batch file");
        Ok(file)
    }

    /// Rename a fresh file to its quarantined name.
    pub fn quarantine(&self, file: &BatchFile) -> BatchFileResult<BatchFile> {
        if file.state == BatchFileState::Quarantined {
            return Ok(file.clone());
        }
        let target = BatchFile::new(&self.dir, &file.id, BatchFileState::Quarantined);
        fs::rename(file.path(), target.path()).map_err(|err| map_not_found(err, file.path()))?;
        sync_dir(&self.dir);
        Ok(target)
    }

    /// Delete a batch file. Deleting a file that is already gone is not an error.
    pub fn remove(&self, file: &BatchFile) -> BatchFileResult<()> {
        match fs::remove_file(file.path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a batch file so it can be claimed for exclusive reading.
    pub fn open(&self, file: &BatchFile) -> BatchFileResult<LockableBatch> {
        let handle = fs::OpenOptions::new()
            .read(true)
            .open(file.path())
            .map_err(|err| map_not_found(err, file.path()))?;
        Ok(LockableBatch {
            file: file.clone(),
            lock: fd_lock::RwLock::new(handle),
        })
    }

    /// Time since the file was last modified.
    pub fn age(&self, file: &BatchFile) -> BatchFileResult<Duration> {
        let modified = fs::metadata(file.path())
            .map_err(|err| map_not_found(err, file.path()))?
            .modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default())
    }

    /// Enumerate batch files in `state`, in directory order.
    pub fn list(&self, state: BatchFileState) -> BatchFileResult<Vec<BatchFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((id, found)) = parse_file_name(name) {
                if found == state {
                    files.push(BatchFile::new(&self.dir, id, found));
                }
            }
        }
        Ok(files)
    }

    /// Count batch files per state. A missing directory counts as empty.
    pub fn counts(&self) -> BatchFileResult<StoreCounts> {
        let mut counts = StoreCounts::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(counts),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            match entry.file_name().to_str().and_then(parse_file_name) {
                Some((_, BatchFileState::Fresh)) => counts.fresh += 1,
                Some((_, BatchFileState::Quarantined)) => counts.quarantined += 1,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Quarantine fresh files left behind by an unclean shutdown and remove
    /// abandoned temporaries. Best effort: failures are logged and counted,
    /// never returned. Running it twice yields the same quarantined set.
    pub fn recover_interrupted(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "Recovery scan could not read directory");
                report.failures += 1;
                return report;
            }
        };

        for entry in entries {
            let name = match entry {
                Ok(entry) => entry.file_name(),
                Err(err) => {
                    warn!(error = %err, "Recovery scan could not read entry");
                    report.failures += 1;
                    continue;
                }
            };
            let Some(name) = name.to_str() else {
                continue;
            };

            if is_temp_file_name(name) {
                match fs::remove_file(self.dir.join(name)) {
                    Ok(()) => report.temp_removed += 1,
                    Err(err) => {
                        warn!(file = name, error = %err, "Could not remove abandoned temp file");
                        report.failures += 1;
                    }
                }
                continue;
            }

            if let Some((id, BatchFileState::Fresh)) = parse_file_name(name) {
                let fresh = BatchFile::new(&self.dir, id, BatchFileState::Fresh);
                match self.quarantine(&fresh) {
                    Ok(_) => report.quarantined += 1,
                    Err(err) => {
                        warn!(batch_file = name, error = %err, "Could not quarantine interrupted batch");
                        report.failures += 1;
                    }
                }
            }
        }

        report
    }
}

/// An open batch file, not yet claimed.
pub struct LockableBatch {
    file: BatchFile,
    lock: fd_lock::RwLock<fs::File>,
}

impl std::fmt::Debug for LockableBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockableBatch")
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

impl LockableBatch {
    pub fn file(&self) -> &BatchFile {
        &self.file
    }

    /// Take the exclusive lock without waiting.
    ///
    /// Fails with [`BatchFileError::Locked`] while any other handle, in this
    /// process or another, holds the claim. The claim ends when the returned
    /// guard is dropped.
    pub fn try_claim(&mut self) -> BatchFileResult<ClaimedBatch<'_>> {
        let path = self.file.path();
        match self.lock.try_write() {
            Ok(guard) => Ok(ClaimedBatch { guard }),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Err(BatchFileError::Locked(path.to_path_buf()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Exclusive claim on a batch file, held until dropped.
pub struct ClaimedBatch<'a> {
    guard: fd_lock::RwLockWriteGuard<'a, fs::File>,
}

impl ClaimedBatch<'_> {
    /// Read the whole payload through the claimed handle.
    pub fn read_payload(&mut self) -> BatchFileResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.guard.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

fn map_not_found(err: io::Error, path: &Path) -> BatchFileError {
    if err.kind() == io::ErrorKind::NotFound {
        BatchFileError::NotFound(path.to_path_buf())
    } else {
        BatchFileError::Io(err)
    }
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}
