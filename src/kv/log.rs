//! Log-structured durable key-value store.
//!
//! Every `put` appends one checksummed entry to `data.log` and is synced
//! before returning. An in-memory index maps each live key to the offset of
//! its latest entry. Overwritten entries become garbage; once garbage
//! outweighs live data past a threshold the log is rewritten in place.
//!
//! Entry framing: `len: u32 LE | rmp(LogEntry) | crc32(payload): u32 LE`.

use super::{KvIter, KvPair, KvStore};
use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"IRS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for the data log.
const LOG_MAGIC: &[u8; 4] = b"KVL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Log header size (magic + version).
const LOG_HEADER_SIZE: u64 = 5;

/// Per-entry framing overhead (length prefix + checksum).
const FRAME_OVERHEAD: u64 = 8;

/// Sanity bound on a single entry.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync after every write. Turning this off trades durability for speed.
    pub sync_writes: bool,

    /// Garbage bytes tolerated before the log is compacted.
    /// Compaction also requires garbage to exceed live data.
    pub compact_threshold_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./intervention-relay.db"),
            create_if_missing: true,
            sync_writes: true,
            compact_threshold_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub key_count: u64,
    pub log_size_bytes: u64,
    pub garbage_bytes: u64,
}

/// A single log entry.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    timestamp: Timestamp,
}

/// Where the latest entry for a key lives.
#[derive(Clone, Copy, Debug)]
struct EntryLocation {
    offset: u64,
    /// Full frame size including overhead.
    frame_len: u64,
}

/// Mutable log state, guarded as one unit.
struct LogFile {
    file: File,
    size: u64,
    garbage: u64,
}

/// Durable [`KvStore`] backed by an append-only log.
pub struct FileStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Path to the data log.
    log_path: PathBuf,

    /// Log handle and size accounting. Always locked before `index`.
    log: Mutex<LogFile>,

    /// Key -> latest entry.
    index: RwLock<BTreeMap<Vec<u8>, EntryLocation>>,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    ///
    /// The MANIFEST is written last. A crash before it lands leaves a
    /// directory that `open_or_create` creates again.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join("data.log");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)?;
        Self::write_log_header(&mut file)?;

        Self::write_manifest(&config.path)?;

        info!(event = "store created", path = %config.path.display());

        Ok(Self {
            config,
            _lock_file: lock_file,
            log_path,
            log: Mutex::new(LogFile {
                file,
                size: LOG_HEADER_SIZE,
                garbage: 0,
            }),
            index: RwLock::new(BTreeMap::new()),
        })
    }

    /// Open an existing store, replaying the log into the index.
    ///
    /// A missing or empty `data.log` holds no entries and is started fresh.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join("data.log");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;
        if file.metadata()?.len() == 0 {
            warn!(event = "empty data log", path = %log_path.display());
            Self::write_log_header(&mut file)?;
        }
        let (index, size, garbage) = Self::replay(&mut file)?;

        info!(
            event = "store opened",
            path = %config.path.display(),
            keys = index.len(),
            log_bytes = size,
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log_path,
            log: Mutex::new(LogFile { file, size, garbage }),
            index: RwLock::new(index),
        })
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Current statistics.
    pub fn stats(&self) -> StoreStats {
        let log = self.log.lock();
        StoreStats {
            key_count: self.index.read().len() as u64,
            log_size_bytes: log.size,
            garbage_bytes: log.garbage,
        }
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.lock().file.sync_all()?;
        Ok(())
    }

    /// Rewrite the log keeping only the latest entry per key.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut LogFile) -> Result<()> {
        let before = log.size;
        let mut index = self.index.write();

        let mut tmp = tempfile::NamedTempFile::new_in(&self.config.path)?;
        tmp.write_all(LOG_MAGIC)?;
        tmp.write_all(&[LOG_VERSION])?;

        let mut new_index = BTreeMap::new();
        let mut offset = LOG_HEADER_SIZE;
        for (key, location) in index.iter() {
            let entry = Self::read_frame(&mut log.file, *location)?;
            let frame = Self::encode_frame(&entry)?;
            tmp.write_all(&frame)?;
            new_index.insert(
                key.clone(),
                EntryLocation {
                    offset,
                    frame_len: frame.len() as u64,
                },
            );
            offset += frame.len() as u64;
        }
        tmp.as_file().sync_all()?;
        // Nothing past the rename can fail, so the handle and index stay in step
        log.file = tmp
            .persist(&self.log_path)
            .map_err(|e| StoreError::Io(e.error))?;
        log.size = offset;
        log.garbage = 0;
        *index = new_index;

        info!(event = "store compacted", before_bytes = before, after_bytes = offset);
        Ok(())
    }

    /// Read the value stored under `key` while holding the log lock.
    fn read_value(&self, log: &mut LogFile, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let location = match self.index.read().get(key) {
            Some(location) => *location,
            None => return Ok(None),
        };
        let entry = Self::read_frame(&mut log.file, location)?;
        if entry.key != key {
            return Err(StoreError::Corruption(format!(
                "index points at wrong entry at offset {}",
                location.offset
            )));
        }
        Ok(Some(entry.value))
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > MAX_ENTRY_SIZE {
            return Err(StoreError::Serialization(format!(
                "entry of {} bytes exceeds limit",
                encoded.len()
            )));
        }

        let mut frame = Vec::with_capacity(encoded.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    fn read_frame(file: &mut File, location: EntryLocation) -> Result<LogEntry> {
        file.seek(SeekFrom::Start(location.offset))?;
        let mut frame = vec![0u8; location.frame_len as usize];
        file.read_exact(&mut frame)?;
        Self::decode_frame(&frame)
    }

    fn decode_frame(frame: &[u8]) -> Result<LogEntry> {
        if frame.len() < FRAME_OVERHEAD as usize {
            return Err(StoreError::Corruption("truncated frame".into()));
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if len + FRAME_OVERHEAD as usize != frame.len() {
            return Err(StoreError::Corruption("frame length mismatch".into()));
        }

        let payload = &frame[4..4 + len];
        let tail = &frame[4 + len..];
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(payload)?)
    }

    /// Rebuild the index from the log. A torn final entry is truncated away;
    /// damage anywhere else is reported as corruption.
    fn replay(file: &mut File) -> Result<(BTreeMap<Vec<u8>, EntryLocation>, u64, u64)> {
        let file_size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut index = BTreeMap::new();
        let mut garbage = 0u64;
        let mut offset = LOG_HEADER_SIZE;

        while offset < file_size {
            match Self::next_frame(&mut reader, file_size - offset) {
                Ok(Some(frame)) => {
                    let entry = match Self::decode_frame(&frame) {
                        Ok(entry) => entry,
                        Err(e) if offset + frame.len() as u64 == file_size => {
                            warn!(event = "torn log tail", offset, error = %e);
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    let location = EntryLocation {
                        offset,
                        frame_len: frame.len() as u64,
                    };
                    if let Some(old) = index.insert(entry.key, location) {
                        garbage += old.frame_len;
                    }
                    offset += frame.len() as u64;
                }
                Ok(None) => {
                    warn!(event = "torn log tail", offset, remaining = file_size - offset);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        drop(reader);
        if offset < file_size {
            file.set_len(offset)?;
            file.sync_all()?;
            debug!(event = "log truncated", offset);
        }

        Ok((index, offset, garbage))
    }

    /// Read one raw frame. `Ok(None)` if the remaining bytes can't hold it.
    fn next_frame<R: Read>(reader: &mut R, remaining: u64) -> Result<Option<Vec<u8>>> {
        if remaining < FRAME_OVERHEAD {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(StoreError::Corruption("log entry too large".into()));
        }
        if (len as u64) + FRAME_OVERHEAD > remaining {
            return Ok(None);
        }

        let mut frame = vec![0u8; len + FRAME_OVERHEAD as usize];
        frame[..4].copy_from_slice(&len_bytes);
        match reader.read_exact(&mut frame[4..]) {
            Ok(()) => Ok(Some(frame)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_log_header(file: &mut File) -> Result<()> {
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut log = self.log.lock();
        self.read_value(&mut log, key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let entry = LogEntry {
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp: Timestamp::now(),
        };
        let frame = Self::encode_frame(&entry)?;

        let mut log = self.log.lock();
        let offset = log.size;
        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(&frame)?;
        log.file.flush()?;
        if self.config.sync_writes {
            log.file.sync_data()?;
        }
        log.size += frame.len() as u64;

        let previous = self.index.write().insert(
            entry.key,
            EntryLocation {
                offset,
                frame_len: frame.len() as u64,
            },
        );
        if let Some(old) = previous {
            log.garbage += old.frame_len;
        }

        let live = log.size - LOG_HEADER_SIZE - log.garbage;
        if log.garbage >= self.config.compact_threshold_bytes && log.garbage > live {
            // The write above is already durable
            if let Err(e) = self.compact_locked(&mut log) {
                warn!(event = "compaction failed", error = %e, garbage_bytes = log.garbage);
            }
        }

        Ok(())
    }

    fn scan_range(&self, low: &[u8], high: Option<&[u8]>) -> KvIter<'_> {
        if let Some(h) = high {
            if h <= low {
                return Box::new(std::iter::empty());
            }
        }
        let upper = match high {
            Some(h) => Bound::Excluded(h.to_vec()),
            None => Bound::Unbounded,
        };
        let keys: Vec<Vec<u8>> = self
            .index
            .read()
            .range((Bound::Included(low.to_vec()), upper))
            .map(|(k, _)| k.clone())
            .collect();

        Box::new(FileScan {
            store: self,
            keys: keys.into_iter(),
            failed: false,
        })
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Lazy range scan. Values are read from the log one at a time, so a
/// concurrent overwrite or compaction is observed rather than raced.
struct FileScan<'a> {
    store: &'a FileStore,
    keys: std::vec::IntoIter<Vec<u8>>,
    failed: bool,
}

impl Iterator for FileScan<'_> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        for key in self.keys.by_ref() {
            let mut log = self.store.log.lock();
            match self.store.read_value(&mut log, &key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
