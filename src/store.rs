//! Persistence seams: a TTL key-value cache for lock tokens and failure
//! records, and a per-owner metadata store for derivative bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A file that exists but does not parse yet is assumed to be mid-write for this long.
const PARTIAL_WRITE_GRACE: Duration = Duration::from_secs(5);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait TtlCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Sets `key` only if it is absent. The default is a read followed by a
    /// write, which two callers can race; backends should override it with an
    /// atomic set-if-absent where they can.
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        if self.get(key)?.is_some() {
            return Ok(false);
        }
        self.set(key, "1", ttl)?;
        Ok(true)
    }
}

pub trait MetaStore: Send + Sync {
    fn get(&self, owner: i64, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, owner: i64, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, owner: i64, key: &str) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local TTL cache.
#[derive(Debug, Default)]
pub struct MemoryTtlCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryTtlCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TtlCache for MemoryTtlCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), ("1".to_string(), now + ttl));
        Ok(true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FsEntry {
    value: String,
    expires_at_ms: u64,
}

/// TTL cache backed by one file per key, shared by every process on the host.
/// `try_acquire` relies on exclusive file creation, so it is atomic.
#[derive(Debug, Clone)]
pub struct FsTtlCache {
    dir: PathBuf,
}

impl FsTtlCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let hash = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.json", &hash.to_hex().as_str()[..32]))
    }

    fn encode(value: &str, ttl: Duration) -> Result<Vec<u8>, StoreError> {
        let expires_at_ms = now_ms().saturating_add(ttl.as_millis() as u64);
        Ok(serde_json::to_vec(&FsEntry {
            value: value.to_string(),
            expires_at_ms,
        })?)
    }
}

impl TtlCache for FsTtlCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<FsEntry>(&bytes) {
            Ok(entry) if entry.expires_at_ms > now_ms() => Ok(Some(entry.value)),
            Ok(_) => {
                remove_if_exists(&path)?;
                Ok(None)
            }
            Err(_) if recently_modified(&path) => Ok(Some(String::new())),
            Err(_) => {
                remove_if_exists(&path)?;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        write_atomic(&self.path_for(key), &Self::encode(value, ttl)?)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.path_for(key))?;
        Ok(())
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&Self::encode("1", ttl)?)?;
                    file.sync_all()?;
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    // An expired token is removed by `get`, then creation is retried once.
                    if self.get(key)?.is_some() {
                        return Ok(false);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(false)
    }
}

/// Process-local metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    entries: Mutex<HashMap<(i64, String), String>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get(&self, owner: i64, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries).get(&(owner, key.to_string())).cloned())
    }

    fn set(&self, owner: i64, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.entries).insert((owner, key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, owner: i64, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(&(owner, key.to_string()));
        Ok(())
    }
}

/// Metadata store with one JSON document per owner and key.
#[derive(Debug, Clone)]
pub struct JsonFileMetaStore {
    dir: PathBuf,
}

impl JsonFileMetaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, owner: i64, key: &str) -> PathBuf {
        let key: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}-{}.json", owner, key))
    }
}

impl MetaStore for JsonFileMetaStore {
    fn get(&self, owner: i64, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(owner, key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, owner: i64, key: &str, value: &str) -> Result<(), StoreError> {
        write_atomic(&self.path_for(owner, key), value.as_bytes())?;
        Ok(())
    }

    fn delete(&self, owner: i64, key: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.path_for(owner, key))?;
        Ok(())
    }
}

/// Writes through a uniquely named sibling and renames it into place, so
/// readers never observe a partially written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(
        ".{}.{}.{}.part",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(err) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age < PARTIAL_WRITE_GRACE)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
