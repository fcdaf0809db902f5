use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Fingerprint of a source file's size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceSignature(String);

impl SourceSignature {
    pub fn compute(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self::from_parts(
            mtime.as_secs(),
            mtime.subsec_nanos(),
            metadata.len(),
        ))
    }

    pub fn from_parts(mtime_secs: u64, mtime_nanos: u32, size: u64) -> Self {
        let raw = format!("{}.{:09}:{}", mtime_secs, mtime_nanos, size);
        let hash = blake3::hash(raw.as_bytes());
        Self(hash.to_hex().as_str()[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
