//! Derivative bookkeeping per entry, guarded by the source signature.

use crate::engine::StorageLayout;
use crate::sandbox;
use crate::signature::SourceSignature;
use crate::store::{MetaStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Metadata key holding every derivative of an entry.
pub const META_KEY: &str = "gravityview_thumbnails";

/// Identity of one derivative: which file of which field of which entry, at what width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResizeKey {
    pub entry_id: i64,
    pub field_id: i64,
    pub file_index: usize,
    pub width: u32,
}

impl ResizeKey {
    pub fn size_key(&self) -> String {
        format!("w{}", self.width)
    }
}

impl fmt::Display for ResizeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.entry_id, self.field_id, self.file_index, self.width
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileThumbnails {
    pub source_url: String,
    pub source_sig: SourceSignature,
    #[serde(default)]
    pub sizes: BTreeMap<String, DerivativeRecord>,
}

/// `field_id -> file_index -> file thumbnails`, stored as one blob per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryThumbnails {
    pub fields: BTreeMap<String, BTreeMap<String, FileThumbnails>>,
}

impl EntryThumbnails {
    pub fn file(&self, key: &ResizeKey) -> Option<&FileThumbnails> {
        self.fields
            .get(&key.field_id.to_string())?
            .get(&key.file_index.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Clone)]
pub struct ThumbnailStore {
    meta: Arc<dyn MetaStore>,
    layout: StorageLayout,
}

impl ThumbnailStore {
    pub fn new(meta: Arc<dyn MetaStore>, layout: StorageLayout) -> Self {
        Self { meta, layout }
    }

    /// Unreadable blobs are treated as empty so a corrupt record only costs a re-resize.
    pub fn load(&self, entry_id: i64) -> Result<EntryThumbnails, StoreError> {
        let Some(raw) = self.meta.get(entry_id, META_KEY)? else {
            return Ok(EntryThumbnails::default());
        };
        match serde_json::from_str(&raw) {
            Ok(thumbnails) => Ok(thumbnails),
            Err(err) => {
                warn!(entry_id, error = %err, "discarding unreadable thumbnail metadata");
                Ok(EntryThumbnails::default())
            }
        }
    }

    /// The stored derivative for `key`, only if it was made from the current
    /// version of the source and its file is still on disk.
    pub fn get_cached_size(
        &self,
        key: &ResizeKey,
        source_sig: &SourceSignature,
    ) -> Option<DerivativeRecord> {
        let thumbnails = match self.load(key.entry_id) {
            Ok(thumbnails) => thumbnails,
            Err(err) => {
                warn!(entry_id = key.entry_id, error = %err, "cannot read thumbnail metadata");
                return None;
            }
        };
        let file = thumbnails.file(key)?;
        if &file.source_sig != source_sig {
            return None;
        }
        let mut record = file.sizes.get(&key.size_key())?.clone();
        let path = match record.path.take() {
            Some(path) => path,
            None => self.layout.path_for_url(&record.url)?,
        };
        if !sandbox::is_within(&path, self.layout.uploads_root()) || !path.is_file() {
            return None;
        }
        record.path = Some(path);
        Some(record)
    }

    /// Records a new derivative. A signature change drops every size stored
    /// for that file before the new one is inserted.
    pub fn update_meta_for_size(
        &self,
        key: &ResizeKey,
        source_url: &str,
        source_sig: &SourceSignature,
        record: DerivativeRecord,
    ) -> Result<(), StoreError> {
        let mut thumbnails = self.load(key.entry_id)?;
        let file = thumbnails
            .fields
            .entry(key.field_id.to_string())
            .or_default()
            .entry(key.file_index.to_string())
            .or_insert_with(|| FileThumbnails {
                source_url: source_url.to_string(),
                source_sig: source_sig.clone(),
                sizes: BTreeMap::new(),
            });
        if &file.source_sig != source_sig {
            file.sizes.clear();
            file.source_sig = source_sig.clone();
        }
        file.source_url = source_url.to_string();
        file.sizes.insert(key.size_key(), record);

        let raw = serde_json::to_string(&thumbnails)?;
        self.meta.set(key.entry_id, META_KEY, &raw)
    }

    pub fn delete_entry(&self, entry_id: i64) -> Result<(), StoreError> {
        self.meta.delete(entry_id, META_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetaStore;
    use std::fs;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        uploads: PathBuf,
        store: ThumbnailStore,
        meta: Arc<MemoryMetaStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let layout = StorageLayout::new(
            &uploads,
            &uploads.join("thumbs"),
            "https://example.com/uploads/thumbs",
        )
        .unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        Fixture {
            store: ThumbnailStore::new(meta.clone(), layout),
            uploads,
            meta,
            _dir: dir,
        }
    }

    fn key(width: u32) -> ResizeKey {
        ResizeKey {
            entry_id: 42,
            field_id: 5,
            file_index: 0,
            width,
        }
    }

    fn derivative(uploads: &Path, width: u32, with_path: bool) -> DerivativeRecord {
        let path = uploads
            .join("thumbs/42/5")
            .join(width.to_string())
            .join("photo-abc.jpg");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"jpeg").unwrap();
        DerivativeRecord {
            url: format!(
                "https://example.com/uploads/thumbs/42/5/{}/photo-abc.jpg",
                width
            ),
            path: with_path.then_some(path),
            width,
            height: width * 3 / 4,
            created: 1_700_000_000,
        }
    }

    #[test]
    fn hit_requires_matching_signature() {
        let f = fixture();
        let sig = SourceSignature::from_parts(1, 0, 10);
        let record = derivative(&f.uploads, 800, true);
        f.store
            .update_meta_for_size(&key(800), "https://example.com/uploads/photo.jpg", &sig, record)
            .unwrap();

        let hit = f.store.get_cached_size(&key(800), &sig).unwrap();
        assert_eq!(hit.width, 800);
        assert!(f
            .store
            .get_cached_size(&key(800), &SourceSignature::from_parts(2, 0, 10))
            .is_none());
        assert!(f.store.get_cached_size(&key(400), &sig).is_none());
    }

    #[test]
    fn missing_path_is_resolved_from_url() {
        let f = fixture();
        let sig = SourceSignature::from_parts(1, 0, 10);
        f.store
            .update_meta_for_size(&key(800), "src", &sig, derivative(&f.uploads, 800, false))
            .unwrap();
        let hit = f.store.get_cached_size(&key(800), &sig).unwrap();
        assert!(hit.path.unwrap().ends_with("thumbs/42/5/800/photo-abc.jpg"));
    }

    #[test]
    fn externally_deleted_file_is_a_miss() {
        let f = fixture();
        let sig = SourceSignature::from_parts(1, 0, 10);
        let record = derivative(&f.uploads, 800, true);
        let path = record.path.clone().unwrap();
        f.store.update_meta_for_size(&key(800), "src", &sig, record).unwrap();
        fs::remove_file(path).unwrap();
        assert!(f.store.get_cached_size(&key(800), &sig).is_none());
    }

    #[test]
    fn new_signature_resets_sibling_sizes() {
        let f = fixture();
        let old = SourceSignature::from_parts(1, 0, 10);
        let new = SourceSignature::from_parts(2, 0, 12);
        f.store
            .update_meta_for_size(&key(400), "src", &old, derivative(&f.uploads, 400, true))
            .unwrap();
        f.store
            .update_meta_for_size(&key(800), "src", &old, derivative(&f.uploads, 800, true))
            .unwrap();
        f.store
            .update_meta_for_size(&key(600), "src", &new, derivative(&f.uploads, 600, true))
            .unwrap();

        let thumbnails = f.store.load(42).unwrap();
        let file = thumbnails.file(&key(600)).unwrap();
        assert_eq!(file.source_sig, new);
        assert_eq!(file.sizes.keys().collect::<Vec<_>>(), vec!["w600"]);
    }

    #[test]
    fn same_signature_merges_sizes() {
        let f = fixture();
        let sig = SourceSignature::from_parts(1, 0, 10);
        for width in [400, 800] {
            f.store
                .update_meta_for_size(&key(width), "src", &sig, derivative(&f.uploads, width, true))
                .unwrap();
        }
        let thumbnails = f.store.load(42).unwrap();
        assert_eq!(thumbnails.file(&key(400)).unwrap().sizes.len(), 2);
    }

    #[test]
    fn corrupt_blob_reads_as_empty() {
        let f = fixture();
        f.meta.set(42, META_KEY, "{not json").unwrap();
        assert!(f.store.load(42).unwrap().is_empty());
        assert!(f
            .store
            .get_cached_size(&key(800), &SourceSignature::from_parts(1, 0, 10))
            .is_none());
    }

    #[test]
    fn metadata_uses_nested_field_and_index_keys() {
        let f = fixture();
        let sig = SourceSignature::from_parts(1, 0, 10);
        f.store
            .update_meta_for_size(&key(800), "src", &sig, derivative(&f.uploads, 800, true))
            .unwrap();
        let raw = f.meta.get(42, META_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["5"]["0"]["source_sig"], sig.as_str());
        assert_eq!(value["5"]["0"]["sizes"]["w800"]["width"], 800);
    }
}
