use crate::engine::StorageLayout;
use crate::sandbox;
use crate::store::StoreError;
use crate::thumbnails::ThumbnailStore;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to touch {0}: outside the uploads root")]
    Escape(PathBuf),
    #[error("metadata error: {0}")]
    Metadata(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub files: usize,
    pub dirs: usize,
}

/// Removes an entry's derivatives and their metadata.
#[derive(Clone)]
pub struct Cleanup {
    layout: StorageLayout,
    thumbnails: ThumbnailStore,
}

impl Cleanup {
    pub fn new(layout: StorageLayout, thumbnails: ThumbnailStore) -> Self {
        Self { layout, thumbnails }
    }

    /// Deletes `<storage>/<entry_id>` recursively, then the entry's metadata.
    /// Metadata is dropped even when part of the tree could not be removed.
    pub fn purge_entry(&self, entry_id: i64) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport::default();
        let tree = self.remove_entry_dir(&self.layout.entry_dir(entry_id), &mut report);
        self.thumbnails.delete_entry(entry_id)?;
        tree?;
        info!(entry_id, files = report.files, dirs = report.dirs, "purged entry derivatives");
        Ok(report)
    }

    fn remove_entry_dir(
        &self,
        dir: &Path,
        report: &mut CleanupReport,
    ) -> Result<(), CleanupError> {
        match fs::symlink_metadata(dir) {
            Ok(meta) if meta.is_dir() => self.remove_tree(dir, report),
            Ok(_) => self.remove_file(dir, report),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CleanupError::Io {
                path: dir.to_path_buf(),
                source,
            }),
        }
    }

    fn remove_tree(&self, dir: &Path, report: &mut CleanupReport) -> Result<(), CleanupError> {
        if !sandbox::is_within(dir, self.layout.uploads_root()) {
            return Err(CleanupError::Escape(dir.to_path_buf()));
        }
        let entries = fs::read_dir(dir).map_err(|source| CleanupError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CleanupError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| CleanupError::Io {
                path: path.clone(),
                source,
            })?;
            // `file_type` does not follow symlinks: linked directories are unlinked, not walked.
            if file_type.is_dir() {
                self.remove_tree(&path, report)?;
            } else {
                self.remove_file(&path, report)?;
            }
        }
        if !sandbox::is_within(dir, self.layout.uploads_root()) {
            return Err(CleanupError::Escape(dir.to_path_buf()));
        }
        fs::remove_dir(dir).map_err(|source| CleanupError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        report.dirs += 1;
        Ok(())
    }

    /// Unlinks a file or symlink after checking that its parent directory is inside uploads.
    fn remove_file(&self, path: &Path, report: &mut CleanupReport) -> Result<(), CleanupError> {
        let parent_inside = path
            .parent()
            .map_or(false, |parent| sandbox::is_within(parent, self.layout.uploads_root()));
        if !parent_inside || path.file_name().is_none() {
            return Err(CleanupError::Escape(path.to_path_buf()));
        }
        fs::remove_file(path).map_err(|source| CleanupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        report.files += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SourceSignature;
    use crate::store::{MemoryMetaStore, MetaStore};
    use crate::thumbnails::{DerivativeRecord, ResizeKey, META_KEY};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        cleanup: Cleanup,
        thumbnails: ThumbnailStore,
        meta: Arc<MemoryMetaStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let layout =
            StorageLayout::new(&uploads, &uploads.join("thumbs"), "/uploads/thumbs").unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let thumbnails = ThumbnailStore::new(meta.clone(), layout.clone());
        Fixture {
            root: dir.path().to_path_buf(),
            cleanup: Cleanup::new(layout, thumbnails.clone()),
            thumbnails,
            meta,
            _dir: dir,
        }
    }

    fn seed(f: &Fixture, entry_id: i64) -> PathBuf {
        let dir = f.root.join("uploads/thumbs").join(entry_id.to_string());
        for width in ["400", "800"] {
            let sub = dir.join("5").join(width);
            fs::create_dir_all(&sub).unwrap();
            fs::write(sub.join("photo-abc.jpg"), b"jpeg").unwrap();
        }
        let key = ResizeKey {
            entry_id,
            field_id: 5,
            file_index: 0,
            width: 800,
        };
        let record = DerivativeRecord {
            url: format!("/uploads/thumbs/{}/5/800/photo-abc.jpg", entry_id),
            path: None,
            width: 800,
            height: 600,
            created: 0,
        };
        f.thumbnails
            .update_meta_for_size(&key, "src", &SourceSignature::from_parts(1, 0, 1), record)
            .unwrap();
        dir
    }

    #[test]
    fn purges_only_the_deleted_entry() {
        let f = fixture();
        let a = seed(&f, 42);
        let b = seed(&f, 43);

        let report = f.cleanup.purge_entry(42).unwrap();
        assert_eq!(report, CleanupReport { files: 2, dirs: 4 });
        assert!(!a.exists());
        assert!(f.meta.get(42, META_KEY).unwrap().is_none());

        assert!(b.join("5/800/photo-abc.jpg").is_file());
        assert!(f.meta.get(43, META_KEY).unwrap().is_some());
    }

    #[test]
    fn missing_directory_still_drops_metadata() {
        let f = fixture();
        let dir = seed(&f, 42);
        fs::remove_dir_all(dir).unwrap();
        assert_eq!(f.cleanup.purge_entry(42).unwrap(), CleanupReport::default());
        assert!(f.meta.get(42, META_KEY).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_unlinked_not_followed() {
        let f = fixture();
        let dir = seed(&f, 42);
        let outside = f.root.join("precious");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep.txt"), b"keep").unwrap();
        std::os::unix::fs::symlink(&outside, dir.join("5").join("escape")).unwrap();

        f.cleanup.purge_entry(42).unwrap();
        assert!(!dir.exists());
        assert!(outside.join("keep.txt").is_file());
    }
}
