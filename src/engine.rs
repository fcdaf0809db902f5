use crate::resolver;
use crate::sandbox::{self, SandboxError, SandboxedPath};
use crate::signature::SourceSignature;
use crate::store;
use crate::thumbnails::ResizeKey;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_JPEG_QUALITY: u8 = 82;

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("invalid storage location: {0}")]
    InvalidStorage(String),
    #[error("unable to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to open image: {0}")]
    Open(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("resize failed: {0}")]
    Resize(String),
    #[error("unable to save derivative: {0}")]
    Save(String),
}

/// Where derivatives live on disk and how they are addressed publicly.
/// The storage directory is always strictly inside the uploads root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    uploads_root: PathBuf,
    dir: PathBuf,
    url: String,
}

impl StorageLayout {
    /// Creates the storage directory if needed. Fails when it would land
    /// outside `uploads_root`, checked lexically first and then against the
    /// canonical path of every component before it is created.
    pub fn new(uploads_root: &Path, dir: &Path, url: &str) -> Result<Self, ResizeError> {
        let lexical_root = sandbox::normalize_path(uploads_root);
        let lexical_dir = sandbox::normalize_path(dir);
        if lexical_dir == lexical_root || !lexical_dir.starts_with(&lexical_root) {
            return Err(ResizeError::InvalidStorage(format!(
                "{} is not inside {}",
                dir.display(),
                uploads_root.display()
            )));
        }
        let dir = sandbox::create_dir_within(dir, uploads_root).map_err(storage_error)?;
        let uploads_root = uploads_root
            .canonicalize()
            .map_err(|e| ResizeError::InvalidStorage(e.to_string()))?;
        Ok(Self {
            uploads_root,
            dir,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn entry_dir(&self, entry_id: i64) -> PathBuf {
        self.dir.join(entry_id.to_string())
    }

    pub fn derivative_dir(&self, key: &ResizeKey) -> PathBuf {
        self.entry_dir(key.entry_id)
            .join(key.field_id.to_string())
            .join(key.width.to_string())
    }

    /// Public URL of a file under the storage directory.
    pub fn url_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.dir).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|component| match component {
                Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Option<_>>()?;
        if segments.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.url, segments.join("/")))
    }

    /// Storage path behind a derivative URL. The result is not validated.
    pub fn path_for_url(&self, url: &str) -> Option<PathBuf> {
        let relative = resolver::relative_url(url, &self.url)?;
        Some(self.dir.join(relative))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivative {
    pub url: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ResizeJob<'a> {
    pub source: &'a SandboxedPath,
    pub key: ResizeKey,
    pub source_sig: &'a SourceSignature,
}

pub trait Resizer: Send + Sync {
    fn resize(&self, job: &ResizeJob<'_>) -> Result<Derivative, ResizeError>;
}

/// Decode, downscale, encode and write with the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageResizer {
    layout: StorageLayout,
    quality: Option<u8>,
    max_alloc: Option<u64>,
}

impl ImageResizer {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            quality: None,
            max_alloc: None,
        }
    }

    pub fn with_quality(mut self, quality: Option<u8>) -> Self {
        self.quality = quality;
        self
    }

    /// Memory the decoder may use. It only ever raises the decoder's default
    /// cap; `None` lifts the cap entirely.
    pub fn with_max_alloc(mut self, max_alloc: Option<u64>) -> Self {
        self.max_alloc = max_alloc;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn destination_dir(&self, key: &ResizeKey) -> Result<PathBuf, ResizeError> {
        let dir = self.layout.derivative_dir(key);
        sandbox::create_dir_within(&dir, self.layout.uploads_root()).map_err(storage_error)
    }

    fn derivative(
        &self,
        path: PathBuf,
        width: u32,
        height: u32,
    ) -> Result<Derivative, ResizeError> {
        let url = self.layout.url_for(&path).ok_or_else(|| {
            ResizeError::InvalidStorage(format!("{} has no public url", path.display()))
        })?;
        Ok(Derivative {
            url,
            path,
            width,
            height,
        })
    }
}

impl Resizer for ImageResizer {
    fn resize(&self, job: &ResizeJob<'_>) -> Result<Derivative, ResizeError> {
        let source = job.source.as_path();
        let target_width = job.key.width;
        let dir = self.destination_dir(&job.key)?;

        let mut reader = ImageReader::open(source)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| ResizeError::Open(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| ResizeError::UnsupportedFormat(source.display().to_string()))?;
        let extension = path_extension(source)
            .or_else(|| extension_for_format(format).map(str::to_string))
            .ok_or_else(|| ResizeError::UnsupportedFormat(format!("{:?}", format)))?;

        let filename = derivative_filename(source, job.source_sig, target_width, &extension);
        let destination = dir.join(filename);
        if destination.is_file() {
            if let Ok((width, height)) = image::image_dimensions(&destination) {
                debug!(path = %destination.display(), "derivative already on disk");
                return self.derivative(destination, width, height);
            }
        }

        let mut limits = Limits::default();
        limits.max_alloc = decoder_alloc_ceiling(self.max_alloc);
        reader.limits(limits);

        let start = Instant::now();
        let image = reader
            .decode()
            .map_err(|e| ResizeError::Open(e.to_string()))?;
        if image.width() <= target_width {
            return Err(ResizeError::Resize(format!(
                "source is {}px wide, not wider than {}px",
                image.width(),
                target_width
            )));
        }
        let target_height = scaled_height(image.width(), image.height(), target_width);
        let resized = image.resize_exact(target_width, target_height, FilterType::Lanczos3);

        let encoded = encode_image(&resized, format, self.quality)?;
        store::write_atomic(&destination, &encoded)
            .map_err(|e| ResizeError::Save(format!("{}: {}", destination.display(), e)))?;
        info!(
            source = %source.display(),
            path = %destination.display(),
            width = target_width,
            height = target_height,
            elapsed = ?start.elapsed(),
            "created derivative"
        );
        self.derivative(destination, target_width, target_height)
    }
}

fn storage_error(err: SandboxError) -> ResizeError {
    match err {
        SandboxError::CreateDir { path, source } => ResizeError::CreateDir { path, source },
        other => ResizeError::InvalidStorage(other.to_string()),
    }
}

/// The larger of the configured limit and the decoder's own default.
fn decoder_alloc_ceiling(configured: Option<u64>) -> Option<u64> {
    configured
        .zip(Limits::default().max_alloc)
        .map(|(configured, default)| configured.max(default))
}

/// Height that keeps the aspect ratio at `target_width`, never below 1px.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    ((target_width as f64 / width as f64) * height as f64)
        .round()
        .max(1.0) as u32
}

/// `<stem>-<hash>.<ext>`, where the hash covers the source path, its
/// signature and the target width.
pub fn derivative_filename(
    source: &Path,
    source_sig: &SourceSignature,
    width: u32,
    extension: &str,
) -> String {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(source_sig.as_str().as_bytes());
    hasher.update(width.to_string().as_bytes());
    let hash = hasher.finalize();
    format!("{}-{}.{}", stem, &hash.to_hex().as_str()[..12], extension)
}

fn sanitize_filename(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    sanitized.trim_matches('_').to_string()
}

fn path_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn extension_for_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Png => Some("png"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

fn encode_image(
    image: &DynamicImage,
    format: ImageFormat,
    quality: Option<u8>,
) -> Result<Vec<u8>, ResizeError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let mut encoder =
                JpegEncoder::new_with_quality(&mut buf, quality.unwrap_or(DEFAULT_JPEG_QUALITY));
            encoder
                .encode_image(&image.to_rgb8())
                .map_err(|e| ResizeError::Save(e.to_string()))?;
        }
        ImageFormat::Png => {
            image
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|e| ResizeError::Save(e.to_string()))?;
        }
        ImageFormat::Gif | ImageFormat::WebP => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), format)
                .map_err(|e| ResizeError::Save(e.to_string()))?;
        }
        other => return Err(ResizeError::UnsupportedFormat(format!("{:?}", other))),
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        uploads: PathBuf,
        resizer: ImageResizer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let layout = StorageLayout::new(
            &uploads,
            &uploads.join("gravityview").join("thumbnails"),
            "https://example.com/uploads/gravityview/thumbnails/",
        )
        .unwrap();
        Fixture {
            resizer: ImageResizer::new(layout),
            uploads,
            _dir: dir,
        }
    }

    fn write_source(uploads: &Path, name: &str, width: u32, height: u32) -> SandboxedPath {
        let path = uploads.join(name);
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 90]))
            .save(&path)
            .unwrap();
        SandboxedPath::file(&path, uploads).unwrap()
    }

    fn key(width: u32) -> ResizeKey {
        ResizeKey {
            entry_id: 42,
            field_id: 5,
            file_index: 0,
            width,
        }
    }

    #[test]
    fn preserves_aspect_ratio() {
        let f = fixture();
        let source = write_source(&f.uploads, "photo.jpg", 400, 300);
        let sig = SourceSignature::compute(source.as_path()).unwrap();
        let derivative = f
            .resizer
            .resize(&ResizeJob {
                source: &source,
                key: key(80),
                source_sig: &sig,
            })
            .unwrap();

        assert_eq!((derivative.width, derivative.height), (80, 60));
        assert_eq!(image::image_dimensions(&derivative.path).unwrap(), (80, 60));
        assert!(derivative
            .url
            .starts_with("https://example.com/uploads/gravityview/thumbnails/42/5/80/photo-"));
        assert!(derivative.url.ends_with(".jpg"));
    }

    #[test]
    fn second_resize_reuses_file_without_encoding() {
        let f = fixture();
        let source = write_source(&f.uploads, "photo.png", 200, 100);
        let sig = SourceSignature::compute(source.as_path()).unwrap();
        let job = ResizeJob {
            source: &source,
            key: key(50),
            source_sig: &sig,
        };
        let first = f.resizer.resize(&job).unwrap();
        let modified = fs::metadata(&first.path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let second = f.resizer.resize(&job).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&second.path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn filename_is_content_addressed() {
        let source = Path::new("/srv/uploads/My Photo!.JPG");
        let sig = SourceSignature::from_parts(1, 0, 10);
        let name = derivative_filename(source, &sig, 800, "jpg");
        assert_eq!(name, derivative_filename(source, &sig, 800, "jpg"));
        assert!(name.starts_with("My_Photo-"));
        assert_eq!(name.len(), "My_Photo-".len() + 12 + ".jpg".len());
        assert_ne!(name, derivative_filename(source, &sig, 400, "jpg"));
        assert_ne!(
            name,
            derivative_filename(source, &SourceSignature::from_parts(2, 0, 10), 800, "jpg")
        );
    }

    #[test]
    fn refuses_to_upscale() {
        let f = fixture();
        let source = write_source(&f.uploads, "small.png", 40, 30);
        let sig = SourceSignature::compute(source.as_path()).unwrap();
        let err = f
            .resizer
            .resize(&ResizeJob {
                source: &source,
                key: key(80),
                source_sig: &sig,
            })
            .unwrap_err();
        assert!(matches!(err, ResizeError::Resize(_)));
    }

    #[test]
    fn undecodable_source_is_an_open_error() {
        let f = fixture();
        let path = f.uploads.join("broken.jpg");
        fs::write(&path, [0xFF, 0xD8, 0xFF, 0x00, 0x01]).unwrap();
        let source = SandboxedPath::file(&path, &f.uploads).unwrap();
        let sig = SourceSignature::compute(&path).unwrap();
        let err = f
            .resizer
            .resize(&ResizeJob {
                source: &source,
                key: key(80),
                source_sig: &sig,
            })
            .unwrap_err();
        assert!(matches!(err, ResizeError::Open(_)));
    }

    #[test]
    fn storage_outside_uploads_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        for storage in [dir.path().join("elsewhere"), uploads.join("../escape"), uploads.clone()] {
            assert!(matches!(
                StorageLayout::new(&uploads, &storage, "/x"),
                Err(ResizeError::InvalidStorage(_))
            ));
        }
        assert!(!dir.path().join("elsewhere").exists());
    }

    #[cfg(unix)]
    #[test]
    fn storage_through_symlink_creates_nothing_outside() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&uploads).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, uploads.join("gv")).unwrap();

        let layout = StorageLayout::new(&uploads, &uploads.join("gv/thumbnails"), "/x");
        assert!(matches!(layout, Err(ResizeError::InvalidStorage(_))));
        assert!(!outside.join("thumbnails").exists());
    }

    #[cfg(unix)]
    #[test]
    fn derivative_dir_through_symlink_creates_nothing_outside() {
        let f = fixture();
        let outside = f.uploads.parent().unwrap().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, f.resizer.layout().entry_dir(42)).unwrap();

        let source = write_source(&f.uploads, "photo.png", 200, 100);
        let sig = SourceSignature::compute(source.as_path()).unwrap();
        let err = f
            .resizer
            .resize(&ResizeJob {
                source: &source,
                key: key(50),
                source_sig: &sig,
            })
            .unwrap_err();
        assert!(matches!(err, ResizeError::InvalidStorage(_)));
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
    }

    #[test]
    fn decoder_ceiling_never_drops_below_default() {
        let default = Limits::default().max_alloc.unwrap();
        assert_eq!(decoder_alloc_ceiling(Some(1024)), Some(default));
        assert_eq!(decoder_alloc_ceiling(Some(default * 2)), Some(default * 2));
        assert_eq!(decoder_alloc_ceiling(None), None);
    }

    #[test]
    fn urls_and_paths_map_both_ways() {
        let f = fixture();
        let layout = f.resizer.layout();
        let path = layout.derivative_dir(&key(800)).join("photo-abc.jpg");
        let url = layout.url_for(&path).unwrap();
        assert_eq!(
            url,
            "https://example.com/uploads/gravityview/thumbnails/42/5/800/photo-abc.jpg"
        );
        assert_eq!(layout.path_for_url(&url).unwrap(), path);
        assert!(layout.path_for_url("https://other.test/x.jpg").is_none());
    }

    #[test]
    fn scaled_height_rounds_and_clamps() {
        assert_eq!(scaled_height(4000, 3000, 800), 600);
        assert_eq!(scaled_height(1000, 333, 500), 167);
        assert_eq!(scaled_height(5000, 1, 100), 1);
    }
}
