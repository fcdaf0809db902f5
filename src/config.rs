use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;
pub const DEFAULT_FAILURE_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_DIMENSION: u32 = 5000;
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub resizer: ResizerConfig,
    pub uploads: UploadsConfig,
    pub storage: StorageConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResizerConfig {
    pub enabled: bool,
    pub hooks: String,
    pub allowed_mimes: Vec<String>,
    pub max_dimension: u32,
    pub memory_threshold: f64,
    pub memory_limit: String,
    pub quality: Option<u8>,
    pub bypass_secure: bool,
    pub lock_ttl_secs: u64,
    pub failure_ttl_secs: u64,
}

impl Default for ResizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hooks: "default".into(),
            allowed_mimes: vec![
                "image/jpeg".into(),
                "image/png".into(),
                "image/gif".into(),
                "image/webp".into(),
            ],
            max_dimension: DEFAULT_MAX_DIMENSION,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            memory_limit: "256M".into(),
            quality: None,
            bypass_secure: false,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            failure_ttl_secs: DEFAULT_FAILURE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    pub dir: PathBuf,
    pub url: String,
    pub forms: Vec<FormUploadConfig>,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wp-content/uploads"),
            url: "/wp-content/uploads".into(),
            forms: Vec::new(),
        }
    }
}

/// Upload location of a single form, usually nested under the generic uploads root.
#[derive(Debug, Clone, Deserialize)]
pub struct FormUploadConfig {
    pub form_id: u64,
    pub dir: PathBuf,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: Option<PathBuf>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".entry-thumbs"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display(path),
            source,
        })?;
        let mut config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: display(path),
            source,
        })?;
        config.resolve_relative_to(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(contents)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        self.resizer.normalize();
        self.uploads.url = trim_url(&self.uploads.url);
        for form in &mut self.uploads.forms {
            form.url = trim_url(&form.url);
        }
        if let Some(url) = &mut self.storage.url {
            let trimmed = trim_url(url);
            if trimmed.is_empty() {
                self.storage.url = None;
            } else {
                *url = trimmed;
            }
        }
    }

    /// Relative directories in a config file are relative to the file itself.
    fn resolve_relative_to(&mut self, base: &Path) {
        let rebase = |dir: &mut PathBuf| {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        };
        rebase(&mut self.uploads.dir);
        for form in &mut self.uploads.forms {
            rebase(&mut form.dir);
        }
        if let Some(dir) = &mut self.storage.dir {
            rebase(dir);
        }
        rebase(&mut self.state.dir);
    }

    /// Storage directory for derivatives, defaulting to a folder under the uploads root.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .dir
            .clone()
            .unwrap_or_else(|| self.uploads.dir.join("gravityview").join("thumbnails"))
    }

    pub fn storage_url(&self) -> String {
        self.storage
            .url
            .clone()
            .unwrap_or_else(|| format!("{}/gravityview/thumbnails", self.uploads.url))
    }
}

impl ResizerConfig {
    fn normalize(&mut self) {
        if self.hooks.trim().is_empty() {
            self.hooks = "default".into();
        }
        self.allowed_mimes = self
            .allowed_mimes
            .iter()
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        self.allowed_mimes.dedup();
        if self.max_dimension == 0 {
            self.max_dimension = DEFAULT_MAX_DIMENSION;
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold <= 1.0) {
            self.memory_threshold = DEFAULT_MEMORY_THRESHOLD;
        }
        if self.memory_limit.trim().is_empty() {
            self.memory_limit = "-1".into();
        }
        self.quality = self.quality.map(|q| q.clamp(10, 100));
        if self.lock_ttl_secs == 0 {
            self.lock_ttl_secs = DEFAULT_LOCK_TTL_SECS;
        }
        if self.failure_ttl_secs == 0 {
            self.failure_ttl_secs = DEFAULT_FAILURE_TTL_SECS;
        }
    }
}

fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
