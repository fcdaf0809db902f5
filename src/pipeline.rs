//! The attribute filter: decides whether an `<img>` can point at a smaller
//! derivative and produces or reuses one. Every failure ends in the original
//! attributes being handed back.

use crate::cleanup::{Cleanup, CleanupError, CleanupReport};
use crate::config::Config;
use crate::engine::{Derivative, ImageResizer, ResizeError, ResizeJob, Resizer, StorageLayout};
use crate::guard::{ConcurrencyGuard, FailureMemo};
use crate::hooks::HookRegistry;
use crate::inspector;
use crate::policy::EligibilityPolicy;
use crate::resolver::SourceResolver;
use crate::signature::SourceSignature;
use crate::store::{MetaStore, TtlCache};
use crate::thumbnails::{DerivativeRecord, ResizeKey, ThumbnailStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// The `src`, `width` and `height` of an image about to be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttributes {
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub url: String,
    #[serde(default)]
    pub is_secure: bool,
}

/// Where the image comes from: which file of which field of which entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderContext {
    #[serde(default)]
    pub form_id: Option<u64>,
    pub entry_id: i64,
    pub field_id: i64,
    #[serde(default)]
    pub file_index: usize,
    pub file: FileUpload,
}

/// Why the original attributes were kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    Disabled,
    NoTargetWidth,
    Vetoed,
    InvalidIds,
    SecureFile,
    MimeNotAllowed(String),
    NoUpscale,
    Unresolvable,
    Uninspectable,
    Unsafe(String),
    Contended,
    RecentlyFailed,
    EngineFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCategory {
    Ineligible,
    Unresolvable,
    Unsafe,
    Contended,
    RecentlyFailed,
    EngineFailure,
}

impl Skip {
    pub fn category(&self) -> SkipCategory {
        match self {
            Skip::Disabled
            | Skip::NoTargetWidth
            | Skip::Vetoed
            | Skip::InvalidIds
            | Skip::SecureFile
            | Skip::MimeNotAllowed(_)
            | Skip::NoUpscale => SkipCategory::Ineligible,
            Skip::Unresolvable | Skip::Uninspectable => SkipCategory::Unresolvable,
            Skip::Unsafe(_) => SkipCategory::Unsafe,
            Skip::Contended => SkipCategory::Contended,
            Skip::RecentlyFailed => SkipCategory::RecentlyFailed,
            Skip::EngineFailure(_) => SkipCategory::EngineFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Cached(DerivativeRecord),
    Resized(Derivative),
    Skipped(Skip),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no resize hooks registered as {0:?}")]
    UnknownHooks(String),
    #[error(transparent)]
    Storage(#[from] ResizeError),
}

pub struct Pipeline {
    policy: EligibilityPolicy,
    resolver: SourceResolver,
    layout: StorageLayout,
    thumbnails: ThumbnailStore,
    guard: ConcurrencyGuard,
    failures: FailureMemo,
    resizer: Arc<dyn Resizer>,
    cleanup: Cleanup,
}

impl Pipeline {
    pub fn from_config(
        config: &Config,
        registry: &HookRegistry,
        ttl: Arc<dyn TtlCache>,
        meta: Arc<dyn MetaStore>,
    ) -> Result<Self, PipelineError> {
        let hooks = registry
            .resolve(&config.resizer.hooks)
            .ok_or_else(|| PipelineError::UnknownHooks(config.resizer.hooks.clone()))?;
        let policy = EligibilityPolicy::new(&config.resizer, Arc::clone(&hooks));

        let storage_dir = hooks.storage_dir(&config.storage_dir());
        let storage_url = hooks.storage_url(&config.storage_url());
        let layout = StorageLayout::new(&config.uploads.dir, &storage_dir, &storage_url)?;

        let resizer = ImageResizer::new(layout.clone())
            .with_quality(hooks.quality(config.resizer.quality))
            .with_max_alloc(policy.memory_limit().bytes());
        let thumbnails = ThumbnailStore::new(meta, layout.clone());

        Ok(Self {
            policy,
            resolver: SourceResolver::from_config(&config.uploads),
            guard: ConcurrencyGuard::new(
                Arc::clone(&ttl),
                Duration::from_secs(config.resizer.lock_ttl_secs),
            ),
            failures: FailureMemo::new(
                ttl,
                Duration::from_secs(config.resizer.failure_ttl_secs),
            ),
            resizer: Arc::new(resizer),
            cleanup: Cleanup::new(layout.clone(), thumbnails.clone()),
            thumbnails,
            layout,
        })
    }

    /// Swaps the engine, e.g. for one with different encoder settings.
    pub fn with_resizer(mut self, resizer: Arc<dyn Resizer>) -> Self {
        self.resizer = resizer;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn thumbnails(&self) -> &ThumbnailStore {
        &self.thumbnails
    }

    pub fn filter_image_attributes(
        &self,
        attrs: &ImageAttributes,
        ctx: &RenderContext,
    ) -> ImageAttributes {
        self.process(attrs, ctx).0
    }

    /// Like [`Pipeline::filter_image_attributes`], also reporting what happened.
    pub fn process(
        &self,
        attrs: &ImageAttributes,
        ctx: &RenderContext,
    ) -> (ImageAttributes, Outcome) {
        let outcome = match self.render(attrs, ctx) {
            Ok(outcome) => outcome,
            Err(skip) => Outcome::Skipped(skip),
        };
        let rewritten = match &outcome {
            Outcome::Cached(record) => rewrite(&record.url, record.width, record.height),
            Outcome::Resized(derivative) => {
                rewrite(&derivative.url, derivative.width, derivative.height)
            }
            Outcome::Skipped(_) => attrs.clone(),
        };
        (rewritten, outcome)
    }

    /// Removes every derivative and the metadata of a deleted entry.
    pub fn on_entry_deleted(&self, entry_id: i64) -> Result<CleanupReport, CleanupError> {
        self.cleanup.purge_entry(entry_id).map_err(|err| {
            warn!(entry_id, error = %err, "entry cleanup incomplete");
            err
        })
    }

    fn render(&self, attrs: &ImageAttributes, ctx: &RenderContext) -> Result<Outcome, Skip> {
        let width = self.policy.check_context(ctx, attrs)?;
        let key = ResizeKey {
            entry_id: ctx.entry_id,
            field_id: ctx.field_id,
            file_index: ctx.file_index,
            width,
        };
        let source_url = if ctx.file.url.is_empty() {
            attrs.src.as_str()
        } else {
            ctx.file.url.as_str()
        };

        let source = self
            .resolver
            .resolve(source_url, ctx.form_id)
            .ok_or(Skip::Unresolvable)?;
        let info = inspector::inspect(source.as_path()).ok_or_else(|| {
            debug!(key = %key, path = %source, "source is not a readable image");
            Skip::Uninspectable
        })?;
        self.policy.check_image(&info, width).map_err(|skip| {
            if let Skip::Unsafe(reason) = &skip {
                info!(
                    key = %key,
                    path = %source,
                    reason = %reason,
                    "image too large to resize safely"
                );
            }
            skip
        })?;
        let sig = SourceSignature::compute(source.as_path()).map_err(|err| {
            debug!(key = %key, path = %source, error = %err, "cannot stat source");
            Skip::Unresolvable
        })?;

        if let Some(record) = self.thumbnails.get_cached_size(&key, &sig) {
            debug!(key = %key, url = %record.url, "derivative cache hit");
            return Ok(Outcome::Cached(record));
        }
        if self.failures.has_recent_failure(&key, &sig) {
            debug!(key = %key, "resize failed recently, not retrying");
            return Err(Skip::RecentlyFailed);
        }
        let Some(_lock) = self.guard.acquire(&key) else {
            debug!(key = %key, "resize already in progress elsewhere");
            return Err(Skip::Contended);
        };

        let job = ResizeJob {
            source: &source,
            key,
            source_sig: &sig,
        };
        let derivative = self.resizer.resize(&job).map_err(|err| {
            error!(
                entry_id = key.entry_id,
                field_id = key.field_id,
                width = key.width,
                path = %source,
                error = %err,
                "resize failed"
            );
            let message = err.to_string();
            self.failures.record(&key, &sig, &message);
            Skip::EngineFailure(message)
        })?;

        let record = DerivativeRecord {
            url: derivative.url.clone(),
            path: Some(derivative.path.clone()),
            width: derivative.width,
            height: derivative.height,
            created: OffsetDateTime::now_utc().unix_timestamp(),
        };
        if let Err(err) = self
            .thumbnails
            .update_meta_for_size(&key, source_url, &sig, record)
        {
            warn!(key = %key, error = %err, "derivative created but metadata not saved");
        }
        Ok(Outcome::Resized(derivative))
    }
}

fn rewrite(url: &str, width: u32, height: u32) -> ImageAttributes {
    ImageAttributes {
        src: url.to_string(),
        width: Some(width),
        height: Some(height),
    }
}
