use crate::config;
use crate::hooks::ResizeHooks;
use crate::inspector::ImageInfo;
use crate::pipeline::{ImageAttributes, RenderContext, Skip};
use std::sync::Arc;
use tracing::warn;

/// Bytes per decoded pixel (RGBA8).
const BYTES_PER_PIXEL: f64 = 4.0;
/// Headroom for the decoder's scratch buffers on top of the pixel buffer.
const DECODE_SAFETY_FACTOR: f64 = 1.5;
/// Used when the configured memory limit cannot be parsed.
const FALLBACK_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLimit {
    Unbounded,
    Bytes(u64),
}

impl MemoryLimit {
    pub fn bytes(self) -> Option<u64> {
        match self {
            MemoryLimit::Unbounded => None,
            MemoryLimit::Bytes(bytes) => Some(bytes),
        }
    }
}

/// Parses shorthand sizes such as `256M`, `1g`, `512k` or `-1` (unbounded).
pub fn parse_memory_limit(value: &str) -> Option<MemoryLimit> {
    let value = value.trim().to_ascii_lowercase();
    if value.starts_with('-') {
        return value[1..]
            .parse::<u64>()
            .ok()
            .map(|_| MemoryLimit::Unbounded);
    }
    let (digits, multiplier) = match value.chars().last()? {
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'k' => (&value[..value.len() - 1], 1024),
        _ => (value.as_str(), 1),
    };
    let amount: u64 = digits.trim().parse().ok()?;
    amount.checked_mul(multiplier).map(MemoryLimit::Bytes)
}

/// Rough peak memory needed to decode and resample an image of this size.
pub fn estimate_decode_bytes(width: u32, height: u32) -> f64 {
    width as f64 * height as f64 * BYTES_PER_PIXEL * DECODE_SAFETY_FACTOR
}

/// Ordered allow/deny checks. The first failing check decides the [`Skip`].
#[derive(Clone)]
pub struct EligibilityPolicy {
    hooks: Arc<dyn ResizeHooks>,
    enabled: bool,
    allowed_mimes: Vec<String>,
    max_dimension: u32,
    memory_threshold: f64,
    memory_limit: MemoryLimit,
    bypass_secure: bool,
}

impl EligibilityPolicy {
    pub fn new(config: &config::ResizerConfig, hooks: Arc<dyn ResizeHooks>) -> Self {
        let memory_limit = parse_memory_limit(&config.memory_limit).unwrap_or_else(|| {
            warn!(
                memory_limit = %config.memory_limit,
                "unparseable memory limit, assuming 128M"
            );
            MemoryLimit::Bytes(FALLBACK_MEMORY_LIMIT)
        });
        Self {
            hooks,
            enabled: config.enabled,
            allowed_mimes: config.allowed_mimes.clone(),
            max_dimension: config.max_dimension,
            memory_threshold: config.memory_threshold,
            memory_limit,
            bypass_secure: config.bypass_secure,
        }
    }

    pub fn memory_limit(&self) -> MemoryLimit {
        self.memory_limit
    }

    /// Checks that need only the render context. Returns the requested width.
    pub fn check_context(
        &self,
        ctx: &RenderContext,
        attrs: &ImageAttributes,
    ) -> Result<u32, Skip> {
        if !self.hooks.enabled(ctx, self.enabled) {
            return Err(Skip::Disabled);
        }
        let target_width = match attrs.width {
            Some(width) if width > 0 => width,
            _ => return Err(Skip::NoTargetWidth),
        };
        if !self.hooks.should_resize(ctx) {
            return Err(Skip::Vetoed);
        }
        if ctx.entry_id <= 0 || ctx.field_id <= 0 {
            return Err(Skip::InvalidIds);
        }
        if ctx.file.is_secure && !self.hooks.bypass_secure(ctx, self.bypass_secure) {
            return Err(Skip::SecureFile);
        }
        Ok(target_width)
    }

    /// Checks that need the probed source image.
    pub fn check_image(&self, info: &ImageInfo, target_width: u32) -> Result<(), Skip> {
        let allowed = self.hooks.allowed_mimes(&self.allowed_mimes);
        if !allowed.iter().any(|m| m.eq_ignore_ascii_case(info.mime)) {
            return Err(Skip::MimeNotAllowed(info.mime.to_string()));
        }
        if info.width <= target_width {
            return Err(Skip::NoUpscale);
        }
        self.check_resize_safety(info.width, info.height)
    }

    pub fn check_resize_safety(&self, width: u32, height: u32) -> Result<(), Skip> {
        let max_dimension = self.hooks.max_dimension(self.max_dimension);
        if width >= max_dimension || height >= max_dimension {
            return Err(Skip::Unsafe(format!(
                "{}x{} exceeds the {}px dimension cap",
                width, height, max_dimension
            )));
        }
        let Some(limit) = self.memory_limit.bytes() else {
            return Ok(());
        };
        let threshold = self.hooks.memory_threshold(self.memory_threshold);
        let budget = limit as f64 * threshold;
        let needed = estimate_decode_bytes(width, height);
        if needed >= budget {
            return Err(Skip::Unsafe(format!(
                "decoding {}x{} needs ~{:.0} bytes, budget is {:.0}",
                width, height, needed, budget
            )));
        }
        Ok(())
    }
}
