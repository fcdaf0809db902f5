//! Extension points for the resize pipeline.
//!
//! Every method receives the configured default and returns the value to use,
//! so a strategy only overrides what it cares about.

use crate::pipeline::RenderContext;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_HOOKS: &str = "default";

pub trait ResizeHooks: Send + Sync {
    fn enabled(&self, _ctx: &RenderContext, default: bool) -> bool {
        default
    }

    /// Unconditional veto for a given entry and field.
    fn should_resize(&self, _ctx: &RenderContext) -> bool {
        true
    }

    fn allowed_mimes(&self, default: &[String]) -> Vec<String> {
        default.to_vec()
    }

    fn max_dimension(&self, default: u32) -> u32 {
        default
    }

    fn memory_threshold(&self, default: f64) -> f64 {
        default
    }

    fn quality(&self, default: Option<u8>) -> Option<u8> {
        default
    }

    fn storage_dir(&self, default: &Path) -> PathBuf {
        default.to_path_buf()
    }

    fn storage_url(&self, default: &str) -> String {
        default.to_string()
    }

    fn bypass_secure(&self, _ctx: &RenderContext, default: bool) -> bool {
        default
    }
}

/// Keeps every configured default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ResizeHooks for DefaultHooks {}

/// Named strategies the configuration can pick from.
#[derive(Clone)]
pub struct HookRegistry {
    entries: HashMap<String, Arc<dyn ResizeHooks>>,
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, hooks: Arc<dyn ResizeHooks>) {
        self.entries.insert(name.into(), hooks);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ResizeHooks>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DEFAULT_HOOKS, Arc::new(DefaultHooks));
        registry
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("HookRegistry").field("entries", &names).finish()
    }
}
