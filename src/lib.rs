pub mod cleanup;
pub mod config;
pub mod engine;
pub mod guard;
pub mod hooks;
pub mod inspector;
pub mod pipeline;
pub mod policy;
pub mod resolver;
pub mod sandbox;
pub mod signature;
pub mod store;
pub mod thumbnails;

pub use cleanup::{Cleanup, CleanupError, CleanupReport};
pub use config::Config;
pub use engine::{Derivative, ImageResizer, ResizeError, Resizer, StorageLayout};
pub use hooks::{DefaultHooks, HookRegistry, ResizeHooks};
pub use pipeline::{
    FileUpload, ImageAttributes, Outcome, Pipeline, PipelineError, RenderContext, Skip,
    SkipCategory,
};
pub use store::{
    FsTtlCache, JsonFileMetaStore, MemoryMetaStore, MemoryTtlCache, MetaStore, TtlCache,
};
