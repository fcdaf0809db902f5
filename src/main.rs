use entry_thumbs::{
    Config, FsTtlCache, HookRegistry, ImageAttributes, JsonFileMetaStore, Pipeline, RenderContext,
};
use rayon::prelude::*;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Level};

#[derive(Debug, Deserialize)]
struct RenderRequest {
    attrs: ImageAttributes,
    context: RenderContext,
}

fn usage() -> ! {
    eprintln!("Usage: entry-thumbs <config.toml> render <requests.json>");
    eprintln!("       entry-thumbs <config.toml> purge <entry_id>...");
    process::exit(1);
}

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    process::exit(1);
}

fn main() {
    let level = if env::var("ENTRY_THUMBS_DEBUG").ok().as_deref() == Some("1") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        usage();
    }

    let config = Config::load(Path::new(&args[1])).unwrap_or_else(|e| fail(e));
    let pipeline = build_pipeline(&config);

    match args[2].as_str() {
        "render" if args.len() == 4 => render(&pipeline, &args[3]),
        "purge" => purge(&pipeline, &args[3..]),
        _ => usage(),
    }
}

fn build_pipeline(config: &Config) -> Pipeline {
    let state = &config.state.dir;
    let ttl = FsTtlCache::new(state.join("ttl")).unwrap_or_else(|e| fail(e));
    let meta = JsonFileMetaStore::new(state.join("meta")).unwrap_or_else(|e| fail(e));
    Pipeline::from_config(
        config,
        &HookRegistry::default(),
        Arc::new(ttl),
        Arc::new(meta),
    )
    .unwrap_or_else(|e| fail(e))
}

fn render(pipeline: &Pipeline, requests_path: &str) {
    let raw = fs::read_to_string(requests_path)
        .unwrap_or_else(|e| fail(format!("Failed to read {}: {}", requests_path, e)));
    let requests: Vec<RenderRequest> = serde_json::from_str(&raw)
        .unwrap_or_else(|e| fail(format!("Failed to parse {}: {}", requests_path, e)));

    let start = Instant::now();
    let rendered: Vec<ImageAttributes> = requests
        .par_iter()
        .map(|request| pipeline.filter_image_attributes(&request.attrs, &request.context))
        .collect();
    info!(count = rendered.len(), elapsed = ?start.elapsed(), "rendered image attributes");

    match serde_json::to_string_pretty(&rendered) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

fn purge(pipeline: &Pipeline, ids: &[String]) {
    let mut failed = false;
    for raw in ids {
        let Ok(entry_id) = raw.parse::<i64>() else {
            error!(entry_id = %raw, "not an entry id");
            failed = true;
            continue;
        };
        if pipeline.on_entry_deleted(entry_id).is_err() {
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
}
