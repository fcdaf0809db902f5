use crate::config;
use crate::sandbox::SandboxedPath;
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

lazy_static! {
    static ref SCHEME_REGEX: Regex = Regex::new(r"^(?i)(?:https?:)?//").unwrap();
}

/// A public URL prefix and the directory it is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBase {
    pub dir: PathBuf,
    pub url: String,
}

/// Maps upload URLs back onto files under the configured upload roots.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    generic: UploadBase,
    forms: HashMap<u64, UploadBase>,
}

impl SourceResolver {
    pub fn new(generic: UploadBase) -> Self {
        Self {
            generic,
            forms: HashMap::new(),
        }
    }

    pub fn from_config(config: &config::UploadsConfig) -> Self {
        let mut resolver = Self::new(UploadBase {
            dir: config.dir.clone(),
            url: config.url.clone(),
        });
        for form in &config.forms {
            resolver = resolver.with_form_base(
                form.form_id,
                UploadBase {
                    dir: form.dir.clone(),
                    url: form.url.clone(),
                },
            );
        }
        resolver
    }

    pub fn with_form_base(mut self, form_id: u64, base: UploadBase) -> Self {
        self.forms.insert(form_id, base);
        self
    }

    pub fn generic_base(&self) -> &UploadBase {
        &self.generic
    }

    /// Returns the sandboxed local file behind `url`, or `None` when the URL
    /// does not belong to a known upload base or escapes it.
    pub fn resolve(&self, url: &str, form_id: Option<u64>) -> Option<SandboxedPath> {
        let bases = form_id
            .and_then(|id| self.forms.get(&id))
            .into_iter()
            .chain(std::iter::once(&self.generic));

        for base in bases {
            let Some(relative) = relative_url(url, &base.url) else {
                continue;
            };
            let candidate = base.dir.join(relative);
            return match SandboxedPath::file(&candidate, &base.dir) {
                Ok(path) => Some(path),
                Err(err) => {
                    debug!(url, error = %err, "upload url does not resolve to a safe local file");
                    None
                }
            };
        }
        debug!(url, "url does not match any upload base");
        None
    }
}

/// Decoded path of `url` below `base_url`, or `None` when it is not below it.
pub(crate) fn relative_url(url: &str, base_url: &str) -> Option<String> {
    let target = normalize_url(&decode(strip_query(url))?);
    relative_to(&target, &normalize_url(base_url)).map(str::to_string)
}

fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].trim()
}

fn decode(url: &str) -> Option<String> {
    let decoded = percent_decode_str(url).decode_utf8().ok()?;
    if decoded.contains('\0') {
        return None;
    }
    Some(decoded.into_owned())
}

/// Drops the scheme and lowercases the host so `http://`, `https://` and
/// protocol-relative URLs compare equal. Root-relative paths are kept as-is.
fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    match SCHEME_REGEX.find(trimmed) {
        Some(scheme) => {
            let rest = &trimmed[scheme.end()..];
            let (host, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
            format!("//{}{}", host.to_ascii_lowercase(), path)
        }
        None => trimmed.to_string(),
    }
}

/// Portion of `target` below `prefix`, matched on a path-segment boundary.
fn relative_to<'a>(target: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = target.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
