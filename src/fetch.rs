//! Module resolution and fetch service.
//!
//! Resolves a module id (plus optional importer) to a canonical id and
//! fetches its transformed source. Three sources are provided:
//!
//! - [`ResolvingFetcher`]: checks static directories and runtime built-ins
//!   first, then delegates; owns the fetch cache.
//! - [`BundleSource`]: a prebuilt server bundle (directory or in-memory).
//! - [`DevServerSource`]: the dev module-fetch protocol over a [`Transport`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::module_server::ProtocolResponse;
use crate::utils::{
    builtin_wrapper_code, clean_url, encode_path_segment, escape_js_string, is_builtin,
    is_virtual, join_specifier, normalize_builtin, scan_imports, split_query, unwrap_id,
    QueryFlags,
};
use crate::{SsrError, TransformError};

/// Transformed source of one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    /// Canonical module id.
    pub id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<Value>,
    /// Static import specifiers, in source order.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Dynamic import specifiers, in source order.
    #[serde(default)]
    pub dynamic_deps: Vec<String>,
}

/// A place modules can be resolved and fetched from.
pub trait ModuleSource: Send + Sync {
    /// Resolve `id` relative to `importer`. `Ok(None)` means not found.
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>>;

    /// Fetch the transformed source of a resolved id.
    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FetchResult, SsrError>>;

    /// Drop anything cached for `id`.
    fn invalidate(&self, _id: &str) {}
}

// ---------------------------------------------------------------------------
// ResolvingFetcher
// ---------------------------------------------------------------------------

/// Front of the fetch service: static directories, built-ins, fetch cache.
pub struct ResolvingFetcher {
    static_dirs: Vec<PathBuf>,
    inner: Arc<dyn ModuleSource>,
    cache: DashMap<String, FetchResult>,
}

impl fmt::Debug for ResolvingFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvingFetcher")
            .field("static_dirs", &self.static_dirs)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ResolvingFetcher {
    pub fn new(inner: Arc<dyn ModuleSource>) -> Self {
        Self {
            static_dirs: Vec::new(),
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn with_static_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.static_dirs.extend(dirs);
        self
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    /// Look `id` up in the static directories. Query and virtual encodings
    /// are stripped for the lookup but the query is kept on the result.
    async fn resolve_static(&self, id: &str) -> Option<String> {
        if is_virtual(id) || self.static_dirs.is_empty() {
            return None;
        }
        let (_, query) = split_query(id);
        let relative = clean_url(id).trim_start_matches('/');
        if relative.is_empty() {
            return None;
        }
        for dir in &self.static_dirs {
            let candidate = dir.join(relative);
            let is_file = tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file {
                let path = candidate.to_string_lossy().into_owned();
                return Some(match query {
                    Some(q) => format!("{path}?{q}"),
                    None => path,
                });
            }
        }
        None
    }

    fn is_static_path(&self, id: &str) -> bool {
        let path = Path::new(clean_url(id));
        self.static_dirs.iter().any(|dir| path.starts_with(dir))
    }

    async fn load_static(&self, id: &str) -> Result<FetchResult, SsrError> {
        let path = clean_url(id);
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SsrError::Io(e).with_context(format!("reading static module '{path}'")))?;
        let flags = QueryFlags::parse(id);

        let (code, deps, dynamic_deps) = if flags.raw || flags.inline {
            let code = format!("export default \"{}\";\n", escape_js_string(&source));
            (code, Vec::new(), Vec::new())
        } else if flags.url {
            let code = format!("export default \"{}\";\n", escape_js_string(path));
            (code, Vec::new(), Vec::new())
        } else {
            let (deps, dynamic_deps) = scan_imports(&source);
            (source, deps, dynamic_deps)
        };

        Ok(FetchResult {
            id: id.to_string(),
            code,
            map: None,
            deps,
            dynamic_deps,
        })
    }
}

impl ModuleSource for ResolvingFetcher {
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>> {
        Box::pin(async move {
            let id = unwrap_id(id);
            if is_builtin(&id) {
                return Ok(Some(normalize_builtin(&id)));
            }
            if let Some(path) = self.resolve_static(&id).await {
                trace!("resolved {id} to static file {path}");
                return Ok(Some(path));
            }
            self.inner.resolve(&id, importer).await
        })
    }

    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FetchResult, SsrError>> {
        Box::pin(async move {
            if let Some(hit) = self.cache.get(id) {
                return Ok(hit.value().clone());
            }

            let result = if is_builtin(id) {
                FetchResult {
                    id: id.to_string(),
                    code: builtin_wrapper_code(id),
                    ..Default::default()
                }
            } else if self.is_static_path(id) {
                self.load_static(id).await?
            } else {
                self.inner.fetch(id).await?
            };

            debug!("fetched {id} ({} bytes)", result.code.len());
            self.cache.insert(id.to_string(), result.clone());
            Ok(result)
        })
    }

    fn invalidate(&self, id: &str) {
        self.cache.remove(id);
        self.inner.invalidate(id);
    }
}

// ---------------------------------------------------------------------------
// BundleSource
// ---------------------------------------------------------------------------

const BUNDLE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// Modules of a prebuilt server bundle, keyed by `/`-rooted relative path.
#[derive(Debug, Default)]
pub struct BundleSource {
    modules: DashMap<String, String>,
}

impl BundleSource {
    pub fn from_modules<I, K, V>(modules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source = Self::default();
        for (id, code) in modules {
            source.insert(id, code);
        }
        source
    }

    /// Read every script file below `dir`.
    pub async fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SsrError> {
        let root = dir.as_ref().to_path_buf();
        let source = Self::default();
        let mut pending = vec![root.clone()];

        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let is_script = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| BUNDLE_EXTENSIONS.contains(&e));
                if !is_script {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&root) else {
                    continue;
                };
                let id = format!("/{}", relative.to_string_lossy().replace('\\', "/"));
                let code = tokio::fs::read_to_string(&path).await?;
                source.insert(id, code);
            }
        }

        debug!("loaded server bundle from {} ({} modules)", root.display(), source.len());
        Ok(source)
    }

    pub fn insert(&self, id: impl Into<String>, code: impl Into<String>) {
        self.modules.insert(id.into(), code.into());
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn lookup(&self, path: &str) -> Option<String> {
        if self.modules.contains_key(path) {
            return Some(path.to_string());
        }
        for ext in BUNDLE_EXTENSIONS {
            let candidate = format!("{path}.{ext}");
            if self.modules.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        let index = format!("{}/index.js", path.trim_end_matches('/'));
        self.modules.contains_key(&index).then_some(index)
    }
}

impl ModuleSource for BundleSource {
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>> {
        Box::pin(async move {
            let (path, query) = split_query(id);
            let joined = join_specifier(path, importer);
            Ok(self.lookup(&joined).map(|found| match query {
                Some(q) => format!("{found}?{q}"),
                None => found,
            }))
        })
    }

    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FetchResult, SsrError>> {
        Box::pin(async move {
            let path = clean_url(id);
            let code = self
                .modules
                .get(path)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| SsrError::NotFound {
                    id: id.to_string(),
                    importer: None,
                })?;
            let (deps, dynamic_deps) = scan_imports(&code);
            Ok(FetchResult {
                id: id.to_string(),
                code,
                map: None,
                deps,
                dynamic_deps,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// DevServerSource
// ---------------------------------------------------------------------------

/// Carries module-fetch protocol requests to the dev module server.
pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<ProtocolResponse, SsrError>>;
}

#[derive(Debug, Deserialize)]
struct ResolveReply {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: TransformError,
}

/// Client side of the dev module-fetch protocol.
pub struct DevServerSource {
    transport: Arc<dyn Transport>,
    route: String,
}

impl fmt::Debug for DevServerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevServerSource")
            .field("route", &self.route)
            .finish()
    }
}

impl DevServerSource {
    pub fn new(transport: Arc<dyn Transport>, route: impl Into<String>) -> Self {
        Self {
            transport,
            route: route.into(),
        }
    }
}

impl ModuleSource for DevServerSource {
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>> {
        Box::pin(async move {
            let mut path = format!("{}/resolve/{}", self.route, encode_path_segment(id));
            if let Some(importer) = importer {
                path.push_str("?importer=");
                path.push_str(&encode_path_segment(importer));
            }
            let response = self.transport.get(&path).await?;
            if response.status != 200 {
                return Err(SsrError::Resolution {
                    id: id.to_string(),
                    message: format!("module server answered {}: {}", response.status, response.body),
                });
            }
            let reply: ResolveReply = serde_json::from_str(&response.body)?;
            Ok(reply.id)
        })
    }

    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FetchResult, SsrError>> {
        Box::pin(async move {
            let path = format!("{}/module/{}", self.route, encode_path_segment(id));
            let response = self.transport.get(&path).await?;
            match response.status {
                200 => {
                    let mut result: FetchResult = serde_json::from_str(&response.body)?;
                    if result.id.is_empty() {
                        result.id = id.to_string();
                    }
                    Ok(result)
                }
                404 => Err(SsrError::NotFound {
                    id: id.to_string(),
                    importer: None,
                }),
                _ => {
                    let reply: ErrorReply = serde_json::from_str(&response.body)?;
                    Err(SsrError::Transform(reply.error))
                }
            }
        })
    }
}
