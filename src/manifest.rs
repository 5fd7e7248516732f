//! Build artifacts consumed by the renderer.
//!
//! The bundler produces these; the runtime only reads them:
//! - the client asset manifest (id → file, css, imports, ...)
//! - the styles manifest (module id → lazy CSS loader)
//! - the server entry module re-exporting the render function

use std::fmt;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::utils::{escape_js_string, join_url};
use crate::SsrError;

// ---------------------------------------------------------------------------
// Client manifest
// ---------------------------------------------------------------------------

/// One chunk of the client build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChunk {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default)]
    pub css: Vec<String>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub dynamic_imports: Vec<String>,
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub is_dynamic_entry: bool,
    /// Whether the chunk is an ES module.
    #[serde(default)]
    pub module: bool,
}

/// The client asset manifest, keyed by source id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientManifest {
    pub chunks: IndexMap<String, ManifestChunk>,
}

/// Resource hints for one render, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHints {
    /// Stylesheet hrefs.
    pub styles: Vec<String>,
    /// `modulepreload` hrefs of statically imported chunks.
    pub preloads: Vec<String>,
    /// `prefetch` hrefs of dynamically imported chunks and their styles.
    pub prefetches: Vec<String>,
    /// Entry scripts.
    pub scripts: Vec<String>,
}

impl ClientManifest {
    pub fn from_json(source: &str) -> Result<Self, SsrError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn get(&self, id: &str) -> Option<&ManifestChunk> {
        self.chunks
            .get(id)
            .or_else(|| self.chunks.get(id.trim_start_matches('/')))
    }

    fn key_of(&self, id: &str) -> Option<String> {
        if self.chunks.contains_key(id) {
            Some(id.to_string())
        } else {
            let trimmed = id.trim_start_matches('/');
            self.chunks.contains_key(trimmed).then(|| trimmed.to_string())
        }
    }

    /// Compute the resources for an entry plus the modules used while
    /// rendering. Unknown module ids are ignored.
    pub fn resources<'a>(
        &self,
        entry: &str,
        modules: impl IntoIterator<Item = &'a str>,
        assets_dir: &str,
    ) -> ResourceHints {
        let mut roots: Vec<String> = Vec::new();
        roots.extend(self.key_of(entry));
        for id in modules {
            if let Some(key) = self.key_of(id) {
                if !roots.contains(&key) {
                    roots.push(key);
                }
            }
        }

        let mut visited: IndexSet<String> = IndexSet::new();
        for root in &roots {
            self.walk_static(root, &mut visited);
        }

        let mut hints = ResourceHints::default();
        let entry_key = self.key_of(entry);
        let mut seen: IndexSet<String> = IndexSet::new();

        for key in &visited {
            let Some(chunk) = self.chunks.get(key) else {
                continue;
            };
            for css in &chunk.css {
                let href = join_url(assets_dir, css);
                if seen.insert(href.clone()) {
                    hints.styles.push(href);
                }
            }
            let href = join_url(assets_dir, &chunk.file);
            if !seen.insert(href.clone()) {
                continue;
            }
            if Some(key) == entry_key.as_ref() {
                hints.scripts.push(href);
            } else if chunk.file.ends_with(".css") {
                hints.styles.push(href);
            } else {
                hints.preloads.push(href);
            }
        }

        for key in &visited {
            let Some(chunk) = self.chunks.get(key) else {
                continue;
            };
            for dynamic in &chunk.dynamic_imports {
                let Some(target) = self.chunks.get(dynamic) else {
                    continue;
                };
                for file in std::iter::once(&target.file).chain(target.css.iter()) {
                    let href = join_url(assets_dir, file);
                    if seen.insert(href.clone()) {
                        hints.prefetches.push(href);
                    }
                }
            }
        }

        hints
    }

    fn walk_static(&self, key: &str, visited: &mut IndexSet<String>) {
        if !visited.insert(key.to_string()) {
            return;
        }
        if let Some(chunk) = self.chunks.get(key) {
            for import in &chunk.imports {
                self.walk_static(import, visited);
            }
        }
    }
}

/// Shared, read-mostly holder of the current client manifest.
/// Replacement is atomic for readers.
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    inner: Arc<RwLock<Arc<ClientManifest>>>,
}

impl ManifestStore {
    pub fn new(manifest: ClientManifest) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(manifest))),
        }
    }

    /// Snapshot of the current manifest.
    pub fn current(&self) -> Arc<ClientManifest> {
        let guard = self.inner.read().expect("manifest store poisoned");
        Arc::clone(&guard)
    }

    pub fn replace(&self, manifest: ClientManifest) {
        let mut guard = self.inner.write().expect("manifest store poisoned");
        *guard = Arc::new(manifest);
    }
}

// ---------------------------------------------------------------------------
// Styles manifest
// ---------------------------------------------------------------------------

/// Lazily produces the CSS strings of one module.
pub type StyleLoader =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<String>, SsrError>> + Send + Sync>;

#[derive(Clone)]
struct StyleEntry {
    loader: StyleLoader,
    scoped: bool,
    loaded: Arc<OnceCell<Vec<String>>>,
}

/// Module id → lazily loaded CSS. Each loader runs at most once.
#[derive(Clone, Default)]
pub struct StylesManifest {
    entries: IndexMap<String, StyleEntry>,
}

impl fmt::Debug for StylesManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StylesManifest")
            .field("modules", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// CSS collected for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStyles {
    pub id: String,
    pub scoped: bool,
    pub css: Vec<String>,
}

impl StylesManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, scoped: bool, loader: StyleLoader) {
        self.entries.insert(
            id.into(),
            StyleEntry {
                loader,
                scoped,
                loaded: Arc::new(OnceCell::new()),
            },
        );
    }

    /// Register CSS that is already in memory.
    pub fn register_static(&mut self, id: impl Into<String>, scoped: bool, css: Vec<String>) {
        let loader: StyleLoader = Arc::new(move || -> BoxFuture<'static, Result<Vec<String>, SsrError>> {
            let css = css.clone();
            Box::pin(async move { Ok(css) })
        });
        self.register(id, scoped, loader);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Load the CSS of a single module. `None` for unknown modules.
    pub async fn load(&self, id: &str) -> Result<Option<ModuleStyles>, SsrError> {
        let Some(entry) = self.entries.get(id) else {
            return Ok(None);
        };
        let css = entry
            .loaded
            .get_or_try_init(|| (entry.loader)())
            .await?
            .clone();
        Ok(Some(ModuleStyles {
            id: id.to_string(),
            scoped: entry.scoped,
            css,
        }))
    }

    /// Load the CSS of every known module in `ids`, keeping their order.
    pub async fn collect<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<ModuleStyles>, SsrError> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(styles) = self.load(id).await? {
                out.push(styles);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Server entry
// ---------------------------------------------------------------------------

/// Source of the server entry module that re-exports the application's
/// render function.
pub fn server_entry_code(app_entry: &str) -> String {
    let app_entry = escape_js_string(app_entry);
    format!("export * from \"{app_entry}\";\nexport {{ default }} from \"{app_entry}\";\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manifest() -> ClientManifest {
        ClientManifest::from_json(
            r#"{
                "src/entry-client.js": { "file": "entry.js", "css": ["entry.css"], "imports": ["_vendor.js"], "dynamicImports": ["src/pages/about.js"], "isEntry": true, "module": true },
                "_vendor.js": { "file": "vendor.js", "css": ["vendor.css"] },
                "src/pages/index.js": { "file": "index.js", "css": ["index.css"], "imports": ["_vendor.js"] },
                "src/pages/about.js": { "file": "about.js", "css": ["about.css"], "isDynamicEntry": true }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resources_follow_static_imports() {
        let hints = manifest().resources(
            "src/entry-client.js",
            ["/src/pages/index.js", "/unknown.js"],
            "/_zenith/",
        );
        assert_eq!(
            hints.styles,
            vec!["/_zenith/entry.css", "/_zenith/vendor.css", "/_zenith/index.css"]
        );
        assert_eq!(hints.scripts, vec!["/_zenith/entry.js"]);
        assert_eq!(hints.preloads, vec!["/_zenith/vendor.js", "/_zenith/index.js"]);
        assert_eq!(hints.prefetches, vec!["/_zenith/about.js", "/_zenith/about.css"]);
    }

    #[test]
    fn store_replace_is_visible_to_new_snapshots() {
        let store = ManifestStore::new(manifest());
        let before = store.current();
        store.replace(ClientManifest::default());
        assert_eq!(before.chunks.len(), 4);
        assert!(store.current().chunks.is_empty());
    }

    #[tokio::test]
    async fn style_loader_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut styles = StylesManifest::new();
        styles.register(
            "/src/app.vue",
            true,
            Arc::new(move || -> BoxFuture<'static, Result<Vec<String>, SsrError>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(vec![".app{}".to_string()]) })
            }),
        );

        for _ in 0..3 {
            let loaded = styles.load("/src/app.vue").await.unwrap().unwrap();
            assert_eq!(loaded.css, vec![".app{}"]);
            assert!(loaded.scoped);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(styles.load("/missing").await.unwrap().is_none());
    }

    #[test]
    fn server_entry_reexports_default() {
        let code = server_entry_code("/src/app.js");
        assert!(code.contains(r#"export { default } from "/src/app.js";"#));
    }
}
