//! Invalidation tracking and response caches.
//!
//! - [`InvalidationSet`] accumulates changed module ids; draining is read-once.
//! - [`PrerenderCache`] keeps island and payload responses during static
//!   pre-rendering, optionally mirrored to disk.
//! - [`Debouncer`] / [`DevRebuilder`] batch file-change events into one
//!   trailing rebuild.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use indexmap::IndexSet;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::island::{IslandRequest, IslandResponse};
use crate::manifest::{ClientManifest, ManifestStore};
use crate::utils::encode_path_segment;
use crate::SsrError;

// ---------------------------------------------------------------------------
// InvalidationSet
// ---------------------------------------------------------------------------

/// Module ids changed since the last drain.
#[derive(Debug, Clone, Default)]
pub struct InvalidationSet {
    inner: Arc<Mutex<IndexSet<String>>>,
}

impl InvalidationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: impl Into<String>) {
        let mut set = self.inner.lock().expect("invalidation set poisoned");
        set.insert(id.into());
    }

    pub fn extend<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.inner.lock().expect("invalidation set poisoned");
        set.extend(ids.into_iter().map(Into::into));
    }

    pub fn contains(&self, id: &str) -> bool {
        let set = self.inner.lock().expect("invalidation set poisoned");
        set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("invalidation set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every pending id, leaving the set empty.
    pub fn drain(&self) -> IndexSet<String> {
        let mut set = self.inner.lock().expect("invalidation set poisoned");
        std::mem::take(&mut *set)
    }
}

// ---------------------------------------------------------------------------
// PrerenderCache
// ---------------------------------------------------------------------------

const ISLANDS_DIR: &str = "islands";
const ISLAND_REQUESTS_DIR: &str = "island-requests";
const PAYLOADS_DIR: &str = "payloads";

/// Response caches consulted before rendering while pre-rendering.
/// Keys are exact request paths.
#[derive(Debug, Default)]
pub struct PrerenderCache {
    islands: DashMap<String, IslandResponse>,
    /// Original island parameters, so an evicted island can be re-rendered.
    island_requests: DashMap<String, IslandRequest>,
    payloads: DashMap<String, Value>,
    persist_dir: Option<PathBuf>,
}

impl PrerenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror entries to JSON files under `dir`. Lookups that miss in memory
    /// fall back to disk.
    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    pub async fn island(&self, path: &str) -> Option<IslandResponse> {
        if let Some(hit) = self.islands.get(path) {
            debug!("prerender cache hit (island) {path}");
            return Some(hit.value().clone());
        }
        let restored: IslandResponse = self.read_persisted(ISLANDS_DIR, path).await?;
        self.islands.insert(path.to_string(), restored.clone());
        Some(restored)
    }

    pub async fn island_request(&self, path: &str) -> Option<IslandRequest> {
        if let Some(hit) = self.island_requests.get(path) {
            return Some(hit.value().clone());
        }
        let restored: IslandRequest = self.read_persisted(ISLAND_REQUESTS_DIR, path).await?;
        self.island_requests.insert(path.to_string(), restored.clone());
        Some(restored)
    }

    pub async fn put_island(
        &self,
        path: &str,
        request: &IslandRequest,
        response: &IslandResponse,
    ) -> Result<(), SsrError> {
        self.islands.insert(path.to_string(), response.clone());
        self.island_requests.insert(path.to_string(), request.clone());
        self.write_persisted(ISLANDS_DIR, path, response).await?;
        self.write_persisted(ISLAND_REQUESTS_DIR, path, request).await
    }

    /// Drop a cached island response, keeping its original request.
    pub fn evict_island(&self, path: &str) -> Option<IslandResponse> {
        self.islands.remove(path).map(|(_, response)| response)
    }

    pub async fn payload(&self, path: &str) -> Option<Value> {
        if let Some(hit) = self.payloads.get(path) {
            debug!("prerender cache hit (payload) {path}");
            return Some(hit.value().clone());
        }
        let restored: Value = self.read_persisted(PAYLOADS_DIR, path).await?;
        self.payloads.insert(path.to_string(), restored.clone());
        Some(restored)
    }

    pub async fn put_payload(&self, path: &str, payload: &Value) -> Result<(), SsrError> {
        self.payloads.insert(path.to_string(), payload.clone());
        self.write_persisted(PAYLOADS_DIR, path, payload).await
    }

    /// Clear the memory caches. Persisted files are left alone.
    pub fn clear(&self) {
        self.islands.clear();
        self.island_requests.clear();
        self.payloads.clear();
    }

    fn file_for(&self, kind: &str, path: &str) -> Option<PathBuf> {
        let dir = self.persist_dir.as_ref()?;
        Some(dir.join(kind).join(format!("{}.json", encode_path_segment(path))))
    }

    async fn read_persisted<T: DeserializeOwned>(&self, kind: &str, path: &str) -> Option<T> {
        let file = self.file_for(kind, path)?;
        let source = tokio::fs::read_to_string(&file).await.ok()?;
        match serde_json::from_str(&source) {
            Ok(value) => {
                debug!("prerender cache restored {kind} {path} from disk");
                Some(value)
            }
            Err(e) => {
                warn!("ignoring corrupt cache file {}: {e}", file.display());
                None
            }
        }
    }

    async fn write_persisted<T: Serialize>(&self, kind: &str, path: &str, value: &T) -> Result<(), SsrError> {
        let Some(file) = self.file_for(kind, path) else {
            return Ok(());
        };
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, serde_json::to_vec(value)?).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

pub type DebouncedAction<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct DebounceState<T> {
    generation: u64,
    pending: Option<T>,
}

/// Trailing debounce: only the last trigger inside the window runs, with the
/// value it was given.
pub struct Debouncer<T> {
    window: Duration,
    action: DebouncedAction<T>,
    state: Arc<Mutex<DebounceState<T>>>,
}

impl<T> fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .finish()
    }
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration, action: DebouncedAction<T>) -> Self {
        Self {
            window,
            action,
            state: Arc::new(Mutex::new(DebounceState {
                generation: 0,
                pending: None,
            })),
        }
    }

    /// Schedule `value`, superseding any call still waiting out its window.
    pub fn trigger(&self, value: T) -> JoinHandle<()> {
        let generation = {
            let mut state = self.state.lock().expect("debouncer poisoned");
            state.generation += 1;
            state.pending = Some(value);
            state.generation
        };

        let window = self.window;
        let state = Arc::clone(&self.state);
        let action = Arc::clone(&self.action);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let value = {
                let mut state = state.lock().expect("debouncer poisoned");
                if state.generation != generation {
                    return;
                }
                state.pending.take()
            };
            if let Some(value) = value {
                action(value).await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// DevRebuilder
// ---------------------------------------------------------------------------

/// Full module-graph rebuild, producing a fresh client manifest.
pub trait Rebuild: Send + Sync {
    fn rebuild<'a>(&'a self, changed: &'a [String]) -> BoxFuture<'a, Result<ClientManifest, SsrError>>;
}

/// Dev-mode glue between the file watcher and the rebuild. Changed ids go
/// into the invalidation set right away; the rebuild is debounced.
#[derive(Debug)]
pub struct DevRebuilder {
    invalidations: InvalidationSet,
    debouncer: Debouncer<Vec<String>>,
}

impl DevRebuilder {
    pub fn new(
        rebuild: Arc<dyn Rebuild>,
        manifest: ManifestStore,
        invalidations: InvalidationSet,
        window: Duration,
    ) -> Self {
        let action: DebouncedAction<Vec<String>> = Arc::new(move |changed: Vec<String>| -> BoxFuture<'static, ()> {
            let rebuild = Arc::clone(&rebuild);
            let manifest = manifest.clone();
            Box::pin(async move {
                match rebuild.rebuild(&changed).await {
                    Ok(next) => {
                        manifest.replace(next);
                        info!("rebuilt after {} changed file(s)", changed.len());
                    }
                    Err(e) => warn!("rebuild failed: {e}"),
                }
            })
        });
        Self {
            invalidations,
            debouncer: Debouncer::new(window, action),
        }
    }

    /// Record one file-change event.
    pub fn file_changed<I, S>(&self, files: I) -> JoinHandle<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files: Vec<String> = files.into_iter().map(Into::into).collect();
        self.invalidations.extend(files.iter().cloned());
        self.debouncer.trigger(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_is_destructive() {
        let set = InvalidationSet::new();
        set.add("/src/a.js");
        set.extend(["/src/b.js", "/src/a.js"]);
        assert_eq!(set.len(), 2);

        let drained: Vec<String> = set.drain().into_iter().collect();
        assert_eq!(drained, vec!["/src/a.js", "/src/b.js"]);
        assert!(set.is_empty());
        assert!(set.drain().is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let set = InvalidationSet::new();
        let watcher = set.clone();
        watcher.add("/src/page.js");
        assert!(set.contains("/src/page.js"));
    }
}
