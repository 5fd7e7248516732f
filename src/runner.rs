//! Module runner and execution cache.
//!
//! Each module id gets one [`ModuleRecord`] that moves through
//! `Unresolved → Fetching → Instantiating → Ready`, and back to `Fetching`
//! after being marked `Stale` by invalidation.
//!
//! **Invariants:**
//! - A record is evaluated at most once per generation; concurrent importers
//!   share the in-flight evaluation.
//! - Circular imports never wait: an importer already on the import stack
//!   receives the partially populated exports of the in-progress module.
//! - Invalidation of a record is a single synchronous step, and propagates to
//!   every transitive importer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::cache::InvalidationSet;
use crate::fetch::ModuleSource;
use crate::utils::{clean_url, wrap_id};
use crate::{AppRenderer, SsrError};

/// Export key holding the default export.
pub const DEFAULT_EXPORT: &str = "default";

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// A single exported binding.
#[derive(Clone)]
pub enum ExportValue {
    Value(Value),
    /// A module namespace object (`import * as ns`).
    Namespace(Exports),
    Renderer(Arc<dyn AppRenderer>),
}

impl fmt::Debug for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            ExportValue::Namespace(ns) => f.debug_tuple("Namespace").field(ns).finish(),
            ExportValue::Renderer(_) => f.write_str("Renderer"),
        }
    }
}

/// Live exports object of a module. Clones share the same bindings, so a
/// circular importer holding a clone observes bindings added later.
#[derive(Clone, Default)]
pub struct Exports {
    bindings: Arc<RwLock<IndexMap<String, ExportValue>>>,
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ExportValue> {
        let bindings = self.bindings.read().expect("exports poisoned");
        bindings.get(key).cloned()
    }

    /// A plain value binding.
    pub fn value(&self, key: &str) -> Option<Value> {
        match self.get(key)? {
            ExportValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn namespace(&self, key: &str) -> Option<Exports> {
        match self.get(key)? {
            ExportValue::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    /// The render capability exported as `default`.
    pub fn renderer(&self) -> Option<Arc<dyn AppRenderer>> {
        match self.get(DEFAULT_EXPORT)? {
            ExportValue::Renderer(renderer) => Some(renderer),
            _ => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: ExportValue) {
        let mut bindings = self.bindings.write().expect("exports poisoned");
        bindings.insert(key.into(), value);
    }

    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.set(key, ExportValue::Value(value));
    }

    pub fn keys(&self) -> Vec<String> {
        let bindings = self.bindings.read().expect("exports poisoned");
        bindings.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().expect("exports poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every named binding of `from` into `self`, skipping `default`.
    pub fn reexport_all(&self, from: &Exports) {
        if self.ptr_eq(from) {
            return;
        }
        let source: Vec<(String, ExportValue)> = {
            let bindings = from.bindings.read().expect("exports poisoned");
            bindings
                .iter()
                .filter(|(key, _)| key.as_str() != DEFAULT_EXPORT)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut bindings = self.bindings.write().expect("exports poisoned");
        for (key, value) in source {
            bindings.insert(key, value);
        }
    }

    /// Whether both handles point at the same exports object.
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.bindings, &other.bindings)
    }
}

// ---------------------------------------------------------------------------
// ModuleRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unresolved,
    Fetching,
    Instantiating,
    Ready,
    Stale,
}

impl ModuleState {
    fn is_in_flight(self) -> bool {
        matches!(self, ModuleState::Fetching | ModuleState::Instantiating)
    }
}

struct RecordInner {
    state: ModuleState,
    code: Option<Arc<str>>,
    dependencies: IndexSet<String>,
    dynamic_dependencies: IndexSet<String>,
    importers: IndexSet<String>,
    exports: Exports,
    evaluation: Arc<OnceCell<Exports>>,
    evaluations: usize,
}

/// One resolved, executable module.
pub struct ModuleRecord {
    id: String,
    url: String,
    inner: Mutex<RecordInner>,
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ModuleRecord {
    fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            inner: Mutex::new(RecordInner {
                state: ModuleState::Unresolved,
                code: None,
                dependencies: IndexSet::new(),
                dynamic_dependencies: IndexSet::new(),
                importers: IndexSet::new(),
                exports: Exports::new(),
                evaluation: Arc::new(OnceCell::new()),
                evaluations: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordInner> {
        self.inner.lock().expect("module record poisoned")
    }

    /// Canonical module id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The path this module was first requested as.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ModuleState {
        self.lock().state
    }

    pub fn code(&self) -> Option<Arc<str>> {
        self.lock().code.clone()
    }

    /// Resolved static dependency ids, in import order.
    pub fn dependencies(&self) -> Vec<String> {
        self.lock().dependencies.iter().cloned().collect()
    }

    pub fn dynamic_dependencies(&self) -> Vec<String> {
        self.lock().dynamic_dependencies.iter().cloned().collect()
    }

    pub fn importers(&self) -> Vec<String> {
        self.lock().importers.iter().cloned().collect()
    }

    /// Current exports object (possibly partially populated).
    pub fn exports(&self) -> Exports {
        self.lock().exports.clone()
    }

    /// How many times this module's top-level code has run.
    pub fn evaluations(&self) -> usize {
        self.lock().evaluations
    }

    fn add_importer(&self, importer: &str) {
        self.lock().importers.insert(importer.to_string());
    }

    fn evaluation(&self) -> Arc<OnceCell<Exports>> {
        Arc::clone(&self.lock().evaluation)
    }

    // The transitions below take the evaluation cell that started the
    // attempt. Once the record is invalidated that cell is no longer current
    // and the attempt must not touch the record's state.

    fn begin_fetch(&self, generation: &Arc<OnceCell<Exports>>) -> Exports {
        let mut inner = self.lock();
        if !Arc::ptr_eq(&inner.evaluation, generation) {
            return Exports::new();
        }
        inner.state = ModuleState::Fetching;
        inner.exports.clone()
    }

    fn begin_instantiate(
        &self,
        generation: &Arc<OnceCell<Exports>>,
        code: Arc<str>,
        dependencies: IndexSet<String>,
        dynamic_dependencies: IndexSet<String>,
    ) {
        let mut inner = self.lock();
        inner.evaluations += 1;
        if !Arc::ptr_eq(&inner.evaluation, generation) {
            return;
        }
        inner.state = ModuleState::Instantiating;
        inner.code = Some(code);
        inner.dependencies = dependencies;
        inner.dynamic_dependencies = dynamic_dependencies;
    }

    fn mark_ready(&self, generation: &Arc<OnceCell<Exports>>) {
        let mut inner = self.lock();
        if Arc::ptr_eq(&inner.evaluation, generation) {
            inner.state = ModuleState::Ready;
        }
    }

    /// Back to `Unresolved` with fresh exports after a failed attempt.
    fn reset_after_failure(&self, generation: &Arc<OnceCell<Exports>>) {
        let mut inner = self.lock();
        if !Arc::ptr_eq(&inner.evaluation, generation) {
            return;
        }
        inner.state = ModuleState::Unresolved;
        inner.code = None;
        inner.exports = Exports::new();
    }

    /// Discard code, exports and the evaluation in one step. Returns the
    /// importers so invalidation can propagate.
    fn invalidate(&self) -> Vec<String> {
        let mut inner = self.lock();
        inner.state = ModuleState::Stale;
        inner.code = None;
        inner.dependencies.clear();
        inner.dynamic_dependencies.clear();
        inner.exports = Exports::new();
        inner.evaluation = Arc::new(OnceCell::new());
        inner.importers.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Evaluation scope
// ---------------------------------------------------------------------------

/// `import.meta` stand-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMeta {
    pub url: String,
    pub filename: String,
    pub dirname: String,
    /// Hot reloading is available.
    pub hot: bool,
}

impl ImportMeta {
    fn for_module(id: &str, hot: bool) -> Self {
        let filename = clean_url(id).to_string();
        let dirname = match filename.rfind('/') {
            Some(0) => "/".to_string(),
            Some(pos) => filename[..pos].to_string(),
            None => String::new(),
        };
        Self {
            url: wrap_id(id),
            filename,
            dirname,
            hot,
        }
    }
}

/// The fixed set of capabilities a module sees while it executes: its
/// exports object, an import function bound to the runner, `import.meta`,
/// and dynamic import.
pub struct ModuleScope {
    runner: ModuleRunner,
    id: String,
    exports: Exports,
    meta: ImportMeta,
    callstack: Arc<Vec<String>>,
}

impl fmt::Debug for ModuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleScope")
            .field("id", &self.id)
            .field("callstack", &self.callstack)
            .finish()
    }
}

impl ModuleScope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub fn meta(&self) -> &ImportMeta {
        &self.meta
    }

    /// Static import. Statically imported modules are already instantiated
    /// by the time the module body runs, so this returns from cache.
    pub async fn import(&self, specifier: &str) -> Result<Exports, SsrError> {
        self.runner
            .cached_request(specifier, Some(&self.id), Arc::clone(&self.callstack))
            .await
    }

    /// `import()` from inside the module.
    pub async fn dynamic_import(&self, specifier: &str) -> Result<Exports, SsrError> {
        self.runner
            .cached_request(specifier, Some(&self.id), Arc::clone(&self.callstack))
            .await
            .map_err(|e| e.with_context(format!("dynamic import of '{specifier}' from '{}'", self.id)))
    }
}

/// Executes transformed module code. The embedder supplies the engine.
pub trait ModuleEvaluator: Send + Sync {
    /// Run `code` as the body of the module described by `scope`, populating
    /// `scope.exports()`.
    fn evaluate<'a>(&'a self, code: &'a str, scope: &'a ModuleScope) -> BoxFuture<'a, anyhow::Result<()>>;
}

// ---------------------------------------------------------------------------
// ModuleRunner
// ---------------------------------------------------------------------------

type ResolutionKey = (String, Option<String>);

struct RunnerInner {
    source: Arc<dyn ModuleSource>,
    evaluator: Arc<dyn ModuleEvaluator>,
    records: DashMap<String, Arc<ModuleRecord>>,
    resolutions: DashMap<ResolutionKey, Arc<OnceCell<String>>>,
    hot: bool,
}

/// Executes module graphs on demand. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct ModuleRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for ModuleRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRunner")
            .field("modules", &self.inner.records.len())
            .field("hot", &self.inner.hot)
            .finish()
    }
}

impl ModuleRunner {
    pub fn new(source: Arc<dyn ModuleSource>, evaluator: Arc<dyn ModuleEvaluator>) -> Self {
        Self::with_options(source, evaluator, false)
    }

    /// `hot` is surfaced to modules through [`ImportMeta::hot`].
    pub fn with_options(
        source: Arc<dyn ModuleSource>,
        evaluator: Arc<dyn ModuleEvaluator>,
        hot: bool,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                source,
                evaluator,
                records: DashMap::new(),
                resolutions: DashMap::new(),
                hot,
            }),
        }
    }

    pub fn record(&self, id: &str) -> Option<Arc<ModuleRecord>> {
        self.inner.records.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.inner.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Resolve `specifier` from `importer`. Memoized per pair; concurrent
    /// callers share one in-flight resolution. Misses are not memoized.
    pub async fn resolve(&self, specifier: &str, importer: Option<&str>) -> Result<String, SsrError> {
        let key = (specifier.to_string(), importer.map(str::to_string));
        let cell = Arc::clone(self.inner.resolutions.entry(key).or_default().value());
        let resolved = cell
            .get_or_try_init(|| async {
                self.inner
                    .source
                    .resolve(specifier, importer)
                    .await?
                    .ok_or_else(|| SsrError::NotFound {
                        id: specifier.to_string(),
                        importer: importer.map(str::to_string),
                    })
            })
            .await?;
        Ok(resolved.clone())
    }

    /// Resolve and execute an entry module, returning its record.
    pub async fn load(&self, id: &str) -> Result<Arc<ModuleRecord>, SsrError> {
        let resolved = self.resolve(id, None).await?;
        self.request_resolved(&resolved, id, None, Arc::new(Vec::new()))
            .await?;
        self.record(&resolved).ok_or_else(|| SsrError::NotFound {
            id: resolved,
            importer: None,
        })
    }

    /// Resolve and execute an entry module, returning its exports.
    pub async fn import(&self, id: &str) -> Result<Exports, SsrError> {
        self.cached_request(id, None, Arc::new(Vec::new())).await
    }

    fn ensure_record(&self, id: &str, url: &str) -> Arc<ModuleRecord> {
        Arc::clone(
            self.inner
                .records
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ModuleRecord::new(id, url)))
                .value(),
        )
    }

    fn cached_request<'a>(
        &'a self,
        specifier: &'a str,
        importer: Option<&'a str>,
        callstack: Arc<Vec<String>>,
    ) -> BoxFuture<'a, Result<Exports, SsrError>> {
        Box::pin(async move {
            let id = self.resolve(specifier, importer).await?;
            self.request_resolved(&id, specifier, importer, callstack).await
        })
    }

    fn request_resolved<'a>(
        &'a self,
        id: &'a str,
        url: &'a str,
        importer: Option<&'a str>,
        callstack: Arc<Vec<String>>,
    ) -> BoxFuture<'a, Result<Exports, SsrError>> {
        Box::pin(async move {
            let record = self.ensure_record(id, url);
            if let Some(importer) = importer {
                record.add_importer(importer);
            }

            if callstack.iter().any(|entry| entry == id) {
                debug!("circular import of {id} (stack: {})", callstack.join(" -> "));
                return Ok(record.exports());
            }
            if self.waits_on_callstack(&record, &callstack) {
                debug!("circular import of in-flight {id}, returning partial exports");
                return Ok(record.exports());
            }

            let cell = record.evaluation();
            let exports = cell
                .get_or_try_init(|| self.instantiate(Arc::clone(&record), Arc::clone(&cell), callstack))
                .await?;
            Ok(exports.clone())
        })
    }

    /// Whether `record` is in flight and one of its known transitive
    /// dependencies is on `callstack`; waiting on it would never finish.
    fn waits_on_callstack(&self, record: &ModuleRecord, callstack: &[String]) -> bool {
        if callstack.is_empty() || !record.state().is_in_flight() {
            return false;
        }
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut queue: VecDeque<String> = record.dependencies().into();
        while let Some(dep) = queue.pop_front() {
            if callstack.contains(&dep) {
                return true;
            }
            if !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(next) = self.record(&dep) {
                queue.extend(next.dependencies());
            }
        }
        false
    }

    async fn instantiate(
        &self,
        record: Arc<ModuleRecord>,
        generation: Arc<OnceCell<Exports>>,
        callstack: Arc<Vec<String>>,
    ) -> Result<Exports, SsrError> {
        let id = record.id().to_string();
        let exports = record.begin_fetch(&generation);

        let fetched = match self.inner.source.fetch(&id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                record.reset_after_failure(&generation);
                return Err(err);
            }
        };

        // Resolved id → the specifier it was first imported as.
        let mut dependencies: IndexMap<String, String> = IndexMap::new();
        for specifier in &fetched.deps {
            match self.resolve(specifier, Some(&id)).await {
                Ok(dep) => {
                    dependencies.entry(dep).or_insert_with(|| specifier.clone());
                }
                Err(err) => {
                    record.reset_after_failure(&generation);
                    return Err(err);
                }
            }
        }

        let mut dynamic_dependencies: IndexSet<String> = IndexSet::new();
        for specifier in &fetched.dynamic_deps {
            match self.resolve(specifier, Some(&id)).await {
                Ok(dep) => {
                    dynamic_dependencies.insert(dep);
                }
                Err(err) if err.is_not_found() => {
                    warn!("skipping unresolved dynamic import '{specifier}' in {id}");
                }
                Err(err) => {
                    record.reset_after_failure(&generation);
                    return Err(err);
                }
            }
        }

        let code: Arc<str> = Arc::from(fetched.code);
        record.begin_instantiate(
            &generation,
            Arc::clone(&code),
            dependencies.keys().cloned().collect(),
            dynamic_dependencies,
        );

        let mut stack = callstack.as_ref().clone();
        stack.push(id.clone());
        let stack = Arc::new(stack);

        for (dep, specifier) in &dependencies {
            if let Err(err) = self
                .request_resolved(dep, specifier, Some(&id), Arc::clone(&stack))
                .await
            {
                record.reset_after_failure(&generation);
                return Err(err.with_context(format!("while importing '{dep}' from '{id}'")));
            }
        }

        let scope = ModuleScope {
            runner: self.clone(),
            id: id.clone(),
            exports: exports.clone(),
            meta: ImportMeta::for_module(&id, self.inner.hot),
            callstack: stack,
        };
        if let Err(cause) = self.inner.evaluator.evaluate(&code, &scope).await {
            record.reset_after_failure(&generation);
            return Err(SsrError::Evaluation { id, cause });
        }

        record.mark_ready(&generation);
        debug!("module {id} ready");
        Ok(exports)
    }

    /// Mark `ids` and all of their transitive importers stale. Returns every
    /// invalidated module id that the runner knows about.
    pub fn invalidate<I, S>(&self, ids: I) -> IndexSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut invalidated: IndexSet<String> = IndexSet::new();
        let mut visited: IndexSet<String> = IndexSet::new();
        let mut queue: VecDeque<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            self.inner.source.invalidate(&id);
            if let Some(record) = self.record(&id) {
                let importers = record.invalidate();
                invalidated.insert(id);
                queue.extend(importers);
            }
        }

        if !invalidated.is_empty() {
            debug!("invalidated {} module(s): {:?}", invalidated.len(), invalidated);
        }
        invalidated
    }

    /// Drain `pending` and invalidate everything in it.
    pub fn apply_invalidations(&self, pending: &InvalidationSet) -> IndexSet<String> {
        let changed = pending.drain();
        if changed.is_empty() {
            return IndexSet::new();
        }
        self.invalidate(changed)
    }
}
