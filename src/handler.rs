//! Request entry point.
//!
//! `request → context → classification → entry module (after draining
//! invalidations) → document / island / payload render → response`.

use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::{InvalidationSet, PrerenderCache};
use crate::config::SsrConfig;
use crate::context::{ContextManager, NoopHooks, Payload, RenderContext, RenderHooks, RequestKind, SsrRequest};
use crate::document::{fallback_error_page, payload_url, DocumentRenderer, EarlyHintSink, RenderedDocument, HTML_CONTENT_TYPE};
use crate::island::IslandRenderer;
use crate::manifest::{ClientManifest, ManifestStore, StylesManifest};
use crate::runner::ModuleRunner;
use crate::{AppRenderer, PayloadFormat, RenderError, SsrError, TransformError};

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The HTTP-facing response contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: IndexMap<String, String>,
    pub body: String,
}

impl SsrResponse {
    pub fn new(status_code: u16, content_type: &str, body: impl Into<String>) -> Self {
        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            status_code,
            status_message: if status_code == 200 { "OK".to_string() } else { String::new() },
            headers,
            body: body.into(),
        }
    }

    pub fn html(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code, HTML_CONTENT_TYPE, body)
    }

    pub fn json(status_code: u16, body: &impl Serialize) -> Result<Self, SsrError> {
        Ok(Self::new(
            status_code,
            "application/json;charset=utf-8",
            serde_json::to_string(body)?,
        ))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = message.into();
        self
    }
}

impl From<RenderedDocument> for SsrResponse {
    fn from(document: RenderedDocument) -> Self {
        Self {
            status_code: document.status_code,
            status_message: document.status_message,
            headers: document.headers,
            body: document.html,
        }
    }
}

// ---------------------------------------------------------------------------
// Build context
// ---------------------------------------------------------------------------

/// Shared build state, created once per server start and handed to the
/// handler. Everything here is either immutable or safe to read concurrently.
#[derive(Clone)]
pub struct BuildContext {
    pub config: Arc<SsrConfig>,
    pub runner: ModuleRunner,
    pub manifest: ManifestStore,
    pub styles: StylesManifest,
    /// Changed module ids, drained before every render.
    pub invalidations: InvalidationSet,
    pub prerender_cache: Arc<PrerenderCache>,
    pub hooks: Arc<dyn RenderHooks>,
    pub early_hints: Option<Arc<dyn EarlyHintSink>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .field("styles", &self.styles)
            .finish()
    }
}

impl BuildContext {
    pub fn new(config: SsrConfig, runner: ModuleRunner) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            manifest: ManifestStore::new(ClientManifest::default()),
            styles: StylesManifest::new(),
            invalidations: InvalidationSet::new(),
            prerender_cache: Arc::new(PrerenderCache::new()),
            hooks: Arc::new(NoopHooks),
            early_hints: None,
        }
    }

    pub fn with_manifest(mut self, manifest: ManifestStore) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_styles(mut self, styles: StylesManifest) -> Self {
        self.styles = styles;
        self
    }

    pub fn with_invalidations(mut self, invalidations: InvalidationSet) -> Self {
        self.invalidations = invalidations;
        self
    }

    pub fn with_prerender_cache(mut self, cache: PrerenderCache) -> Self {
        self.prerender_cache = Arc::new(cache);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RenderHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_early_hints(mut self, sink: Arc<dyn EarlyHintSink>) -> Self {
        self.early_hints = Some(sink);
        self
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SsrHandler {
    build: BuildContext,
    contexts: ContextManager,
    documents: DocumentRenderer,
    islands: IslandRenderer,
}

impl SsrHandler {
    pub fn new(build: BuildContext) -> Self {
        let contexts = ContextManager::new(Arc::clone(&build.config));
        let documents = DocumentRenderer::new(
            build.manifest.clone(),
            build.styles.clone(),
            Arc::clone(&build.hooks),
            build.early_hints.clone(),
        );
        Self {
            build,
            contexts,
            documents,
            islands: IslandRenderer,
        }
    }

    pub fn build(&self) -> &BuildContext {
        &self.build
    }

    /// Handle one request. Failures become error responses; this never
    /// returns an error itself.
    pub async fn handle(&self, request: SsrRequest) -> SsrResponse {
        let fallback_kind = RequestKind::classify(request.pathname(), &self.build.config);
        let mut ctx = match self.contexts.create(request) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!("rejected request: {err}");
                return self.error_response(fallback_kind, None, err).await;
            }
        };

        let result = match ctx.kind {
            RequestKind::Error => self.render_error_route(&mut ctx, None).await,
            RequestKind::Island => self.render_island(&mut ctx).await,
            RequestKind::Payload => self.render_payload(&mut ctx).await,
            RequestKind::Document => self.render_document(&mut ctx).await,
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let err = err.with_context(format!("rendering {}", ctx.original_url()));
                warn!("{err}");
                self.error_response(ctx.kind, Some(&ctx), err).await
            }
        };

        let request = ctx.teardown();
        debug!("{} {} -> {}", request.method, request.path, response.status_code);
        response
    }

    /// Load the server entry, applying pending invalidations first.
    async fn entry(&self) -> Result<Arc<dyn AppRenderer>, SsrError> {
        let invalidated = self.build.runner.apply_invalidations(&self.build.invalidations);
        let entry = &self.build.config.server_entry;
        if !invalidated.is_empty() {
            debug!(
                "{} module(s) invalidated, entry affected: {}",
                invalidated.len(),
                invalidated.iter().any(|id| id.ends_with(entry.as_str()))
            );
        }
        let exports = self
            .build
            .runner
            .import(entry)
            .await
            .map_err(|e| {
                if matches!(e.root(), SsrError::NotFound { id, .. } if id == entry) {
                    SsrError::Config(format!("cannot load server entry '{entry}'"))
                } else {
                    e.with_context(format!("loading server entry '{entry}'"))
                }
            })?;
        exports.renderer().ok_or_else(|| SsrError::Resolution {
            id: entry.clone(),
            message: "server entry has no default render export".to_string(),
        })
    }

    async fn render_document(&self, ctx: &mut RenderContext) -> Result<SsrResponse, SsrError> {
        if ctx.skip_ssr() {
            return Ok(self.documents.render_spa_shell(ctx)?.into());
        }
        let app = self.entry().await?;
        let document = self.documents.render(ctx, app.as_ref()).await?;

        if ctx.is_prerendering && ctx.config.payload_extraction {
            let key = payload_url(&ctx.url, ctx.config.payload_format);
            self.build
                .prerender_cache
                .put_payload(&key, &ctx.payload.to_value())
                .await?;
        }
        Ok(document.into())
    }

    async fn render_payload(&self, ctx: &mut RenderContext) -> Result<SsrResponse, SsrError> {
        let format = ctx.config.payload_format;
        let key = ctx.original_url().to_string();
        if ctx.is_prerendering {
            if let Some(cached) = self.build.prerender_cache.payload(&key).await {
                return payload_response(cached, format);
            }
        }

        if ctx.skip_ssr() {
            return payload_response(json!({ "serverRendered": false }), format);
        }

        let app = self.entry().await?;
        match app.render_app(ctx).await {
            Ok(_) => {}
            Err(err) if err.is_skip_render() && !ctx.has_error() => {
                if let Some(prepared) = ctx.take_prepared_response() {
                    return Ok(prepared);
                }
                return Err(err);
            }
            Err(err) => {
                let err = ctx.resolve_error(err);
                self.build.hooks.on_error(ctx, &err);
                return Err(err);
            }
        }
        if let Some(err) = ctx.take_error() {
            self.build.hooks.on_error(ctx, &err);
            return Err(err);
        }
        self.build.hooks.on_rendered(ctx).await?;
        ctx.payload.set("serverRendered", Value::Bool(true));

        let value = ctx.payload.to_value();
        if ctx.is_prerendering {
            self.build.prerender_cache.put_payload(&key, &value).await?;
        }
        payload_response(value, format)
    }

    async fn render_island(&self, ctx: &mut RenderContext) -> Result<SsrResponse, SsrError> {
        let path = ctx.original_url().to_string();
        let mut island = ctx
            .island
            .clone()
            .ok_or_else(|| SsrError::BadRequest(format!("missing island descriptor for {path}")))?;

        if ctx.is_prerendering {
            let cache = &self.build.prerender_cache;
            if let Some(cached) = cache.island(&path).await {
                return SsrResponse::json(200, &cached);
            }
            if let Some(original) = cache.island_request(&path).await {
                debug!("re-deriving evicted island {path} from its original request");
                island = original;
            }
        }

        let app = self.entry().await?;
        let response = match self.islands.render(ctx, app.as_ref(), &island, &self.build.styles).await {
            Ok(response) => response,
            Err(err) => {
                let err = ctx.resolve_error(err);
                self.build.hooks.on_error(ctx, &err);
                return Err(err);
            }
        };

        if ctx.is_prerendering {
            self.build
                .prerender_cache
                .put_island(&path, &island, &response)
                .await?;
        }
        SsrResponse::json(200, &response)
    }

    /// Render the error route for the parameters in the request query.
    /// `detail` is the structured form of the error that led here; its
    /// `code`, `plugin`, `stack` and `frame` are exposed to the error page.
    async fn render_error_route(
        &self,
        ctx: &mut RenderContext,
        detail: Option<Value>,
    ) -> Result<SsrResponse, SsrError> {
        let query = ctx.request().query();
        let status_code = query
            .get("statusCode")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(500);
        let status_message = query
            .get("statusMessage")
            .cloned()
            .unwrap_or_else(|| RenderError::new(status_code, "").status_message);
        let mut error = json!({
            "statusCode": status_code,
            "statusMessage": status_message,
            "message": query.get("message").cloned().unwrap_or_default(),
            "url": query.get("url").cloned().unwrap_or_default(),
        });
        if let (Some(Value::Object(detail)), Value::Object(fields)) = (detail, &mut error) {
            for key in ["code", "id", "plugin", "stack", "frame", "loc"] {
                if let Some(value) = detail.get(key).filter(|v| !v.is_null()) {
                    fields.insert(key.to_string(), value.clone());
                }
            }
        }
        ctx.payload.set("error", error);

        let document = if ctx.skip_ssr() {
            self.documents.render_spa_shell(ctx)?
        } else {
            let app = self.entry().await?;
            self.documents.render(ctx, app.as_ref()).await?
        };
        Ok(SsrResponse {
            status_code,
            ..SsrResponse::from(document)
        }
        .with_status_message(status_message))
    }

    async fn error_response(&self, kind: RequestKind, ctx: Option<&RenderContext>, err: SsrError) -> SsrResponse {
        let status_code = err.status_code();
        let status_message = err.status_message();
        match kind {
            RequestKind::Island | RequestKind::Payload => {
                let body = json!({ "error": err.to_json() });
                SsrResponse::json(status_code, &body)
                    .unwrap_or_else(|_| SsrResponse::new(status_code, "application/json", "{}"))
                    .with_status_message(status_message)
            }
            RequestKind::Error => self.fallback_page(&err),
            RequestKind::Document => self.error_page(ctx, err).await,
        }
    }

    /// Re-render through the error route once; a second failure produces the
    /// minimal fallback page.
    async fn error_page(&self, failed: Option<&RenderContext>, err: SsrError) -> SsrResponse {
        let config = &self.build.config;
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("statusCode", &err.status_code().to_string())
            .append_pair("statusMessage", &err.status_message())
            .append_pair("url", failed.map(|c| c.url.as_str()).unwrap_or("/"));
        if config.is_dev() {
            query.append_pair("message", &err.to_string());
        }
        let mut request = SsrRequest::get(format!("{}?{}", config.error_route, query.finish()));
        request.prerender = failed.is_some_and(|c| c.is_prerendering);

        let mut ctx = match self.contexts.create(request) {
            Ok(ctx) => ctx,
            Err(_) => return self.fallback_page(&err),
        };
        let detail = config.is_dev().then(|| err.to_json());
        match self.render_error_route(&mut ctx, detail).await {
            Ok(response) => response,
            Err(second) => {
                warn!("error page failed as well: {second}");
                self.fallback_page(&err)
            }
        }
    }

    fn fallback_page(&self, err: &SsrError) -> SsrResponse {
        let dev = self.build.config.is_dev();
        let message = if dev { err.to_string() } else { err.status_message() };
        let frame = match err.root() {
            SsrError::Transform(TransformError { frame: Some(frame), .. }) if dev => Some(frame.as_str()),
            _ => None,
        };
        SsrResponse::html(
            err.status_code(),
            fallback_error_page(err.status_code(), &err.status_message(), &message, frame),
        )
        .with_status_message(err.status_message())
    }
}

fn payload_response(value: Value, format: PayloadFormat) -> Result<SsrResponse, SsrError> {
    let payload = Payload::from_value(value)?;
    let body = match format {
        PayloadFormat::Json => payload.to_json()?,
        PayloadFormat::Script => payload.to_module()?,
    };
    Ok(SsrResponse::new(200, format.content_type(), body))
}
