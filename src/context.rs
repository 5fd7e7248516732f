//! Per-request render context.
//!
//! [`ContextManager::create`] classifies the request, rewrites the effective
//! path for island and payload requests, applies the no-SSR policy, and
//! returns a fresh [`RenderContext`]. Nothing on the context is shared with
//! other requests; [`RenderContext::teardown`] hands back the request with
//! its original path.

use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SsrConfig;
use crate::document::HtmlParts;
use crate::handler::SsrResponse;
use crate::island::IslandRequest;
use crate::utils::{escape_html, escape_json_for_script, parse_query, split_query};
use crate::SsrError;

/// Request header that disables SSR for one request.
pub const NO_SSR_HEADER: &str = "x-zenith-no-ssr";
/// Query parameter that disables SSR for one request.
pub const NO_SSR_QUERY: &str = "no_ssr";
/// Element id of the inlined payload script.
pub const PAYLOAD_SCRIPT_ID: &str = "__ZENITH_DATA__";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The HTTP-facing request contract.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SsrRequest {
    pub method: String,
    /// Path plus query string.
    pub path: String,
    /// Header names are stored lowercase.
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
    /// Set by the static pre-renderer.
    pub prerender: bool,
}

impl SsrRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.into(),
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn prerendering(mut self) -> Self {
        self.prerender = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Path without the query string.
    pub fn pathname(&self) -> &str {
        split_query(&self.path).0
    }

    pub fn query(&self) -> IndexMap<String, String> {
        split_query(&self.path)
            .1
            .map(parse_query)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Error,
    Island,
    Payload,
    Document,
}

impl RequestKind {
    /// Error route, then island prefix, then payload suffix, then document.
    pub fn classify(pathname: &str, config: &SsrConfig) -> Self {
        if has_prefix(pathname, &config.error_route) {
            RequestKind::Error
        } else if has_prefix(pathname, &config.island_prefix) {
            RequestKind::Island
        } else if pathname.ends_with(config.payload_format.suffix()) {
            RequestKind::Payload
        } else {
            RequestKind::Document
        }
    }
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
}

// ---------------------------------------------------------------------------
// No-SSR policy
// ---------------------------------------------------------------------------

/// Every condition that can disable SSR for a request. Any one of them is
/// enough; there is no precedence between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoSsrPolicy {
    pub env: bool,
    pub request: bool,
    pub route_rule: bool,
    pub spa_shell: bool,
    pub globally_disabled: bool,
}

impl NoSsrPolicy {
    pub fn evaluate(config: &SsrConfig, request: &SsrRequest, pathname: &str, prerendering: bool) -> Self {
        let request_override = request.header(NO_SSR_HEADER).is_some_and(is_truthy)
            || request
                .query()
                .get(NO_SSR_QUERY)
                .is_some_and(|v| v.is_empty() || is_truthy(v));
        Self {
            env: config.no_ssr_env,
            request: request_override,
            route_rule: config
                .route_rules
                .iter()
                .any(|rule| rule.ssr == Some(false) && rule.matches(pathname)),
            spa_shell: prerendering && config.spa_shell_routes.iter().any(|r| r == pathname),
            globally_disabled: !config.ssr,
        }
    }

    pub fn skip_ssr(&self) -> bool {
        self.env || self.request || self.route_rule || self.spa_shell || self.globally_disabled
    }
}

// ---------------------------------------------------------------------------
// Head accumulator
// ---------------------------------------------------------------------------

/// One tag destined for `<head>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadTag {
    pub tag: String,
    pub attrs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
}

impl HeadTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: IndexMap::new(),
            inner: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
        self.inner = Some(inner.into());
        self
    }

    fn is_void(&self) -> bool {
        matches!(self.tag.as_str(), "meta" | "link" | "base")
    }

    pub fn to_html(&self) -> String {
        let attrs = join_attrs(&self.attrs);
        if self.is_void() {
            format!("<{}{attrs}>", self.tag)
        } else {
            let inner = self.inner.as_deref().unwrap_or_default();
            format!("<{tag}{attrs}>{inner}</{tag}>", tag = self.tag)
        }
    }

    /// The island head object form: attributes plus `innerHTML`.
    pub fn to_json(&self) -> Value {
        let mut object: Map<String, Value> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        if let Some(inner) = &self.inner {
            object.insert("innerHTML".to_string(), Value::String(inner.clone()));
        }
        Value::Object(object)
    }
}

/// Join attributes with a leading space each. Empty input yields `""`.
pub fn join_attrs(attrs: &IndexMap<String, String>) -> String {
    attrs
        .iter()
        .map(|(name, value)| {
            if value.is_empty() {
                format!(" {name}")
            } else {
                format!(" {name}=\"{}\"", escape_html(value))
            }
        })
        .collect()
}

/// Document metadata written by the application while rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadAccumulator {
    pub html_attrs: IndexMap<String, String>,
    pub body_attrs: IndexMap<String, String>,
    pub tags: Vec<HeadTag>,
    pub body_prepend: Vec<String>,
    pub body_append: Vec<String>,
}

impl HeadAccumulator {
    pub fn push(&mut self, tag: HeadTag) {
        self.tags.push(tag);
    }

    pub fn title(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.tag == "title")
            .and_then(|t| t.inner.as_deref())
    }

    /// `meta`, `title` and `base` tags, which lead the head.
    pub fn leading_tags(&self) -> impl Iterator<Item = &HeadTag> {
        self.tags
            .iter()
            .filter(|t| matches!(t.tag.as_str(), "meta" | "title" | "base"))
    }

    pub fn trailing_tags(&self) -> impl Iterator<Item = &HeadTag> {
        self.tags
            .iter()
            .filter(|t| !matches!(t.tag.as_str(), "meta" | "title" | "base"))
    }

    /// Island head shape: tags grouped by name (`{ link: [...], style: [...] }`).
    pub fn to_island_head(&self) -> IndexMap<String, Vec<Value>> {
        let mut head: IndexMap<String, Vec<Value>> = IndexMap::new();
        head.insert("link".to_string(), Vec::new());
        head.insert("style".to_string(), Vec::new());
        for tag in &self.tags {
            head.entry(tag.tag.clone()).or_default().push(tag.to_json());
        }
        head
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Serializable application state handed from server render to the client.
/// The server side calls [`Payload::set`]; the client side
/// [`Payload::restore`]s by the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    data: IndexMap<String, Value>,
}

impl Payload {
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn restore(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn to_json(&self) -> Result<String, SsrError> {
        Ok(serde_json::to_string(&self.data)?)
    }

    pub fn from_json(source: &str) -> Result<Self, SsrError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_value(value: Value) -> Result<Self, SsrError> {
        Ok(serde_json::from_value(value)?)
    }

    /// The inline `<script type="application/json">` form.
    pub fn to_script(&self) -> Result<String, SsrError> {
        Ok(format!(
            "<script type=\"application/json\" id=\"{PAYLOAD_SCRIPT_ID}\">{}</script>",
            escape_json_for_script(&self.to_json()?)
        ))
    }

    /// The ES module form served on `/_payload.js` routes.
    pub fn to_module(&self) -> Result<String, SsrError> {
        Ok(format!("export default {}", self.to_json()?))
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Application hooks around rendering.
pub trait RenderHooks: Send + Sync {
    /// After the app has rendered and before the response is assembled.
    fn on_rendered<'a>(&'a self, _ctx: &'a mut RenderContext) -> BoxFuture<'a, Result<(), SsrError>> {
        Box::pin(async { Ok(()) })
    }

    /// A render failed; called before the error propagates.
    fn on_error(&self, _ctx: &RenderContext, _error: &SsrError) {}

    /// Last chance to change the document parts before they are joined.
    fn on_render_html(&self, _ctx: &RenderContext, _parts: &mut HtmlParts) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl RenderHooks for NoopHooks {}

// ---------------------------------------------------------------------------
// RenderContext
// ---------------------------------------------------------------------------

/// State of one request's render.
#[derive(Debug)]
pub struct RenderContext {
    /// Effective path the app renders (rewritten for island/payload requests).
    pub url: String,
    pub kind: RequestKind,
    pub is_island: bool,
    pub is_payload_request: bool,
    pub is_prerendering: bool,
    pub no_ssr: NoSsrPolicy,
    pub head: HeadAccumulator,
    pub payload: Payload,
    /// Anchor key → rendered fragment. Last write wins.
    pub teleports: IndexMap<String, String>,
    /// Module ids touched while rendering.
    pub modules: IndexSet<String>,
    pub island: Option<IslandRequest>,
    pub config: Arc<SsrConfig>,
    request: SsrRequest,
    original_path: String,
    error: Option<SsrError>,
    prepared: Option<SsrResponse>,
}

impl RenderContext {
    pub fn request(&self) -> &SsrRequest {
        &self.request
    }

    /// The path the request originally arrived with.
    pub fn original_url(&self) -> &str {
        &self.original_path
    }

    pub fn skip_ssr(&self) -> bool {
        self.no_ssr.skip_ssr()
    }

    pub fn track_module(&mut self, id: impl Into<String>) {
        self.modules.insert(id.into());
    }

    pub fn teleport(&mut self, key: impl Into<String>, html: impl Into<String>) {
        self.teleports.insert(key.into(), html.into());
    }

    /// Record an error. The first recorded error is kept.
    pub fn set_error(&mut self, error: SsrError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn error(&self) -> Option<&SsrError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<SsrError> {
        self.error.take()
    }

    /// Pick the error to report for a failed render. An error already on the
    /// context wins over the one that was thrown.
    pub fn resolve_error(&mut self, thrown: SsrError) -> SsrError {
        match self.error.take() {
            Some(recorded) => {
                debug!("reporting recorded context error over thrown: {thrown}");
                recorded
            }
            None => thrown,
        }
    }

    /// Used by the app before throwing [`SsrError::SkipRender`].
    pub fn prepare_response(&mut self, response: SsrResponse) {
        self.prepared = Some(response);
    }

    pub fn take_prepared_response(&mut self) -> Option<SsrResponse> {
        self.prepared.take()
    }

    /// End of request: the request with its original path restored.
    pub fn teardown(self) -> SsrRequest {
        let mut request = self.request;
        request.path = self.original_path;
        request
    }
}

/// Builds one [`RenderContext`] per request.
#[derive(Debug, Clone)]
pub struct ContextManager {
    config: Arc<SsrConfig>,
}

impl ContextManager {
    pub fn new(config: Arc<SsrConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<SsrConfig> {
        &self.config
    }

    pub fn create(&self, request: SsrRequest) -> Result<RenderContext, SsrError> {
        let original_path = request.path.clone();
        let pathname = request.pathname().to_string();
        let kind = RequestKind::classify(&pathname, &self.config);
        let prerendering = request.prerender;

        let mut island = None;
        let url = match kind {
            RequestKind::Island => {
                let parsed = IslandRequest::from_request(&request, &self.config.island_prefix)?;
                let url = parsed.url.clone().unwrap_or_else(|| "/".to_string());
                island = Some(parsed);
                url
            }
            RequestKind::Payload => {
                let route = pathname
                    .strip_suffix(self.config.payload_format.suffix())
                    .unwrap_or_default();
                if route.is_empty() {
                    "/".to_string()
                } else {
                    route.to_string()
                }
            }
            RequestKind::Error | RequestKind::Document => original_path.clone(),
        };

        let no_ssr = NoSsrPolicy::evaluate(&self.config, &request, split_query(&url).0, prerendering);
        if no_ssr.skip_ssr() {
            debug!("ssr disabled for {url}: {no_ssr:?}");
        }

        let mut request = request;
        request.path = url.clone();

        Ok(RenderContext {
            url,
            kind,
            is_island: kind == RequestKind::Island,
            is_payload_request: kind == RequestKind::Payload,
            is_prerendering: prerendering,
            no_ssr,
            head: HeadAccumulator::default(),
            payload: Payload::default(),
            teleports: IndexMap::new(),
            modules: IndexSet::new(),
            island,
            config: Arc::clone(&self.config),
            request,
            original_path,
            error: None,
            prepared: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteRule;
    use crate::PayloadFormat;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn manager(config: SsrConfig) -> ContextManager {
        ContextManager::new(Arc::new(config))
    }

    #[test]
    fn test_classification_precedence() {
        let config = SsrConfig::default();
        assert_eq!(RequestKind::classify("/__zenith_error", &config), RequestKind::Error);
        assert_eq!(RequestKind::classify("/__zenith_island/Card_1.json", &config), RequestKind::Island);
        assert_eq!(RequestKind::classify("/blog/_payload.json", &config), RequestKind::Payload);
        assert_eq!(RequestKind::classify("/blog/_payload.js", &config), RequestKind::Document);
        assert_eq!(RequestKind::classify("/__zenith_islander", &config), RequestKind::Document);
        assert_eq!(RequestKind::classify("/", &config), RequestKind::Document);

        let script = SsrConfig {
            payload_format: PayloadFormat::Script,
            ..SsrConfig::default()
        };
        assert_eq!(RequestKind::classify("/blog/_payload.js", &script), RequestKind::Payload);
    }

    #[test]
    fn test_payload_path_rewritten_and_restored() {
        let ctx = manager(SsrConfig::default())
            .create(SsrRequest::get("/blog/_payload.json"))
            .unwrap();
        assert_eq!(ctx.url, "/blog");
        assert!(ctx.is_payload_request);
        assert_eq!(ctx.request().path, "/blog");
        assert_eq!(ctx.teardown().path, "/blog/_payload.json");

        let root = manager(SsrConfig::default())
            .create(SsrRequest::get("/_payload.json"))
            .unwrap();
        assert_eq!(root.url, "/");
    }

    #[test]
    fn test_no_ssr_is_flat_or() {
        let config = SsrConfig {
            route_rules: vec![RouteRule {
                path: "/admin/**".into(),
                ssr: Some(false),
            }],
            ..SsrConfig::default()
        };
        let m = manager(config);

        assert!(!m.create(SsrRequest::get("/")).unwrap().skip_ssr());
        assert!(m.create(SsrRequest::get("/admin/users")).unwrap().no_ssr.route_rule);
        assert!(m.create(SsrRequest::get("/?no_ssr")).unwrap().no_ssr.request);
        assert!(m
            .create(SsrRequest::get("/").with_header("X-Zenith-No-SSR", "1"))
            .unwrap()
            .skip_ssr());
        assert!(!m
            .create(SsrRequest::get("/").with_header(NO_SSR_HEADER, "false"))
            .unwrap()
            .skip_ssr());

        let shell = m.create(SsrRequest::get("/200.html").prerendering()).unwrap();
        assert!(shell.no_ssr.spa_shell);
        assert!(!m.create(SsrRequest::get("/200.html")).unwrap().skip_ssr());

        let env = manager(SsrConfig {
            no_ssr_env: true,
            ..SsrConfig::default()
        });
        assert!(env.create(SsrRequest::get("/")).unwrap().no_ssr.env);
    }

    #[test]
    fn test_recorded_error_wins() {
        let mut ctx = manager(SsrConfig::default()).create(SsrRequest::get("/")).unwrap();
        assert!(matches!(
            ctx.resolve_error(SsrError::BadRequest("thrown".into())),
            SsrError::BadRequest(_)
        ));

        ctx.set_error(SsrError::Render(crate::RenderError::new(404, "missing")));
        ctx.set_error(SsrError::BadRequest("second".into()));
        let reported = ctx.resolve_error(SsrError::BadRequest("thrown".into()));
        assert_eq!(reported.status_code(), 404);
    }

    #[test]
    fn test_head_tags() {
        let tag = HeadTag::new("link")
            .with_attr("rel", "stylesheet")
            .with_attr("href", "/a.css");
        assert_eq!(tag.to_html(), r#"<link rel="stylesheet" href="/a.css">"#);

        let style = HeadTag::new("style").with_inner(".a{}");
        assert_eq!(style.to_json(), json!({ "innerHTML": ".a{}" }));

        let mut head = HeadAccumulator::default();
        head.push(style);
        head.push(HeadTag::new("title").with_inner("Home"));
        assert_eq!(head.title(), Some("Home"));
        let island_head = head.to_island_head();
        assert_eq!(island_head["link"].len(), 0);
        assert_eq!(island_head["style"].len(), 1);
        assert_eq!(join_attrs(&IndexMap::new()), "");
    }

    #[test]
    fn test_payload_script_escapes_closing_tags() {
        let mut payload = Payload::default();
        payload.set("html", json!("</script><b>"));
        let script = payload.to_script().unwrap();
        assert!(script.starts_with(r#"<script type="application/json" id="__ZENITH_DATA__">"#));
        assert_eq!(script.matches("</script>").count(), 1);

        let restored = Payload::from_json(&payload.to_json().unwrap()).unwrap();
        assert_eq!(restored.restore("html"), Some(json!("</script><b>")));
        assert_eq!(payload.to_module().unwrap(), r#"export default {"html":"</script><b>"}"#);
    }
}
