//! # Zenith SSR
//!
//! On-demand server-side rendering runtime for the Zenith Framework.
//!
//! Given an incoming request, the runtime resolves which module graph to
//! execute, executes it (fetching transformed source on demand from the dev
//! module server or from a prebuilt bundle), and produces either a full HTML
//! document, an island fragment, or a payload-only response. Per-request side
//! channels (head tags, teleports, payload) live on a [`context::RenderContext`]
//! that is never shared between requests.
//!
//! The runtime never interprets component templates. Rendering is delegated to
//! an opaque [`AppRenderer`] exported by the server entry module.

pub mod cache;
pub mod config;
pub mod context;
pub mod document;
pub mod fetch;
pub mod handler;
pub mod html;
pub mod island;
pub mod manifest;
pub mod module_server;
pub mod runner;
pub mod utils;

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub use config::SsrConfig;
pub use context::{RenderContext, SsrRequest};
pub use handler::{BuildContext, SsrHandler, SsrResponse};
pub use island::{IslandRequest, IslandResponse};
pub use runner::{ExportValue, Exports, ModuleEvaluator, ModuleRunner, ModuleScope};

// ---------------------------------------------------------------------------
// Build Mode
// ---------------------------------------------------------------------------

/// The build mode the runtime was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BuildMode {
    /// Development: modules are fetched on demand from the dev module server.
    #[default]
    Dev,
    /// Production: modules come from a prebuilt server bundle.
    Prod,
    /// Static Site Generation: production bundle plus pre-render caches.
    SSG,
}

/// How payload data is delivered on payload-only routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `<route>/_payload.json`, served as `application/json`.
    #[default]
    Json,
    /// `<route>/_payload.js`, served as an ES module.
    Script,
}

impl PayloadFormat {
    /// The path suffix that marks a payload-only request.
    pub fn suffix(self) -> &'static str {
        match self {
            PayloadFormat::Json => "/_payload.json",
            PayloadFormat::Script => "/_payload.js",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            PayloadFormat::Json => "application/json;charset=utf-8",
            PayloadFormat::Script => "text/javascript;charset=utf-8",
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer capability (opaque to the runtime)
// ---------------------------------------------------------------------------

/// The application's render capability, exported by the server entry module
/// under the `default` key.
///
/// Implementations are free to write into the context's head accumulator,
/// payload, teleport map and module tracking set while rendering.
pub trait AppRenderer: Send + Sync {
    /// Render the application body (the contents of the root container).
    fn render_app<'a>(&'a self, ctx: &'a mut RenderContext) -> BoxFuture<'a, Result<String, SsrError>>;

    /// Render a single named component in isolation, including the app root
    /// wrapper element.
    fn render_component<'a>(
        &'a self,
        ctx: &'a mut RenderContext,
        island: &'a IslandRequest,
    ) -> BoxFuture<'a, Result<String, SsrError>>;
}

impl fmt::Debug for dyn AppRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppRenderer")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Source location of a transform failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: usize,
    pub column: usize,
}

/// A parse/transform failure reported by the dev transform pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{}] {message}", .plugin.as_deref().unwrap_or("transform"))]
pub struct TransformError {
    /// Machine-readable error code, e.g. `PARSE_ERROR`.
    pub code: String,
    /// Module id the error originated from.
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
    /// Plugin or pipeline stage that produced the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceLocation>,
    /// Rendered code frame for developer display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

impl TransformError {
    /// Attach a code frame rendered from `source` at the error location.
    /// Keeps an existing frame untouched.
    pub fn with_source(mut self, source: &str) -> Self {
        if self.frame.is_none() {
            if let Some(loc) = &self.loc {
                self.frame = Some(utils::code_frame(source, loc.line, loc.column));
            }
        }
        self
    }
}

/// An error thrown by the application render function, or produced by a
/// route-level guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{status_code} {status_message}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct RenderError {
    pub status_code: u16,
    pub status_message: String,
    pub message: String,
    /// Fatal errors are always shown as a full error page.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RenderError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            status_message: default_status_message(status_code).to_string(),
            message: message.into(),
            fatal: false,
            data: None,
        }
    }
}

/// Errors surfaced by the SSR runtime.
#[derive(Debug, Error)]
pub enum SsrError {
    #[error("Module not found: {id}{}", .importer.as_ref().map(|i| format!(" (imported by {i})")).unwrap_or_default())]
    NotFound { id: String, importer: Option<String> },

    #[error("Cannot resolve '{id}': {message}")]
    Resolution { id: String, message: String },

    #[error("Transform error in {id}: {err}", id = .0.id, err = .0)]
    Transform(TransformError),

    #[error("Failed to load built-in module '{id}': {message}")]
    Builtin { id: String, message: String },

    #[error("Error while executing module '{id}': {cause:#}")]
    Evaluation { id: String, cause: anyhow::Error },

    #[error("Render error: {0}")]
    Render(RenderError),

    /// Thrown by the application when it already prepared the response.
    #[error("Render skipped: response already set")]
    SkipRender,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SsrError>,
    },
}

impl SsrError {
    /// Wrap with context (module id, request path) before crossing a
    /// component boundary.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SsrError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &SsrError {
        match self {
            SsrError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), SsrError::NotFound { .. })
    }

    pub fn is_skip_render(&self) -> bool {
        matches!(self.root(), SsrError::SkipRender)
    }

    /// HTTP status code used when this error reaches the HTTP boundary.
    pub fn status_code(&self) -> u16 {
        match self.root() {
            SsrError::NotFound { .. } => 404,
            SsrError::BadRequest(_) => 400,
            SsrError::Render(err) => err.status_code,
            _ => 500,
        }
    }

    pub fn status_message(&self) -> String {
        match self.root() {
            SsrError::Render(err) => err.status_message.clone(),
            other => default_status_message(other.status_code()).to_string(),
        }
    }

    /// The structured error object of the module-fetch protocol and of JSON
    /// error bodies.
    pub fn to_json(&self) -> Value {
        match self.root() {
            SsrError::Transform(err) => json!({
                "code": err.code,
                "id": err.id,
                "message": err.message,
                "stack": err.stack,
                "frame": err.frame,
                "plugin": err.plugin,
                "loc": err.loc,
            }),
            SsrError::Render(err) => json!({
                "statusCode": err.status_code,
                "statusMessage": err.status_message,
                "message": err.message,
                "data": err.data,
            }),
            _ => json!({
                "statusCode": self.status_code(),
                "statusMessage": self.status_message(),
                "message": self.to_string(),
            }),
        }
    }
}

fn default_status_message(status_code: u16) -> &'static str {
    match status_code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Page Not Found",
        405 => "Method Not Allowed",
        500 => "Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}
