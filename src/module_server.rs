//! Server side of the dev module-fetch protocol.
//!
//! Routes, relative to the configured module route:
//! - `/manifest` - current client manifest
//! - `/invalidates` - drains the pending invalidation set
//! - `/resolve/<id>?importer=<id>` - `{ "id": <resolved> | null }`
//! - `/module/<id>` - a [`FetchResult`], or `{ "error": { code, id, message, stack, frame? } }`

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::InvalidationSet;
use crate::fetch::{FetchResult, Transport};
use crate::manifest::ManifestStore;
use crate::utils::{decode_path_segment, parse_query, split_query, unwrap_id};
use crate::{SsrError, TransformError};

/// The external dev transform pipeline.
pub trait Transformer: Send + Sync {
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>>;

    /// Transform a module for server execution. `Ok(None)` when it does not
    /// exist.
    fn transform<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<FetchResult>, SsrError>>;

    /// Untransformed source, used to render code frames for errors.
    fn original_source<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async { None })
    }
}

/// A protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl ProtocolResponse {
    fn json(status: u16, body: &impl Serialize) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: serde_json::to_string(body).unwrap_or_else(|_| "null".to_string()),
        }
    }
}

/// Decode a `/resolve/<id>` or `/module/<id>` path segment into a module id.
pub fn decode_requested_id(segment: &str) -> String {
    unwrap_id(&decode_path_segment(segment))
}

pub struct ModuleServer {
    transformer: Arc<dyn Transformer>,
    manifest: ManifestStore,
    invalidations: InvalidationSet,
    route: String,
}

impl fmt::Debug for ModuleServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleServer")
            .field("route", &self.route)
            .field("pending_invalidations", &self.invalidations.len())
            .finish()
    }
}

impl ModuleServer {
    pub fn new(
        transformer: Arc<dyn Transformer>,
        manifest: ManifestStore,
        invalidations: InvalidationSet,
        route: impl Into<String>,
    ) -> Self {
        Self {
            transformer,
            manifest,
            invalidations,
            route: route.into(),
        }
    }

    /// Handle a protocol request. `path` may include the route prefix and a
    /// query string.
    pub async fn handle(&self, path: &str) -> ProtocolResponse {
        let (path, query) = split_query(path);
        let path = path.strip_prefix(self.route.as_str()).unwrap_or(path);
        let query = query.map(parse_query).unwrap_or_default();

        if path == "/manifest" {
            return ProtocolResponse::json(200, self.manifest.current().as_ref());
        }
        if path == "/invalidates" {
            let drained: Vec<String> = self.invalidations.drain().into_iter().collect();
            return ProtocolResponse::json(200, &drained);
        }
        if let Some(segment) = path.strip_prefix("/resolve/") {
            let id = decode_requested_id(segment);
            let importer = query.get("importer").map(|i| unwrap_id(i));
            return match self.transformer.resolve(&id, importer.as_deref()).await {
                Ok(resolved) => ProtocolResponse::json(200, &json!({ "id": resolved })),
                Err(err) => {
                    warn!("resolve of '{id}' failed: {err}");
                    ProtocolResponse::json(500, &json!({ "error": err.to_json() }))
                }
            };
        }
        if let Some(segment) = path.strip_prefix("/module/") {
            let id = decode_requested_id(segment);
            return self.module(&id).await;
        }

        ProtocolResponse::json(
            404,
            &json!({ "error": { "code": "UNKNOWN_ROUTE", "id": path, "message": format!("unknown module route '{path}'") } }),
        )
    }

    async fn module(&self, id: &str) -> ProtocolResponse {
        match self.transformer.transform(id).await {
            Ok(Some(mut result)) => {
                if result.id.is_empty() {
                    result.id = id.to_string();
                }
                debug!("served module {id} ({} deps)", result.deps.len());
                ProtocolResponse::json(200, &result)
            }
            Ok(None) => ProtocolResponse::json(
                404,
                &json!({ "error": { "code": "NOT_FOUND", "id": id, "message": format!("Module not found: {id}") } }),
            ),
            Err(err) => {
                warn!("transform of '{id}' failed: {err}");
                match err.root() {
                    SsrError::Transform(transform) => {
                        let transform = self.with_frame(transform.clone()).await;
                        ProtocolResponse::json(500, &json!({ "error": transform }))
                    }
                    _ => ProtocolResponse::json(500, &json!({ "error": internal_error(id, &err) })),
                }
            }
        }
    }

    async fn with_frame(&self, err: TransformError) -> TransformError {
        if err.frame.is_some() || err.loc.is_none() {
            return err;
        }
        let file = err
            .loc
            .as_ref()
            .and_then(|loc| loc.file.clone())
            .unwrap_or_else(|| err.id.clone());
        match self.transformer.original_source(&file).await {
            Some(source) => err.with_source(&source),
            None => err,
        }
    }
}

fn internal_error(id: &str, err: &SsrError) -> Value {
    json!({
        "code": "INTERNAL_ERROR",
        "id": id,
        "message": err.to_string(),
        "stack": format!("{err:?}"),
    })
}

/// In-process transport: the runtime and the module server share a process.
impl Transport for ModuleServer {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<ProtocolResponse, SsrError>> {
        Box::pin(async move { Ok(self.handle(path).await) })
    }
}
