//! Dev module-fetch protocol: the module server routes, and the runner
//! fetching through them.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use zenith_ssr::cache::InvalidationSet;
use zenith_ssr::fetch::{DevServerSource, FetchResult, ModuleSource, ResolvingFetcher, Transport};
use zenith_ssr::manifest::{ClientManifest, ManifestStore};
use zenith_ssr::module_server::{ModuleServer, ProtocolResponse, Transformer};
use zenith_ssr::utils::{encode_path_segment, join_specifier, scan_imports};
use zenith_ssr::{ModuleEvaluator, ModuleRunner, SourceLocation, SsrError, TransformError};

use common::ScriptedEvaluator;

// ---- Helpers ----

const ROUTE: &str = "/__zenith_ssr";

/// Serves sources from memory. Sources starting with `!` fail to transform
/// at line 2, column 4; with `!!` the failure is wrapped in context.
struct MemoryTransformer {
    sources: HashMap<String, String>,
}

impl MemoryTransformer {
    fn new(modules: &[(&str, &str)]) -> Self {
        Self {
            sources: modules
                .iter()
                .map(|(id, code)| (id.to_string(), code.to_string()))
                .collect(),
        }
    }
}

impl Transformer for MemoryTransformer {
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        importer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, SsrError>> {
        Box::pin(async move {
            let joined = join_specifier(id, importer);
            Ok(self.sources.contains_key(&joined).then_some(joined))
        })
    }

    fn transform<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<FetchResult>, SsrError>> {
        Box::pin(async move {
            let Some(code) = self.sources.get(id) else {
                return Ok(None);
            };
            if code.starts_with('!') {
                let err = SsrError::Transform(TransformError {
                    code: "PARSE_ERROR".to_string(),
                    id: id.to_string(),
                    message: "Unexpected token".to_string(),
                    stack: String::new(),
                    plugin: Some("zenith:sfc".to_string()),
                    loc: Some(SourceLocation {
                        file: Some(id.to_string()),
                        line: 2,
                        column: 4,
                    }),
                    frame: None,
                });
                return Err(if code.starts_with("!!") {
                    err.with_context(format!("compiling {id}"))
                } else {
                    err
                });
            }
            let (deps, dynamic_deps) = scan_imports(code);
            Ok(Some(FetchResult {
                id: id.to_string(),
                code: code.clone(),
                map: None,
                deps,
                dynamic_deps,
            }))
        })
    }

    fn original_source<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { self.sources.get(id).cloned() })
    }
}

struct Setup {
    server: Arc<ModuleServer>,
    invalidations: InvalidationSet,
    manifest: ManifestStore,
}

fn setup(modules: &[(&str, &str)]) -> Setup {
    let invalidations = InvalidationSet::new();
    let manifest = ManifestStore::new(ClientManifest::default());
    let server = Arc::new(ModuleServer::new(
        Arc::new(MemoryTransformer::new(modules)),
        manifest.clone(),
        invalidations.clone(),
        ROUTE,
    ));
    Setup {
        server,
        invalidations,
        manifest,
    }
}

fn runner_over(server: &Arc<ModuleServer>) -> ModuleRunner {
    let transport: Arc<dyn Transport> = server.clone();
    let remote = Arc::new(DevServerSource::new(transport, ROUTE));
    let fetcher = Arc::new(ResolvingFetcher::new(remote));
    ModuleRunner::new(fetcher, Arc::new(ScriptedEvaluator::new()) as Arc<dyn ModuleEvaluator>)
}

async fn get(server: &ModuleServer, path: &str) -> (u16, Value) {
    let ProtocolResponse { status, body, .. } = server.handle(path).await;
    (status, serde_json::from_str(&body).unwrap())
}

fn module_path(id: &str) -> String {
    format!("{ROUTE}/module/{}", encode_path_segment(id))
}

// ===========================================================================
// Routes
// ===========================================================================

/// `/resolve` answers with the resolved id or null.
#[tokio::test]
async fn resolve_route() {
    let s = setup(&[("/src/entry.js", ""), ("/src/dep.js", "")]);
    let path = format!(
        "{ROUTE}/resolve/{}?importer={}",
        encode_path_segment("./dep.js"),
        encode_path_segment("/src/entry.js")
    );
    assert_eq!(get(&s.server, &path).await, (200, json!({ "id": "/src/dep.js" })));

    let path = format!("{ROUTE}/resolve/{}", encode_path_segment("/src/none.js"));
    assert_eq!(get(&s.server, &path).await, (200, json!({ "id": null })));
}

/// `/module` serves the transformed module.
#[tokio::test]
async fn module_route_serves_fetch_result() {
    let s = setup(&[("/src/entry.js", "import \"./dep.js\";\nawait import(\"./lazy.js\");")]);
    let (status, body) = get(&s.server, &module_path("/src/entry.js")).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], json!("/src/entry.js"));
    assert_eq!(body["deps"], json!(["./dep.js"]));
    assert_eq!(body["dynamicDeps"], json!(["./lazy.js"]));
}

/// Unknown modules are a 404 with a NOT_FOUND code.
#[tokio::test]
async fn missing_module_is_not_found() {
    let s = setup(&[]);
    let (status, body) = get(&s.server, &module_path("/src/nope.js")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], json!("NOT_FOUND"));
    assert_eq!(body["error"]["id"], json!("/src/nope.js"));
}

/// Transform failures carry a code frame rendered from the original source.
#[tokio::test]
async fn transform_error_has_frame() {
    let s = setup(&[("/src/Broken.vue", "!template\n<div>{{ oops</div>\n")]);
    let (status, body) = get(&s.server, &module_path("/src/Broken.vue")).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], json!("PARSE_ERROR"));
    let frame = body["error"]["frame"].as_str().unwrap();
    assert!(frame.contains("> 2 | <div>{{ oops</div>"));
    assert!(frame.contains("|     ^"));
}

/// A transform error wrapped in context keeps its typed body and frame.
#[tokio::test]
async fn wrapped_transform_error_keeps_frame() {
    let s = setup(&[("/src/Wrapped.vue", "!!template\n<div>{{ oops</div>\n")]);
    let (status, body) = get(&s.server, &module_path("/src/Wrapped.vue")).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], json!("PARSE_ERROR"));
    assert_eq!(body["error"]["plugin"], json!("zenith:sfc"));
    assert!(body["error"]["frame"].as_str().unwrap().contains("> 2 | <div>{{ oops</div>"));
}

/// `/invalidates` drains the shared set.
#[tokio::test]
async fn invalidates_route_drains() {
    let s = setup(&[]);
    s.invalidations.extend(["/src/a.js", "/src/b.js"]);
    assert_eq!(
        get(&s.server, &format!("{ROUTE}/invalidates")).await,
        (200, json!(["/src/a.js", "/src/b.js"]))
    );
    assert_eq!(get(&s.server, &format!("{ROUTE}/invalidates")).await, (200, json!([])));
}

/// `/manifest` reflects the current manifest.
#[tokio::test]
async fn manifest_route_reflects_replacement() {
    let s = setup(&[]);
    assert_eq!(get(&s.server, &format!("{ROUTE}/manifest")).await, (200, json!({})));

    s.manifest.replace(
        ClientManifest::from_json(r#"{ "src/entry-client.js": { "file": "assets/e.js", "isEntry": true } }"#)
            .unwrap(),
    );
    let (_, body) = get(&s.server, &format!("{ROUTE}/manifest")).await;
    assert_eq!(body["src/entry-client.js"]["file"], json!("assets/e.js"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let s = setup(&[]);
    let (status, body) = get(&s.server, &format!("{ROUTE}/nope")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], json!("UNKNOWN_ROUTE"));
}

// ===========================================================================
// Runner over the protocol
// ===========================================================================

/// The runner executes a graph fetched through the protocol.
#[tokio::test]
async fn runner_imports_through_protocol() {
    let s = setup(&[
        ("/src/entry.js", "export * from \"./dep.js\";\nexport const entry = true;"),
        ("/src/dep.js", "export const dep = \"remote\";"),
    ]);
    let runner = runner_over(&s.server);
    let exports = runner.import("/src/entry.js").await.unwrap();
    assert_eq!(exports.value("dep"), Some(json!("remote")));
    assert_eq!(exports.value("entry"), Some(json!(true)));
    assert_eq!(
        runner.record("/src/entry.js").unwrap().dependencies(),
        vec!["/src/dep.js"]
    );
}

/// Protocol errors surface as typed errors.
#[tokio::test]
async fn protocol_errors_are_typed() {
    let s = setup(&[("/src/Broken.vue", "!template\n<div>{{ oops</div>\n")]);
    let remote = DevServerSource::new(s.server.clone(), ROUTE);

    let err = remote.fetch("/src/nope.js").await.unwrap_err();
    assert!(err.is_not_found());

    let err = remote.fetch("/src/Broken.vue").await.unwrap_err();
    match err.root() {
        SsrError::Transform(transform) => {
            assert_eq!(transform.plugin.as_deref(), Some("zenith:sfc"));
            assert!(transform.frame.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let runner = runner_over(&s.server);
    let err = runner.import("/src/missing.js").await.unwrap_err();
    assert!(err.is_not_found());
}
