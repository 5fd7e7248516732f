//! Shared fixtures: an in-memory module graph, a line-based scripted
//! evaluator, and a configurable application renderer.
//!
//! Evaluator statements (one per line):
//! - `export const NAME = <json>;`
//! - `export * from "./x.js";` / `export * as ns from "./x.js";`
//! - `import "./x.js";`
//! - `await import("./x.js");`
//! - `export default renderer("name");`
//! - `sleep <ms>;` / `throw <message>;`
//! - lines starting with `//` are ignored

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use zenith_ssr::context::{HeadTag, RequestKind};
use zenith_ssr::fetch::{BundleSource, ModuleSource, ResolvingFetcher};
use zenith_ssr::{
    AppRenderer, ExportValue, IslandRequest, ModuleEvaluator, ModuleRunner, ModuleScope,
    RenderContext, RenderError, SsrError, SsrResponse, TransformError,
};

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedEvaluator {
    renderers: Mutex<HashMap<String, Arc<dyn AppRenderer>>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, renderer: Arc<dyn AppRenderer>) {
        self.renderers
            .lock()
            .unwrap()
            .insert(name.to_string(), renderer);
    }

    /// How many times the module's top-level code ran.
    pub fn count(&self, id: &str) -> usize {
        self.counts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    async fn run_line(&self, line: &str, scope: &ModuleScope) -> anyhow::Result<()> {
        if line.is_empty() || line.starts_with("//") {
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("export const ") {
            let (name, value) = rest
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("bad export: {line}"))?;
            let value: Value = serde_json::from_str(value.trim().trim_end_matches(';'))?;
            scope.exports().set_value(name.trim(), value);
        } else if let Some(rest) = line.strip_prefix("export * as ") {
            let (name, _) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("bad namespace export: {line}"))?;
            let ns = scope.import(quoted(line)?).await?;
            scope.exports().set(name, ExportValue::Namespace(ns));
        } else if line.starts_with("export * from ") {
            let source = scope.import(quoted(line)?).await?;
            scope.exports().reexport_all(&source);
        } else if line.starts_with("export default renderer(") {
            let name = quoted(line)?;
            let renderer = self
                .renderers
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown renderer {name}"))?;
            scope.exports().set("default", ExportValue::Renderer(renderer));
        } else if line.starts_with("import ") {
            scope.import(quoted(line)?).await?;
        } else if line.starts_with("await import(") {
            scope.dynamic_import(quoted(line)?).await?;
        } else if let Some(ms) = line.strip_prefix("sleep ") {
            let ms: u64 = ms.trim_end_matches(';').trim().parse()?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if let Some(message) = line.strip_prefix("throw ") {
            anyhow::bail!("{}", message.trim_end_matches(';'));
        }
        Ok(())
    }
}

fn quoted(line: &str) -> anyhow::Result<&str> {
    let start = line
        .find('"')
        .ok_or_else(|| anyhow::anyhow!("no specifier in {line}"))?;
    let rest = &line[start + 1..];
    let end = rest
        .find('"')
        .ok_or_else(|| anyhow::anyhow!("unterminated specifier in {line}"))?;
    Ok(&rest[..end])
}

impl ModuleEvaluator for ScriptedEvaluator {
    fn evaluate<'a>(&'a self, code: &'a str, scope: &'a ModuleScope) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            *self
                .counts
                .lock()
                .unwrap()
                .entry(scope.id().to_string())
                .or_default() += 1;
            // Built-ins are provided by the host.
            if scope.id().starts_with("node:") {
                scope.exports().set_value("default", Value::String(scope.id().to_string()));
                return Ok(());
            }
            for line in code.lines().map(str::trim) {
                self.run_line(line, scope).await?;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Module graph
// ---------------------------------------------------------------------------

pub struct Graph {
    pub runner: ModuleRunner,
    pub bundle: Arc<BundleSource>,
    pub fetcher: Arc<ResolvingFetcher>,
    pub evaluator: Arc<ScriptedEvaluator>,
}

pub fn graph(modules: &[(&str, &str)]) -> Graph {
    let bundle = Arc::new(BundleSource::from_modules(modules.iter().copied()));
    let fetcher = Arc::new(ResolvingFetcher::new(bundle.clone() as Arc<dyn ModuleSource>));
    let evaluator = Arc::new(ScriptedEvaluator::new());
    let runner = ModuleRunner::new(
        fetcher.clone() as Arc<dyn ModuleSource>,
        evaluator.clone() as Arc<dyn ModuleEvaluator>,
    );
    Graph {
        runner,
        bundle,
        fetcher,
        evaluator,
    }
}

// ---------------------------------------------------------------------------
// Application renderer
// ---------------------------------------------------------------------------

/// Application stand-in. Writes to the context the way a real app would.
#[derive(Default, Clone)]
pub struct TestApp {
    pub body: String,
    pub title: Option<String>,
    pub modules: Vec<String>,
    pub teleports: Vec<(String, String)>,
    /// Island name → component template (without the root wrapper).
    pub islands: HashMap<String, String>,
    pub payload: Vec<(String, Value)>,
    pub fail_status: Option<u16>,
    /// Fail the render the way a broken page module would.
    pub transform_error: Option<TransformError>,
    pub skip_with: Option<SsrResponse>,
    /// Record a 403 on the context, then throw something else.
    pub guard_then_throw: bool,
    pub app_calls: Arc<AtomicUsize>,
    pub component_calls: Arc<AtomicUsize>,
}

impl TestApp {
    pub fn with_body(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Self::default()
        }
    }

    pub fn with_island(mut self, name: &str, template: &str) -> Self {
        self.islands.insert(name.to_string(), template.to_string());
        self
    }
}

impl AppRenderer for TestApp {
    fn render_app<'a>(&'a self, ctx: &'a mut RenderContext) -> BoxFuture<'a, Result<String, SsrError>> {
        Box::pin(async move {
            self.app_calls.fetch_add(1, Ordering::SeqCst);
            if ctx.kind == RequestKind::Error {
                let status = ctx
                    .payload
                    .get("error")
                    .and_then(|e| e.get("statusCode"))
                    .cloned()
                    .unwrap_or(Value::Null);
                return Ok(format!("<main class=\"error\">{status}</main>"));
            }
            if let Some(response) = &self.skip_with {
                ctx.prepare_response(response.clone());
                return Err(SsrError::SkipRender);
            }
            if let Some(title) = &self.title {
                ctx.head.push(HeadTag::new("title").with_inner(title.clone()));
            }
            ctx.head.html_attrs.insert("lang".into(), "en".into());
            for module in &self.modules {
                ctx.track_module(module.clone());
            }
            for (key, html) in &self.teleports {
                ctx.teleport(key.clone(), html.clone());
            }
            for (key, value) in &self.payload {
                ctx.payload.set(key.clone(), value.clone());
            }
            if self.guard_then_throw {
                ctx.set_error(SsrError::Render(RenderError::new(403, "guard rejected")));
                return Err(SsrError::BadRequest("thrown after guard".into()));
            }
            if let Some(err) = &self.transform_error {
                return Err(SsrError::Transform(err.clone()));
            }
            if let Some(status) = self.fail_status {
                return Err(SsrError::Render(RenderError::new(status, "boom")));
            }
            Ok(self.body.clone())
        })
    }

    fn render_component<'a>(
        &'a self,
        ctx: &'a mut RenderContext,
        island: &'a IslandRequest,
    ) -> BoxFuture<'a, Result<String, SsrError>> {
        Box::pin(async move {
            self.component_calls.fetch_add(1, Ordering::SeqCst);
            let template = self.islands.get(&island.name).ok_or_else(|| SsrError::NotFound {
                id: island.name.clone(),
                importer: None,
            })?;
            for module in &self.modules {
                ctx.track_module(module.clone());
            }
            Ok(format!("<div id=\"__zenith\">{template}</div>"))
        })
    }
}
