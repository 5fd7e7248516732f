//! Full-document rendering.
//!
//! Head order is fixed:
//! 1. `meta` / `title` / `base` written by the app
//! 2. payload preload (extraction mode only)
//! 3. stylesheet links, then inline module styles, then the app's other head tags
//! 4. `modulepreload` / `prefetch` hints
//! 5. scripts (inline payload, then entry)
//!
//! The document itself is a plain string join of [`HtmlParts`].

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use log::debug;
use regex::{Captures, Regex};

use crate::context::{join_attrs, HeadTag, RenderContext, RenderHooks, RequestKind};
use crate::handler::SsrResponse;
use crate::island::ISLAND_TELEPORT_PREFIX;
use crate::manifest::{ManifestStore, ResourceHints, StylesManifest};
use crate::utils::escape_html;
use crate::{AppRenderer, PayloadFormat, SsrError};

/// Comment prefix of teleport anchors: `<!--zenith-teleport:KEY-->`.
pub const TELEPORT_ANCHOR_PREFIX: &str = "zenith-teleport:";
/// Response header naming the payload file the pre-renderer must also emit.
pub const PRERENDER_HEADER: &str = "x-zenith-prerender";
pub const HTML_CONTENT_TYPE: &str = "text/html;charset=utf-8";

pub fn teleport_anchor(key: &str) -> String {
    format!("<!--{TELEPORT_ANCHOR_PREFIX}{key}-->")
}

fn anchor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<!--zenith-teleport:([^>]*?)-->").expect("valid teleport anchor regex")
    })
}

/// Payload URL of a route: `/blog` → `/blog/_payload.json`.
pub fn payload_url(route: &str, format: PayloadFormat) -> String {
    let route = route.split(['?', '#']).next().unwrap_or_default();
    format!("{}{}", route.trim_end_matches('/'), format.suffix())
}

/// Replace every teleport anchor in `body` with its fragment. Fragments are
/// substituted recursively, so anchors of nested islands are filled too. Each
/// fragment is emitted at most once; anchors without a fragment are removed.
/// Returns the new body and the keys that were consumed.
pub fn substitute_teleports(body: &str, teleports: &IndexMap<String, String>) -> (String, HashSet<String>) {
    let mut consumed: HashSet<String> = HashSet::new();
    let replaced = substitute_into(body, teleports, &mut consumed);
    (replaced, consumed)
}

fn substitute_into(text: &str, teleports: &IndexMap<String, String>, consumed: &mut HashSet<String>) -> String {
    anchor_pattern()
        .replace_all(text, |caps: &Captures<'_>| {
            let key = &caps[1];
            match teleports.get(key) {
                Some(fragment) if consumed.insert(key.to_string()) => {
                    substitute_into(fragment, teleports, consumed)
                }
                _ => String::new(),
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Document parts
// ---------------------------------------------------------------------------

/// The pieces of a document, joined verbatim by [`HtmlParts::join`].
/// Attribute strings carry their own leading space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlParts {
    pub html_attrs: String,
    pub head: Vec<String>,
    pub body_attrs: String,
    pub body_prepend: Vec<String>,
    pub body: Vec<String>,
    pub body_append: Vec<String>,
}

impl HtmlParts {
    pub fn join(&self) -> String {
        let mut out = String::from("<!DOCTYPE html>");
        out.push_str(&format!("<html{}>", self.html_attrs));
        out.push_str("<head>");
        out.push_str(&self.head.concat());
        out.push_str("</head>");
        out.push_str(&format!("<body{}>", self.body_attrs));
        out.push_str(&self.body_prepend.concat());
        out.push_str(&self.body.concat());
        out.push_str(&self.body_append.concat());
        out.push_str("</body></html>");
        out
    }
}

/// A rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub html: String,
    pub status_code: u16,
    pub status_message: String,
    pub headers: IndexMap<String, String>,
}

impl From<SsrResponse> for RenderedDocument {
    fn from(response: SsrResponse) -> Self {
        Self {
            html: response.body,
            status_code: response.status_code,
            status_message: response.status_message,
            headers: response.headers,
        }
    }
}

/// Receives `link` header values before the body is rendered.
pub trait EarlyHintSink: Send + Sync {
    fn send(&self, links: Vec<String>);
}

/// `link` header values for early hints.
pub fn early_hint_links(hints: &ResourceHints) -> Vec<String> {
    let styles = hints
        .styles
        .iter()
        .map(|href| format!("<{href}>; rel=preload; as=style"));
    let modules = hints
        .preloads
        .iter()
        .chain(hints.scripts.iter())
        .map(|href| format!("<{href}>; rel=modulepreload; crossorigin"));
    styles.chain(modules).collect()
}

/// Minimal error page used when the error route itself cannot render.
pub fn fallback_error_page(status_code: u16, status_message: &str, message: &str, frame: Option<&str>) -> String {
    let mut body = format!(
        "<h1>{status_code} {}</h1><p>{}</p>",
        escape_html(status_message),
        escape_html(message)
    );
    if let Some(frame) = frame {
        body.push_str(&format!("<pre>{}</pre>", escape_html(frame)));
    }
    HtmlParts {
        head: vec![format!("<title>{status_code} {}</title>", escape_html(status_message))],
        body: vec![body],
        ..HtmlParts::default()
    }
    .join()
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

pub struct DocumentRenderer {
    manifest: ManifestStore,
    styles: StylesManifest,
    hooks: Arc<dyn RenderHooks>,
    early_hints: Option<Arc<dyn EarlyHintSink>>,
}

impl std::fmt::Debug for DocumentRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRenderer")
            .field("styles", &self.styles)
            .field("early_hints", &self.early_hints.is_some())
            .finish()
    }
}

impl DocumentRenderer {
    pub fn new(
        manifest: ManifestStore,
        styles: StylesManifest,
        hooks: Arc<dyn RenderHooks>,
        early_hints: Option<Arc<dyn EarlyHintSink>>,
    ) -> Self {
        Self {
            manifest,
            styles,
            hooks,
            early_hints,
        }
    }

    fn resources(&self, ctx: &RenderContext) -> ResourceHints {
        self.manifest.current().resources(
            &ctx.config.client_entry,
            ctx.modules.iter().map(String::as_str),
            &ctx.config.build_assets_dir,
        )
    }

    fn send_early_hints(&self, ctx: &RenderContext) {
        let Some(sink) = &self.early_hints else {
            return;
        };
        if !ctx.config.early_hints || ctx.kind != RequestKind::Document || ctx.is_prerendering {
            return;
        }
        let links = early_hint_links(&self.resources(ctx));
        if !links.is_empty() {
            debug!("sending {} early hint(s) for {}", links.len(), ctx.url);
            sink.send(links);
        }
    }

    /// Render a full document through the app.
    pub async fn render(&self, ctx: &mut RenderContext, app: &dyn AppRenderer) -> Result<RenderedDocument, SsrError> {
        self.send_early_hints(ctx);

        let body = match app.render_app(ctx).await {
            Ok(body) => body,
            Err(err) if err.is_skip_render() && !ctx.has_error() => {
                return match ctx.take_prepared_response() {
                    Some(prepared) => Ok(prepared.into()),
                    None => Err(err),
                };
            }
            Err(err) => {
                let err = ctx.resolve_error(err);
                self.hooks.on_error(ctx, &err);
                return Err(err);
            }
        };
        if let Some(err) = ctx.take_error() {
            self.hooks.on_error(ctx, &err);
            return Err(err);
        }

        self.hooks.on_rendered(ctx).await?;
        ctx.payload.set("serverRendered", serde_json::Value::Bool(true));

        let hints = self.resources(ctx);
        let extracting = ctx.config.payload_extraction && ctx.is_prerendering;
        let payload_href = payload_url(&ctx.url, ctx.config.payload_format);

        let mut head: Vec<String> = ctx.head.leading_tags().map(HeadTag::to_html).collect();
        if extracting {
            head.push(payload_preload(&payload_href, ctx.config.payload_format));
        }
        head.extend(stylesheet_links(&hints));
        if ctx.config.inline_styles {
            let modules = self.styles.collect(ctx.modules.iter().map(String::as_str)).await?;
            for module in modules {
                for css in module.css {
                    head.push(HeadTag::new("style").with_inner(css).to_html());
                }
            }
        }
        head.extend(ctx.head.trailing_tags().map(HeadTag::to_html));
        head.extend(resource_links(&hints));
        if !extracting {
            head.push(ctx.payload.to_script()?);
        }
        head.extend(entry_scripts(&hints));

        let (main, consumed) = substitute_teleports(&body, &ctx.teleports);
        let config = &ctx.config;
        let mut body = vec![format!(
            "<{tag} id=\"{id}\">{main}</{tag}>",
            tag = config.root_tag,
            id = config.root_id
        )];
        if !config.teleport_id.is_empty() {
            let rest: String = ctx
                .teleports
                .iter()
                .filter(|(key, _)| !consumed.contains(*key) && !key.starts_with(ISLAND_TELEPORT_PREFIX))
                .map(|(_, html)| html.as_str())
                .collect();
            body.push(format!(
                "<{tag} id=\"{id}\">{rest}</{tag}>",
                tag = config.teleport_tag,
                id = config.teleport_id
            ));
        }

        let mut parts = HtmlParts {
            html_attrs: join_attrs(&ctx.head.html_attrs),
            head,
            body_attrs: join_attrs(&ctx.head.body_attrs),
            body_prepend: ctx.head.body_prepend.clone(),
            body,
            body_append: ctx.head.body_append.clone(),
        };
        self.hooks.on_render_html(ctx, &mut parts);

        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), HTML_CONTENT_TYPE.to_string());
        if extracting {
            headers.insert(PRERENDER_HEADER.to_string(), payload_href);
        }

        Ok(RenderedDocument {
            html: parts.join(),
            status_code: 200,
            status_message: "OK".to_string(),
            headers,
        })
    }

    /// The degenerate renderer used when SSR is off: an empty root container
    /// and the client entry, no application code runs.
    pub fn render_spa_shell(&self, ctx: &mut RenderContext) -> Result<RenderedDocument, SsrError> {
        ctx.payload.set("serverRendered", serde_json::Value::Bool(false));
        let hints = self.resources(ctx);

        let mut head: Vec<String> = stylesheet_links(&hints);
        head.extend(resource_links(&hints));
        head.push(ctx.payload.to_script()?);
        head.extend(entry_scripts(&hints));

        let config = &ctx.config;
        let parts = HtmlParts {
            head,
            body: vec![format!("<{tag} id=\"{id}\"></{tag}>", tag = config.root_tag, id = config.root_id)],
            ..HtmlParts::default()
        };

        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), HTML_CONTENT_TYPE.to_string());
        Ok(RenderedDocument {
            html: parts.join(),
            status_code: 200,
            status_message: "OK".to_string(),
            headers,
        })
    }
}

fn payload_preload(href: &str, format: PayloadFormat) -> String {
    match format {
        PayloadFormat::Json => {
            format!("<link rel=\"preload\" as=\"fetch\" crossorigin=\"anonymous\" href=\"{href}\">")
        }
        PayloadFormat::Script => format!("<link rel=\"modulepreload\" href=\"{href}\">"),
    }
}

fn stylesheet_links(hints: &ResourceHints) -> Vec<String> {
    hints
        .styles
        .iter()
        .map(|href| format!("<link rel=\"stylesheet\" href=\"{href}\">"))
        .collect()
}

fn resource_links(hints: &ResourceHints) -> Vec<String> {
    let preloads = hints
        .preloads
        .iter()
        .map(|href| format!("<link rel=\"modulepreload\" as=\"script\" crossorigin href=\"{href}\">"));
    let prefetches = hints.prefetches.iter().map(|href| {
        if href.ends_with(".css") {
            format!("<link rel=\"prefetch\" as=\"style\" href=\"{href}\">")
        } else {
            format!("<link rel=\"prefetch\" as=\"script\" href=\"{href}\">")
        }
    });
    preloads.chain(prefetches).collect()
}

fn entry_scripts(hints: &ResourceHints) -> Vec<String> {
    hints
        .scripts
        .iter()
        .map(|src| format!("<script type=\"module\" src=\"{src}\" crossorigin></script>"))
        .collect()
}
