//! Island (partial) rendering.
//!
//! An island is one named component rendered in isolation, addressed as
//! `<island prefix>/<Name>_<id>.json`. The response carries the component HTML
//! without the app root wrapper, its head output, a description of every
//! client-only descendant (teleported out of the HTML) and of every slot.
//!
//! Rewriting works on the [`crate::html`] node tree:
//! - `<slot name="x">fallback</slot>` becomes
//!   `<div data-island-slot="x">content or fallback</div>`; repeated slots get
//!   keys `x`, `x:1`, `x:2`, ...
//! - an element carrying `data-island-client="Name"` (plus optional
//!   `data-island-props` JSON and `data-island-chunk`) is replaced by
//!   `<div data-island-uid=".." data-island-component="Name"></div>`
//! - teleport anchor comments are dropped
//! - `<style>` elements move into the head

use std::sync::OnceLock;

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{HeadTag, RenderContext, SsrRequest};
use crate::document::TELEPORT_ANCHOR_PREFIX;
use crate::html::{self, Element, Node};
use crate::manifest::StylesManifest;
use crate::utils::stable_hash_8;
use crate::{AppRenderer, SsrError};

pub const CLIENT_ATTR: &str = "data-island-client";
pub const CLIENT_PROPS_ATTR: &str = "data-island-props";
pub const CLIENT_CHUNK_ATTR: &str = "data-island-chunk";
pub const SLOT_ATTR: &str = "data-island-slot";
pub const UID_ATTR: &str = "data-island-uid";
pub const COMPONENT_ATTR: &str = "data-island-component";
/// Teleport map key prefix of client-only components.
pub const ISLAND_TELEPORT_PREFIX: &str = "island:";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("valid island name regex"))
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid island id regex"))
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Identifies one island render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IslandRequest {
    pub name: String,
    /// Opaque per-instance hash.
    pub id: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Slot content supplied by the caller, by slot name.
    #[serde(default)]
    pub slots: IndexMap<String, String>,
    /// Page the island is rendered for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IslandParams {
    #[serde(default)]
    props: Map<String, Value>,
    #[serde(default)]
    context: Map<String, Value>,
    #[serde(default)]
    slots: IndexMap<String, String>,
    #[serde(default)]
    url: Option<String>,
}

impl IslandRequest {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_props(mut self, props: Value) -> Self {
        if let Value::Object(props) = props {
            self.props = props;
        }
        self
    }

    pub fn with_slot(mut self, name: impl Into<String>, html: impl Into<String>) -> Self {
        self.slots.insert(name.into(), html.into());
        self
    }

    /// `Name_id`, the addressable key of this island.
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.id)
    }

    /// Request path of this island under `prefix`.
    pub fn path(&self, prefix: &str) -> String {
        format!("{}/{}.json", prefix.trim_end_matches('/'), self.key())
    }

    /// Build the descriptor from `<prefix>/<Name>_<id>.json` plus either GET
    /// query parameters (`props`, `context`, `slots` as JSON strings, `url`)
    /// or a POST JSON body.
    pub fn from_request(request: &SsrRequest, prefix: &str) -> Result<Self, SsrError> {
        let pathname = request.pathname();
        let key = pathname
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .map(|rest| rest.strip_suffix(".json").unwrap_or(rest))
            .ok_or_else(|| SsrError::BadRequest(format!("not an island path: {pathname}")))?;
        let (name, id) = key
            .rsplit_once('_')
            .ok_or_else(|| SsrError::BadRequest(format!("island path must be <Name>_<id>: {key}")))?;
        if !name_pattern().is_match(name) || !id_pattern().is_match(id) {
            return Err(SsrError::BadRequest(format!("invalid island name or id: {key}")));
        }

        let params = if request.method.eq_ignore_ascii_case("POST") {
            match request.body.as_deref().map(str::trim) {
                Some(body) if !body.is_empty() => serde_json::from_str::<IslandParams>(body)
                    .map_err(|e| SsrError::BadRequest(format!("invalid island body: {e}")))?,
                _ => IslandParams::default(),
            }
        } else {
            let query = request.query();
            IslandParams {
                props: query_json(&query, "props")?,
                context: query_json(&query, "context")?,
                slots: match query.get("slots") {
                    Some(raw) => serde_json::from_str(raw)
                        .map_err(|e| SsrError::BadRequest(format!("invalid island slots: {e}")))?,
                    None => IndexMap::new(),
                },
                url: query.get("url").cloned(),
            }
        };

        Ok(Self {
            name: name.to_string(),
            id: id.to_string(),
            props: params.props,
            context: params.context,
            slots: params.slots,
            url: params.url,
        })
    }
}

fn query_json(query: &IndexMap<String, String>, key: &str) -> Result<Map<String, Value>, SsrError> {
    match query.get(key) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| SsrError::BadRequest(format!("invalid island {key}: {e}"))),
        None => Ok(Map::new()),
    }
}

/// A client-only descendant, teleported out of the island HTML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientComponent {
    pub html: String,
    pub props: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub slots: IndexMap<String, SlotInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub props: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// The island JSON response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IslandResponse {
    pub id: String,
    pub head: IndexMap<String, Vec<Value>>,
    pub html: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub components: IndexMap<String, ClientComponent>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub slots: IndexMap<String, SlotInfo>,
}

// ---------------------------------------------------------------------------
// Tree rewriting
// ---------------------------------------------------------------------------

struct IslandWalker<'a> {
    island: &'a IslandRequest,
    slot_counts: IndexMap<String, usize>,
    slots: IndexMap<String, SlotInfo>,
    components: IndexMap<String, ClientComponent>,
    component_count: usize,
    styles: Vec<String>,
}

impl<'a> IslandWalker<'a> {
    fn new(island: &'a IslandRequest) -> Self {
        Self {
            island,
            slot_counts: IndexMap::new(),
            slots: IndexMap::new(),
            components: IndexMap::new(),
            component_count: 0,
            styles: Vec::new(),
        }
    }

    fn walk(&mut self, nodes: Vec<Node>) -> Result<Vec<Node>, SsrError> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Element(element) if element.name == "slot" => {
                    out.push(Node::Element(self.slot(element)?));
                }
                Node::Element(element) if element.name == "style" => {
                    self.styles.push(element.inner_html());
                }
                Node::Element(element) if element.has_attr(CLIENT_ATTR) => {
                    out.push(Node::Element(self.client_component(element)?));
                }
                Node::Element(mut element) => {
                    element.children = self.walk(std::mem::take(&mut element.children))?;
                    out.push(Node::Element(element));
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn slot_key(&mut self, name: &str) -> String {
        let count = self.slot_counts.entry(name.to_string()).or_insert(0);
        let key = if *count == 0 {
            name.to_string()
        } else {
            format!("{name}:{count}")
        };
        *count += 1;
        key
    }

    fn slot(&mut self, mut element: Element) -> Result<Element, SsrError> {
        let name = element
            .attr("name")
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "default".to_string());
        let props = match element.attr("props") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => Value::Object(Map::new()),
        };
        let key = self.slot_key(&name);

        let fallback_nodes = self.walk(std::mem::take(&mut element.children))?;
        let fallback = (!html::is_blank(&fallback_nodes)).then(|| html::serialize(&fallback_nodes));

        let mut placeholder = Element::new("div").with_attr(SLOT_ATTR, &key);
        placeholder.children = match self.island.slots.get(&name) {
            Some(content) => html::parse(content),
            None => fallback_nodes,
        };

        self.slots.insert(key, SlotInfo { props, fallback });
        Ok(placeholder)
    }

    fn client_component(&mut self, mut element: Element) -> Result<Element, SsrError> {
        let name = element.remove_attr(CLIENT_ATTR).unwrap_or_default();
        let props = match element.remove_attr(CLIENT_PROPS_ATTR) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => Value::Object(Map::new()),
        };
        let chunk = element.remove_attr(CLIENT_CHUNK_ATTR).filter(|c| !c.is_empty());

        let uid = stable_hash_8(&format!("{}:{name}:{}", self.island.key(), self.component_count));
        self.component_count += 1;

        let outer_slots = std::mem::take(&mut self.slots);
        element.children = self.walk(std::mem::take(&mut element.children))?;
        let nested_slots = std::mem::replace(&mut self.slots, outer_slots);

        self.components.insert(
            uid.clone(),
            ClientComponent {
                html: element.outer_html(),
                props,
                chunk,
                slots: nested_slots,
            },
        );

        Ok(Element::new("div")
            .with_attr(UID_ATTR, &uid)
            .with_attr(COMPONENT_ATTR, &name))
    }
}

/// Drop the app root wrapper if it is the only top-level element.
fn unwrap_root(nodes: Vec<Node>, root_tag: &str, root_id: &str) -> Vec<Node> {
    let mut elements = nodes.iter().filter(|n| !html::is_blank(std::slice::from_ref(*n)));
    let is_root = match (elements.next(), elements.next()) {
        (Some(Node::Element(element)), None) => {
            element.name.eq_ignore_ascii_case(root_tag) && element.attr("id").as_deref() == Some(root_id)
        }
        _ => false,
    };
    if !is_root {
        return nodes;
    }
    nodes
        .into_iter()
        .find_map(|node| match node {
            Node::Element(element) => Some(element.children),
            _ => None,
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Renders island descriptors through the app's render capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct IslandRenderer;

impl IslandRenderer {
    pub async fn render(
        &self,
        ctx: &mut RenderContext,
        app: &dyn AppRenderer,
        island: &IslandRequest,
        styles: &StylesManifest,
    ) -> Result<IslandResponse, SsrError> {
        let rendered = app.render_component(ctx, island).await?;

        let mut nodes = unwrap_root(html::parse(&rendered), &ctx.config.root_tag, &ctx.config.root_id);
        html::strip_comments(&mut nodes, &|text| text.starts_with(TELEPORT_ANCHOR_PREFIX));

        let mut walker = IslandWalker::new(island);
        let nodes = walker.walk(nodes)?;
        let html = html::serialize(&nodes);

        for css in walker.styles.drain(..) {
            push_unique(ctx, HeadTag::new("style").with_inner(css));
        }
        if ctx.config.is_dev() && ctx.config.inline_styles {
            self.inline_dev_styles(ctx, styles).await?;
        }

        for (uid, component) in &walker.components {
            ctx.teleport(format!("{ISLAND_TELEPORT_PREFIX}{uid}"), component.html.clone());
        }
        debug!(
            "rendered island {} ({} client components, {} slots)",
            island.key(),
            walker.components.len(),
            walker.slots.len()
        );

        Ok(IslandResponse {
            id: island.key(),
            head: ctx.head.to_island_head(),
            html,
            components: walker.components,
            slots: walker.slots,
        })
    }

    /// Scoped styles of non-page modules touched by the render.
    async fn inline_dev_styles(&self, ctx: &mut RenderContext, styles: &StylesManifest) -> Result<(), SsrError> {
        let pages_dir = ctx.config.pages_dir.clone();
        let ids: Vec<String> = ctx
            .modules
            .iter()
            .filter(|id| !id.starts_with(&pages_dir))
            .cloned()
            .collect();
        for module in styles.collect(ids.iter().map(String::as_str)).await? {
            if !module.scoped {
                continue;
            }
            for css in module.css {
                push_unique(
                    ctx,
                    HeadTag::new("style")
                        .with_attr("data-island-module", module.id.clone())
                        .with_inner(css),
                );
            }
        }
        Ok(())
    }
}

fn push_unique(ctx: &mut RenderContext, tag: HeadTag) {
    if !ctx.head.tags.contains(&tag) {
        ctx.head.push(tag);
    }
}
