//! Island rendering: slot fallbacks, provided slot content, client component
//! teleports, style hoisting and determinism.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use zenith_ssr::context::ContextManager;
use zenith_ssr::island::{IslandRenderer, ISLAND_TELEPORT_PREFIX};
use zenith_ssr::manifest::StylesManifest;
use zenith_ssr::{IslandRequest, IslandResponse, SsrConfig, SsrRequest};

use common::TestApp;

// ---- Helpers ----

const CARD: &str = concat!(
    "<article class=\"card\"><h2>Card</h2>",
    "<slot name=\"footer\" props='{\"size\":\"sm\"}'><p>Default</p></slot>",
    "</article>"
);

const WITH_CLIENT: &str = concat!(
    "<section>",
    "<button data-island-client=\"Counter\" data-island-props='{\"start\":3}' data-island-chunk=\"/_zenith/counter.js\">3</button>",
    "<!--zenith-teleport:modal-->",
    "</section>"
);

fn contexts() -> ContextManager {
    ContextManager::new(Arc::new(SsrConfig::default()))
}

async fn render(app: &TestApp, path: &str) -> IslandResponse {
    let mut ctx = contexts().create(SsrRequest::get(path)).unwrap();
    let island = ctx.island.clone().unwrap();
    IslandRenderer
        .render(&mut ctx, app, &island, &StylesManifest::new())
        .await
        .unwrap()
}

// ===========================================================================
// Slots
// ===========================================================================

/// A slot without provided content renders its fallback once, inside the
/// placeholder, and no `<slot>` element survives.
#[tokio::test]
async fn slot_fallback_renders_once() {
    let app = TestApp::default().with_island("Card", CARD);
    let response = render(&app, "/__zenith_island/Card_abc.json").await;

    assert_eq!(response.id, "Card_abc");
    assert_eq!(response.html.matches("<p>Default</p>").count(), 1);
    assert!(!response.html.contains("<slot"));
    assert!(!response.html.contains("__zenith"));
    assert_eq!(
        response.html,
        "<article class=\"card\"><h2>Card</h2><div data-island-slot=\"footer\"><p>Default</p></div></article>"
    );

    let footer = &response.slots["footer"];
    assert_eq!(footer.props, json!({ "size": "sm" }));
    assert_eq!(footer.fallback.as_deref(), Some("<p>Default</p>"));
}

/// Provided slot content replaces the fallback in the HTML; the fallback is
/// still described for the client.
#[tokio::test]
async fn provided_slot_content_replaces_fallback() {
    let app = TestApp::default().with_island("Card", CARD);
    let island = IslandRequest::new("Card", "abc").with_slot("footer", "<em>Custom</em>");
    let mut ctx = contexts()
        .create(SsrRequest::post(
            island.path("/__zenith_island"),
            serde_json::to_string(&json!({ "slots": island.slots })).unwrap(),
        ))
        .unwrap();
    let parsed = ctx.island.clone().unwrap();
    assert_eq!(parsed.slots, island.slots);

    let response = IslandRenderer
        .render(&mut ctx, &app, &parsed, &StylesManifest::new())
        .await
        .unwrap();
    assert!(response.html.contains("<div data-island-slot=\"footer\"><em>Custom</em></div>"));
    assert!(!response.html.contains("<p>Default</p>"));
    assert_eq!(response.slots["footer"].fallback.as_deref(), Some("<p>Default</p>"));
}

// ===========================================================================
// Client components
// ===========================================================================

/// Client-only descendants are replaced by a placeholder and teleported
/// under their uid.
#[tokio::test]
async fn client_components_are_teleported() {
    let app = TestApp::default().with_island("Widget", WITH_CLIENT);
    let mut ctx = contexts()
        .create(SsrRequest::get("/__zenith_island/Widget_w1.json?url=%2Fshop"))
        .unwrap();
    assert_eq!(ctx.url, "/shop");
    let island = ctx.island.clone().unwrap();
    let response = IslandRenderer
        .render(&mut ctx, &app, &island, &StylesManifest::new())
        .await
        .unwrap();

    assert_eq!(response.components.len(), 1);
    let (uid, component) = response.components.first().unwrap();
    assert_eq!(uid.len(), 8);
    assert_eq!(component.props, json!({ "start": 3 }));
    assert_eq!(component.chunk.as_deref(), Some("/_zenith/counter.js"));
    assert_eq!(component.html, "<button>3</button>");

    assert_eq!(
        response.html,
        format!("<section><div data-island-uid=\"{uid}\" data-island-component=\"Counter\"></div></section>")
    );
    assert!(!response.html.contains("zenith-teleport"));
    assert_eq!(
        ctx.teleports.get(&format!("{ISLAND_TELEPORT_PREFIX}{uid}")).map(String::as_str),
        Some("<button>3</button>")
    );
}

/// Rendering the same island twice yields identical output.
#[tokio::test]
async fn island_output_is_deterministic() {
    let app = TestApp::default()
        .with_island("Widget", &format!("{WITH_CLIENT}{CARD}"));
    let first = render(&app, "/__zenith_island/Widget_w1.json").await;
    let second = render(&app, "/__zenith_island/Widget_w1.json").await;
    assert_eq!(first, second);

    let other = render(&app, "/__zenith_island/Widget_w2.json").await;
    assert_ne!(
        first.components.keys().collect::<Vec<_>>(),
        other.components.keys().collect::<Vec<_>>()
    );
}

// ===========================================================================
// Head
// ===========================================================================

/// Inline styles move into the head; head always has link and style keys.
#[tokio::test]
async fn styles_are_hoisted_into_head() {
    let app = TestApp::default().with_island(
        "Styled",
        "<style>.a{color:red}</style><p class=\"a\">x</p><style>.a{color:red}</style>",
    );
    let response = render(&app, "/__zenith_island/Styled_s.json").await;
    assert_eq!(response.html, "<p class=\"a\">x</p>");
    assert_eq!(response.head["link"], Vec::<serde_json::Value>::new());
    assert_eq!(response.head["style"], vec![json!({ "innerHTML": ".a{color:red}" })]);
}

/// Scoped CSS of touched non-page modules is inlined in development.
#[tokio::test]
async fn dev_inlines_scoped_module_styles() {
    let mut app = TestApp::default().with_island("Card", CARD);
    app.modules = vec![
        "/src/components/Card.vue".to_string(),
        "/src/pages/index.vue".to_string(),
    ];
    let mut styles = StylesManifest::new();
    styles.register_static("/src/components/Card.vue", true, vec![".card{margin:0}".to_string()]);
    styles.register_static("/src/pages/index.vue", true, vec![".page{}".to_string()]);

    let mut ctx = contexts().create(SsrRequest::get("/__zenith_island/Card_c.json")).unwrap();
    let island = ctx.island.clone().unwrap();
    let response = IslandRenderer.render(&mut ctx, &app, &island, &styles).await.unwrap();

    assert_eq!(
        response.head["style"],
        vec![json!({
            "data-island-module": "/src/components/Card.vue",
            "innerHTML": ".card{margin:0}",
        })]
    );
}
