//! Runtime configuration.
//!
//! The configuration is resolved once (CLI and config-file loading happen
//! outside this crate) and handed to every component at construction time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BuildMode, PayloadFormat, SsrError};

/// Environment variable that disables SSR for every request when set to a
/// truthy value.
pub const NO_SSR_ENV: &str = "ZENITH_NO_SSR";

/// A route-level static rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    /// Exact path, or a prefix when it ends with `/**`.
    pub path: String,
    /// `Some(false)` disables SSR for matching routes.
    #[serde(default)]
    pub ssr: Option<bool>,
}

impl RouteRule {
    pub fn matches(&self, path: &str) -> bool {
        match self.path.strip_suffix("/**") {
            Some(prefix) => path == prefix || path.starts_with(&format!("{prefix}/")),
            None => self.path == path,
        }
    }
}

/// Configuration shared by all runtime components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SsrConfig {
    pub mode: BuildMode,
    /// Global SSR switch. `false` serves the SPA shell for every document.
    pub ssr: bool,
    /// Emit companion payload files for pre-rendered routes.
    pub payload_extraction: bool,
    pub payload_format: PayloadFormat,
    /// Send `link` early hints before the body is produced.
    pub early_hints: bool,
    /// Inline styles of rendered modules into the document head.
    pub inline_styles: bool,
    pub island_prefix: String,
    pub error_route: String,
    /// Route prefix of the dev module-fetch protocol.
    pub module_route: String,
    pub root_tag: String,
    pub root_id: String,
    /// Application-wide teleport target. Empty disables it.
    pub teleport_tag: String,
    pub teleport_id: String,
    /// Client-only shell pages known to the pre-renderer (e.g. `/200.html`).
    pub spa_shell_routes: Vec<String>,
    pub route_rules: Vec<RouteRule>,
    /// Directories served as-is; modules found there skip transformation.
    pub static_dirs: Vec<PathBuf>,
    /// Module id of the server entry re-exporting the render function.
    pub server_entry: String,
    /// Client manifest key of the client entry chunk.
    pub client_entry: String,
    pub build_assets_dir: String,
    /// Module id prefix of page components, whose styles are never inlined
    /// into island responses.
    pub pages_dir: String,
    pub rebuild_debounce_ms: u64,
    /// Set from [`NO_SSR_ENV`] by [`SsrConfig::with_env_overrides`].
    pub no_ssr_env: bool,
}

impl Default for SsrConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::Dev,
            ssr: true,
            payload_extraction: false,
            payload_format: PayloadFormat::Json,
            early_hints: false,
            inline_styles: true,
            island_prefix: "/__zenith_island".into(),
            error_route: "/__zenith_error".into(),
            module_route: "/__zenith_ssr".into(),
            root_tag: "div".into(),
            root_id: "__zenith".into(),
            teleport_tag: "div".into(),
            teleport_id: "teleports".into(),
            spa_shell_routes: vec!["/200.html".into(), "/404.html".into()],
            route_rules: Vec::new(),
            static_dirs: Vec::new(),
            server_entry: "/src/entry-server.js".into(),
            client_entry: "src/entry-client.js".into(),
            build_assets_dir: "/_zenith/".into(),
            pages_dir: "/src/pages/".into(),
            rebuild_debounce_ms: 100,
            no_ssr_env: false,
        }
    }
}

impl SsrConfig {
    /// Parse a JSON configuration. Missing keys take their defaults.
    pub fn from_json_str(source: &str) -> Result<Self, SsrError> {
        let config: SsrConfig = serde_json::from_str(source)
            .map_err(|e| SsrError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SsrError> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            SsrError::Config(format!("failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&source)
    }

    /// Apply environment overrides on top of the loaded values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(NO_SSR_ENV) {
            self.no_ssr_env = is_truthy(&value);
        }
        self
    }

    pub fn is_dev(&self) -> bool {
        self.mode == BuildMode::Dev
    }

    fn validate(&self) -> Result<(), SsrError> {
        for (key, value) in [
            ("islandPrefix", &self.island_prefix),
            ("errorRoute", &self.error_route),
            ("moduleRoute", &self.module_route),
        ] {
            if !value.starts_with('/') {
                return Err(SsrError::Config(format!("{key} must start with '/', got '{value}'")));
            }
        }
        if self.root_tag.trim().is_empty() {
            return Err(SsrError::Config("rootTag must be non-empty".into()));
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no" | "off")
}
