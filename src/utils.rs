//! Utility functions for the runtime.
//!
//! - Module id encodings (virtual prefix, `/@id/` wrapping, query markers)
//! - Built-in module detection and forwarding code
//! - Import scanning for prebuilt bundles
//! - HTML/JS escaping and code frames

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

// ---------------------------------------------------------------------------
// Module IDs
// ---------------------------------------------------------------------------

/// Prefix marking id-encoded virtual modules that never hit the filesystem.
pub const VIRTUAL_PREFIX: &str = "\0";

/// URL prefix under which non-URL-safe ids are requested.
pub const ID_PREFIX: &str = "/@id/";

/// Stand-in for the `\0` virtual prefix inside URLs.
pub const NULL_BYTE_PLACEHOLDER: &str = "__x00__";

/// Turn a requested URL back into a module id.
pub fn unwrap_id(url: &str) -> String {
    let id = url.strip_prefix(ID_PREFIX).unwrap_or(url);
    id.replace(NULL_BYTE_PLACEHOLDER, VIRTUAL_PREFIX)
}

/// Turn a module id into a URL-safe request path.
pub fn wrap_id(id: &str) -> String {
    if id.starts_with(ID_PREFIX) {
        return id.to_string();
    }
    if let Some(rest) = id.strip_prefix(VIRTUAL_PREFIX) {
        return format!("{ID_PREFIX}{NULL_BYTE_PLACEHOLDER}{rest}");
    }
    id.to_string()
}

/// Check if a module id is a virtual module.
pub fn is_virtual(id: &str) -> bool {
    id.starts_with(VIRTUAL_PREFIX) || id.starts_with(ID_PREFIX)
}

/// Split an id into its path and query string (without `?`).
pub fn split_query(id: &str) -> (&str, Option<&str>) {
    match id.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (id, None),
    }
}

/// The id with query and hash removed, as used for filesystem lookups.
pub fn clean_url(id: &str) -> &str {
    let end = id.find(['?', '#']).unwrap_or(id.len());
    &id[..end]
}

/// Variant directives carried in a module id's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// `?raw`: import the file contents as a string.
    pub raw: bool,
    /// `?inline`: inline the processed asset.
    pub inline: bool,
    /// `?url`: import the public URL of the asset.
    pub url: bool,
    /// Everything else, in order of appearance.
    pub other: IndexMap<String, String>,
}

impl QueryFlags {
    pub fn parse(id: &str) -> Self {
        let mut flags = QueryFlags::default();
        let Some(query) = split_query(id).1 else {
            return flags;
        };
        for (key, value) in parse_query(query) {
            match key.as_str() {
                "raw" => flags.raw = true,
                "inline" => flags.inline = true,
                "url" => flags.url = true,
                _ => {
                    flags.other.insert(key, value);
                }
            }
        }
        flags
    }

    /// Whether the id requests a non-executable variant of the file.
    pub fn is_asset_variant(&self) -> bool {
        self.raw || self.inline || self.url
    }
}

/// Parse a `key=value&...` query string. Later keys overwrite earlier ones.
pub fn parse_query(query: &str) -> IndexMap<String, String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Encode a module id for use as a single URL path segment.
pub fn encode_path_segment(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

/// Inverse of [`encode_path_segment`].
pub fn decode_path_segment(segment: &str) -> String {
    url::form_urlencoded::parse(segment.as_bytes())
        .next()
        .map(|(key, value)| {
            if value.is_empty() {
                key.into_owned()
            } else {
                format!("{key}={value}")
            }
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Built-in modules
// ---------------------------------------------------------------------------

const BUILTIN_PREFIX: &str = "node:";

const BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "crypto", "events", "fs",
    "fs/promises", "http", "https", "module", "net", "os", "path", "process",
    "querystring", "stream", "string_decoder", "timers", "tty", "url", "util", "vm",
    "worker_threads", "zlib",
];

/// Check if an id refers to a runtime built-in module.
pub fn is_builtin(id: &str) -> bool {
    id.starts_with(BUILTIN_PREFIX) || BUILTINS.contains(&id)
}

/// Canonical `node:`-prefixed form of a built-in id.
pub fn normalize_builtin(id: &str) -> String {
    if id.starts_with(BUILTIN_PREFIX) {
        id.to_string()
    } else {
        format!("{BUILTIN_PREFIX}{id}")
    }
}

/// Forwarding module for a built-in: dynamically imports the built-in and
/// re-exports its named bindings plus `default`, rethrowing load failures
/// tagged with the original id.
pub fn builtin_wrapper_code(id: &str) -> String {
    let specifier = escape_js_string(&normalize_builtin(id));
    let original = escape_js_string(id);
    format!(
        r#"let __builtin;
try {{
  __builtin = await __zenith_dynamic_import__("{specifier}");
}} catch (error) {{
  throw new Error("Failed to load built-in module '{original}': " + (error && error.message), {{ cause: error }});
}}
for (const key of Object.keys(__builtin)) {{
  if (key !== "default") __zenith_exports__[key] = __builtin[key];
}}
__zenith_exports__.default = "default" in __builtin ? __builtin.default : __builtin;
"#
    )
}

// ---------------------------------------------------------------------------
// Import scanning
// ---------------------------------------------------------------------------

fn static_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[\w*{}\s,$]+?\s+from\s+)?["']([^"']+)["']"#)
            .expect("static import regex")
    })
}

fn dynamic_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bimport\(\s*["']([^"']+)["']\s*\)"#).expect("dynamic import regex")
    })
}

/// Collect static and dynamic import specifiers, deduplicated in order of
/// first appearance.
pub fn scan_imports(code: &str) -> (Vec<String>, Vec<String>) {
    let mut statics: Vec<String> = Vec::new();
    for cap in static_import_re().captures_iter(code) {
        let spec = cap[1].to_string();
        if !statics.contains(&spec) {
            statics.push(spec);
        }
    }
    let mut dynamics: Vec<String> = Vec::new();
    for cap in dynamic_import_re().captures_iter(code) {
        let spec = cap[1].to_string();
        if !statics.contains(&spec) && !dynamics.contains(&spec) {
            dynamics.push(spec);
        }
    }
    (statics, dynamics)
}

/// Resolve a relative specifier against the importer's id.
/// Bare specifiers are returned unchanged.
pub fn join_specifier(specifier: &str, importer: Option<&str>) -> String {
    if !(specifier.starts_with("./") || specifier.starts_with("../")) {
        return specifier.to_string();
    }
    let base = importer.map(clean_url).unwrap_or("/");
    let dir = match base.rfind('/') {
        Some(pos) => &base[..pos],
        None => "",
    };
    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for part in specifier.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe embedding inside a JS double-quoted string literal.
pub fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

/// Escape text content for HTML.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Decode the entities produced by [`escape_html`].
pub fn unescape_html(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Make serialized JSON safe to embed inside a `<script>` element.
pub fn escape_json_for_script(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Render a code frame around a 1-based `line` and 0-based `column`.
pub fn code_frame(source: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if line == 0 || line > lines.len() {
        return String::new();
    }
    let start = line.saturating_sub(3);
    let end = (line + 2).min(lines.len());
    let width = end.to_string().len();

    let mut frame = String::new();
    for (index, text) in lines.iter().enumerate().take(end).skip(start) {
        let number = index + 1;
        let marker = if number == line { '>' } else { ' ' };
        frame.push_str(&format!("{marker} {number:>width$} | {text}\n"));
        if number == line {
            frame.push_str(&format!("  {:>width$} | {}^\n", "", " ".repeat(column)));
        }
    }
    frame
}

/// Deterministic 8-hex-digit hash of a string.
pub fn stable_hash_8(content: &str) -> String {
    let mut hash: i32 = 0;
    for byte in content.bytes() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(byte as i32);
    }
    let normalized = hash.wrapping_abs() as u32;
    format!("{normalized:08x}")
}

/// Join a base path and a relative asset path with exactly one `/`.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() {
        format!("/{path}")
    } else {
        format!("{base}/{path}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
