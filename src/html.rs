//! Minimal HTML node tree.
//!
//! Island slot and teleport rewriting operate on this tree instead of on
//! string offsets. The parser is lenient: unknown closing tags are dropped,
//! unclosed elements are closed at end of input, and text and attribute
//! values are kept verbatim so that `serialize(parse(html)) == html` for
//! well-formed, double-quoted markup.

use crate::utils::unescape_html;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// A node in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    Doctype(String),
}

/// An attribute. `raw` holds the value exactly as written (entities kept).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }

    /// Decoded attribute value. Boolean attributes yield an empty string.
    pub fn attr(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.raw.as_deref().map(unescape_html).unwrap_or_default())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Set (or replace) an attribute from a decoded value.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        let raw = Some(escape_attr(value));
        match self.attrs.iter_mut().find(|a| a.name.eq_ignore_ascii_case(name)) {
            Some(attr) => attr.raw = raw,
            None => self.attrs.push(Attribute {
                name: name.to_string(),
                raw,
            }),
        }
    }

    /// Remove an attribute, returning its decoded value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self
            .attrs
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))?;
        let attr = self.attrs.remove(index);
        Some(attr.raw.as_deref().map(unescape_html).unwrap_or_default())
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn inner_html(&self) -> String {
        serialize(&self.children)
    }

    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out);
        out
    }
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an HTML fragment into a list of top-level nodes.
pub fn parse(input: &str) -> Vec<Node> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        stack: Vec::new(),
        roots: Vec::new(),
    };
    parser.run();
    parser.roots
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    stack: Vec<Element>,
    roots: Vec<Node>,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn push_node(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    fn run(&mut self) {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                let body = &rest[4..];
                let (content, consumed) = match body.find("-->") {
                    Some(end) => (&body[..end], 4 + end + 3),
                    None => (body, rest.len()),
                };
                self.push_node(Node::Comment(content.to_string()));
                self.pos += consumed;
            } else if rest.starts_with("<!") {
                let (content, consumed) = match rest.find('>') {
                    Some(end) => (&rest[2..end], end + 1),
                    None => (&rest[2..], rest.len()),
                };
                self.push_node(Node::Doctype(content.to_string()));
                self.pos += consumed;
            } else if rest.starts_with("</") {
                self.close_tag();
            } else if rest.starts_with('<')
                && rest[1..].chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            {
                self.open_tag();
            } else {
                let first = rest.chars().next().map_or(1, char::len_utf8);
                let end = rest[first..]
                    .find('<')
                    .map(|i| i + first)
                    .unwrap_or(rest.len());
                self.push_text(&rest[..end]);
                self.pos += end;
            }
        }
        while !self.stack.is_empty() {
            self.pop_element();
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(existing)) = self
            .stack
            .last_mut()
            .map(|e| &mut e.children)
            .unwrap_or(&mut self.roots)
            .last_mut()
        {
            existing.push_str(text);
            return;
        }
        self.push_node(Node::Text(text.to_string()));
    }

    fn pop_element(&mut self) {
        if let Some(element) = self.stack.pop() {
            self.push_node(Node::Element(element));
        }
    }

    fn close_tag(&mut self) {
        let rest = self.rest();
        let end = rest.find('>').unwrap_or(rest.len());
        let name = rest[2..end].trim().to_ascii_lowercase();
        self.pos += (end + 1).min(rest.len());

        if let Some(depth) = self.stack.iter().rposition(|e| e.name == name) {
            while self.stack.len() > depth {
                self.pop_element();
            }
        }
    }

    fn open_tag(&mut self) {
        self.pos += 1;
        let name = self.take_while(|c| !c.is_whitespace() && c != '>' && c != '/');
        let mut element = Element::new(name.to_ascii_lowercase());
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if rest.starts_with("/>") {
                self_closing = true;
                self.pos += 2;
                break;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.starts_with('/') {
                self.pos += 1;
                continue;
            }
            let attr_name =
                self.take_while(|c| !c.is_whitespace() && c != '=' && c != '>' && c != '/');
            if attr_name.is_empty() {
                self.pos += rest.chars().next().map_or(1, char::len_utf8);
                continue;
            }
            self.skip_whitespace();
            let raw = if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                Some(self.attr_value())
            } else {
                None
            };
            element.attrs.push(Attribute {
                name: attr_name.to_string(),
                raw,
            });
        }

        if self_closing || element.is_void() {
            self.push_node(Node::Element(element));
            return;
        }

        if RAW_TEXT_ELEMENTS.contains(&element.name.as_str()) {
            let closing = format!("</{}", element.name);
            let rest = self.rest();
            let end = find_ascii_case_insensitive(rest, &closing).unwrap_or(rest.len());
            if end > 0 {
                element.children.push(Node::Text(rest[..end].to_string()));
            }
            self.pos += end;
            let rest = self.rest();
            self.pos += rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
            self.push_node(Node::Element(element));
            return;
        }

        self.stack.push(element);
    }

    fn attr_value(&mut self) -> String {
        let rest = self.rest();
        match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &rest[1..];
                let end = body.find(quote).unwrap_or(body.len());
                self.pos += 1 + end + usize::from(end < body.len());
                body[..end].to_string()
            }
            _ => self
                .take_while(|c| !c.is_whitespace() && c != '>')
                .to_string(),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !pred(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize nodes back to HTML.
pub fn serialize(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(node, &mut out);
    }
    out
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Element(element) => write_element(element, out),
        Node::Text(text) => out.push_str(text),
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        Node::Doctype(text) => {
            out.push_str("<!");
            out.push_str(text);
            out.push('>');
        }
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for attr in &element.attrs {
        out.push(' ');
        out.push_str(&attr.name);
        if let Some(raw) = &attr.raw {
            out.push_str("=\"");
            out.push_str(&raw.replace('"', "&quot;"));
            out.push('"');
        }
    }
    out.push('>');
    if element.is_void() {
        return;
    }
    for child in &element.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

/// Remove every comment matching `pred`, recursively.
pub fn strip_comments(nodes: &mut Vec<Node>, pred: &dyn Fn(&str) -> bool) {
    nodes.retain(|node| !matches!(node, Node::Comment(text) if pred(text)));
    for node in nodes.iter_mut() {
        if let Node::Element(element) = node {
            strip_comments(&mut element.children, pred);
        }
    }
}

/// Whether a node list contains nothing but whitespace text.
pub fn is_blank(nodes: &[Node]) -> bool {
    nodes
        .iter()
        .all(|node| matches!(node, Node::Text(text) if text.trim().is_empty()))
}
