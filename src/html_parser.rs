use std::borrow::Cow;
use std::collections::VecDeque;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// `url(...)` values inside inline styles. Group 1 is the raw URL.
pub(crate) static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("CSS url() pattern is valid")
});

/// `rel` tokens that make a `<link>` a navigation hint rather than an asset.
const NAVIGATIONAL_RELS: &[&str] = &[
    "alternate",
    "author",
    "bookmark",
    "canonical",
    "dns-prefetch",
    "external",
    "help",
    "license",
    "me",
    "next",
    "pingback",
    "preconnect",
    "prev",
    "search",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Img,
    Link,
    Script,
    /// Any element carrying a `style` attribute with `url(...)` values.
    InlineStyle,
}

/// One asset URL found in the markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    pub element: ElementKind,
    pub attribute: &'static str,
    /// As written in the markup.
    pub raw_url: String,
    /// Absolute, fragment-free.
    pub resolved_url: Url,
}

#[derive(Clone)]
pub struct HtmlParser {
    page_url: Url,
}

impl HtmlParser {
    /// `page_url` is where the document was served from, after redirects.
    pub fn new(page_url: Url) -> Self {
        Self { page_url }
    }

    /// Parses a document. Never fails: malformed markup yields a best-effort
    /// tree and the parser's complaints end up in [`ParsedDocument::warnings`].
    pub fn parse(&self, html: &str) -> ParsedDocument {
        let dom = parse_document(RcDom::default(), Default::default()).one(html);
        let base_url = document_base(&dom.document, &self.page_url);
        ParsedDocument { dom, base_url }
    }

    /// Convenience for `parse(html).references().collect()`.
    pub fn extract_resources(&self, html: &str) -> Vec<AssetReference> {
        self.parse(html).references().collect()
    }
}

pub struct ParsedDocument {
    dom: RcDom,
    base_url: Url,
}

impl ParsedDocument {
    /// URL references resolve against: the first `<base href>` if it is
    /// usable, otherwise the page URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn warnings(&self) -> &[Cow<'static, str>] {
        &self.dom.errors
    }

    /// Asset references in document order. Each call starts a fresh walk.
    pub fn references(&self) -> References<'_> {
        References {
            base_url: &self.base_url,
            stack: vec![self.dom.document.clone()],
            pending: VecDeque::new(),
        }
    }
}

fn document_base(document: &Handle, page_url: &Url) -> Url {
    descendants(document)
        .iter()
        .filter(|node| element_name(node).as_deref() == Some("base"))
        .find_map(|node| attribute(node, "href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or_else(|| page_url.clone())
}

/// Lazy depth-first walk over the parsed tree.
pub struct References<'a> {
    base_url: &'a Url,
    stack: Vec<Handle>,
    pending: VecDeque<AssetReference>,
}

impl Iterator for References<'_> {
    type Item = AssetReference;

    fn next(&mut self) -> Option<AssetReference> {
        loop {
            if let Some(reference) = self.pending.pop_front() {
                return Some(reference);
            }
            let node = self.stack.pop()?;
            self.stack
                .extend(node.children.borrow().iter().rev().cloned());
            self.collect_from(&node);
        }
    }
}

impl References<'_> {
    fn collect_from(&mut self, node: &Handle) {
        let Some(tag) = element_name(node) else {
            return;
        };

        let primary = match tag.as_str() {
            "img" => Some((ElementKind::Img, "src")),
            "script" => Some((ElementKind::Script, "src")),
            "link" if is_asset_link(attribute(node, "rel").as_deref()) => {
                Some((ElementKind::Link, "href"))
            }
            _ => None,
        };
        if let Some((element, name)) = primary {
            if let Some(raw) = attribute(node, name) {
                self.push(element, name, raw);
            }
        }

        if let Some(style) = attribute(node, "style") {
            for cap in CSS_URL.captures_iter(&style) {
                self.push(ElementKind::InlineStyle, "style", cap[1].to_string());
            }
        }
    }

    fn push(&mut self, element: ElementKind, attribute: &'static str, raw_url: String) {
        if let Some(resolved_url) = resolve_reference(self.base_url, &raw_url) {
            self.pending.push_back(AssetReference {
                element,
                attribute,
                raw_url,
                resolved_url,
            });
        }
    }
}

/// Resolves a reference as written in markup against the page URL.
///
/// Returns `None` for empty and fragment-only references and anything that
/// does not resolve to `http`/`https`.
pub fn resolve_reference(base_url: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let mut resolved = base_url.join(raw).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// `<link>` elements without `rel`, or with at least one non-navigational
/// `rel` token (stylesheet, icon, preload, manifest...), are assets.
pub fn is_asset_link(rel: Option<&str>) -> bool {
    let Some(rel) = rel else {
        return true;
    };
    let mut tokens = rel.split_ascii_whitespace().peekable();
    if tokens.peek().is_none() {
        return true;
    }
    tokens.any(|token| {
        !NAVIGATIONAL_RELS
            .iter()
            .any(|nav| nav.eq_ignore_ascii_case(token))
    })
}

pub(crate) fn element_name(node: &Handle) -> Option<String> {
    match node.data {
        NodeData::Element { ref name, .. } => Some(name.local.as_ref().to_ascii_lowercase()),
        _ => None,
    }
}

pub(crate) fn attribute(node: &Handle, name: &str) -> Option<String> {
    match node.data {
        NodeData::Element { ref attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|attr| attr.name.local.as_ref().eq_ignore_ascii_case(name))
            .map(|attr| attr.value.to_string()),
        _ => None,
    }
}

/// Every element below `root`, in document order.
pub(crate) fn descendants(root: &Handle) -> Vec<Handle> {
    let mut out = Vec::new();
    let mut stack: Vec<Handle> = root.children.borrow().iter().rev().cloned().collect();
    while let Some(node) = stack.pop() {
        stack.extend(node.children.borrow().iter().rev().cloned());
        if matches!(node.data, NodeData::Element { .. }) {
            out.push(node);
        }
    }
    out
}
