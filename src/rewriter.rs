//! Streams the root document through `lol_html`, swapping asset references
//! for their mirrored location. Bytes outside the touched attributes pass
//! through unchanged.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicUsize, Ordering};

use lol_html::{element, HtmlRewriter, Settings};
use regex::Captures;
use url::Url;

use crate::error::RewriteError;
use crate::html_parser::{is_asset_link, resolve_reference, CSS_URL};

#[derive(Debug, Clone)]
pub struct Rewritten {
    pub html: String,
    /// Number of attribute values replaced.
    pub replaced: usize,
}

/// Rewrites every asset reference whose resolved URL is a key of
/// `replacements` to the mapped value.
///
/// Callers map succeeded assets to their local href and failed ones to their
/// absolute URL; references without an entry are left alone.
pub fn rewrite(
    html: &str,
    base_url: &Url,
    replacements: &HashMap<Url, String>,
) -> Result<Rewritten, RewriteError> {
    let mut output = Vec::with_capacity(html.len());
    let replaced = AtomicUsize::new(0);

    let lookup = |raw: &str| -> Option<String> {
        let decoded = html_escape::decode_html_entities(raw);
        resolve_reference(base_url, &decoded).and_then(|url| replacements.get(&url).cloned())
    };

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                // Local hrefs are relative to the mirrored file, not the remote base.
                element!("base[href]", |el| {
                    el.remove_attribute("href");
                    Ok(())
                }),
                element!("img[src]", |el| {
                    if let Some(local) = el.get_attribute("src").as_deref().and_then(&lookup) {
                        el.set_attribute("src", &local)?;
                        replaced.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }),
                element!("script[src]", |el| {
                    if let Some(local) = el.get_attribute("src").as_deref().and_then(&lookup) {
                        el.set_attribute("src", &local)?;
                        replaced.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }),
                element!("link[href]", |el| {
                    if !is_asset_link(el.get_attribute("rel").as_deref()) {
                        return Ok(());
                    }
                    if let Some(local) = el.get_attribute("href").as_deref().and_then(&lookup) {
                        el.set_attribute("href", &local)?;
                        replaced.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }),
                element!("[style]", |el| {
                    let Some(style) = el.get_attribute("style") else {
                        return Ok(());
                    };
                    let style = html_escape::decode_html_entities(&style).into_owned();
                    let mut hits = 0;
                    let updated = CSS_URL.replace_all(&style, |caps: &Captures| {
                        match lookup(&caps[1]).and_then(|local| splice_url(caps, &local)) {
                            Some(spliced) => {
                                hits += 1;
                                spliced
                            }
                            None => caps[0].to_string(),
                        }
                    });
                    if hits > 0 {
                        el.set_attribute("style", &updated)?;
                        replaced.fetch_add(hits, Ordering::Relaxed);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter.write(html.as_bytes())?;
    rewriter.end()?;

    Ok(Rewritten {
        html: String::from_utf8(output)?,
        replaced: replaced.into_inner(),
    })
}

/// Replaces the URL group of a `url(...)` match, keeping quotes and spacing.
fn splice_url(caps: &Captures, local: &str) -> Option<String> {
    let whole = caps.get(0)?;
    let url = caps.get(1)?;
    let start = url.start() - whole.start();
    let end = url.end() - whole.start();
    let text = whole.as_str();
    Some(format!("{}{}{}", &text[..start], local, &text[end..]))
}

/// Href from the document at `from_document` to the file at `to_file`,
/// with `/` separators and each segment percent-encoded.
pub fn relative_href(from_document: &Path, to_file: &Path) -> Option<String> {
    let from_dir = from_document.parent()?;
    let relative = pathdiff::diff_paths(to_file, from_dir)?;
    let segments: Vec<String> = relative
        .components()
        .map(|component| match component {
            Component::ParentDir => Some("..".to_string()),
            Component::CurDir => Some(".".to_string()),
            Component::Normal(part) => Some(urlencoding::encode(&part.to_string_lossy()).into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    Some(segments.join("/"))
}
