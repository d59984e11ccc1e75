//! Maps resolved asset URLs onto the on-disk mirror layout.
//!
//! Layout is host + path: `<host>[_<port>]/<segments...>/<file>`. Directory
//! style paths get [`DEFAULT_FILENAME`]. A query string is folded into the
//! file name as a stable hash so `app.js?v=1` and `app.js?v=2` stay apart.
//! Mapping is pure: no I/O, same input always gives the same [`LocalPath`].

use std::borrow::Cow;
use std::path::PathBuf;

use serde::Serialize;
use url::{Position, Url};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::MappingError;

pub const DEFAULT_FILENAME: &str = "index.html";

/// Linux NAME_MAX.
const NAME_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Style,
    Script,
    Image,
    Other,
}

impl AssetCategory {
    /// Guesses the category from the path extension.
    pub fn from_url(url: &Url) -> Self {
        match mime_guess::from_path(url.path()).first() {
            Some(m) if m.type_() == mime::IMAGE => AssetCategory::Image,
            Some(m) if m.subtype() == mime::CSS => AssetCategory::Style,
            Some(m) if m.subtype() == mime::JAVASCRIPT => AssetCategory::Script,
            _ => AssetCategory::Other,
        }
    }
}

/// Location of an asset relative to the output root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPath {
    segments: Vec<String>,
    category: AssetCategory,
}

impl LocalPath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn category(&self) -> AssetCategory {
        self.category
    }

    /// Relative filesystem path, to be joined onto the output root.
    pub fn to_path_buf(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl std::fmt::Display for LocalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Maps a resolved URL to its place in the mirror.
///
/// Only `http`/`https` URLs with a host can be mapped. Traversal segments never
/// survive: dot-only segments are escaped and decoded separators are replaced,
/// so every result stays below the host directory.
pub fn map_url(url: &Url) -> Result<LocalPath, MappingError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(MappingError::UnsupportedScheme(other.to_string())),
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(MappingError::MissingHost)?;

    let (mut host_dir, _) = sanitize_segment(host);
    if let Some(port) = url.port() {
        host_dir = format!("{host_dir}_{port}");
    }

    let mut segments = vec![fit_name_max(host_dir)];
    let raw: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let (file, dirs) = match raw.split_last() {
        Some((file, dirs)) => (*file, dirs),
        None => ("", &[][..]),
    };

    // Set when the on-disk name no longer identifies the URL path on its own.
    let mut altered = false;
    for dir in dirs {
        if dir.is_empty() {
            altered = true;
            continue;
        }
        let (name, changed) = sanitize_segment(dir);
        altered |= changed;
        segments.push(fit_name_max(name));
    }

    let mut file = if file.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        let (name, changed) = sanitize_segment(file);
        altered |= changed;
        name
    };
    let disambiguator = if altered {
        Some(&url[Position::BeforePath..Position::AfterQuery])
    } else {
        url.query()
    };
    if let Some(key) = disambiguator {
        file = with_hash_suffix(&file, key);
    }
    segments.push(fit_name_max(file));

    Ok(LocalPath {
        segments,
        category: AssetCategory::from_url(url),
    })
}

/// Percent-decodes one path segment and makes it safe as a file name.
///
/// The flag is set when the result is lossy: invalid UTF-8, replaced
/// characters, or an escaped dot-only name.
fn sanitize_segment(raw: &str) -> (String, bool) {
    let bytes = urlencoding::decode_binary(raw.as_bytes());
    let decoded = String::from_utf8_lossy(&bytes);
    let mut altered = matches!(decoded, Cow::Owned(_));

    let cleaned: String = decoded
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                altered = true;
                '_'
            }
            c if c.is_control() => {
                altered = true;
                '_'
            }
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        return ("_".to_string(), true);
    }
    // `.` and `..` must never reach the filesystem as path components.
    if cleaned.chars().all(|c| c == '.') {
        return (cleaned.replace('.', "%2E"), true);
    }
    (cleaned, altered)
}

/// Inserts a hash of `key` before the extension: `app.js` -> `app-<hash>.js`.
fn with_hash_suffix(file: &str, key: &str) -> String {
    let hash = xxh3_64(key.as_bytes());
    let (stem, ext) = split_extension(file);
    format!("{stem}-{hash:016x}{ext}")
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Truncates over-long names, keeping the extension and adding a hash of the
/// full name so truncated siblings stay distinct.
fn fit_name_max(name: String) -> String {
    if name.len() <= NAME_MAX {
        return name;
    }
    let hash = xxh3_64(name.as_bytes());
    let (stem, ext) = split_extension(&name);
    let ext = if ext.len() > 32 { "" } else { ext };
    let budget = NAME_MAX - ext.len() - 17;
    let mut take = budget.min(stem.len());
    while take > 0 && !stem.is_char_boundary(take) {
        take -= 1;
    }
    format!("{}-{hash:016x}{ext}", &stem[..take])
}
