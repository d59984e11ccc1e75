//! Character encoding of the root document.
//!
//! The page is decoded once for scanning and rewriting, then encoded back into
//! its own encoding so bytes outside the rewritten attributes survive.

use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::bytes::Regex;

/// How far into the document a `<meta>` charset declaration is looked for.
const PRESCAN_LIMIT: usize = 1024;

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_.:-]+)"#)
        .expect("meta charset pattern is valid")
});

#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    /// Encoding the bytes were read with.
    pub encoding: &'static Encoding,
}

/// BOM first, then the `Content-Type` charset, then a `<meta>` declaration
/// near the top of the document, then UTF-8.
pub fn detect(bytes: &[u8], content_type: Option<&str>) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }
    content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .and_then(|m| {
            m.get_param(mime::CHARSET)
                .and_then(|label| Encoding::for_label(label.as_str().as_bytes()))
        })
        .or_else(|| meta_charset(&bytes[..bytes.len().min(PRESCAN_LIMIT)]))
        .unwrap_or(UTF_8)
}

fn meta_charset(head: &[u8]) -> Option<&'static Encoding> {
    let label = META_CHARSET.captures(head)?.get(1)?.as_bytes();
    // A document that declares UTF-16 in ASCII markup is not UTF-16.
    Encoding::for_label(label).map(Encoding::output_encoding)
}

pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Decoded {
    let (text, encoding, had_errors) = detect(bytes, content_type).decode(bytes);
    if had_errors {
        tracing::warn!(encoding = encoding.name(), "document contains malformed byte sequences");
    }
    Decoded {
        text: text.into_owned(),
        encoding,
    }
}

/// Encodes `text` back into `encoding`. Characters the encoding cannot
/// represent become numeric character references. Encodings that cannot be
/// written (UTF-16) fall back to UTF-8 with a BOM so browsers still detect it.
pub fn encode(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    let (bytes, used, _) = encoding.encode(text);
    if used == encoding {
        return bytes.into_owned();
    }
    let mut out = Vec::with_capacity(bytes.len() + 3);
    out.extend_from_slice(b"\xEF\xBB\xBF");
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_16LE, WINDOWS_1252};

    const LATIN1_PAGE: &[u8] =
        b"<html><head><meta charset=\"iso-8859-1\"></head><body><p>caf\xE9</p></body></html>";

    #[test]
    fn meta_charset_is_honored() {
        let decoded = decode(LATIN1_PAGE, Some("text/html"));
        assert_eq!(decoded.encoding, WINDOWS_1252);
        assert!(decoded.text.contains("<p>café</p>"));
    }

    #[test]
    fn http_equiv_declaration_is_found() {
        let page = br#"<meta http-equiv="Content-Type" content="text/html; charset=windows-1252">"#;
        assert_eq!(detect(page, None), WINDOWS_1252);
    }

    #[test]
    fn content_type_wins_over_meta() {
        let page = b"<meta charset=\"utf-8\"><p>caf\xE9</p>";
        assert_eq!(detect(page, Some("text/html; charset=ISO-8859-1")), WINDOWS_1252);
        assert_eq!(detect(page, Some("text/html")), UTF_8);
    }

    #[test]
    fn defaults_to_utf8() {
        assert_eq!(detect(b"<p>hello</p>", None), UTF_8);
        assert_eq!(detect(b"<p>hello</p>", Some("not a mime type")), UTF_8);
    }

    #[test]
    fn meta_declaring_utf16_means_utf8() {
        assert_eq!(detect(b"<meta charset=utf-16>", None), UTF_8);
    }

    #[test]
    fn round_trip_keeps_original_bytes() {
        let decoded = decode(LATIN1_PAGE, None);
        assert_eq!(encode(&decoded.text, decoded.encoding), LATIN1_PAGE);
    }

    #[test]
    fn unrepresentable_characters_become_references() {
        assert_eq!(encode("a\u{2603}b", WINDOWS_1252), b"a&#9731;b");
    }

    #[test]
    fn utf16_is_written_back_as_utf8_with_bom() {
        let bytes = b"\xFF\xFEh\x00i\x00";
        let decoded = decode(bytes, None);
        assert_eq!(decoded.encoding, UTF_16LE);
        assert_eq!(decoded.text, "hi");
        assert_eq!(encode(&decoded.text, decoded.encoding), b"\xEF\xBB\xBFhi");
    }
}
