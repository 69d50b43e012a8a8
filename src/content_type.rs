//! Response content-type inference: URL suffix first, payload sniff second.

/// MIME type for a URL with a known file suffix.
pub fn from_url_suffix(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    mime_guess::from_ext(ext)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Pick a content type for a text payload, honoring the URL suffix when one
/// is known: JSON-parseable strings are JSON, markup is HTML (or XML when
/// the URL says so), everything else is plain text.
pub fn infer_for_text(text: &str, url: Option<&str>) -> String {
    if let Some(mime) = url.and_then(from_url_suffix) {
        return mime;
    }
    if serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return "application/json".to_string();
    }
    if looks_like_markup(text) {
        if url.map(|u| u.ends_with(".xml")).unwrap_or(false) {
            return "application/xml".to_string();
        }
        return "text/html".to_string();
    }
    "text/plain".to_string()
}

fn looks_like_markup(text: &str) -> bool {
    match (text.find('<'), text.rfind('>')) {
        (Some(open), Some(close)) => open < close,
        _ => false,
    }
}
