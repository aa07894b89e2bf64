//! Turns downloaded manifests into locally addressable ones.
//!
//! Every fetched resource is stored under a path mirroring its remote
//! `<host>/<path>`, so dropping the `http://` and `https://` prefixes is
//! enough to turn absolute references into relative ones.

use std::{borrow::Cow, path::Path};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::{error::HozonResult, util::write_atomic};

static URI_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"URI="([^"]*)""#).unwrap());

const SCHEMES: [&str; 2] = ["https://", "http://"];

/// Remove every `http://` and `https://` occurrence. Line structure is untouched.
pub fn strip_schemes(text: &str) -> Cow<'_, str> {
    if !SCHEMES.iter().any(|s| text.contains(s)) {
        return Cow::Borrowed(text);
    }

    let mut result = text.to_string();
    for scheme in SCHEMES {
        result = result.replace(scheme, "");
    }
    Cow::Owned(result)
}

/// Resolve every relative URI line and `URI="..."` attribute against `base`.
///
/// Used for manifests stored outside the mirrored tree, whose relative
/// references would otherwise stop resolving once moved.
pub fn qualify_uris(text: &str, base: &Url) -> String {
    let mut result = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (content, ending) = split_line_ending(line);
        if content.starts_with('#') {
            let qualified = URI_ATTRIBUTE.replace_all(content, |c: &Captures| {
                format!(r#"URI="{}""#, qualify(&c[1], base))
            });
            result.push_str(&qualified);
        } else if content.trim().is_empty() {
            result.push_str(content);
        } else {
            result.push_str(&qualify(content.trim(), base));
        }
        result.push_str(ending);
    }
    result
}

fn qualify(uri: &str, base: &Url) -> String {
    match base.join(uri) {
        Ok(url) => url.to_string(),
        Err(e) => {
            log::warn!("Keeping unresolvable uri {uri}: {e}");
            uri.to_string()
        }
    }
}

fn split_line_ending(line: &str) -> (&str, &str) {
    let content = line.trim_end_matches(['\r', '\n']);
    (content, &line[content.len()..])
}

/// Produce the local form of a manifest's text.
pub fn rewrite_text<'a>(text: &'a str, qualify_against: Option<&Url>) -> Cow<'a, str> {
    match qualify_against {
        Some(base) => Cow::Owned(strip_schemes(&qualify_uris(text, base)).into_owned()),
        None => strip_schemes(text),
    }
}

/// Rewrite the manifest at `path` in place.
///
/// Returns `false` when the file already was in its local form, in which
/// case it is not touched at all.
pub fn rewrite_manifest(path: &Path, qualify_against: Option<&Url>) -> HozonResult<bool> {
    let text = std::fs::read_to_string(path)?;
    let rewritten = rewrite_text(&text, qualify_against);
    if rewritten == text {
        return Ok(false);
    }

    write_atomic(path, rewritten.as_bytes())?;
    Ok(true)
}
