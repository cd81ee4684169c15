//! Canonicalizes the many shapes a video reference arrives in.
//!
//! Everything downstream (artifact directories, ledger rows) is keyed by the
//! canonical 11-character id, so resolution is strict: an input either yields
//! a validated [`VideoId`] or fails with `InvalidIdentifier`. Resolution is
//! pure string work, no network and no filesystem.

use std::fmt;

use crate::error::CacheError;

/// Length of a canonical video id.
pub const ID_LEN: usize = 11;

/// URL path fragments that are immediately followed by a video id.
const PATH_MARKERS: &[&str] = &["youtu.be/", "/shorts/", "/embed/", "/watch/", "/live/"];

/// A validated canonical video identifier.
///
/// The inner string is guaranteed to match `[A-Za-z0-9_-]{11}`, which makes it
/// safe to use as a filesystem path segment and as a ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VideoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolves a bare id, a watch/short/embed URL, or a `v=`/`video_id=` query
/// form into a canonical [`VideoId`].
pub fn resolve(input: &str) -> Result<VideoId, CacheError> {
    let trimmed = input.trim();

    if is_canonical(trimmed) {
        return Ok(VideoId(trimmed.to_owned()));
    }

    if let Some(id) = query_param_id(trimmed).or_else(|| path_segment_id(trimmed)) {
        return Ok(VideoId(id));
    }

    Err(CacheError::InvalidIdentifier(input.to_owned()))
}

/// True when `candidate` already is a canonical id.
fn is_canonical(candidate: &str) -> bool {
    candidate.len() == ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Extracts the id from `?v=` or `?video_id=` query parameters.
fn query_param_id(input: &str) -> Option<String> {
    let (_, query) = input.split_once('?')?;

    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=')
            && matches!(key, "v" | "video_id")
        {
            let candidate = value.split('#').next().unwrap_or(value);
            if is_canonical(candidate) {
                return Some(candidate.to_owned());
            }
        }
    }

    None
}

/// Extracts the id from path-style URLs (`youtu.be/<id>`, `/shorts/<id>`,
/// `/embed/<id>`, `/watch/<id>`, `/live/<id>`).
fn path_segment_id(input: &str) -> Option<String> {
    for marker in PATH_MARKERS {
        if let Some(pos) = input.find(marker) {
            let rest = &input[pos + marker.len()..];
            let candidate: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if is_canonical(&candidate) {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_id() {
        let id = resolve("wLp_c3M-nPA").unwrap();
        assert_eq!(id.as_str(), "wLp_c3M-nPA");
    }

    #[test]
    fn resolves_bare_id_with_whitespace() {
        let id = resolve("  wLp_c3M-nPA\n").unwrap();
        assert_eq!(id.as_str(), "wLp_c3M-nPA");
    }

    #[test]
    fn all_url_forms_resolve_to_the_same_id() {
        let forms = [
            "wLp_c3M-nPA",
            "https://www.youtube.com/watch?v=wLp_c3M-nPA",
            "https://www.youtube.com/watch?feature=shared&v=wLp_c3M-nPA",
            "https://youtu.be/wLp_c3M-nPA",
            "https://youtu.be/wLp_c3M-nPA?t=42",
            "https://www.youtube.com/shorts/wLp_c3M-nPA",
            "https://www.youtube.com/embed/wLp_c3M-nPA",
            "https://www.youtube.com/live/wLp_c3M-nPA",
            "/watch/wLp_c3M-nPA",
            "/watch?video_id=wLp_c3M-nPA",
        ];

        for form in forms {
            let id = resolve(form).unwrap_or_else(|_| panic!("failed to resolve {form}"));
            assert_eq!(id.as_str(), "wLp_c3M-nPA", "input {form}");
        }
    }

    #[test]
    fn rejects_malformed_inputs() {
        let inputs = [
            "",
            "not a url",
            "short",
            "exactly-12-ch",
            "bad!chars$$",
            "https://example.com/page",
            "https://www.youtube.com/watch?v=tooshort",
            "https://www.youtube.com/watch?list=PLabcdefghij",
        ];

        for input in inputs {
            assert!(
                matches!(resolve(input), Err(CacheError::InvalidIdentifier(_))),
                "expected rejection for {input:?}"
            );
        }
    }

    #[test]
    fn query_id_stops_at_fragment() {
        let id = resolve("https://www.youtube.com/watch?v=wLp_c3M-nPA#t=1").unwrap();
        assert_eq!(id.as_str(), "wLp_c3M-nPA");
    }

    #[test]
    fn path_id_stops_at_delimiters() {
        let id = resolve("https://youtu.be/abc12345678?si=xyz").unwrap();
        assert_eq!(id.as_str(), "abc12345678");
    }
}
