//! Remote thumbnail fallback.
//!
//! The retrieval task writes a thumbnail alongside the media streams, but a
//! thumbnail request can arrive before any caching job ran (or after the
//! tool skipped it). In that case the image host is tried directly and the
//! first hit is cached next to the other artifacts.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::identity::VideoId;
use crate::store::MediaStore;

/// Candidate thumbnail filenames, best quality first.
const THUMBNAIL_CANDIDATES: &[&str] = &[
    "maxresdefault.jpg",
    "hq720.jpg",
    "sddefault.jpg",
    "hqdefault.jpg",
    "mqdefault.jpg",
    "default.jpg",
    "0.jpg",
    "1.jpg",
    "2.jpg",
    "3.jpg",
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a fetched image; anything larger is not a thumbnail.
const MAX_THUMBNAIL_BYTES: u64 = 8 * 1024 * 1024;

fn candidate_url(id: &VideoId, name: &str) -> String {
    format!("https://i.ytimg.com/vi/{id}/{name}")
}

/// Tries the candidates in order and caches the first success as
/// `thumbnail.jpg` in the identifier's artifact directory. Returns `None`
/// when no candidate exists remotely.
pub fn fetch_remote_thumbnail(store: &MediaStore, id: &VideoId) -> Result<Option<PathBuf>> {
    let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();

    for name in THUMBNAIL_CANDIDATES {
        let url = candidate_url(id, name);
        let response = match agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                tracing::debug!(%url, code, "thumbnail candidate not available");
                continue;
            }
            Err(err) => {
                tracing::info!(%url, error = %err, "thumbnail fetch failed, trying next candidate");
                continue;
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_THUMBNAIL_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading thumbnail body from {url}"))?;
        if bytes.is_empty() {
            continue;
        }

        let dir = store.artifact_dir(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating artifact directory {}", dir.display()))?;

        // Write-then-rename so a concurrent reader never sees a partial file.
        let tmp = dir.join(format!(".thumbnail.tmp-{}", std::process::id()));
        fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        let path = dir.join("thumbnail.jpg");
        fs::rename(&tmp, &path).with_context(|| format!("finalizing {}", path.display()))?;

        return Ok(Some(path));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    #[test]
    fn candidate_urls_are_ordered_by_quality() {
        let id = identity::resolve("abc12345678").unwrap();
        assert_eq!(
            candidate_url(&id, THUMBNAIL_CANDIDATES[0]),
            "https://i.ytimg.com/vi/abc12345678/maxresdefault.jpg"
        );
        assert_eq!(THUMBNAIL_CANDIDATES.first(), Some(&"maxresdefault.jpg"));
        assert_eq!(THUMBNAIL_CANDIDATES.last(), Some(&"3.jpg"));
    }
}
