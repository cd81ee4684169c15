//! Read-side view of the on-disk media cache.
//!
//! Every identifier owns one directory under the media root. Finalized
//! artifacts are named `video.<ext>`, `audio.<ext>`, `thumbnail.<ext>`; the
//! retrieval task assembles them in a hidden staging directory and renames
//! them into place, so anything this module observes is complete. Lookups
//! never create directories or files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::identity::VideoId;

/// One of the three files cached per identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Audio,
    Thumbnail,
}

impl ArtifactKind {
    /// File-name stem and URL slug for this kind.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Thumbnail => "thumbnail",
        }
    }

    /// Parses the slug used in `/media/{id}/{kind}` routes.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "thumbnail" => Some(Self::Thumbnail),
            _ => None,
        }
    }
}

/// Maps identifiers to artifact locations under a fixed media root.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every artifact for `id`. Deterministic; safe because
    /// the id grammar excludes path separators.
    pub fn artifact_dir(&self, id: &VideoId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Scratch directory the retrieval task downloads into before renaming
    /// files into [`Self::artifact_dir`]. Hidden so readers never match it.
    pub fn staging_dir(&self, id: &VideoId, job_ref: &str) -> PathBuf {
        self.artifact_dir(id).join(format!(".staging-{job_ref}"))
    }

    /// Returns the finalized artifact file for `id`/`kind`, or `None` when it
    /// does not exist yet. Zero-byte files are ignored so a corrupt artifact
    /// reads as a cache miss.
    pub fn find_artifact(&self, id: &VideoId, kind: ArtifactKind) -> Option<PathBuf> {
        newest_nonempty(&self.artifact_dir(id), kind.slug())
    }

    /// Ready means both media streams are present and non-empty. The
    /// thumbnail never gates readiness.
    pub fn is_ready(&self, id: &VideoId) -> bool {
        self.find_artifact(id, ArtifactKind::Video).is_some()
            && self.find_artifact(id, ArtifactKind::Audio).is_some()
    }
}

/// Picks the most recently modified non-empty `<stem>.*` file in `dir`.
///
/// The extension is decided by the downloader at runtime, and a failed
/// earlier attempt can leave an older file behind next to a fresh one, so the
/// newest candidate wins.
pub(crate) fn newest_nonempty(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let prefix = format!("{stem}.");
    let mut best: Option<(SystemTime, PathBuf)> = None;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) {
            continue;
        }

        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(time, _)| modified > *time) {
            best = Some((modified, entry.path()));
        }
    }

    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn id(raw: &str) -> VideoId {
        identity::resolve(raw).unwrap()
    }

    #[test]
    fn artifact_dir_is_keyed_by_id() {
        let store = MediaStore::new("/data/media");
        let dir = store.artifact_dir(&id("abc12345678"));
        assert_eq!(dir, PathBuf::from("/data/media/abc12345678"));
    }

    #[test]
    fn missing_directory_is_a_miss() {
        let temp = tempdir().unwrap();
        let store = MediaStore::new(temp.path());
        assert!(store.find_artifact(&id("abc12345678"), ArtifactKind::Video).is_none());
        assert!(!store.is_ready(&id("abc12345678")));
    }

    #[test]
    fn empty_files_do_not_count_as_cached() {
        let temp = tempdir().unwrap();
        let store = MediaStore::new(temp.path());
        let vid = id("abc12345678");
        let dir = store.artifact_dir(&vid);
        fs::create_dir_all(&dir).unwrap();
        File::create(dir.join("video.mp4")).unwrap();

        assert!(store.find_artifact(&vid, ArtifactKind::Video).is_none());
    }

    #[test]
    fn ready_requires_both_media_streams() {
        let temp = tempdir().unwrap();
        let store = MediaStore::new(temp.path());
        let vid = id("abc12345678");
        let dir = store.artifact_dir(&vid);
        fs::create_dir_all(&dir).unwrap();

        File::create(dir.join("video.mp4"))
            .unwrap()
            .write_all(b"video-bytes")
            .unwrap();
        assert!(!store.is_ready(&vid));

        File::create(dir.join("audio.m4a"))
            .unwrap()
            .write_all(b"audio-bytes")
            .unwrap();
        assert!(store.is_ready(&vid));
    }

    #[test]
    fn thumbnail_is_optional_for_readiness() {
        let temp = tempdir().unwrap();
        let store = MediaStore::new(temp.path());
        let vid = id("abc12345678");
        let dir = store.artifact_dir(&vid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("video.mp4"), b"v").unwrap();
        fs::write(dir.join("audio.m4a"), b"a").unwrap();

        assert!(store.is_ready(&vid));
        assert!(store.find_artifact(&vid, ArtifactKind::Thumbnail).is_none());
    }

    #[test]
    fn staging_directories_are_invisible_to_lookups() {
        let temp = tempdir().unwrap();
        let store = MediaStore::new(temp.path());
        let vid = id("abc12345678");
        let staging = store.staging_dir(&vid, "job-feedbeef");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("video.mp4"), b"half-written").unwrap();

        assert!(store.find_artifact(&vid, ArtifactKind::Video).is_none());
    }

    #[test]
    fn newest_nonempty_prefers_recent_files() {
        let temp = tempdir().unwrap();
        let dir = temp.path();
        fs::write(dir.join("video.webm"), b"old").unwrap();
        // Ensure a strictly newer mtime for the second file.
        let newer = dir.join("video.mp4");
        fs::write(&newer, b"new").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        File::options()
            .write(true)
            .open(&newer)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let picked = newest_nonempty(dir, "video").unwrap();
        assert_eq!(picked, newer);
    }
}
