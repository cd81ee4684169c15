//! Shared security helpers used by the ytcache binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. Both the backend and the
/// prefetch tool shell out to the downloader and write into the media tree,
/// so they are expected to run under a dedicated unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use a dedicated ytcache service account");
    }
    Ok(())
}
