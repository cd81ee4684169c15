#![forbid(unsafe_code)]

//! Warms the media cache from the command line, without the HTTP server.
//!
//! Goes through the same ledger and retrieval path as the backend, so a
//! concurrently running server sees the claims and never duplicates work.
//! Useful for seeding a cache before exposing it, or from cron.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use ytcache_tools::{
    config,
    identity,
    ledger::{JobLedger, SqliteLedger},
    queue, retrieval,
    security::ensure_not_root,
    store::MediaStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Warm the media cache for one or more videos.")]
struct Cli {
    /// Video ids or URLs in any recognized form.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Override the media root directory.
    #[arg(long, value_name = "PATH")]
    media_root: Option<PathBuf>,

    /// Override the job ledger database path.
    #[arg(long, value_name = "PATH")]
    state_db: Option<PathBuf>,

    /// Read settings from an alternative env file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    ensure_not_root("prefetch")?;
    retrieval::ensure_downloader_available()?;

    let runtime = match &cli.config {
        Some(path) => config::load_runtime_config_from(path)?,
        None => config::load_runtime_config()?,
    };
    let media_root = cli.media_root.unwrap_or(runtime.media_root);
    let state_db = cli.state_db.unwrap_or(runtime.state_db);

    fs::create_dir_all(&media_root)
        .with_context(|| format!("creating media root {}", media_root.display()))?;

    let store = MediaStore::new(&media_root);
    let ledger = SqliteLedger::open(&state_db, runtime.stale_after)?;

    let total = cli.inputs.len();
    let mut failures = 0usize;

    for (index, input) in cli.inputs.iter().enumerate() {
        let current = index + 1;

        let id = match identity::resolve(input) {
            Ok(id) => id,
            Err(err) => {
                eprintln!("[{current}/{total}] Warning: skipping {input:?}: {err}");
                failures += 1;
                continue;
            }
        };

        if store.is_ready(&id) {
            println!("[{current}/{total}] {id} already cached");
            continue;
        }

        let candidate = queue::mint_job_ref(&id);
        let (record, is_new_claim) = ledger.claim_or_join(&id, &candidate)?;
        if !is_new_claim {
            println!(
                "[{current}/{total}] {id} already has an active job ({})",
                record.job_ref
            );
            continue;
        }

        println!("[{current}/{total}] Caching {id}");
        match retrieval::run(&store, &ledger, &id, &record.job_ref) {
            Ok(()) => println!("  Completed: {id}"),
            Err(err) => {
                eprintln!("  Warning: failed to cache {id}: {err}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {total} input(s) failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_requires_at_least_one_input() {
        assert!(Cli::try_parse_from(["prefetch"]).is_err());

        let cli = Cli::try_parse_from(["prefetch", "wLp_c3M-nPA"]).unwrap();
        assert_eq!(cli.inputs, vec!["wLp_c3M-nPA".to_string()]);
        assert!(cli.media_root.is_none());
    }

    #[test]
    fn cli_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "prefetch",
            "--media-root",
            "/srv/media",
            "--state-db",
            "/srv/jobs.db",
            "https://youtu.be/wLp_c3M-nPA",
        ])
        .unwrap();
        assert_eq!(cli.media_root, Some(PathBuf::from("/srv/media")));
        assert_eq!(cli.state_db, Some(PathBuf::from("/srv/jobs.db")));
    }
}
