use anyhow::{Context, Result};
use std::time::Duration;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ytcache-env";
pub const DEFAULT_PORT: u16 = 58000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_MEDIA_ROOT: &str = "/data/media";
pub const LEDGER_DB_FILE: &str = "jobs.db";
/// Matches the staleness window historically applied to abandoned claims.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;

/// Raw key=value pairs read from the env file. Everything optional; defaults
/// and process-environment overrides are applied in [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub media_root: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub stale_after_secs: Option<u64>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub state_db: PathBuf,
    pub public_base_url: String,
    pub port: u16,
    pub host: String,
    pub stale_after: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "MEDIA_ROOT" => cfg.media_root = Some(PathBuf::from(value)),
                "STATE_DB" => cfg.state_db = Some(PathBuf::from(value)),
                "PUBLIC_BASE_URL" => cfg.public_base_url = Some(value.to_string()),
                "YTCACHE_PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing YTCACHE_PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "YTCACHE_HOST" => cfg.host = Some(value.to_string()),
                "STALE_AFTER_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing STALE_AFTER_SECS from {}", path.display())
                    })?;
                    cfg.stale_after_secs = Some(secs);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

/// Loads the default config file location, tolerating its absence.
pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Resolution order per key: process environment, then the env file, then the
/// built-in default.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?.unwrap_or_default();
    let env_vars: HashMap<String, String> = std::env::vars().collect();

    let media_root = env_or_config(&env_vars, "MEDIA_ROOT", cfg.media_root.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));

    let state_db = env_or_config(&env_vars, "STATE_DB", cfg.state_db.clone())
        .unwrap_or_else(|| media_root.join(LEDGER_DB_FILE));

    let port = match env_vars.get("YTCACHE_PORT") {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("Parsing YTCACHE_PORT={value} from the environment"))?,
        None => cfg.port.unwrap_or(DEFAULT_PORT),
    };

    let host = env_or_config(&env_vars, "YTCACHE_HOST", cfg.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let public_base_url = env_or_config(&env_vars, "PUBLIC_BASE_URL", cfg.public_base_url.clone())
        .unwrap_or_else(|| format!("http://localhost:{port}"));

    let stale_after_secs = match env_vars.get("STALE_AFTER_SECS") {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("Parsing STALE_AFTER_SECS={value} from the environment"))?,
        None => cfg.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS),
    };

    Ok(RuntimeConfig {
        media_root,
        state_db,
        public_base_url: public_base_url.trim_end_matches('/').to_string(),
        port,
        host,
        stale_after: Duration::from_secs(stale_after_secs),
    })
}

fn env_or_config<T: From<String>>(
    env_vars: &HashMap<String, String>,
    key: &str,
    from_file: Option<T>,
) -> Option<T> {
    env_vars
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| T::from(value.to_string()))
        .or(from_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("MEDIA_ROOT=\"/srv/media\"\nYTCACHE_PORT=\"4242\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.media_root, Some(PathBuf::from("/srv/media")));
    }

    #[test]
    fn runtime_config_applies_defaults() {
        let cfg = make_config("MEDIA_ROOT=\"/srv/media\"\n");
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.media_root, PathBuf::from("/srv/media"));
        assert_eq!(runtime.state_db, PathBuf::from("/srv/media/jobs.db"));
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(
            runtime.stale_after,
            Duration::from_secs(DEFAULT_STALE_AFTER_SECS)
        );
        assert_eq!(
            runtime.public_base_url,
            format!("http://localhost:{DEFAULT_PORT}")
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let runtime = load_runtime_config_from("/nonexistent/ytcache-env").unwrap();
        assert_eq!(runtime.media_root, PathBuf::from(DEFAULT_MEDIA_ROOT));
    }

    #[test]
    fn explicit_state_db_and_staleness_are_honored() {
        let cfg = make_config(
            "MEDIA_ROOT=\"/srv/media\"\nSTATE_DB=\"/var/lib/ytcache/jobs.db\"\nSTALE_AFTER_SECS=\"120\"\n",
        );
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.state_db, PathBuf::from("/var/lib/ytcache/jobs.db"));
        assert_eq!(runtime.stale_after, Duration::from_secs(120));
    }

    #[test]
    fn public_base_url_is_normalized() {
        let cfg = make_config("PUBLIC_BASE_URL=\"https://cache.example.com/\"\n");
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.public_base_url, "https://cache.example.com");
    }
}
