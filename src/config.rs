#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_FORMAT: &str = "best";
pub const DEFAULT_CONTAINER: &str = "mp4";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;
pub const DEFAULT_PROGRESS_STEP: u8 = 5;
pub const DEFAULT_YTDLP: &str = "yt-dlp";

/// Fully resolved startup configuration. Nothing here changes at runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub storage_root: PathBuf,
    pub www_root: Option<PathBuf>,
    pub port: u16,
    pub host: String,
    pub max_concurrent: usize,
    pub format: String,
    pub container: String,
    pub transfer_timeout: Duration,
    pub progress_interval: Duration,
    pub progress_step: u8,
    pub ytdlp: PathBuf,
    pub allow_root: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub storage_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub max_concurrent: Option<usize>,
    pub env_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

/// Optional TOML layer, laid out like the sections of the service manual.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub download: DownloadSection,
    pub progress: ProgressSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub max_concurrent: Option<usize>,
    pub format: Option<String>,
    pub container: Option<String>,
    pub timeout_secs: Option<u64>,
    pub ytdlp: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub interval_ms: Option<u64>,
    pub step: Option<u8>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    let file_config = match overrides.config_path.as_deref() {
        Some(path) => read_config_file(path)?,
        None => FileConfig::default(),
    };
    build_runtime_config(&file_vars, &file_config, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    file_config: &FileConfig,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let storage_root = overrides
        .storage_root
        .or_else(|| lookup("TUBEVAULT_STORAGE").map(PathBuf::from))
        .or_else(|| file_config.storage.path.clone())
        .ok_or_else(|| anyhow!("TUBEVAULT_STORAGE not set"))?;
    let www_root = overrides
        .www_root
        .or_else(|| lookup("TUBEVAULT_WWW_ROOT").map(PathBuf::from))
        .or_else(|| file_config.server.www_root.clone());
    let port = overrides
        .port
        .or_else(|| lookup("TUBEVAULT_PORT").and_then(|value| value.parse::<u16>().ok()))
        .or(file_config.server.port)
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEVAULT_HOST"))
        .or_else(|| file_config.server.host.clone())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let max_concurrent = overrides
        .max_concurrent
        .or_else(|| parsed("TUBEVAULT_MAX_CONCURRENT").map(|value| value as usize))
        .or(file_config.download.max_concurrent)
        .unwrap_or(DEFAULT_MAX_CONCURRENT)
        .max(1);
    let format = lookup("TUBEVAULT_FORMAT")
        .or_else(|| file_config.download.format.clone())
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
    let container = lookup("TUBEVAULT_CONTAINER")
        .or_else(|| file_config.download.container.clone())
        .map(|value| value.trim_start_matches('.').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
    let timeout_secs = parsed("TUBEVAULT_TIMEOUT_SECS")
        .or(file_config.download.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let interval_ms = parsed("TUBEVAULT_PROGRESS_INTERVAL_MS")
        .or(file_config.progress.interval_ms)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS);
    let progress_step = lookup("TUBEVAULT_PROGRESS_STEP")
        .and_then(|value| value.parse::<u8>().ok())
        .or(file_config.progress.step)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_PROGRESS_STEP);
    let ytdlp = lookup("TUBEVAULT_YTDLP")
        .map(PathBuf::from)
        .or_else(|| file_config.download.ytdlp.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let allow_root = lookup("TUBEVAULT_ALLOW_ROOT")
        .map(|value| parse_flag(&value))
        .unwrap_or(false);

    Ok(RuntimeConfig {
        storage_root,
        www_root,
        port,
        host,
        max_concurrent,
        format,
        container,
        transfer_timeout: Duration::from_secs(timeout_secs),
        progress_interval: Duration::from_millis(interval_ms),
        progress_step,
        ytdlp,
        allow_root,
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_config_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_file(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, &FileConfig::default(), |_| None, Default::default()).unwrap()
    }

    #[test]
    fn defaults_fill_everything_but_storage() {
        let config = config_from("TUBEVAULT_STORAGE=\"/srv/videos\"\n");
        assert_eq!(config.storage_root, PathBuf::from("/srv/videos"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.format, "best");
        assert_eq!(config.container, "mp4");
        assert_eq!(config.transfer_timeout, Duration::from_secs(300));
        assert_eq!(config.progress_interval, Duration::from_millis(500));
        assert_eq!(config.progress_step, 5);
        assert!(config.www_root.is_none());
        assert!(!config.allow_root);
    }

    #[test]
    fn missing_storage_is_an_error() {
        let err = build_runtime_config(
            &HashMap::new(),
            &FileConfig::default(),
            |_| None,
            Default::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("TUBEVAULT_STORAGE"));
    }

    #[test]
    fn env_file_values_are_parsed() {
        let config = config_from(
            "TUBEVAULT_STORAGE=/v\nTUBEVAULT_PORT=\"4242\"\nTUBEVAULT_MAX_CONCURRENT=4\n\
             TUBEVAULT_PROGRESS_INTERVAL_MS=250\nTUBEVAULT_CONTAINER=.mkv\nTUBEVAULT_ALLOW_ROOT=yes\n",
        );
        assert_eq!(config.port, 4242);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.container, "mkv");
        assert!(config.allow_root);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from(
            "TUBEVAULT_STORAGE=/v\nTUBEVAULT_PORT=nope\nTUBEVAULT_MAX_CONCURRENT=0\nTUBEVAULT_PROGRESS_STEP=0\n",
        );
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.progress_step, DEFAULT_PROGRESS_STEP);
    }

    #[test]
    fn env_wins_over_env_file() {
        let vars = read_env_file(make_file("TUBEVAULT_STORAGE=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            &FileConfig::default(),
            |key| (key == "TUBEVAULT_STORAGE").then(|| "/env".to_string()),
            Default::default(),
        )
        .unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/env"));
    }

    #[test]
    fn toml_layer_sits_below_env_file() {
        let toml_file = make_file(
            r#"
            [server]
            port = 8000
            host = "0.0.0.0"

            [storage]
            path = "/toml/videos"

            [download]
            max_concurrent = 3
            format = "bestvideo+bestaudio"

            [progress]
            interval_ms = 1000
            "#,
        );
        let file_config = read_config_file(toml_file.path()).unwrap();
        let vars = read_env_file(make_file("TUBEVAULT_PORT=9000\n").path()).unwrap();
        let config =
            build_runtime_config(&vars, &file_config, |_| None, Default::default()).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/toml/videos"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.format, "bestvideo+bestaudio");
        assert_eq!(config.progress_interval, Duration::from_millis(1000));
    }

    #[test]
    fn overrides_take_precedence() {
        let vars = read_env_file(
            make_file("TUBEVAULT_STORAGE=/file\nTUBEVAULT_HOST=file-host\nTUBEVAULT_PORT=7000\n")
                .path(),
        )
        .unwrap();
        let overrides = RuntimeOverrides {
            storage_root: Some(PathBuf::from("/override")),
            port: Some(9100),
            host: Some("   ".into()),
            max_concurrent: Some(6),
            ..RuntimeOverrides::default()
        };
        let config =
            build_runtime_config(&vars, &FileConfig::default(), |_| None, overrides).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/override"));
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "file-host");
        assert_eq!(config.max_concurrent, 6);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_file(
            r#"
            export TUBEVAULT_STORAGE="/media"
            TUBEVAULT_WWW_ROOT='/www'
            TUBEVAULT_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBEVAULT_STORAGE").unwrap(), "/media");
        assert_eq!(vars.get("TUBEVAULT_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("TUBEVAULT_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
