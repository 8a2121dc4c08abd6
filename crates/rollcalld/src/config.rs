use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Listen address for the HTTP and WebSocket API.
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Largest cosine distance still accepted as a match.
    pub recognition_threshold: f32,
    pub token_ttl_secs: u64,
    /// How long closed or expired tokens are remembered before eviction.
    pub token_grace_secs: u64,
    pub sweep_interval_secs: u64,
    /// Session embedding caches idle this long are dropped.
    pub cache_idle_secs: u64,
    pub roster_timeout_secs: u64,
    pub roster_retry_attempts: u32,
    pub extraction_timeout_secs: u64,
    pub validation_timeout_ms: u64,
    /// Keep every submitted capture in the database.
    pub archive_captures: bool,
}

/// Keys accepted in the TOML file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<SocketAddr>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    recognition_threshold: Option<f32>,
    token_ttl_secs: Option<u64>,
    token_grace_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    cache_idle_secs: Option<u64>,
    roster_timeout_secs: Option<u64>,
    roster_retry_attempts: Option<u32>,
    extraction_timeout_secs: Option<u64>,
    validation_timeout_ms: Option<u64>,
    archive_captures: Option<bool>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn defaults(env: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            model_dir: rollcall_core::default_model_dir(),
            db_path: data_dir.join("rollcall.db"),
            recognition_threshold: rollcall_core::DEFAULT_RECOGNITION_THRESHOLD,
            token_ttl_secs: 300,
            token_grace_secs: 60,
            sweep_interval_secs: 30,
            cache_idle_secs: 2 * 60 * 60,
            roster_timeout_secs: 5,
            roster_retry_attempts: 3,
            extraction_timeout_secs: 10,
            validation_timeout_ms: 2000,
            archive_captures: false,
        }
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::defaults(&env);

        if let Some(path) = env("ROLLCALL_CONFIG") {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            let file: FileConfig =
                toml::from_str(&raw).with_context(|| format!("invalid config file {path}"))?;
            config.apply_file(file);
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.bind {
            self.bind = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.recognition_threshold {
            self.recognition_threshold = v;
        }
        if let Some(v) = file.token_ttl_secs {
            self.token_ttl_secs = v;
        }
        if let Some(v) = file.token_grace_secs {
            self.token_grace_secs = v;
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = file.cache_idle_secs {
            self.cache_idle_secs = v;
        }
        if let Some(v) = file.roster_timeout_secs {
            self.roster_timeout_secs = v;
        }
        if let Some(v) = file.roster_retry_attempts {
            self.roster_retry_attempts = v;
        }
        if let Some(v) = file.extraction_timeout_secs {
            self.extraction_timeout_secs = v;
        }
        if let Some(v) = file.validation_timeout_ms {
            self.validation_timeout_ms = v;
        }
        if let Some(v) = file.archive_captures {
            self.archive_captures = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(bind) = parsed(env, "ROLLCALL_BIND") {
            self.bind = bind;
        }
        if let Some(dir) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        override_with(&mut self.recognition_threshold, env, "ROLLCALL_RECOGNITION_THRESHOLD");
        override_with(&mut self.token_ttl_secs, env, "ROLLCALL_TOKEN_TTL_SECS");
        override_with(&mut self.token_grace_secs, env, "ROLLCALL_TOKEN_GRACE_SECS");
        override_with(&mut self.sweep_interval_secs, env, "ROLLCALL_SWEEP_INTERVAL_SECS");
        override_with(&mut self.cache_idle_secs, env, "ROLLCALL_CACHE_IDLE_SECS");
        override_with(&mut self.roster_timeout_secs, env, "ROLLCALL_ROSTER_TIMEOUT_SECS");
        override_with(&mut self.roster_retry_attempts, env, "ROLLCALL_ROSTER_RETRY_ATTEMPTS");
        override_with(&mut self.extraction_timeout_secs, env, "ROLLCALL_EXTRACTION_TIMEOUT_SECS");
        override_with(&mut self.validation_timeout_ms, env, "ROLLCALL_VALIDATION_TIMEOUT_MS");
        if let Some(v) = env("ROLLCALL_ARCHIVE_CAPTURES") {
            self.archive_captures = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (0.0..=2.0).contains(&self.recognition_threshold),
            "recognition threshold {} is outside the cosine distance range [0, 2]",
            self.recognition_threshold
        );
        anyhow::ensure!(self.token_ttl_secs > 0, "token TTL must be positive");
        anyhow::ensure!(self.sweep_interval_secs > 0, "sweep interval must be positive");
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn token_grace(&self) -> Duration {
        Duration::from_secs(self.token_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cache_idle(&self) -> Duration {
        Duration::from_secs(self.cache_idle_secs)
    }

    pub fn roster_timeout(&self) -> Duration {
        Duration::from_secs(self.roster_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn override_with<T: std::str::FromStr>(slot: &mut T, env: &impl Fn(&str) -> Option<String>, key: &str) {
    if let Some(v) = parsed(env, key) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/prof")])).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("/home/prof/.local/share/rollcall/rollcall.db"));
        assert_eq!(config.recognition_threshold, 0.45);
        assert_eq!(config.token_ttl(), Duration::from_secs(300));
        assert_eq!(config.token_grace(), Duration::from_secs(60));
        assert_eq!(config.roster_retry_attempts, 3);
        assert!(!config.archive_captures);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("ROLLCALL_BIND", "0.0.0.0:9000"),
            ("ROLLCALL_TOKEN_TTL_SECS", "120"),
            ("ROLLCALL_RECOGNITION_THRESHOLD", "not-a-number"),
            ("ROLLCALL_ARCHIVE_CAPTURES", "1"),
        ]))
        .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/rollcall.db"));
        assert_eq!(config.token_ttl_secs, 120);
        assert_eq!(config.recognition_threshold, 0.45);
        assert!(config.archive_captures);
    }

    #[test]
    fn test_file_then_env() {
        let path = std::env::temp_dir().join(format!("rollcall-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "recognition_threshold = 0.3\ntoken_ttl_secs = 600\ndb_path = \"/srv/rollcall.db\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::from_lookup(lookup(&[
            ("ROLLCALL_CONFIG", path_str.as_str()),
            ("ROLLCALL_TOKEN_TTL_SECS", "90"),
        ]))
        .unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.recognition_threshold, 0.3);
        assert_eq!(config.token_ttl_secs, 90);
        assert_eq!(config.db_path, PathBuf::from("/srv/rollcall.db"));
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let err = Config::from_lookup(lookup(&[("ROLLCALL_RECOGNITION_THRESHOLD", "3.5")])).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }
}
