use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then the TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the ONNX detector and recognizer.
    pub model_dir: PathBuf,
    /// Where thumbnails of unrecognized faces are kept for review.
    pub unknown_dir: PathBuf,
    /// Cosine similarity at or above which a face counts as recognized.
    pub match_threshold: f32,
    /// Minimum confidence accepted by ledger marking.
    pub min_confidence: f32,
    /// Required length of every stored embedding.
    pub embedding_dim: usize,
    /// Offset of caller-local session start times from UTC, in minutes.
    pub local_utc_offset_minutes: i32,
    pub bus: BusKind,
}

/// Keys accepted in the TOML file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    unknown_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    min_confidence: Option<f32>,
    embedding_dim: Option<usize>,
    local_utc_offset_minutes: Option<i32>,
    bus: Option<BusKind>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Some((path, text))
            }
            Err(_) => None,
        };
        Self::from_sources(
            file.as_ref().map(|(p, t)| (p.as_path(), t.as_str())),
            |key| std::env::var(key).ok(),
        )
    }

    fn from_sources(
        file: Option<(&Path, &str)>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let mut config = Self {
            db_path: data_dir.join("rollcall.db"),
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            unknown_dir: data_dir.join("unknown_faces"),
            match_threshold: 0.55,
            min_confidence: 0.60,
            embedding_dim: 512,
            local_utc_offset_minutes: 330,
            bus: BusKind::Session,
        };

        if let Some((path, text)) = file {
            let f: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            config.db_path = f.db_path.unwrap_or(config.db_path);
            config.model_dir = f.model_dir.unwrap_or(config.model_dir);
            config.unknown_dir = f.unknown_dir.unwrap_or(config.unknown_dir);
            config.match_threshold = f.match_threshold.unwrap_or(config.match_threshold);
            config.min_confidence = f.min_confidence.unwrap_or(config.min_confidence);
            config.embedding_dim = f.embedding_dim.unwrap_or(config.embedding_dim);
            config.local_utc_offset_minutes =
                f.local_utc_offset_minutes.unwrap_or(config.local_utc_offset_minutes);
            config.bus = f.bus.unwrap_or(config.bus);
        }

        if let Some(v) = env("ROLLCALL_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_UNKNOWN_DIR") {
            config.unknown_dir = PathBuf::from(v);
        }
        config.match_threshold = env_parse(&env, "ROLLCALL_MATCH_THRESHOLD", config.match_threshold);
        config.min_confidence = env_parse(&env, "ROLLCALL_MIN_CONFIDENCE", config.min_confidence);
        config.embedding_dim = env_parse(&env, "ROLLCALL_EMBEDDING_DIM", config.embedding_dim);
        config.local_utc_offset_minutes =
            env_parse(&env, "ROLLCALL_LOCAL_UTC_OFFSET_MINUTES", config.local_utc_offset_minutes);
        if let Some(v) = env("ROLLCALL_BUS") {
            config.bus = match v.as_str() {
                "system" => BusKind::System,
                "session" => BusKind::Session,
                other => return Err(ConfigError::Invalid(format!("ROLLCALL_BUS must be session or system, got {other:?}"))),
            };
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("match_threshold", self.match_threshold), ("min_confidence", self.min_confidence)] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [-1, 1], got {value}")));
            }
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        if FixedOffset::east_opt(self.local_utc_offset_minutes.saturating_mul(60)).is_none() {
            return Err(ConfigError::Invalid(format!(
                "local_utc_offset_minutes out of range: {}",
                self.local_utc_offset_minutes
            )));
        }
        Ok(())
    }

    /// Offset applied to start times given without one.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.local_utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }
}

/// Parse an env override, keeping `default` (with a warning) if it does not parse.
fn env_parse<T: std::str::FromStr + Copy>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match env(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = Config::from_sources(None, env_of(&[("HOME", "/home/ta")])).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/home/ta/.local/share/rollcall/rollcall.db"));
        assert_eq!(c.unknown_dir, PathBuf::from("/home/ta/.local/share/rollcall/unknown_faces"));
        assert_eq!(c.match_threshold, 0.55);
        assert_eq!(c.min_confidence, 0.60);
        assert_eq!(c.embedding_dim, 512);
        assert_eq!(c.bus, BusKind::Session);
        assert_eq!(c.local_offset().local_minus_utc(), 330 * 60);
    }

    #[test]
    fn file_then_env_precedence() {
        let toml = r#"
            match_threshold = 0.5
            min_confidence = 0.7
            bus = "system"
            db_path = "/var/lib/rollcall/db.sqlite"
        "#;
        let env = env_of(&[("ROLLCALL_MATCH_THRESHOLD", "0.45"), ("XDG_DATA_HOME", "/data")]);
        let c = Config::from_sources(Some((Path::new("rollcall.toml"), toml)), env).unwrap();
        assert_eq!(c.match_threshold, 0.45);
        assert_eq!(c.min_confidence, 0.7);
        assert_eq!(c.bus, BusKind::System);
        assert_eq!(c.db_path, PathBuf::from("/var/lib/rollcall/db.sqlite"));
        assert_eq!(c.unknown_dir, PathBuf::from("/data/rollcall/unknown_faces"));
    }

    #[test]
    fn unknown_file_key_is_rejected() {
        let err = Config::from_sources(Some((Path::new("x.toml"), "threshold = 0.5")), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn unparsable_env_keeps_default() {
        let c = Config::from_sources(None, env_of(&[("ROLLCALL_EMBEDDING_DIM", "lots")])).unwrap();
        assert_eq!(c.embedding_dim, 512);
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_MATCH_THRESHOLD", "1.5")])).is_err());
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_LOCAL_UTC_OFFSET_MINUTES", "2000")])).is_err());
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_BUS", "tcp")])).is_err());
    }
}
