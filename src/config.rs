use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MarketError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: Option<PathBuf>,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Script,
    Remote,
    #[default]
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Interpreter or executable for the script engine.
    pub program: String,
    /// Script passed to `program`; omitted from the command line when unset.
    pub script: Option<String>,
    /// `/api/match` endpoint for the remote engine.
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Heuristic,
            program: "python3".to_string(),
            script: Some("revolutionary_ai_matching.py".to_string()),
            url: None,
            timeout_secs: Some(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum normalized material score for `match find` to record a match.
    pub min_score: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { min_score: 0.7 }
    }
}

impl Config {
    /// Load from `path`, or from the per-user config file when `path` is None.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| MarketError::Config {
            message: format!("{}: {}", path.display(), e),
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MarketError::Config {
            message: e.to_string(),
        })
    }

    fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "symbiosis")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                self.server.host = host.trim().to_string();
            }
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("SYMBIOSIS_DB") {
            if !path.trim().is_empty() {
                self.database_path = Some(PathBuf::from(path.trim()));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(config_error("server.port must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.matching.min_score) {
            return Err(config_error("matching.min_score must be within 0..=1"));
        }
        if self.engine.timeout_secs == Some(0) {
            return Err(config_error(
                "engine.timeout_secs must be positive (omit it for no timeout)",
            ));
        }
        match self.engine.kind {
            EngineKind::Script if self.engine.program.trim().is_empty() => {
                Err(config_error("engine.program is required for the script engine"))
            }
            EngineKind::Remote if self.engine.url.as_deref().is_none_or(|u| u.trim().is_empty()) => {
                Err(config_error("engine.url is required for the remote engine"))
            }
            _ => Ok(()),
        }
    }

    /// Database file: configured path, else the XDG data dir, else the working dir.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "symbiosis") {
            proj_dirs.data_dir().join("symbiosis.db")
        } else {
            PathBuf::from("symbiosis.db")
        }
    }
}

fn config_error(message: &str) -> MarketError {
    MarketError::Config {
        message: message.to_string(),
    }
}
