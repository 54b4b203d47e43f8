use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs::home_dir;
use serde::Deserialize;
use tracing::debug;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::llm::LlmConfig;

const CONFIG_FILE: &str = ".zist/config.json";
const DEFAULT_HISTORY_DIR: &str = "~/.histories";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub history_paths: Vec<PathBuf>,
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: Database::default_path(),
            history_paths: vec![expand_tilde(DEFAULT_HISTORY_DIR)],
            llm: LlmConfig::default(),
        }
    }
}

/// Shape of `~/.zist/config.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db: Option<String>,
    history: Option<Vec<String>>,
    llm: Option<LlmConfig>,
}

impl Config {
    /// Defaults, then the config file, then `.env` and the environment.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let path = get_config_path();
        if path.exists() {
            config = config.merge_file(&path)?;
        }

        dotenv::dotenv().ok();
        Ok(config.apply_getter(|key| env::var(key).ok()))
    }

    fn merge_file(mut self, path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let file: FileConfig = serde_json::from_str(&content).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded config from {}", path.display());

        if let Some(db) = file.db.filter(|d| !d.trim().is_empty()) {
            self.db_path = expand_tilde(&db);
        }
        if let Some(history) = file.history.filter(|h| !h.is_empty()) {
            self.history_paths = history.iter().map(|p| expand_tilde(p)).collect();
        }
        if let Some(llm) = file.llm {
            self.llm = llm.sanitized();
        }
        Ok(self)
    }

    pub fn apply_getter(mut self, mut getter: impl FnMut(&str) -> Option<String>) -> Self {
        if let Some(db) = getter("ZIST_DB").filter(|v| !v.trim().is_empty()) {
            self.db_path = expand_tilde(db.trim());
        }
        if let Some(history) = getter("ZIST_HISTORY").filter(|v| !v.trim().is_empty()) {
            self.history_paths = env::split_paths(&history).collect();
        }
        self.llm = self.llm.apply_getter(getter);
        self
    }
}

fn get_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(CONFIG_FILE)
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
