use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GatorError, Result};

/// File name of the config inside the user's home directory.
pub const CONFIG_FILE_NAME: &str = ".gatorconfig.json";

/// Environment variable that overrides the config location.
pub const CONFIG_PATH_ENV: &str = "GATOR_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub db_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_name: Option<String>,
    /// HTTP timeout for feed requests, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "gator".to_string()
}

impl Config {
    /// Resolve where the config lives: `$GATOR_CONFIG`, or `~/.gatorconfig.json`.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| GatorError::Config("could not locate home directory".to_string()))?;
        Ok(home.join(CONFIG_FILE_NAME))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            GatorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Parse config from a JSON string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| GatorError::Config(e.to_string()))
    }

    /// The logged-in user, if one is set. An empty name counts as unset.
    pub fn current_user(&self) -> Option<&str> {
        self.current_user_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    /// Write the config next to `path` and rename it into place.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GatorError::Config(e.to_string()))?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Set the current user and persist the change immediately.
    pub fn set_user<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<()> {
        self.current_user_name = Some(name.to_string());
        self.save(path)
    }
}
