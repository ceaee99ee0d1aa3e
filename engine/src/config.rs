use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use log::debug;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const DEFAULT_API_URL: &str = "http://comfyui:8188";
pub const DEFAULT_DATA_DIR: &str = "/app/backend/data";
pub const DEFAULT_MODEL: &str = "flux.1-dev";

const CONFIG_FILE_NAME: &str = "comfyui_agent.ron";

pub const ENV_API_URL: &str = "COMFYUI_API_URL";
pub const ENV_DATA_DIR: &str = "COMFYUI_DATA_DIR";
pub const ENV_MODEL: &str = "COMFYUI_MODEL";
pub const ENV_TIMEOUT_SECS: &str = "COMFYUI_TIMEOUT_SECS";

/// Settings supplied once when the plugin is constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base address of the image generation service
    pub api_url: String,
    /// Root for the outputs, cache and logs directories
    pub data_dir: PathBuf,
    /// Checkpoint used when a request doesn't name one
    pub model: String,
    /// Upper bound for a whole generation call. `None` waits until the
    /// service reports a terminal event.
    pub request_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            data_dir: DEFAULT_DATA_DIR.into(),
            model: DEFAULT_MODEL.into(),
            request_timeout_secs: None,
        }
    }
}

impl Config {
    /// Defaults, then the config file (if there is one), then the environment.
    pub fn load() -> Result<Self> {
        let mut cfg = match config_path() {
            Ok(path) if path.exists() => {
                debug!("Loading config from {}", path.display());
                load_ron_file(&path)
                    .wrap_err_with(|| format!("Couldn't read config file {}", path.display()))?
            }
            _ => Config::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = dir.into();
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.model = model;
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            let secs = secs
                .trim()
                .parse()
                .wrap_err_with(|| format!("{ENV_TIMEOUT_SECS} must be a number of seconds"))?;
            self.request_timeout_secs = Some(secs);
        }
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(dirs::config_local_dir()
        .ok_or(eyre!("Couldn't get config dir"))?
        .join(CONFIG_FILE_NAME))
}

pub fn load_ron_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let src = fs::read_to_string(path)?;
    Ok(ron::from_str(&src)?)
}

pub fn save_ron_file<T: Serialize>(path: &Path, x: &T) -> Result<()> {
    Ok(fs::write(path, ron::to_string(x)?)?)
}
