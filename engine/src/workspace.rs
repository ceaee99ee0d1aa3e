use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::WrapErr as _};
use log::debug;

use crate::config::Config;

const SUBDIR: &str = "comfyui";

/// The directories the plugin writes to, all derived from `Config::data_dir`.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub outputs_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Workspace {
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            outputs_dir: data_dir.join("outputs").join(SUBDIR),
            cache_dir: data_dir.join("cache").join(SUBDIR),
            logs_dir: data_dir.join("logs").join(SUBDIR),
        }
    }

    /// Creates any missing directory. Calling it again is a no-op.
    pub fn init(config: &Config) -> Result<Self> {
        let ws = Self::for_data_dir(&config.data_dir);
        for dir in [&ws.outputs_dir, &ws.cache_dir, &ws.logs_dir] {
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Couldn't create directory {}", dir.display()))?;
            debug!("Ensured {}", dir.display());
        }
        Ok(ws)
    }
}
