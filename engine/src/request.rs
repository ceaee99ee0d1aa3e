use color_eyre::{Result, eyre::ensure};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, blurry, low quality";
pub const DEFAULT_SIZE: u32 = 512;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG_SCALE: f64 = 7.0;
pub const DEFAULT_SAMPLER: &str = "euler";
pub const DEFAULT_SCHEDULER: &str = "normal";
/// Lets the service pick a seed.
pub const RANDOM_SEED: i64 = -1;

/// Parameters of a single `generate_image` call.
///
/// Everything but the description has a default, so hosts can send a
/// partial JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub description: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    /// Checkpoint name. `None` falls back to the configured model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.into()
}

fn default_size() -> u32 {
    DEFAULT_SIZE
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_cfg_scale() -> f64 {
    DEFAULT_CFG_SCALE
}

fn default_sampler() -> String {
    DEFAULT_SAMPLER.into()
}

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.into()
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

impl GenerationRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            negative_prompt: default_negative_prompt(),
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            model: None,
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            seed: RANDOM_SEED,
        }
    }

    pub fn checkpoint<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(fallback)
    }

    /// Rejects values the workflow can't be built from. The seed isn't
    /// checked: interpreting it is up to the service.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.description.trim().is_empty(),
            "description must not be empty"
        );
        ensure!(
            self.width > 0 && self.height > 0,
            "image size must be positive, got {}x{}",
            self.width,
            self.height
        );
        ensure!(self.steps > 0, "steps must be at least 1");
        ensure!(
            self.cfg_scale.is_finite() && self.cfg_scale >= 0.0,
            "cfg_scale must be a non-negative number, got {}",
            self.cfg_scale
        );
        ensure!(
            !self.sampler.is_empty() && !self.scheduler.is_empty(),
            "sampler and scheduler must be named"
        );
        Ok(())
    }
}
