use std::path::PathBuf;

use comfyui_agent::{Config, GenerationRequest, request};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Generate and score images with a ComfyUI server")]
pub struct Cli {
    /// Base address of the ComfyUI server
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Root for the outputs, cache and logs directories
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Checkpoint used when a request doesn't name one
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Give up on a generation after this many seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Flags win over the file and the environment.
    pub fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(url) = &self.api_url {
            cfg.api_url = url.clone();
        }
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(model) = &self.model {
            cfg.model = model.clone();
        }
        if self.timeout_secs.is_some() {
            cfg.request_timeout_secs = self.timeout_secs;
        }
    }
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Render an image from a text description
    Generate(Generate),
    /// Score how well an image matches a description
    Analyze(Analyze),
    /// Print the function manifest
    Functions,
    /// Run a function by name with JSON arguments
    Call(Call),
    /// Write the effective configuration to the config file
    InitConfig,
}

#[derive(Debug, clap::Args)]
pub struct Generate {
    pub description: String,
    #[arg(long, default_value = request::DEFAULT_NEGATIVE_PROMPT)]
    pub negative_prompt: String,
    #[arg(long, default_value_t = request::DEFAULT_SIZE)]
    pub width: u32,
    #[arg(long, default_value_t = request::DEFAULT_SIZE)]
    pub height: u32,
    #[arg(long, default_value_t = request::DEFAULT_STEPS)]
    pub steps: u32,
    #[arg(long, default_value_t = request::DEFAULT_CFG_SCALE)]
    pub cfg_scale: f64,
    /// Overrides the configured checkpoint for this request
    #[arg(long)]
    pub checkpoint: Option<String>,
    #[arg(long, default_value = request::DEFAULT_SAMPLER)]
    pub sampler: String,
    #[arg(long, default_value = request::DEFAULT_SCHEDULER)]
    pub scheduler: String,
    /// -1 lets the server pick
    #[arg(long, default_value_t = request::RANDOM_SEED, allow_hyphen_values = true)]
    pub seed: i64,
}

impl From<Generate> for GenerationRequest {
    fn from(g: Generate) -> Self {
        GenerationRequest {
            description: g.description,
            negative_prompt: g.negative_prompt,
            width: g.width,
            height: g.height,
            steps: g.steps,
            cfg_scale: g.cfg_scale,
            model: g.checkpoint,
            sampler: g.sampler,
            scheduler: g.scheduler,
            seed: g.seed,
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct Analyze {
    pub image_path: PathBuf,
    pub description: String,
}

#[derive(Debug, clap::Args)]
pub struct Call {
    pub name: String,
    /// Arguments as a JSON object
    #[arg(default_value = "{}")]
    pub args: String,
}
