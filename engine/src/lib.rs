pub mod comfy;
pub mod config;
pub mod functions;
pub mod plugin;
pub mod request;
pub mod scoring;
pub mod workflow;
pub mod workspace;

pub use config::Config;
pub use plugin::{GenerationResult, Plugin, ScoringResult};
pub use request::GenerationRequest;
pub use workspace::Workspace;
