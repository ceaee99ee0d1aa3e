use std::path::Path;

use color_eyre::{Result, eyre::eyre};

use crate::comfy::BoxFuture;

#[cfg(feature = "clip")]
pub mod clip;
#[cfg(feature = "clip")]
pub use clip::ClipScorer;

/// Rates how well an image matches a text. Higher is a better match; the
/// scale is whatever the underlying model produces.
pub trait ImageScorer: Send + Sync {
    fn score<'a>(&'a self, image: &'a Path, description: &'a str) -> BoxFuture<'a, Result<f32>>;
}

/// Stand-in when the crate is built without a scoring model.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScorer;

impl ImageScorer for NoScorer {
    fn score<'a>(&'a self, _image: &'a Path, _description: &'a str) -> BoxFuture<'a, Result<f32>> {
        Box::pin(async { Err(eyre!("Scoring model unavailable")) })
    }
}
