//! CLIP image/text similarity on the CPU.
//!
//! Weights and tokenizer come from the Hugging Face hub and are cached in the
//! plugin's cache dir. The model is loaded on first use and kept around.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};
use image::imageops::FilterType;
use log::info;
use tokenizers::Tokenizer;

use super::ImageScorer;
use crate::comfy::BoxFuture;

const MODEL_REPO: &str = "openai/clip-vit-base-patch32";
// the main branch only has pytorch weights
const MODEL_REVISION: &str = "refs/pr/15";

struct LoadedClip {
    model: ClipModel,
    tokenizer: Tokenizer,
    config: ClipConfig,
    device: Device,
}

#[derive(Clone)]
pub struct ClipScorer {
    cache_dir: PathBuf,
    loaded: Arc<Mutex<Option<Arc<LoadedClip>>>>,
}

impl ClipScorer {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            loaded: Arc::default(),
        }
    }

    fn get_or_load(&self) -> Result<Arc<LoadedClip>> {
        let mut slot = self
            .loaded
            .lock()
            .map_err(|_| eyre!("CLIP model lock poisoned"))?;
        if let Some(clip) = slot.as_ref() {
            return Ok(clip.clone());
        }
        let clip = Arc::new(LoadedClip::load(&self.cache_dir)?);
        *slot = Some(clip.clone());
        Ok(clip)
    }
}

impl ImageScorer for ClipScorer {
    fn score<'a>(&'a self, image: &'a Path, description: &'a str) -> BoxFuture<'a, Result<f32>> {
        let scorer = self.clone();
        let image = image.to_path_buf();
        let description = description.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || scorer.get_or_load()?.score(&image, &description))
                .await?
        })
    }
}

/// Cuts token ids down to the model's context length. The last id is the
/// end-of-text token, which pooling looks up by position, so it's kept.
fn fit_context(mut ids: Vec<u32>, max_len: usize) -> Vec<u32> {
    if ids.len() > max_len && max_len > 0 {
        let end = ids[ids.len() - 1];
        ids.truncate(max_len - 1);
        ids.push(end);
    }
    ids
}

impl LoadedClip {
    fn load(cache_dir: &Path) -> Result<Self> {
        info!("Loading {MODEL_REPO}");
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .build()?;
        let repo = api.repo(Repo::with_revision(
            MODEL_REPO.into(),
            RepoType::Model,
            MODEL_REVISION.into(),
        ));
        let weights = repo
            .get("model.safetensors")
            .wrap_err("Couldn't fetch CLIP weights")?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .wrap_err("Couldn't fetch CLIP tokenizer")?;

        let device = Device::Cpu;
        let config = ClipConfig::vit_base_patch32();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = ClipModel::new(vb, &config)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| eyre!("Couldn't load CLIP tokenizer: {e}"))?;

        Ok(Self {
            model,
            tokenizer,
            config,
            device,
        })
    }

    fn score(&self, image: &Path, description: &str) -> Result<f32> {
        let pixels = self.load_image(image)?.unsqueeze(0)?;

        let encoding = self
            .tokenizer
            .encode(description, true)
            .map_err(|e| eyre!("Couldn't tokenize description: {e}"))?;
        let ids = fit_context(
            encoding.get_ids().to_vec(),
            self.config.text_config.max_position_embeddings,
        );
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;

        let (_, logits_per_image) = self.model.forward(&pixels, &input_ids)?;
        logits_per_image
            .flatten_all()?
            .to_vec1::<f32>()?
            .first()
            .copied()
            .ok_or(eyre!("CLIP returned no logits"))
    }

    /// (3, size, size) in [-1, 1]
    fn load_image(&self, path: &Path) -> Result<Tensor> {
        let size = self.config.image_size;
        let img = image::open(path)
            .wrap_err_with(|| format!("Couldn't read image {}", path.display()))?
            .resize_to_fill(size as u32, size as u32, FilterType::Triangle)
            .to_rgb8();
        let data = img.into_raw();
        Ok(Tensor::from_vec(data, (size, size, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?)
    }
}
