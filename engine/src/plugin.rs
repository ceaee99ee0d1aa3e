use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use color_eyre::{
    Result,
    eyre::{WrapErr as _, bail, ensure, eyre},
};
use log::{info, warn};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    comfy::{ComfyApi, ComfyTransport, GeneratedImage, GenerationClient},
    config::Config,
    functions::{self, ANALYZE_IMAGE, GENERATE_IMAGE},
    request::GenerationRequest,
    scoring::ImageScorer,
    workflow::build_workflow,
    workspace::Workspace,
};

/// What `generate_image` hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<GeneratedImage>> for GenerationResult {
    fn from(outcome: Result<GeneratedImage>) -> Self {
        match outcome {
            Ok(image) => Self {
                success: true,
                image_path: Some(image.path),
                client_id: Some(image.client_id),
                error: None,
            },
            Err(e) => Self {
                success: false,
                image_path: None,
                client_id: None,
                error: Some(format!("{e:#}")),
            },
        }
    }
}

/// What `analyze_image` hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<f32>> for ScoringResult {
    fn from(outcome: Result<f32>) -> Self {
        match outcome {
            Ok(score) => Self {
                success: true,
                score: Some(score),
                error: None,
            },
            Err(e) => Self {
                success: false,
                score: None,
                error: Some(format!("{e:#}")),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeArgs {
    image_path: PathBuf,
    description: String,
}

/// The two callable functions, wired to their collaborators. Cheap to clone;
/// clones share the HTTP client and the loaded scoring model.
#[derive(Clone)]
pub struct Plugin {
    config: Arc<Config>,
    workspace: Workspace,
    generator: GenerationClient,
    scorer: Arc<dyn ImageScorer>,
}

impl Plugin {
    pub fn new(config: Config) -> Result<Self> {
        let workspace = Workspace::init(&config)?;
        let scorer = default_scorer(&workspace);
        Self::with_parts(config, workspace, Arc::new(ComfyApi::new()), scorer)
    }

    pub fn with_parts(
        config: Config,
        workspace: Workspace,
        transport: Arc<dyn ComfyTransport>,
        scorer: Arc<dyn ImageScorer>,
    ) -> Result<Self> {
        let generator = GenerationClient::new(
            transport,
            server_url(&config.api_url)?,
            workspace.outputs_dir.clone(),
            config.request_timeout_secs.map(Duration::from_secs),
        );
        Ok(Self {
            config: Arc::new(config),
            workspace,
            generator,
            scorer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn generate_image(&self, request: GenerationRequest) -> GenerationResult {
        let result = GenerationResult::from(self.try_generate(request).await);
        if let Some(e) = &result.error {
            warn!("generate_image failed: {e}");
        }
        result
    }

    async fn try_generate(&self, request: GenerationRequest) -> Result<GeneratedImage> {
        request.validate()?;
        let graph = build_workflow(&request, &self.config.model);
        self.generator.generate(&graph).await
    }

    pub async fn analyze_image(&self, image_path: &Path, description: &str) -> ScoringResult {
        let result = ScoringResult::from(self.try_analyze(image_path, description).await);
        if let Some(e) = &result.error {
            warn!("analyze_image failed: {e}");
        }
        result
    }

    async fn try_analyze(&self, image_path: &Path, description: &str) -> Result<f32> {
        let meta = tokio::fs::metadata(image_path)
            .await
            .wrap_err_with(|| format!("Image not found: {}", image_path.display()))?;
        ensure!(meta.is_file(), "Not a file: {}", image_path.display());
        self.scorer.score(image_path, description).await
    }

    /// Runs a host function call given as a name and a JSON argument object.
    /// Always answers with a `{"success": ..}` object.
    pub async fn call(&self, name: &str, args: Value) -> Value {
        info!("Host call {name}");
        self.dispatch(name, args).await.unwrap_or_else(|e| {
            warn!("Call to {name} rejected: {e:#}");
            serde_json::json!({"success": false, "error": format!("{e:#}")})
        })
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let descriptor =
            functions::find(name).ok_or_else(|| eyre!("Unknown function `{name}`"))?;
        let mut args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => bail!("Arguments must be a JSON object, got {other}"),
        };
        descriptor.check_args(&args).map_err(|e| eyre!(e))?;
        // absent and null mean the same: use the default
        args.retain(|_, v| !v.is_null());
        let args = Value::Object(args);

        Ok(match descriptor.name {
            GENERATE_IMAGE => {
                let request: GenerationRequest = serde_json::from_value(args)?;
                serde_json::to_value(self.generate_image(request).await)?
            }
            ANALYZE_IMAGE => {
                let AnalyzeArgs {
                    image_path,
                    description,
                } = serde_json::from_value(args)?;
                serde_json::to_value(self.analyze_image(&image_path, &description).await)?
            }
            other => bail!("No handler for `{other}`"),
        })
    }

    /// Hook the host runs on a request body before it's processed.
    pub fn inlet(&self, body: Value, user: Option<&Value>) -> Value {
        info!("inlet: body: {body}");
        info!("inlet: user: {user:?}");
        body
    }

    /// Hook the host runs on a response body before it's shown.
    pub fn outlet(&self, body: Value, user: Option<&Value>) -> Value {
        info!("outlet: body: {body}");
        info!("outlet: user: {user:?}");
        body
    }
}

/// Parses the service address so relative joins keep any path prefix.
fn server_url(api_url: &str) -> Result<Url> {
    let mut url: Url = api_url
        .parse()
        .wrap_err_with(|| format!("Invalid service address {api_url:?}"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(feature = "clip")]
fn default_scorer(workspace: &Workspace) -> Arc<dyn ImageScorer> {
    Arc::new(crate::scoring::ClipScorer::new(workspace.cache_dir.clone()))
}

#[cfg(not(feature = "clip"))]
fn default_scorer(_workspace: &Workspace) -> Arc<dyn ImageScorer> {
    Arc::new(crate::scoring::NoScorer)
}
