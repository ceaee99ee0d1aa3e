use std::{future::Future, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

use color_eyre::{Result, eyre::eyre};
use log::{debug, info, warn};
use reqwest::Url;
use uuid::Uuid;

use crate::workflow::WorkflowGraph;

pub mod comfy_api;
pub use comfy_api::ComfyApi;

mod error;
pub use error::ComfyError;

pub mod events;
pub use events::StreamEvent;
use events::{ImagePayload, StoredImage};

pub mod payload;

#[cfg(test)]
pub(crate) mod testing;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChannelBox = Box<dyn EventChannel + Send>;

/// Correlates one submission with the events streamed back for it.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
    pub server: Url,
}

impl ClientSession {
    pub fn new(server: Url) -> Self {
        Self::with_id(server, Uuid::new_v4().to_string())
    }

    pub fn with_id(server: Url, client_id: String) -> Self {
        Self { client_id, server }
    }
}

/// How the client reaches the service. [`ComfyApi`] is the real one.
pub trait ComfyTransport: Send + Sync {
    fn submit<'a>(
        &'a self,
        session: &'a ClientSession,
        graph: &'a WorkflowGraph,
    ) -> BoxFuture<'a, Result<()>>;

    fn open_channel<'a>(&'a self, session: &'a ClientSession) -> BoxFuture<'a, Result<ChannelBox>>;

    fn fetch_image<'a>(
        &'a self,
        session: &'a ClientSession,
        image: &'a StoredImage,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;
}

pub trait EventChannel {
    /// The next event, or `None` once the service hung up.
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<StreamEvent>>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub client_id: String,
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct GenerationClient {
    transport: Arc<dyn ComfyTransport>,
    server: Url,
    outputs_dir: PathBuf,
    timeout: Option<Duration>,
}

impl GenerationClient {
    pub fn new(
        transport: Arc<dyn ComfyTransport>,
        server: Url,
        outputs_dir: PathBuf,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            server,
            outputs_dir,
            timeout,
        }
    }

    /// Submits `graph` and waits until the service delivers an image or
    /// reports a failure.
    pub async fn generate(&self, graph: &WorkflowGraph) -> Result<GeneratedImage> {
        let session = ClientSession::new(self.server.clone());
        match self.timeout {
            // on expiry the inner future is dropped, which drops the channel
            Some(limit) => tokio::time::timeout(limit, self.run(&session, graph))
                .await
                .map_err(|_| eyre!("Timed out after {limit:?}"))?,
            None => self.run(&session, graph).await,
        }
    }

    async fn run(&self, session: &ClientSession, graph: &WorkflowGraph) -> Result<GeneratedImage> {
        info!("Submitting workflow as {}", session.client_id);
        self.transport.submit(session, graph).await?;

        let mut channel = self.transport.open_channel(session).await?;
        let outcome = self.wait_for_image(channel.as_mut(), session).await;
        if let Err(e) = channel.close().await {
            warn!("Couldn't close event channel for {}: {e}", session.client_id);
        }
        outcome
    }

    async fn wait_for_image(
        &self,
        channel: &mut (dyn EventChannel + Send),
        session: &ClientSession,
    ) -> Result<GeneratedImage> {
        loop {
            let Some(event) = channel.next_event().await? else {
                return Err(ComfyError::ChannelClosed.into());
            };

            match event {
                StreamEvent::Executing { node: Some(node) } => debug!("Executing node {node}"),
                StreamEvent::Executing { node: None } => {
                    return Err(ComfyError::FinishedWithoutImage.into());
                }
                StreamEvent::Progress(progress) => {
                    debug!("Progress {:.0}%", progress.fraction() * 100.0)
                }
                StreamEvent::Executed(executed) => match executed.first_image() {
                    Some(image) => {
                        let path = self.store(session, image).await?;
                        info!("Image for {} written to {}", session.client_id, path.display());
                        return Ok(GeneratedImage {
                            client_id: session.client_id.clone(),
                            path,
                        });
                    }
                    None => debug!("Node {:?} finished without images", executed.node),
                },
                StreamEvent::Error { message } => {
                    return Err(ComfyError::Execution { message }.into());
                }
                StreamEvent::Unknown(event_type) => debug!("Ignoring `{event_type}` event"),
            }
        }
    }

    async fn store(&self, session: &ClientSession, image: &ImagePayload) -> Result<PathBuf> {
        let decoded = match image {
            ImagePayload::Encoded(blob) => payload::decode_image(blob)?,
            ImagePayload::Stored(stored) => payload::DecodedImage {
                bytes: self.transport.fetch_image(session, stored).await?,
                extension: payload::extension_for(&stored.filename),
            },
        };

        let path = payload::image_path(&self.outputs_dir, &session.client_id, decoded.extension);
        let dir = self.outputs_dir.clone();
        let staged =
            tokio::task::spawn_blocking(move || payload::stage_image(&dir, &decoded.bytes))
                .await??;
        // no await from here on, so a cancelled call never leaves `path` behind
        staged.persist(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::atomic::Ordering};

    use base64::{Engine, prelude::BASE64_STANDARD};
    use tempfile::tempdir;

    use super::{testing::*, *};
    use crate::{request::GenerationRequest, workflow::build_workflow};

    fn client(transport: Arc<ScriptedTransport>, outputs: PathBuf) -> GenerationClient {
        GenerationClient::new(
            transport,
            "http://comfyui:8188".parse().unwrap(),
            outputs,
            None,
        )
    }

    fn fox_graph() -> WorkflowGraph {
        build_workflow(&GenerationRequest::new("a red fox in snow"), "flux.1-dev")
    }

    #[tokio::test]
    async fn progress_then_image_writes_file() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "status", "data": {"status": {}}}"#,
                r#"{"type": "executing", "data": {"node": "4"}}"#,
                r#"{"type": "executing", "data": {"node": "3"}}"#,
                r#"{"type": "progress", "data": {"value": 0.0}}"#,
                r#"{"type": "progress", "data": {"value": 0.5}}"#,
                r#"{"type": "progress", "data": {"value": 1.0}}"#,
                r#"{"type": "executed", "data": {"node": "7"}}"#,
                image_event(),
            ],
            ..Default::default()
        });

        let image = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await?;

        assert_eq!(
            image.path,
            outputs.path().join(format!("{}.png", image.client_id))
        );
        assert_eq!(fs::read(&image.path)?, FOX_PNG);
        assert_eq!(
            *transport.submitted_ids.lock().unwrap(),
            vec![image.client_id.clone()]
        );
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stored_image_is_fetched() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "executed", "data": {"node": "8", "output": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}}}"#,
            ],
            stored_image: FOX_PNG.to_vec(),
            ..Default::default()
        });

        let image = client(transport, outputs.path().into())
            .generate(&fox_graph())
            .await?;
        assert_eq!(fs::read(&image.path)?, FOX_PNG);
        Ok(())
    }

    #[tokio::test]
    async fn error_event_fails_without_file() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "executing", "data": {"node": "3"}}"#,
                r#"{"type": "progress", "data": {"value": 3, "max": 20}}"#,
                r#"{"type": "error", "data": {"message": "CUDA out of memory"}}"#,
                image_event(),
            ],
            ..Default::default()
        });

        let err = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ComfyError>(),
            Some(ComfyError::Execution { message }) if message == "CUDA out of memory"
        ));
        assert_eq!(fs::read_dir(outputs.path())?.count(), 0);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    async fn assert_execution_failure(script: Vec<&'static str>, expected: &str) -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script,
            ..Default::default()
        });

        let err = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), format!("Generation failed: {expected}"));
        assert_eq!(fs::read_dir(outputs.path())?.count(), 0);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn error_as_first_event() -> Result<()> {
        assert_execution_failure(
            vec![
                r#"{"type": "error", "data": {"message": "unknown checkpoint"}}"#,
                image_event(),
            ],
            "unknown checkpoint",
        )
        .await
    }

    #[tokio::test]
    async fn error_after_imageless_output() -> Result<()> {
        assert_execution_failure(
            vec![
                r#"{"type": "executing", "data": {"node": "7"}}"#,
                r#"{"type": "executed", "data": {"node": "7", "output": {"images": []}}}"#,
                r#"{"type": "executed", "data": {"node": "6"}}"#,
                r#"{"type": "error", "data": {"message": "VAE decode failed"}}"#,
                image_event(),
            ],
            "VAE decode failed",
        )
        .await
    }

    #[tokio::test]
    async fn rejected_submission_never_opens_channel() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![image_event()],
            reject_with: Some(500),
            ..Default::default()
        });

        let err = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ComfyError>(),
            Some(ComfyError::SubmissionRejected { status: 500, .. })
        ));
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read_dir(outputs.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stream_ending_early_is_a_failure() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![r#"{"type": "executing", "data": {"node": "3"}}"#],
            ..Default::default()
        });

        let err = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComfyError>(),
            Some(ComfyError::ChannelClosed)
        ));
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn finished_without_image() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "executing", "data": {"node": "3"}}"#,
                r#"{"type": "executing", "data": {"node": null}}"#,
            ],
            ..Default::default()
        });

        let err = client(transport, outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComfyError>(),
            Some(ComfyError::FinishedWithoutImage)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn bad_payload_leaves_no_file() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "executed", "data": {"node": "8", "output": {"images": ["data:image/png;base64,%%%"]}}}"#,
            ],
            ..Default::default()
        });

        let err = client(transport.clone(), outputs.path().into())
            .generate(&fox_graph())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComfyError>(),
            Some(ComfyError::BadImagePayload(_))
        ));
        assert_eq!(fs::read_dir(outputs.path())?.count(), 0);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn timeout_abandons_the_call() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![r#"{"type": "executing", "data": {"node": "3"}}"#],
            stall: true,
            ..Default::default()
        });

        let client = GenerationClient::new(
            transport.clone(),
            "http://comfyui:8188".parse()?,
            outputs.path().into(),
            Some(Duration::from_millis(50)),
        );
        let err = client.generate(&fox_graph()).await.unwrap_err();
        assert_eq!(err.to_string(), "Timed out after 50ms");
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 0);
        assert_eq!(transport.released.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_dir(outputs.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn timeout_during_write_leaves_no_image() -> Result<()> {
        let outputs = tempdir()?;
        let encoded = BASE64_STANDARD.encode(vec![7u8; 48 << 20]);
        let event = format!(
            r#"{{"type": "executed", "data": {{"node": "8", "output": {{"images": ["data:image/png;base64,{encoded}"]}}}}}}"#
        );
        let transport = Arc::new(ScriptedTransport {
            script: vec![Box::leak(event.into_boxed_str())],
            ..Default::default()
        });

        let client = GenerationClient::new(
            transport.clone(),
            "http://comfyui:8188".parse()?,
            outputs.path().into(),
            Some(Duration::from_millis(5)),
        );
        let err = client.generate(&fox_graph()).await.unwrap_err();
        assert!(err.to_string().starts_with("Timed out after"), "{err}");

        // the staging task may still be running; its temp file goes away with it
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while fs::read_dir(outputs.path())?.count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "temp file never removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let client_id = transport.submitted_ids.lock().unwrap()[0].clone();
        assert!(!outputs.path().join(format!("{client_id}.png")).exists());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_calls_use_distinct_paths() -> Result<()> {
        let outputs = tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            script: vec![
                r#"{"type": "executing", "data": {"node": "3"}}"#,
                image_event(),
            ],
            ..Default::default()
        });
        let client = client(transport.clone(), outputs.path().into());

        let mut handles = vec![];
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.generate(&fox_graph()).await
            }));
        }

        let mut paths = vec![];
        for handle in handles {
            paths.push(handle.await??.path);
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
        assert_eq!(fs::read_dir(outputs.path())?.count(), 8);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 8);
        assert_eq!(transport.released.load(Ordering::SeqCst), 8);
        Ok(())
    }
}
