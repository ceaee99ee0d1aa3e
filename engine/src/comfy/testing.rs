//! An in-memory service that replays canned events.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use base64::{Engine, prelude::BASE64_STANDARD};
use color_eyre::Result;

use super::{
    BoxFuture, ChannelBox, ClientSession, ComfyError, ComfyTransport, EventChannel, StreamEvent,
    events::StoredImage,
};
use crate::workflow::WorkflowGraph;

/// Replays a fixed list of raw messages for every channel it opens.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    pub(crate) script: Vec<&'static str>,
    pub(crate) reject_with: Option<u16>,
    pub(crate) stall: bool,
    pub(crate) stored_image: Vec<u8>,
    pub(crate) opened: AtomicUsize,
    pub(crate) closed: Arc<AtomicUsize>,
    pub(crate) released: Arc<AtomicUsize>,
    pub(crate) submitted_ids: Mutex<Vec<String>>,
}

pub(crate) struct ScriptedChannel {
    events: VecDeque<&'static str>,
    stall: bool,
    closed: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ComfyTransport for ScriptedTransport {
    fn submit<'a>(
        &'a self,
        session: &'a ClientSession,
        _graph: &'a WorkflowGraph,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.submitted_ids
                .lock()
                .unwrap()
                .push(session.client_id.clone());
            match self.reject_with {
                Some(status) => Err(ComfyError::SubmissionRejected {
                    status,
                    body: "{}".into(),
                }
                .into()),
                None => Ok(()),
            }
        })
    }

    fn open_channel<'a>(
        &'a self,
        _session: &'a ClientSession,
    ) -> BoxFuture<'a, Result<ChannelBox>> {
        Box::pin(async move {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedChannel {
                events: self.script.iter().copied().collect(),
                stall: self.stall,
                closed: self.closed.clone(),
                released: self.released.clone(),
            }) as ChannelBox)
        })
    }

    fn fetch_image<'a>(
        &'a self,
        _session: &'a ClientSession,
        image: &'a StoredImage,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            assert_eq!(image.filename, "ComfyUI_00001_.png");
            Ok(self.stored_image.clone())
        })
    }
}

impl EventChannel for ScriptedChannel {
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<StreamEvent>>> {
        Box::pin(async move {
            match self.events.pop_front() {
                Some(raw) => {
                    tokio::task::yield_now().await;
                    Ok(Some(StreamEvent::parse(raw)?))
                }
                None if self.stall => std::future::pending().await,
                None => Ok(None),
            }
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) const FOX_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 13, 10, 26, 10, 0, 0, 0, 13, 42];

pub(crate) fn image_event() -> &'static str {
    let encoded = BASE64_STANDARD.encode(FOX_PNG);
    let msg = format!(
        r#"{{"type": "executed", "data": {{"node": "8", "output": {{"images": ["data:image/png;base64,{encoded}"]}}}}}}"#
    );
    Box::leak(msg.into_boxed_str())
}
