use color_eyre::{
    Result,
    eyre::{WrapErr as _, bail, eyre},
};
use log::{debug, info};
use reqwest::{Client, Url};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

use super::{
    BoxFuture, ChannelBox, ClientSession, ComfyError, ComfyTransport, EventChannel, StreamEvent,
    events::StoredImage,
};
use crate::workflow::WorkflowGraph;

/// Talks to the service over HTTP for submissions and a websocket for events.
#[derive(Clone, Default)]
pub struct ComfyApi {
    client: Client,
}

#[derive(Debug, Serialize)]
pub struct PromptRequest<'a> {
    pub prompt: &'a WorkflowGraph,
    pub client_id: &'a str,
}

impl ComfyApi {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

/// `ws://host/ws?clientId=...` for an `http://host` server, `wss` for `https`.
pub fn channel_url(server: &Url, client_id: &str) -> Result<Url> {
    let mut url = server.join("ws")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("Unsupported scheme for the event channel: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| eyre!("Couldn't switch {server} to {scheme}"))?;
    url.query_pairs_mut().append_pair("clientId", client_id);
    Ok(url)
}

pub async fn submit_prompt(
    client: &Client,
    session: &ClientSession,
    graph: &WorkflowGraph,
) -> Result<()> {
    let resp = client
        .post(session.server.join("prompt")?)
        .json(&PromptRequest {
            prompt: graph,
            client_id: &session.client_id,
        })
        .send()
        .await
        .wrap_err("Couldn't reach the generation service")?;

    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ComfyError::SubmissionRejected {
            status: status.as_u16(),
            body,
        }
        .into());
    }

    info!("Workflow accepted for {}", session.client_id);
    debug!("Submission ack: {body}");
    Ok(())
}

pub async fn fetch_stored_image(
    client: &Client,
    server: &Url,
    image: &StoredImage,
) -> Result<Vec<u8>> {
    let bytes = client
        .get(server.join("view")?)
        .query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.folder_type.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(bytes.to_vec())
}

impl ComfyTransport for ComfyApi {
    fn submit<'a>(
        &'a self,
        session: &'a ClientSession,
        graph: &'a WorkflowGraph,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(submit_prompt(&self.client, session, graph))
    }

    fn open_channel<'a>(&'a self, session: &'a ClientSession) -> BoxFuture<'a, Result<ChannelBox>> {
        Box::pin(async move {
            let url = channel_url(&session.server, &session.client_id)?;
            debug!("Opening event channel {url}");
            let (ws, _) = connect_async(url.as_str())
                .await
                .wrap_err("Couldn't open the event channel")?;
            Ok(Box::new(WsChannel { ws }) as ChannelBox)
        })
    }

    fn fetch_image<'a>(
        &'a self,
        session: &'a ClientSession,
        image: &'a StoredImage,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(fetch_stored_image(&self.client, &session.server, image))
    }
}

/// Dropping the channel drops the socket, so an abandoned call doesn't leak
/// the connection even without `close`.
pub struct WsChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl EventChannel for WsChannel {
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<StreamEvent>>> {
        Box::pin(async move {
            while let Some(msg) = self.ws.next().await {
                match msg? {
                    Message::Text(text) => return Ok(Some(StreamEvent::parse(text.as_str())?)),
                    Message::Binary(bytes) => {
                        // live previews, we only care about the final image
                        debug!("Skipping binary frame ({} bytes)", bytes.len());
                    }
                    Message::Close(frame) => {
                        debug!("Service closed the channel: {frame:?}");
                        return Ok(None);
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            Ok(None)
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.ws.close(None).await {
                Ok(())
                | Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
