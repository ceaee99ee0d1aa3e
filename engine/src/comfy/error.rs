use thiserror::Error;

/// Failures reported by, or about, the generation service
#[derive(Debug, Error)]
pub enum ComfyError {
    #[error("Workflow submission rejected ({status}): {body}")]
    SubmissionRejected { status: u16, body: String },

    #[error("Generation failed: {message}")]
    Execution { message: String },

    #[error("Workflow finished without producing an image")]
    FinishedWithoutImage,

    #[error("Event stream closed before an image arrived")]
    ChannelClosed,

    #[error("Malformed `{event_type}` event: {reason}")]
    MalformedEvent { event_type: String, reason: String },

    #[error("Undecodable image payload: {0}")]
    BadImagePayload(String),
}
