//! Messages arriving over the streaming channel.
//!
//! Each text frame is `{"type": ..., "data": {...}}`. Known types with a
//! payload that doesn't match are an error; unknown types are kept as
//! [`StreamEvent::Unknown`] so newer service versions don't break the loop.

use serde::Deserialize;
use serde_json::Value;

use super::ComfyError;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `node` is `None` once the service is done with the prompt
    Executing { node: Option<String> },
    Progress(Progress),
    Executed(Executed),
    Error { message: String },
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Progress {
    pub value: f64,
    /// Some services report steps as `value`/`max`, others send a fraction.
    #[serde(default)]
    pub max: Option<f64>,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        let f = match self.max {
            Some(max) if max > 0.0 => self.value / max,
            _ => self.value,
        };
        f.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Executed {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub output: Option<Output>,
}

impl Executed {
    pub fn first_image(&self) -> Option<&ImagePayload> {
        self.output.as_ref()?.images.first()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    /// Base64 data, usually behind a format marker like `data:image/png;base64,`
    Encoded(String),
    /// A file kept by the service, fetched separately
    Stored(StoredImage),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".into()
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ExecutingData {
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionErrorData {
    exception_message: String,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
}

impl StreamEvent {
    pub fn parse(text: &str) -> Result<Self, ComfyError> {
        let raw: RawEvent = serde_json::from_str(text).map_err(|e| ComfyError::MalformedEvent {
            event_type: "<unparsed>".into(),
            reason: e.to_string(),
        })?;

        let malformed = |e: serde_json::Error| ComfyError::MalformedEvent {
            event_type: raw.event_type.clone(),
            reason: e.to_string(),
        };

        let event = match raw.event_type.as_str() {
            "executing" => {
                let data: ExecutingData =
                    serde_json::from_value(raw.data.clone()).map_err(malformed)?;
                StreamEvent::Executing { node: data.node }
            }
            "progress" => {
                StreamEvent::Progress(serde_json::from_value(raw.data.clone()).map_err(malformed)?)
            }
            "executed" => {
                StreamEvent::Executed(serde_json::from_value(raw.data.clone()).map_err(malformed)?)
            }
            "error" => {
                let data: ErrorData = serde_json::from_value(raw.data.clone()).map_err(malformed)?;
                StreamEvent::Error {
                    message: data.message,
                }
            }
            "execution_error" => {
                let data: ExecutionErrorData =
                    serde_json::from_value(raw.data.clone()).map_err(malformed)?;
                let message = match (data.node_id, data.node_type) {
                    (Some(id), Some(ty)) => format!("node {id} ({ty}): {}", data.exception_message),
                    (Some(id), None) => format!("node {id}: {}", data.exception_message),
                    _ => data.exception_message,
                };
                StreamEvent::Error { message }
            }
            "execution_interrupted" => StreamEvent::Error {
                message: "execution interrupted".into(),
            },
            _ => StreamEvent::Unknown(raw.event_type.clone()),
        };

        Ok(event)
    }
}
