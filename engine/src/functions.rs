//! Metadata the host shows to users and tool-calling models.

use serde::{Serialize, Serializer, ser::SerializeMap};
use serde_json::Value;
use strum::Display;

use crate::{config::DEFAULT_MODEL, request};

pub const GENERATE_IMAGE: &str = "generate_image";
pub const ANALYZE_IMAGE: &str = "analyze_image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamDefault {
    Text(&'static str),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Parameter {
    #[serde(skip)]
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamDefault>,
}

impl Parameter {
    const fn required(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            default: None,
        }
    }

    const fn optional(
        name: &'static str,
        kind: ParamType,
        description: &'static str,
        default: ParamDefault,
    ) -> Self {
        Self {
            name,
            kind,
            description,
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FunctionDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(serialize_with = "parameters_by_name")]
    pub parameters: &'static [Parameter],
    pub function: &'static str,
}

fn parameters_by_name<S: Serializer>(params: &[Parameter], s: S) -> Result<S::Ok, S::Error> {
    let mut map = s.serialize_map(Some(params.len()))?;
    for p in params {
        map.serialize_entry(p.name, p)?;
    }
    map.end()
}

impl FunctionDescriptor {
    pub fn parameter(&self, name: &str) -> Option<&'static Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Checks a host call's arguments against the declared schema.
    pub fn check_args(&self, args: &serde_json::Map<String, Value>) -> Result<(), String> {
        for p in self.parameters {
            match args.get(p.name) {
                None | Some(Value::Null) if p.default.is_none() => {
                    return Err(format!("missing required parameter `{}`", p.name));
                }
                Some(v) if !v.is_null() && !p.kind.accepts(v) => {
                    return Err(format!("parameter `{}` must be {}, got {v}", p.name, p.kind));
                }
                _ => {}
            }
        }
        if let Some(unknown) = args.keys().find(|k| self.parameter(k).is_none()) {
            return Err(format!("unknown parameter `{unknown}` for {}", self.name));
        }
        Ok(())
    }
}

const GENERATE_PARAMS: &[Parameter] = &[
    Parameter::required(
        "description",
        ParamType::String,
        "Text description of the image to generate",
    ),
    Parameter::optional(
        "negative_prompt",
        ParamType::String,
        "Negative prompt to guide what not to generate",
        ParamDefault::Text(request::DEFAULT_NEGATIVE_PROMPT),
    ),
    Parameter::optional(
        "width",
        ParamType::Integer,
        "Image width",
        ParamDefault::Int(request::DEFAULT_SIZE as i64),
    ),
    Parameter::optional(
        "height",
        ParamType::Integer,
        "Image height",
        ParamDefault::Int(request::DEFAULT_SIZE as i64),
    ),
    Parameter::optional(
        "steps",
        ParamType::Integer,
        "Number of sampling steps",
        ParamDefault::Int(request::DEFAULT_STEPS as i64),
    ),
    Parameter::optional(
        "cfg_scale",
        ParamType::Number,
        "Classifier-free guidance scale",
        ParamDefault::Float(request::DEFAULT_CFG_SCALE),
    ),
    Parameter::optional(
        "model",
        ParamType::String,
        "Model checkpoint to use",
        ParamDefault::Text(DEFAULT_MODEL),
    ),
    Parameter::optional(
        "sampler",
        ParamType::String,
        "Sampling method",
        ParamDefault::Text(request::DEFAULT_SAMPLER),
    ),
    Parameter::optional(
        "scheduler",
        ParamType::String,
        "Scheduler type",
        ParamDefault::Text(request::DEFAULT_SCHEDULER),
    ),
    Parameter::optional(
        "seed",
        ParamType::Integer,
        "Random seed (-1 for random)",
        ParamDefault::Int(request::RANDOM_SEED),
    ),
];

const ANALYZE_PARAMS: &[Parameter] = &[
    Parameter::required("image_path", ParamType::String, "Path to the image file"),
    Parameter::required("description", ParamType::String, "Text description to compare against"),
];

pub static FUNCTIONS: [FunctionDescriptor; 2] = [
    FunctionDescriptor {
        name: GENERATE_IMAGE,
        description: "Generate an image using ComfyUI with CLIP-guided refinement",
        parameters: GENERATE_PARAMS,
        function: GENERATE_IMAGE,
    },
    FunctionDescriptor {
        name: ANALYZE_IMAGE,
        description: "Analyze how well an image matches a description using CLIP",
        parameters: ANALYZE_PARAMS,
        function: ANALYZE_IMAGE,
    },
];

pub fn find(name: &str) -> Option<&'static FunctionDescriptor> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

/// The manifest handed to the host: descriptors keyed by function name.
pub fn get_functions() -> Value {
    Value::Object(
        FUNCTIONS
            .iter()
            .map(|f| {
                (
                    f.name.to_string(),
                    serde_json::to_value(f).unwrap_or(Value::Null),
                )
            })
            .collect(),
    )
}
