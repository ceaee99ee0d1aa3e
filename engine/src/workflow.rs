//! The workflow graph submitted to the generation service.
//!
//! The topology is fixed: a checkpoint loader feeds the sampler and both text
//! encoders, the sampler output is decoded by the VAE and handed to the saver.
//! Only leaf values change from request to request. Nodes are keyed by
//! [`NodeRole`] and links are typed `(role, slot)` pairs, so a reference to a
//! node that isn't part of the graph can't be spelled by accident.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use strum::{Display, EnumIter};

use crate::request::GenerationRequest;

const SAVE_PREFIX: &str = "ComfyUI";

/// The six nodes of the graph. There is no latent-image node: the image size
/// rides on the sampler as `width`/`height` inputs, which a stock `KSampler`
/// doesn't declare (it expects a `latent_image` link instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum NodeRole {
    Sampler,
    CheckpointLoader,
    PositivePrompt,
    NegativePrompt,
    Decoder,
    Saver,
}

impl NodeRole {
    /// Node id on the wire
    pub fn id(&self) -> &'static str {
        match self {
            NodeRole::Sampler => "3",
            NodeRole::CheckpointLoader => "4",
            NodeRole::PositivePrompt => "5",
            NodeRole::NegativePrompt => "6",
            NodeRole::Decoder => "7",
            NodeRole::Saver => "8",
        }
    }

    pub fn class_type(&self) -> &'static str {
        match self {
            NodeRole::Sampler => "KSampler",
            NodeRole::CheckpointLoader => "CheckpointLoaderSimple",
            NodeRole::PositivePrompt | NodeRole::NegativePrompt => "CLIPTextEncode",
            NodeRole::Decoder => "VAEDecode",
            NodeRole::Saver => "SaveImage",
        }
    }

    fn out(self, slot: u32) -> Input {
        Input::Link(Link { node: self, slot })
    }
}

impl Serialize for NodeRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

// Output slots of the checkpoint loader
const MODEL_SLOT: u32 = 0;
const CLIP_SLOT: u32 = 1;
const VAE_SLOT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub node: NodeRole,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Text(String),
    Int(i64),
    Float(f64),
    Link(Link),
}

impl Serialize for Input {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Input::Text(s) => serializer.serialize_str(s),
            Input::Int(i) => serializer.serialize_i64(*i),
            Input::Float(f) => serializer.serialize_f64(*f),
            // links go over the wire as `["<node id>", slot]`
            Input::Link(link) => (link.node.id(), link.slot).serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub class_type: &'static str,
    pub inputs: BTreeMap<&'static str, Input>,
}

impl Node {
    fn new<const N: usize>(role: NodeRole, inputs: [(&'static str, Input); N]) -> Self {
        Self {
            class_type: role.class_type(),
            inputs: inputs.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeRole, Node>,
}

impl WorkflowGraph {
    pub fn node(&self, role: NodeRole) -> Option<&Node> {
        self.nodes.get(&role)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every link in the graph as `(owner, input name, link)`.
    pub fn links(&self) -> impl Iterator<Item = (NodeRole, &'static str, Link)> + '_ {
        self.nodes.iter().flat_map(|(role, node)| {
            node.inputs.iter().filter_map(move |(name, input)| match input {
                Input::Link(link) => Some((*role, *name, *link)),
                _ => None,
            })
        })
    }

    /// Links pointing at nodes that aren't in the graph.
    pub fn dangling_links(&self) -> Vec<(NodeRole, &'static str, Link)> {
        self.links()
            .filter(|(_, _, link)| !self.nodes.contains_key(&link.node))
            .collect()
    }
}

/// Binds a request onto the fixed six node pipeline.
pub fn build_workflow(req: &GenerationRequest, default_model: &str) -> WorkflowGraph {
    use NodeRole::*;

    let nodes = [
        (
            Sampler,
            Node::new(
                Sampler,
                [
                    ("seed", Input::Int(req.seed)),
                    ("steps", Input::Int(req.steps.into())),
                    ("cfg", Input::Float(req.cfg_scale)),
                    ("sampler_name", Input::Text(req.sampler.clone())),
                    ("scheduler", Input::Text(req.scheduler.clone())),
                    ("denoise", Input::Float(1.0)),
                    ("width", Input::Int(req.width.into())),
                    ("height", Input::Int(req.height.into())),
                    ("model", CheckpointLoader.out(MODEL_SLOT)),
                    ("positive", PositivePrompt.out(0)),
                    ("negative", NegativePrompt.out(0)),
                ],
            ),
        ),
        (
            CheckpointLoader,
            Node::new(
                CheckpointLoader,
                [(
                    "ckpt_name",
                    Input::Text(req.checkpoint(default_model).to_string()),
                )],
            ),
        ),
        (
            PositivePrompt,
            Node::new(
                PositivePrompt,
                [
                    ("text", Input::Text(req.description.clone())),
                    ("clip", CheckpointLoader.out(CLIP_SLOT)),
                ],
            ),
        ),
        (
            NegativePrompt,
            Node::new(
                NegativePrompt,
                [
                    ("text", Input::Text(req.negative_prompt.clone())),
                    ("clip", CheckpointLoader.out(CLIP_SLOT)),
                ],
            ),
        ),
        (
            Decoder,
            Node::new(
                Decoder,
                [
                    ("samples", Sampler.out(0)),
                    ("vae", CheckpointLoader.out(VAE_SLOT)),
                ],
            ),
        ),
        (
            Saver,
            Node::new(
                Saver,
                [
                    ("filename_prefix", Input::Text(SAVE_PREFIX.into())),
                    ("images", Decoder.out(0)),
                ],
            ),
        ),
    ];

    WorkflowGraph {
        nodes: nodes.into_iter().collect(),
    }
}
