//! Job graph model.
//!
//! A job graph maps node IDs to node definitions. Inside the crate each
//! node carries a [`NodeKind`] so that inputs the builder relies on can be
//! checked before submission; the plain string-keyed JSON shape only
//! appears at the serialization boundary ([`JobGraph::to_value`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StudioError;

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Operation types the builder knows how to parameterize.
///
/// Anything else is carried through untouched as [`NodeKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    KSampler,
    KSamplerAdvanced,
    LoadImage,
    ClipTextEncode,
    QwenEditTextEncode,
    LoraStackLoader,
    ImageScaleToTotalPixels,
    EmptyLatentImage,
    WanImageToVideo,
    VaeDecode,
    SaveImage,
    VideoCombine,
    FrameInterpolation,
    Other(String),
}

impl NodeKind {
    /// The backend's `class_type` string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::KSampler => "KSampler",
            Self::KSamplerAdvanced => "KSamplerAdvanced",
            Self::LoadImage => "LoadImage",
            Self::ClipTextEncode => "CLIPTextEncode",
            Self::QwenEditTextEncode => "TextEncodeQwenImageEditPlus",
            Self::LoraStackLoader => "LoraStackLoader",
            Self::ImageScaleToTotalPixels => "ImageScaleToTotalPixels",
            Self::EmptyLatentImage => "EmptySD3LatentImage",
            Self::WanImageToVideo => "WanImageToVideo",
            Self::VaeDecode => "VAEDecode",
            Self::SaveImage => "SaveImage",
            Self::VideoCombine => "VHS_VideoCombine",
            Self::FrameInterpolation => "RIFE VFI",
            Self::Other(name) => name,
        }
    }

    /// Inputs that must be present on a node of this kind.
    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            Self::KSampler => &[
                "seed",
                "steps",
                "sampler_name",
                "scheduler",
                "model",
                "positive",
                "negative",
                "latent_image",
            ],
            Self::KSamplerAdvanced => &[
                "noise_seed",
                "steps",
                "sampler_name",
                "scheduler",
                "start_at_step",
                "end_at_step",
                "model",
                "positive",
                "negative",
                "latent_image",
            ],
            Self::LoadImage => &["image"],
            Self::ClipTextEncode => &["text", "clip"],
            Self::QwenEditTextEncode => &["prompt", "clip"],
            Self::LoraStackLoader => &["model", "lora_count"],
            Self::ImageScaleToTotalPixels => &["image", "megapixels"],
            Self::EmptyLatentImage => &["width", "height", "batch_size"],
            Self::WanImageToVideo => &["width", "height", "length", "start_image"],
            Self::VaeDecode => &["samples", "vae"],
            Self::SaveImage => &["images"],
            Self::VideoCombine => &["images", "frame_rate"],
            Self::FrameInterpolation => &["frames", "multiplier"],
            Self::Other(_) => &[],
        }
    }
}

impl From<String> for NodeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "KSampler" => Self::KSampler,
            "KSamplerAdvanced" => Self::KSamplerAdvanced,
            "LoadImage" => Self::LoadImage,
            "CLIPTextEncode" => Self::ClipTextEncode,
            "TextEncodeQwenImageEditPlus" => Self::QwenEditTextEncode,
            "LoraStackLoader" => Self::LoraStackLoader,
            "ImageScaleToTotalPixels" => Self::ImageScaleToTotalPixels,
            "EmptySD3LatentImage" => Self::EmptyLatentImage,
            "WanImageToVideo" => Self::WanImageToVideo,
            "VAEDecode" => Self::VaeDecode,
            "SaveImage" => Self::SaveImage,
            "VHS_VideoCombine" => Self::VideoCombine,
            "RIFE VFI" => Self::FrameInterpolation,
            _ => Self::Other(value),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Reference to output slot `1` of node `0`, serialized as `["id", slot]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLink(pub String, pub u32);

impl NodeLink {
    pub fn new(node_id: impl Into<String>, slot: u32) -> Self {
        Self(node_id.into(), slot)
    }

    pub fn node_id(&self) -> &str {
        &self.0
    }
}

/// One node input: either a literal scalar or a link to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Link(NodeLink),
    Literal(serde_json::Value),
}

impl InputValue {
    pub fn as_link(&self) -> Option<&NodeLink> {
        match self {
            Self::Link(link) => Some(link),
            Self::Literal(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(value) => value.as_str(),
            Self::Link(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Literal(value) => value.as_f64(),
            Self::Link(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Literal(value) => value.as_u64(),
            Self::Link(_) => None,
        }
    }
}

impl From<NodeLink> for InputValue {
    fn from(link: NodeLink) -> Self {
        Self::Link(link)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::Literal(value.into())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::Literal(value.into())
    }
}

impl From<u64> for InputValue {
    fn from(value: u64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<u32> for InputValue {
    fn from(value: u32) -> Self {
        Self::Literal(value.into())
    }
}

impl From<f64> for InputValue {
    fn from(value: f64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        Self::Literal(value.into())
    }
}

// ---------------------------------------------------------------------------
// Nodes and graphs
// ---------------------------------------------------------------------------

/// Editor metadata carried alongside a node. Ignored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub title: String,
}

/// A single operation in a job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub class_type: NodeKind,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
}

impl NodeDefinition {
    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn links(&self) -> impl Iterator<Item = (&str, &NodeLink)> {
        self.inputs
            .iter()
            .filter_map(|(name, value)| value.as_link().map(|link| (name.as_str(), link)))
    }
}

/// Mapping from node ID to node definition, as submitted to `/prompt`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: BTreeMap<String, NodeDefinition>,
}

impl JobGraph {
    /// Parse a graph in the backend's API JSON format.
    pub fn from_json(json: &str) -> Result<Self, StudioError> {
        serde_json::from_str(json)
            .map_err(|e| StudioError::Configuration(format!("Invalid workflow JSON: {e}")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeDefinition)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn insert(&mut self, node_id: impl Into<String>, node: NodeDefinition) {
        self.nodes.insert(node_id.into(), node);
    }

    pub fn remove(&mut self, node_id: &str) -> Option<NodeDefinition> {
        self.nodes.remove(node_id)
    }

    /// Node IDs from `required` that are absent from this graph, in order.
    pub fn missing_nodes<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|id| !self.nodes.contains_key(*id))
            .collect()
    }

    /// Overwrite (or add) one input on an existing node.
    pub fn set_input(
        &mut self,
        node_id: &str,
        input: &str,
        value: impl Into<InputValue>,
    ) -> Result<(), StudioError> {
        let node = self.nodes.get_mut(node_id).ok_or_else(|| {
            StudioError::Configuration(format!("Workflow is missing node {node_id}"))
        })?;
        node.inputs.insert(input.to_string(), value.into());
        Ok(())
    }

    /// Drop one input from an existing node, if present.
    pub fn clear_input(&mut self, node_id: &str, input: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.inputs.remove(input);
        }
    }

    /// Check that every link resolves inside this graph and that every
    /// known node kind carries its required inputs.
    pub fn validate(&self) -> Result<(), StudioError> {
        for (id, node) in &self.nodes {
            for (input, link) in node.links() {
                if !self.nodes.contains_key(link.node_id()) {
                    return Err(StudioError::Validation(format!(
                        "Node {id} input '{input}' references missing node {}",
                        link.node_id()
                    )));
                }
            }
            for required in node.class_type.required_inputs() {
                if !node.inputs.contains_key(*required) {
                    return Err(StudioError::Validation(format!(
                        "Node {id} ({}) is missing input '{required}'",
                        node.class_type.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The JSON shape the backend's `/prompt` endpoint expects.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
