//! Graph, port and value types shared by every engine module
//!
//! These types define the structure of a generation graph as handed over by
//! the editor (nodes, edges, handles) and the typed values that flow along
//! its edges during a run.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for a handle (named port on a node)
pub type HandleId = String;

/// Handle used when an edge or output does not name one
pub const DEFAULT_HANDLE: &str = "default";

/// Conventional output handle of every built-in node
pub const OUTPUT_HANDLE: &str = "out";

/// Node variant, decoded from the editor's `type` tag.
///
/// Unrecognised tags are preserved in `Other` so they can be logged and
/// routed to the passthrough handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Text,
    Image,
    Video,
    Audio,
    Upscaler,
    Media,
    Chip,
    SaveMedia,
    Display,
    Group,
    Other(String),
}

impl NodeType {
    /// Editor tag for this variant
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Upscaler => "upscaler",
            Self::Media => "media",
            Self::Chip => "chip",
            Self::SaveMedia => "save-media",
            Self::Display => "display",
            Self::Group => "group",
            Self::Other(tag) => tag,
        }
    }

    /// Variants that submit a remote generation job
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Image | Self::Video | Self::Audio | Self::Upscaler
        )
    }
}

impl From<String> for NodeType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "upscaler" => Self::Upscaler,
            "media" => Self::Media,
            "chip" => Self::Chip,
            "save-media" => Self::SaveMedia,
            "display" | "display-text" => Self::Display,
            "group" => Self::Group,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for NodeType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        node_type.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic kind of a value flowing through a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Text,
    Image,
    Video,
    Audio,
    /// Untyped value, produced by passthrough nodes
    Any,
}

impl DataKind {
    /// Parse a media kind from a MIME type or a loose tag such as `"image"`
    pub fn from_media_hint(hint: &str) -> Option<Self> {
        let lowered = hint.to_ascii_lowercase();
        let head = lowered.split('/').next().unwrap_or_default();
        match head {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed value produced at one output handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortValue {
    /// Semantic kind of the value
    #[serde(rename = "type")]
    pub kind: DataKind,
    /// The value itself (text, URL, path, or arbitrary JSON)
    pub value: Value,
    /// Provider metadata (prediction id, model, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Placeholder identifier when this value comes from a chip node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip_id: Option<String>,
    /// Chip payloads feed placeholder substitution only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_chip: bool,
}

impl PortValue {
    /// Create a plain value of the given kind
    pub fn new(kind: DataKind, value: impl Into<Value>) -> Self {
        Self {
            kind,
            value: value.into(),
            metadata: None,
            chip_id: None,
            is_chip: false,
        }
    }

    /// Create a text value
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(DataKind::Text, Value::String(value.into()))
    }

    /// Create a chip value carrying its placeholder id
    pub fn chip(chip_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: DataKind::Text,
            value: Value::String(content.into()),
            metadata: None,
            chip_id: Some(chip_id.into()),
            is_chip: true,
        }
    }

    /// Attach provider metadata
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The value as a string slice, if it is one
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// A value is empty when it is null or a blank string
    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }
}

/// Outputs of one node, keyed by its own output handles
pub type NodeOutputs = HashMap<HandleId, PortValue>;

/// Outputs of every node produced (or seeded) during a run
pub type OutputTable = HashMap<NodeId, NodeOutputs>;

/// One node placed in the editor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Editor-assigned node id
    pub id: NodeId,
    /// Node variant
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Model id, prompt text, numeric settings, uploaded file references
    #[serde(default)]
    pub data: Value,
}

impl GraphNode {
    /// Create a node with the given data
    pub fn new(id: impl Into<String>, node_type: impl Into<NodeType>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
        }
    }

    /// String field of `data`, if present and non-empty
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Raw field of `data`
    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }
}

/// An edge connecting two handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Editor-assigned edge id
    #[serde(default)]
    pub id: String,
    /// Source node ID
    pub source: NodeId,
    /// Source handle ID
    #[serde(default)]
    pub source_handle: Option<HandleId>,
    /// Target node ID
    pub target: NodeId,
    /// Target handle ID
    #[serde(default)]
    pub target_handle: Option<HandleId>,
}

impl GraphEdge {
    /// Create an edge between two handles
    pub fn new(
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            source_handle: Some(source_handle.into()),
            target,
            target_handle: Some(target_handle.into()),
        }
    }

    /// Source handle, falling back to the default handle
    pub fn source_handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_HANDLE)
    }

    /// Target handle, falling back to the default handle
    pub fn target_handle(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(DEFAULT_HANDLE)
    }
}

/// Nodes and edges as saved by the editor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    /// Nodes in the graph
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Edges connecting nodes
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    /// Create a graph from its parts
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }
}
