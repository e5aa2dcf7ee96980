//! Provider request construction
//!
//! Connected values are mapped onto a model's schema fields by handle name or
//! by semantic kind, then unset fields are filled from the node's own
//! settings and finally the schema defaults. Without a schema a minimal
//! request (prompt, first image/video, numeric settings) is built instead.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::chips::ChipResolver;
use crate::error::{NodeEngineError, Result};
use crate::inputs::NodeInputs;
use crate::schema::{FieldRole, FieldSchema, NormalizedSchema};
use crate::types::{DataKind, GraphNode, HandleId, NodeType, PortValue};

/// Node data keys that are never forwarded as model settings
const RESERVED_KEYS: &[&str] = &[
    "model",
    "prompt",
    "negativePrompt",
    "systemPrompt",
    "chipValues",
    "chipId",
    "content",
    "output",
    "metadata",
    "label",
    "parameters",
    "mediaPath",
    "mediaType",
    "filePath",
    "fileId",
    "fileUrl",
    "fileExpiresAt",
];

/// Error text for a generation node with nothing to generate from
pub const NO_PROMPT: &str = "No prompt provided";

/// Non-chip values connected to a node, tagged with their target handle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectedInputs {
    values: Vec<(HandleId, PortValue)>,
}

impl ConnectedInputs {
    /// Flatten aggregated inputs, dropping chip payloads and empty values
    ///
    /// Untyped string values count as text. Handles are visited in name order.
    pub fn from_inputs(inputs: &NodeInputs) -> Self {
        let mut handles: Vec<&HandleId> = inputs.keys().collect();
        handles.sort();

        let mut values = Vec::new();
        for handle in handles {
            for value in inputs[handle].values() {
                if value.is_chip || value.is_empty() {
                    continue;
                }
                let mut value = value.clone();
                if value.kind == DataKind::Any {
                    if !value.value.is_string() {
                        log::debug!("Ignoring untyped non-text input on '{}'", handle);
                        continue;
                    }
                    value.kind = DataKind::Text;
                }
                values.push((handle.clone(), value));
            }
        }
        Self { values }
    }

    /// Substitute chip placeholders in every text value
    pub fn resolve_chips(&mut self, chips: &ChipResolver) {
        if chips.is_empty() {
            return;
        }
        for (_, value) in &mut self.values {
            if value.kind == DataKind::Text {
                if let Some(text) = value.as_str() {
                    value.value = Value::String(chips.resolve(text));
                }
            }
        }
    }

    /// Values of one kind, in connection order
    pub fn of_kind(&self, kind: DataKind) -> Vec<&PortValue> {
        self.values
            .iter()
            .filter(|(_, v)| v.kind == kind)
            .map(|(_, v)| v)
            .collect()
    }

    /// Connected text, in connection order
    pub fn texts(&self) -> Vec<&str> {
        self.of_kind(DataKind::Text)
            .into_iter()
            .filter_map(PortValue::as_str)
            .collect()
    }

    /// First connected value of `kind`
    pub fn first(&self, kind: DataKind) -> Option<&PortValue> {
        self.values.iter().map(|(_, v)| v).find(|v| v.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(HandleId, PortValue)> {
        self.values.iter()
    }
}

/// The node's own prompt fields after chip substitution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFields {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub system_prompt: Option<String>,
}

impl PromptFields {
    /// Read `prompt`, `negativePrompt` and `systemPrompt` from node data
    pub fn from_node(node: &GraphNode, chips: &ChipResolver) -> Self {
        let read = |key: &str| node.data_str(key).map(|s| chips.resolve(s));
        Self {
            prompt: read("prompt"),
            negative_prompt: read("negativePrompt"),
            system_prompt: read("systemPrompt"),
        }
    }
}

/// Join connected text and the node's own prompt, skipping blanks
pub fn combine_prompt(texts: &[&str], own: Option<&str>) -> String {
    texts
        .iter()
        .copied()
        .chain(own)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Setting stored on the node for field `name`
///
/// Looks at `data.<name>`, `data.<camelName>` and `data.parameters.<name>`.
pub fn node_setting<'a>(node: &'a GraphNode, name: &str) -> Option<&'a Value> {
    node.data_value(name)
        .or_else(|| node.data_value(&snake_to_camel(name)))
        .or_else(|| {
            node.data
                .get("parameters")
                .and_then(|p| p.get(name))
                .filter(|v| !v.is_null())
        })
}

/// Convert a node setting to the field's declared type
fn coerce(field: &FieldSchema, value: &Value) -> Option<Value> {
    match (field.field_type.as_deref(), value) {
        (Some("integer"), Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (Some("integer"), Value::Number(n)) if n.is_f64() => {
            n.as_f64().map(|f| Value::from(f.round() as i64))
        }
        (Some("number"), Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
        (Some("boolean"), Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (Some("string"), Value::String(s)) if s.trim().is_empty() => None,
        _ => Some(value.clone()),
    }
}

fn kind_mismatch(model_id: &str, kind: DataKind) -> NodeEngineError {
    NodeEngineError::validation(format!(
        "Model {} does not accept {} inputs",
        model_id, kind
    ))
}

fn place_values(
    request: &mut Map<String, Value>,
    schema: &NormalizedSchema,
    field: &FieldSchema,
    values: &[&PortValue],
) -> Result<()> {
    if values.len() > 1 && !field.accepts_array() {
        return Err(NodeEngineError::validation(format!(
            "Model {} accepts a single value for '{}', but {} are connected",
            schema.model_id,
            field.name,
            values.len()
        )));
    }
    let value = if field.accepts_array() {
        Value::Array(values.iter().map(|v| v.value.clone()).collect())
    } else {
        values[0].value.clone()
    };
    request.insert(field.name.clone(), value);
    Ok(())
}

/// Build a request for `schema` from connected values and node settings
pub fn build_request(
    schema: &NormalizedSchema,
    node: &GraphNode,
    connected: &ConnectedInputs,
    prompts: &PromptFields,
) -> Result<Map<String, Value>> {
    let mut request = Map::new();

    // Values wired straight to a named field
    let mut by_field: Vec<(&FieldSchema, Vec<&PortValue>)> = Vec::new();
    let mut by_kind: Vec<&PortValue> = Vec::new();
    for (handle, value) in connected.iter() {
        match schema.field(handle) {
            Some(field) if field.role != FieldRole::Prompt => {
                if let Some(expected) = field.role.kind() {
                    if expected != value.kind {
                        return Err(NodeEngineError::validation(format!(
                            "Input '{}' of model {} expects {}, got {}",
                            field.name, schema.model_id, expected, value.kind
                        )));
                    }
                }
                match by_field.iter_mut().find(|(f, _)| f.name == field.name) {
                    Some((_, values)) => values.push(value),
                    None => by_field.push((field, vec![value])),
                }
            }
            _ => by_kind.push(value),
        }
    }
    for (field, values) in &by_field {
        place_values(&mut request, schema, field, values)?;
    }

    let kinds: BTreeSet<&'static str> = by_kind.iter().map(|v| v.kind.as_str()).collect();
    for kind in [DataKind::Image, DataKind::Video, DataKind::Audio] {
        if !kinds.contains(kind.as_str()) {
            continue;
        }
        let field = schema
            .primary_field(kind)
            .ok_or_else(|| kind_mismatch(&schema.model_id, kind))?;
        let values: Vec<&PortValue> = by_kind.iter().copied().filter(|v| v.kind == kind).collect();
        place_values(&mut request, schema, field, &values)?;
    }

    let texts: Vec<&str> = by_kind
        .iter()
        .filter(|v| v.kind == DataKind::Text)
        .filter_map(|v| v.as_str())
        .collect();
    let prompt = combine_prompt(&texts, prompts.prompt.as_deref());
    if !prompt.is_empty() {
        match schema.primary_field(DataKind::Text) {
            Some(field) => {
                request.insert(field.name.clone(), Value::String(prompt));
            }
            None if !texts.is_empty() => return Err(kind_mismatch(&schema.model_id, DataKind::Text)),
            None => log::debug!("Model {} takes no prompt, ignoring node prompt", schema.model_id),
        }
    }

    if let (Some(text), Some(field)) = (
        &prompts.negative_prompt,
        schema.fields_with_role(FieldRole::NegativePrompt).next(),
    ) {
        request.insert(field.name.clone(), Value::String(text.clone()));
    }
    if let (Some(text), Some(field)) = (
        &prompts.system_prompt,
        schema.fields_with_role(FieldRole::SystemPrompt).next(),
    ) {
        request.insert(field.name.clone(), Value::String(text.clone()));
    }

    for field in &schema.inputs {
        if request.contains_key(&field.name) {
            continue;
        }
        let setting = node_setting(node, &field.name).and_then(|v| coerce(field, v));
        match setting {
            Some(value) if field.allows(&value) => {
                request.insert(field.name.clone(), value);
                continue;
            }
            Some(value) => log::warn!(
                "Value {} for '{}' is not allowed by model {}, using default",
                value,
                field.name,
                schema.model_id
            ),
            None => {}
        }
        if let Some(default) = &field.default {
            request.insert(field.name.clone(), default.clone());
        }
    }

    for name in &schema.required {
        if request.contains_key(name) {
            continue;
        }
        let is_prompt = schema
            .field(name)
            .is_some_and(|f| matches!(f.role, FieldRole::Prompt | FieldRole::Text));
        if is_prompt {
            return Err(NodeEngineError::MissingInput(NO_PROMPT.to_string()));
        }
        return Err(NodeEngineError::MissingInput(format!(
            "Missing required input '{}' for model {}",
            name, schema.model_id
        )));
    }

    Ok(request)
}

/// Minimal request used when the model schema is unavailable
pub fn build_fallback_request(
    node: &GraphNode,
    connected: &ConnectedInputs,
    prompts: &PromptFields,
) -> Result<Map<String, Value>> {
    let mut request = Map::new();

    let prompt = combine_prompt(&connected.texts(), prompts.prompt.as_deref());
    let image = connected.first(DataKind::Image);
    let video = connected.first(DataKind::Video);

    if prompt.is_empty() && image.is_none() && video.is_none() {
        return Err(NodeEngineError::MissingInput(match node.node_type {
            NodeType::Upscaler => "No input media provided".to_string(),
            _ => NO_PROMPT.to_string(),
        }));
    }

    if !prompt.is_empty() {
        request.insert("prompt".to_string(), Value::String(prompt));
    }
    if let Some(image) = image {
        request.insert("image".to_string(), image.value.clone());
    }
    if let Some(video) = video {
        request.insert("video".to_string(), video.value.clone());
    }
    if let Some(text) = &prompts.negative_prompt {
        request.insert("negative_prompt".to_string(), Value::String(text.clone()));
    }
    if let Some(text) = &prompts.system_prompt {
        request.insert("system_prompt".to_string(), Value::String(text.clone()));
    }

    let settings = node
        .data
        .as_object()
        .into_iter()
        .flatten()
        .chain(
            node.data
                .get("parameters")
                .and_then(Value::as_object)
                .into_iter()
                .flatten(),
        );
    for (key, value) in settings {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if value.is_number() || value.is_boolean() {
            request.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    Ok(request)
}
