//! Model schema normalization
//!
//! Providers describe a model's inputs and outputs with an OpenAPI-like
//! document (`components.schemas.Input` / `components.schemas.Output`).
//! Properties may be wrapped in `allOf` or point elsewhere with `$ref`; this
//! module resolves those against the sibling schema definitions and flattens
//! the result into a queryable field map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NodeEngineError, Result};
use crate::types::DataKind;

/// How deep `$ref`/`allOf` chains are followed before giving up
const MAX_RESOLVE_DEPTH: usize = 8;

/// What a field is used for when mapping connected inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldRole {
    Prompt,
    NegativePrompt,
    SystemPrompt,
    /// Free text other than the main prompt (lyrics, captions, ...)
    Text,
    Image,
    Video,
    Audio,
    /// Plain setting (numbers, enums, flags)
    Parameter,
}

impl FieldRole {
    /// Semantic kind of values accepted by the field, if it takes connections
    pub fn kind(&self) -> Option<DataKind> {
        match self {
            Self::Prompt | Self::Text => Some(DataKind::Text),
            Self::Image => Some(DataKind::Image),
            Self::Video => Some(DataKind::Video),
            Self::Audio => Some(DataKind::Audio),
            Self::NegativePrompt | Self::SystemPrompt | Self::Parameter => None,
        }
    }
}

/// Element type of an array field or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSchema {
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub format: Option<String>,
}

/// A single normalized input field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    pub default: Option<Value>,
    pub items: Option<ItemSchema>,
    pub content_media_type: Option<String>,
    pub description: Option<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// `x-order` position in the provider's form
    pub order: Option<i64>,
    pub role: FieldRole,
}

impl FieldSchema {
    /// Whether the field takes a list of values
    pub fn accepts_array(&self) -> bool {
        self.field_type.as_deref() == Some("array")
    }

    /// Whether the field expects a whole number
    pub fn is_integer(&self) -> bool {
        self.field_type.as_deref() == Some("integer")
    }

    /// Whether the field expects a number
    pub fn is_numeric(&self) -> bool {
        matches!(self.field_type.as_deref(), Some("integer") | Some("number"))
    }

    /// Whether `value` is one of the declared enum members (always true when
    /// no enum is declared)
    pub fn allows(&self, value: &Value) -> bool {
        self.enum_values.is_empty() || self.enum_values.contains(value)
    }
}

/// Normalized output declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSchema {
    #[serde(rename = "type")]
    pub output_type: Option<String>,
    pub format: Option<String>,
    pub items: Option<ItemSchema>,
}

impl OutputSchema {
    pub fn is_array(&self) -> bool {
        self.output_type.as_deref() == Some("array")
    }
}

/// Flat, queryable description of one model's inputs and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSchema {
    pub model_id: String,
    /// Fields in form order (`x-order`, then name)
    pub inputs: Vec<FieldSchema>,
    pub outputs: OutputSchema,
    pub required: Vec<String>,
}

impl NormalizedSchema {
    /// Find a field by name
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.inputs.iter().find(|f| f.name == name)
    }

    /// Whether `name` is listed as required
    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }

    /// Fields with the given role, in form order
    pub fn fields_with_role(&self, role: FieldRole) -> impl Iterator<Item = &FieldSchema> {
        self.inputs.iter().filter(move |f| f.role == role)
    }

    /// The field that receives connected values of `kind`
    ///
    /// Required fields win over optional ones; ties keep form order. Text
    /// prefers the main prompt over other free-text fields.
    pub fn primary_field(&self, kind: DataKind) -> Option<&FieldSchema> {
        let mut candidates: Vec<&FieldSchema> = self
            .inputs
            .iter()
            .filter(|f| f.role.kind() == Some(kind))
            .collect();
        candidates.sort_by_key(|f| {
            (
                f.role != FieldRole::Prompt,
                !self.is_required(&f.name),
            )
        });
        candidates.into_iter().next()
    }

    /// Whether any field accepts connected values of `kind`
    pub fn accepts(&self, kind: DataKind) -> bool {
        self.inputs.iter().any(|f| f.role.kind() == Some(kind))
    }
}

/// Locate the OpenAPI document inside a provider response
///
/// Accepts the document itself, or a model record carrying it under
/// `latest_version.openapi_schema`.
fn openapi_document(raw: &Value) -> Option<&Value> {
    if raw.get("components").is_some() {
        return Some(raw);
    }
    raw.get("latest_version")
        .and_then(|v| v.get("openapi_schema"))
        .or_else(|| raw.get("openapi_schema"))
        .filter(|doc| doc.get("components").is_some())
}

/// Resolve a `#/components/schemas/Name` reference
fn lookup_ref<'a>(definitions: &'a Map<String, Value>, reference: &str) -> Option<&'a Value> {
    let name = reference.rsplit('/').next()?;
    definitions.get(name)
}

/// Flatten `$ref` and `allOf` into a single object
///
/// Referenced and `allOf` fragments are merged first, in order; keys written
/// inline on the property are applied last and win on conflicts.
pub fn resolve_fragment(fragment: &Value, definitions: &Map<String, Value>) -> Map<String, Value> {
    resolve_fragment_at(fragment, definitions, 0)
}

fn resolve_fragment_at(
    fragment: &Value,
    definitions: &Map<String, Value>,
    depth: usize,
) -> Map<String, Value> {
    let Some(object) = fragment.as_object() else {
        return Map::new();
    };
    if depth >= MAX_RESOLVE_DEPTH {
        log::warn!("Schema reference chain deeper than {} levels", MAX_RESOLVE_DEPTH);
        return object.clone();
    }

    let mut merged = Map::new();

    if let Some(reference) = object.get("$ref").and_then(Value::as_str) {
        match lookup_ref(definitions, reference) {
            Some(target) => merged.extend(resolve_fragment_at(target, definitions, depth + 1)),
            None => log::warn!("Unresolved schema reference '{}'", reference),
        }
    }

    if let Some(parts) = object.get("allOf").and_then(Value::as_array) {
        for part in parts {
            merged.extend(resolve_fragment_at(part, definitions, depth + 1));
        }
    }

    for (key, value) in object {
        if key != "$ref" && key != "allOf" {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn item_schema(object: &Map<String, Value>, definitions: &Map<String, Value>) -> Option<ItemSchema> {
    let items = object.get("items")?;
    let resolved = resolve_fragment(items, definitions);
    Some(ItemSchema {
        item_type: string_field(&resolved, "type"),
        format: string_field(&resolved, "format"),
    })
}

/// Guess the media kind a URI field carries from its name
fn media_role_from_name(name: &str) -> FieldRole {
    let lowered = name.to_ascii_lowercase();
    if lowered.contains("video") {
        FieldRole::Video
    } else if ["audio", "speech", "song", "music", "voice", "sound"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        FieldRole::Audio
    } else {
        FieldRole::Image
    }
}

/// Classify a field for input mapping
pub fn infer_role(name: &str, field: &Map<String, Value>) -> FieldRole {
    let lowered = name.to_ascii_lowercase();
    let field_type = field.get("type").and_then(Value::as_str);
    let format = field.get("format").and_then(Value::as_str);
    let item_format = field
        .get("items")
        .and_then(|i| i.get("format"))
        .and_then(Value::as_str);

    if let Some(media) = field.get("contentMediaType").and_then(Value::as_str) {
        match DataKind::from_media_hint(media) {
            Some(DataKind::Image) => return FieldRole::Image,
            Some(DataKind::Video) => return FieldRole::Video,
            Some(DataKind::Audio) => return FieldRole::Audio,
            _ => {}
        }
    }

    if format == Some("uri") || item_format == Some("uri") {
        return media_role_from_name(name);
    }

    if field_type == Some("string") && field.get("enum").is_none() {
        return match lowered.as_str() {
            "prompt" => FieldRole::Prompt,
            "negative_prompt" => FieldRole::NegativePrompt,
            "system_prompt" => FieldRole::SystemPrompt,
            _ if lowered.contains("prompt")
                || lowered.contains("text")
                || lowered.contains("lyrics")
                || lowered.contains("caption") =>
            {
                FieldRole::Text
            }
            _ => FieldRole::Parameter,
        };
    }

    FieldRole::Parameter
}

fn normalize_field(name: &str, raw: &Value, definitions: &Map<String, Value>) -> FieldSchema {
    let resolved = resolve_fragment(raw, definitions);
    let role = infer_role(name, &resolved);
    FieldSchema {
        name: name.to_string(),
        field_type: string_field(&resolved, "type"),
        format: string_field(&resolved, "format"),
        enum_values: resolved
            .get("enum")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        default: resolved.get("default").cloned().filter(|d| !d.is_null()),
        items: item_schema(&resolved, definitions),
        content_media_type: string_field(&resolved, "contentMediaType"),
        description: string_field(&resolved, "description"),
        minimum: resolved.get("minimum").and_then(Value::as_f64),
        maximum: resolved.get("maximum").and_then(Value::as_f64),
        order: resolved.get("x-order").and_then(Value::as_i64),
        role,
    }
}

/// Normalize a provider's raw schema document for `model_id`
pub fn normalize_schema(model_id: &str, raw: &Value) -> Result<NormalizedSchema> {
    let document = openapi_document(raw).ok_or_else(|| {
        NodeEngineError::NotFound(format!("schema document for model '{}'", model_id))
    })?;

    let empty = Map::new();
    let definitions = document
        .get("components")
        .and_then(|c| c.get("schemas"))
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let input = definitions
        .get("Input")
        .map(|i| resolve_fragment(i, definitions))
        .unwrap_or_default();

    let mut inputs: Vec<FieldSchema> = input
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, raw)| normalize_field(name, raw, definitions))
                .collect()
        })
        .unwrap_or_default();
    inputs.sort_by(|a, b| {
        a.order
            .unwrap_or(i64::MAX)
            .cmp(&b.order.unwrap_or(i64::MAX))
            .then_with(|| a.name.cmp(&b.name))
    });

    let required = input
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let outputs = definitions
        .get("Output")
        .map(|o| {
            let resolved = resolve_fragment(o, definitions);
            OutputSchema {
                output_type: string_field(&resolved, "type"),
                format: string_field(&resolved, "format"),
                items: item_schema(&resolved, definitions),
            }
        })
        .unwrap_or_default();

    Ok(NormalizedSchema {
        model_id: model_id.to_string(),
        inputs,
        outputs,
        required,
    })
}

/// Index fields by name, for callers that need random access
pub fn field_index(schema: &NormalizedSchema) -> HashMap<&str, &FieldSchema> {
    schema
        .inputs
        .iter()
        .map(|f| (f.name.as_str(), f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Shape of a typical text-to-image model document
    fn image_model_document() -> Value {
        json!({
            "openapi": "3.0.2",
            "components": {
                "schemas": {
                    "Input": {
                        "type": "object",
                        "required": ["prompt"],
                        "properties": {
                            "prompt": {"type": "string", "x-order": 0},
                            "negative_prompt": {"type": "string", "x-order": 1},
                            "image_input": {
                                "type": "array",
                                "items": {"type": "string", "format": "uri"},
                                "x-order": 2
                            },
                            "aspect_ratio": {
                                "allOf": [{"$ref": "#/components/schemas/aspect_ratio"}],
                                "default": "1:1",
                                "x-order": 3
                            },
                            "num_outputs": {
                                "type": "integer",
                                "default": 1,
                                "minimum": 1,
                                "maximum": 4,
                                "x-order": 4
                            }
                        }
                    },
                    "aspect_ratio": {
                        "type": "string",
                        "enum": ["1:1", "16:9"],
                        "default": "16:9",
                        "description": "Aspect ratio"
                    },
                    "Output": {
                        "type": "array",
                        "items": {"type": "string", "format": "uri"}
                    }
                }
            }
        })
    }

    #[test]
    fn test_normalize_image_model() {
        let schema = normalize_schema("acme/painter", &image_model_document()).unwrap();

        let names: Vec<_> = schema.inputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["prompt", "negative_prompt", "image_input", "aspect_ratio", "num_outputs"]
        );
        assert_eq!(schema.required, vec!["prompt"]);
        assert_eq!(schema.field("prompt").unwrap().role, FieldRole::Prompt);
        assert_eq!(schema.field("negative_prompt").unwrap().role, FieldRole::NegativePrompt);

        let images = schema.field("image_input").unwrap();
        assert_eq!(images.role, FieldRole::Image);
        assert!(images.accepts_array());

        assert!(schema.outputs.is_array());
        assert_eq!(schema.outputs.items.as_ref().unwrap().format.as_deref(), Some("uri"));
    }

    #[test]
    fn test_inline_keys_win_over_referenced_fragment() {
        let schema = normalize_schema("acme/painter", &image_model_document()).unwrap();
        let aspect = schema.field("aspect_ratio").unwrap();

        assert_eq!(aspect.default, Some(json!("1:1")));
        assert_eq!(aspect.field_type.as_deref(), Some("string"));
        assert_eq!(aspect.description.as_deref(), Some("Aspect ratio"));
        assert_eq!(aspect.enum_values, vec![json!("1:1"), json!("16:9")]);
        assert_eq!(aspect.role, FieldRole::Parameter);
        assert!(aspect.allows(&json!("16:9")));
        assert!(!aspect.allows(&json!("4:3")));
    }

    #[test]
    fn test_nested_refs_resolve_through_chain() {
        let doc = json!({
            "components": {"schemas": {
                "Input": {"properties": {
                    "mode": {"$ref": "#/components/schemas/Outer"}
                }},
                "Outer": {"allOf": [{"$ref": "#/components/schemas/Inner"}], "description": "outer"},
                "Inner": {"type": "string", "enum": ["fast", "slow"], "description": "inner"}
            }}
        });
        let schema = normalize_schema("acme/mode", &doc).unwrap();
        let mode = schema.field("mode").unwrap();
        assert_eq!(mode.field_type.as_deref(), Some("string"));
        assert_eq!(mode.description.as_deref(), Some("outer"));
        assert_eq!(mode.enum_values.len(), 2);
    }

    #[test]
    fn test_self_referencing_schema_terminates() {
        let doc = json!({
            "components": {"schemas": {
                "Input": {"properties": {"loop": {"$ref": "#/components/schemas/Loop"}}},
                "Loop": {"$ref": "#/components/schemas/Loop"}
            }}
        });
        let schema = normalize_schema("acme/loop", &doc).unwrap();
        assert!(schema.field("loop").is_some());
    }

    #[test]
    fn test_media_roles_from_format_and_content_type() {
        let doc = json!({
            "components": {"schemas": {
                "Input": {"properties": {
                    "video": {"type": "string", "format": "uri"},
                    "song_reference": {"type": "string", "format": "uri"},
                    "start_frame": {"type": "string", "format": "uri"},
                    "clip": {"type": "string", "contentMediaType": "audio/wav"},
                    "lyrics": {"type": "string"},
                    "seed": {"type": "integer"}
                }},
                "Output": {"type": "string", "format": "uri"}
            }}
        });
        let schema = normalize_schema("acme/av", &doc).unwrap();
        assert_eq!(schema.field("video").unwrap().role, FieldRole::Video);
        assert_eq!(schema.field("song_reference").unwrap().role, FieldRole::Audio);
        assert_eq!(schema.field("start_frame").unwrap().role, FieldRole::Image);
        assert_eq!(schema.field("clip").unwrap().role, FieldRole::Audio);
        assert_eq!(schema.field("lyrics").unwrap().role, FieldRole::Text);
        assert_eq!(schema.field("seed").unwrap().role, FieldRole::Parameter);
        assert!(!schema.outputs.is_array());
    }

    #[test]
    fn test_primary_field_prefers_prompt_then_required() {
        let doc = json!({
            "components": {"schemas": {
                "Input": {
                    "required": ["mask"],
                    "properties": {
                        "caption": {"type": "string", "x-order": 0},
                        "prompt": {"type": "string", "x-order": 1},
                        "image": {"type": "string", "format": "uri", "x-order": 2},
                        "mask": {"type": "string", "format": "uri", "x-order": 3}
                    }
                }
            }}
        });
        let schema = normalize_schema("acme/inpaint", &doc).unwrap();
        assert_eq!(schema.primary_field(DataKind::Text).unwrap().name, "prompt");
        assert_eq!(schema.primary_field(DataKind::Image).unwrap().name, "mask");
        assert!(schema.primary_field(DataKind::Video).is_none());
        assert!(!schema.accepts(DataKind::Audio));
    }

    #[test]
    fn test_model_record_wrapper_is_accepted() {
        let record = json!({"latest_version": {"openapi_schema": image_model_document()}});
        assert!(normalize_schema("acme/painter", &record).is_ok());
    }

    #[test]
    fn test_missing_document_is_not_found() {
        let err = normalize_schema("acme/none", &json!({"latest_version": null})).unwrap_err();
        assert!(matches!(err, NodeEngineError::NotFound(_)));
    }

    #[test]
    fn test_field_index() {
        let schema = normalize_schema("acme/painter", &image_model_document()).unwrap();
        let index = field_index(&schema);
        assert_eq!(index.len(), 5);
        assert!(index.contains_key("num_outputs"));
    }
}
