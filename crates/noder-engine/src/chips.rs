//! Chip placeholder resolution
//!
//! Chips are small nodes whose only output is a literal string. Other nodes
//! reference them from text fields as `__CHIPID__` (matched case-insensitively).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::inputs::NodeInputs;
use crate::types::{GraphNode, NodeType, OutputTable};

/// Chip id to replacement text
pub type ChipValues = HashMap<String, String>;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"__([A-Za-z0-9][A-Za-z0-9_-]*?)__").expect("placeholder pattern is valid")
});

/// Strip decoration the editor may keep around chip ids
fn normalize_chip_id(raw: &str) -> String {
    raw.trim().trim_matches('_').to_string()
}

/// Collect chip values visible to `node`
///
/// Precedence, lowest first: chip outputs anywhere in the run, live values
/// stored on the node under `data.chipValues`, chips wired into the node.
pub fn collect_chip_values(
    node: &GraphNode,
    nodes: &[GraphNode],
    inputs: &NodeInputs,
    outputs: &OutputTable,
) -> ChipValues {
    let mut values = ChipValues::new();

    for chip in nodes.iter().filter(|n| n.node_type == NodeType::Chip) {
        // Chips in the consumer's own layer have not run yet; their data is the value
        let Some(chip_outputs) = outputs.get(&chip.id) else {
            if let (Some(id), Some(text)) = (
                chip.data_str("chipId"),
                chip.data.get("content").and_then(|c| c.as_str()),
            ) {
                values.insert(normalize_chip_id(id), text.to_string());
            }
            continue;
        };
        for value in chip_outputs.values().filter(|v| v.is_chip) {
            if let (Some(id), Some(text)) = (&value.chip_id, value.as_str()) {
                values.insert(normalize_chip_id(id), text.to_string());
            }
        }
    }

    if let Some(live) = node.data.get("chipValues").and_then(|v| v.as_object()) {
        for (id, text) in live {
            if let Some(text) = text.as_str() {
                values.insert(normalize_chip_id(id), text.to_string());
            }
        }
    }

    for input in inputs.values() {
        for value in input.values().into_iter().filter(|v| v.is_chip) {
            if let (Some(id), Some(text)) = (&value.chip_id, value.as_str()) {
                values.insert(normalize_chip_id(id), text.to_string());
            }
        }
    }

    values
}

/// Substitutes chip placeholders in text fields
#[derive(Debug, Clone)]
pub struct ChipResolver {
    by_lowercase_id: HashMap<String, String>,
    pattern: Option<Regex>,
}

impl ChipResolver {
    /// Build a resolver over the given chip values
    pub fn new(values: ChipValues) -> Self {
        let by_lowercase_id: HashMap<String, String> = values
            .into_iter()
            .filter(|(id, _)| !id.is_empty())
            .map(|(id, text)| (id.to_lowercase(), text))
            .collect();

        let pattern = if by_lowercase_id.is_empty() {
            None
        } else {
            let mut ids: Vec<&String> = by_lowercase_id.keys().collect();
            // Longest first so `__HERO_NAME__` is not shadowed by `__HERO__`
            ids.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            let alternation = ids
                .iter()
                .map(|id| regex::escape(id))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!("(?i)__({})__", alternation)).ok()
        };

        Self {
            by_lowercase_id,
            pattern,
        }
    }

    /// A resolver with no chips; `resolve` returns its input unchanged
    pub fn empty() -> Self {
        Self::new(ChipValues::new())
    }

    pub fn is_empty(&self) -> bool {
        self.by_lowercase_id.is_empty()
    }

    /// Replace every known `__ID__` placeholder in `text`
    pub fn resolve(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };

        let resolved = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
            let id = caps[1].to_lowercase();
            self.by_lowercase_id
                .get(&id)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });

        let leftover = unresolved_placeholders(&resolved);
        if !leftover.is_empty() {
            log::debug!("Unresolved chip placeholders: {:?}", leftover);
        }
        resolved.into_owned()
    }
}

/// Placeholder ids still present in `text`
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}
