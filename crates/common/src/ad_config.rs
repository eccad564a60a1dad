//! Static ad placement definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Width and height of a creative, in pixels.
pub type AdSize = [u32; 2];

/// Description of one ad placement on the page.
///
/// `element_id` is the identity key. Any other table in the definition is a
/// plugin-specific payload keyed by plugin name; the orchestrator never looks
/// inside it, only the matching plugin's `define_unit` does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdConfig {
    pub element_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<Vec<AdSize>>,

    #[serde(flatten)]
    pub payloads: BTreeMap<String, Json>,
}

impl AdConfig {
    /// An ad config with no sizes and no plugin payloads.
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            sizes: None,
            payloads: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_sizes(mut self, sizes: Vec<AdSize>) -> Self {
        self.sizes = Some(sizes);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, plugin: impl Into<String>, payload: Json) -> Self {
        self.payloads.insert(plugin.into(), payload);
        self
    }

    /// The payload block addressed to `plugin`, if any.
    #[must_use]
    pub fn payload(&self, plugin: &str) -> Option<&Json> {
        self.payloads.get(plugin)
    }
}
