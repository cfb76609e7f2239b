//! The `nexus_structure` tree carried by a start command.
//!
//! A JSON tree of groups, static datasets and stream placeholders. Groups
//! and datasets are created up front by the writer task; each `stream` node
//! binds a `(topic, source)` pair to a writer module for the duration of
//! the job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One attribute on a group or dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NexusAttribute {
    pub name: String,
    pub values: Value,
}

/// Static dataset type/shape description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatasetSpec {
    #[serde(default, alias = "dtype")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub shape: Option<Vec<u64>>,
}

/// Per-stream options embedded in a `stream` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub topic: String,
    pub source: String,
    pub writer_module: String,
    #[serde(default)]
    pub run_parallel: bool,
    #[serde(default)]
    pub cue_interval: Option<u64>,
    #[serde(default)]
    pub array_size: Option<u64>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default, alias = "dtype")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub value_units: Option<String>,
}

impl StreamSettings {
    /// The per-stream configuration object handed to the writer module.
    pub fn config_json(&self) -> Value {
        // serde roundtrip keeps the module-facing keys in one place
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One node of the structure tree, dispatched on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NexusNode {
    Group {
        name: String,
        #[serde(default)]
        children: Vec<NexusNode>,
        #[serde(default)]
        attributes: Vec<NexusAttribute>,
    },
    Dataset {
        name: String,
        #[serde(default)]
        values: Value,
        #[serde(default)]
        dataset: DatasetSpec,
        #[serde(default)]
        attributes: Vec<NexusAttribute>,
    },
    Stream {
        stream: StreamSettings,
        #[serde(default)]
        attributes: Vec<NexusAttribute>,
    },
}

/// The root of a structure tree: an anonymous list of children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NexusStructure {
    #[serde(default)]
    pub children: Vec<NexusNode>,
}

impl NexusStructure {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Every stream node in the tree, with the group path it lives under.
    pub fn streams(&self) -> Vec<(String, StreamSettings)> {
        let mut found = Vec::new();
        for child in &self.children {
            collect_streams(child, "", &mut found);
        }
        found
    }
}

fn collect_streams(node: &NexusNode, path: &str, found: &mut Vec<(String, StreamSettings)>) {
    match node {
        NexusNode::Group { name, children, .. } => {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };
            for child in children {
                collect_streams(child, &child_path, found);
            }
        }
        NexusNode::Stream { stream, .. } => {
            found.push((path.to_string(), stream.clone()));
        }
        NexusNode::Dataset { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_structure() -> NexusStructure {
        serde_json::from_value(serde_json::json!({
            "children": [
                {
                    "type": "group",
                    "name": "entry",
                    "attributes": [{"name": "NX_class", "values": "NXentry"}],
                    "children": [
                        {
                            "type": "dataset",
                            "name": "title",
                            "values": "test run",
                            "dataset": {"type": "string"}
                        },
                        {
                            "type": "group",
                            "name": "temperature",
                            "children": [
                                {
                                    "type": "stream",
                                    "stream": {
                                        "topic": "sample_env",
                                        "source": "temp_1",
                                        "writer_module": "f144",
                                        "type": "float64"
                                    }
                                }
                            ]
                        }
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn parses_tree_and_finds_streams() {
        let structure = sample_structure();
        let streams = structure.streams();
        assert_eq!(streams.len(), 1);
        let (path, settings) = &streams[0];
        assert_eq!(path, "entry/temperature");
        assert_eq!(settings.topic, "sample_env");
        assert_eq!(settings.source, "temp_1");
        assert_eq!(settings.writer_module, "f144");
        assert_eq!(settings.r#type.as_deref(), Some("float64"));
    }

    #[test]
    fn stream_defaults_are_off() {
        let settings: StreamSettings = serde_json::from_value(serde_json::json!({
            "topic": "t", "source": "s", "writer_module": "f144"
        }))
        .unwrap();
        assert!(!settings.run_parallel);
        assert!(settings.array_size.is_none());
        assert!(settings.chunk_size.is_none());
    }

    #[test]
    fn dtype_alias_accepted() {
        let settings: StreamSettings = serde_json::from_value(serde_json::json!({
            "topic": "t", "source": "s", "writer_module": "f144", "dtype": "int32"
        }))
        .unwrap();
        assert_eq!(settings.r#type.as_deref(), Some("int32"));
    }
}
