//! The per-job writer task: one output file, the writer instances for
//! every configured stream, and the topic demultiplexer.

use crate::hdf::{GroupRef, HdfError, NexusFile};
use crate::module::{WriteError, WriterModule};
use crate::registry::WriterRegistry;
use nexflow_protocol::nexus::{DatasetSpec, NexusAttribute, NexusNode, NexusStructure, StreamSettings};
use nexflow_protocol::types::SourceKey;
use nexflow_schema::f144::ElementType;
use nexflow_schema::message::FlatbufferMessage;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("nexus structure could not be applied: {0}")]
    Hdf(#[from] HdfError),
    #[error("streams failed to initialise: {0:?}")]
    StreamsUninitialised(Vec<String>),
}

/// One stream recorded from the structure tree.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub topic: String,
    pub source: String,
    pub module: String,
    pub key: SourceKey,
    pub group_path: String,
    pub run_parallel: bool,
    pub initialised: bool,
}

/// Owns the output file and every writer instance of a job.
pub struct WriterTask {
    file: NexusFile,
    modules: HashMap<SourceKey, Box<dyn WriterModule>>,
    streams: Vec<StreamInfo>,
    demux: HashMap<String, BTreeSet<SourceKey>>,
}

impl WriterTask {
    /// Create the output file from a structure tree and initialise every
    /// stream's writer instance.
    pub fn create(
        file_path: &Path,
        file_name: &str,
        structure: &NexusStructure,
        registry: &WriterRegistry,
        use_swmr: bool,
        abort_on_uninitialised_stream: bool,
    ) -> Result<Self, TaskError> {
        let file = NexusFile::create(file_path, file_name, use_swmr);
        let mut task = Self {
            file,
            modules: HashMap::new(),
            streams: Vec::new(),
            demux: HashMap::new(),
        };

        let root = task.file.root();
        for node in &structure.children {
            task.build_node(&root, node, "", registry, false)?;
        }
        if !root.has_child("entry") {
            let entry = root.create_group("entry")?;
            entry.set_attr("NX_class", Value::from("NXentry"));
        }

        task.check_uninitialised(abort_on_uninitialised_stream)?;
        Ok(task)
    }

    /// Attach to a file written by a previous run; every stream module is
    /// re-bound through `reopen` before any write.
    pub fn reopen(
        file_path: &Path,
        structure: &NexusStructure,
        registry: &WriterRegistry,
        use_swmr: bool,
        abort_on_uninitialised_stream: bool,
    ) -> Result<Self, TaskError> {
        let file = NexusFile::open(file_path, use_swmr)?;
        let mut task = Self {
            file,
            modules: HashMap::new(),
            streams: Vec::new(),
            demux: HashMap::new(),
        };
        let root = task.file.root();
        for node in &structure.children {
            task.build_node(&root, node, "", registry, true)?;
        }
        task.check_uninitialised(abort_on_uninitialised_stream)?;
        Ok(task)
    }

    fn check_uninitialised(&self, abort: bool) -> Result<(), TaskError> {
        let failed: Vec<String> = self
            .streams
            .iter()
            .filter(|s| !s.initialised)
            .map(|s| format!("{}/{}", s.topic, s.source))
            .collect();
        if abort && !failed.is_empty() {
            return Err(TaskError::StreamsUninitialised(failed));
        }
        Ok(())
    }

    fn build_node(
        &mut self,
        group: &GroupRef,
        node: &NexusNode,
        path: &str,
        registry: &WriterRegistry,
        reopening: bool,
    ) -> Result<(), TaskError> {
        match node {
            NexusNode::Group {
                name,
                children,
                attributes,
            } => {
                let child = if reopening {
                    group.require_group(name)?
                } else {
                    group.create_group(name)?
                };
                apply_attributes(&child, attributes);
                let child_path = join_path(path, name);
                for grandchild in children {
                    self.build_node(&child, grandchild, &child_path, registry, reopening)?;
                }
            }
            NexusNode::Dataset {
                name,
                values,
                dataset,
                attributes,
            } => {
                if !reopening {
                    create_static_dataset(group, name, values, dataset, attributes)?;
                }
            }
            NexusNode::Stream { stream, attributes } => {
                apply_attributes(group, attributes);
                self.bind_stream(group, stream, path, registry, reopening);
            }
        }
        Ok(())
    }

    fn bind_stream(
        &mut self,
        group: &GroupRef,
        settings: &StreamSettings,
        path: &str,
        registry: &WriterRegistry,
        reopening: bool,
    ) {
        let mut info = StreamInfo {
            topic: settings.topic.clone(),
            source: settings.source.clone(),
            module: settings.writer_module.clone(),
            key: SourceKey::from_raw(0),
            group_path: path.to_string(),
            run_parallel: settings.run_parallel,
            initialised: false,
        };

        let Some((schema_tag, mut module)) = registry.instantiate(&settings.writer_module) else {
            warn!(
                topic = %settings.topic,
                source = %settings.source,
                "Unknown writer module '{}', stream will not be written",
                settings.writer_module
            );
            self.streams.push(info);
            return;
        };
        info.key = SourceKey::compute(schema_tag, &settings.source);

        if let Err(e) = module.parse_config(&settings.config_json()) {
            warn!(
                topic = %settings.topic,
                source = %settings.source,
                "Stream configuration rejected: {e}"
            );
            self.streams.push(info);
            return;
        }

        let bind = if reopening {
            module.reopen(group)
        } else {
            module.init_hdf(group)
        };
        match bind {
            Ok(()) => {
                info.initialised = true;
                self.modules.insert(info.key, module);
                self.demux
                    .entry(settings.topic.clone())
                    .or_default()
                    .insert(info.key);
                info!(
                    topic = %settings.topic,
                    source = %settings.source,
                    module = %settings.writer_module,
                    path = %path,
                    "Stream bound"
                );
            }
            Err(e) => {
                warn!(
                    topic = %settings.topic,
                    source = %settings.source,
                    "Stream init failed: {e}"
                );
            }
        }
        self.streams.push(info);
    }

    /// Append one message through the writer instance for `key`.
    pub fn write(
        &mut self,
        key: SourceKey,
        msg: &FlatbufferMessage,
        restamp: Option<u64>,
    ) -> Result<(), WriteError> {
        let module = self.modules.get_mut(&key).ok_or(WriteError::UnknownSource)?;
        match restamp {
            Some(ts) => module.write_restamped(msg, ts)?,
            None => module.write(msg)?,
        }
        if self.file.swmr() {
            self.file.flush()?;
        }
        Ok(())
    }

    /// Flush every module and the file.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        for module in self.modules.values_mut() {
            module.flush()?;
        }
        self.file.flush()?;
        Ok(())
    }

    /// Close every module, then the file. Idempotent.
    pub fn close(&mut self) -> Result<(), WriteError> {
        for module in self.modules.values_mut() {
            module.close()?;
        }
        self.file.close()?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    pub fn file(&self) -> &NexusFile {
        &self.file
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    /// Topic → set of source keys configured on that topic.
    pub fn demux(&self) -> &HashMap<String, BTreeSet<SourceKey>> {
        &self.demux
    }

    pub fn topics(&self) -> Vec<String> {
        self.demux.keys().cloned().collect()
    }
}

impl std::fmt::Debug for WriterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterTask")
            .field("file", &self.file)
            .field("streams", &self.streams.len())
            .finish()
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", path, name)
    }
}

fn apply_attributes(group: &GroupRef, attributes: &[NexusAttribute]) {
    for attribute in attributes {
        group.set_attr(&attribute.name, attribute.values.clone());
    }
}

fn create_static_dataset(
    group: &GroupRef,
    name: &str,
    values: &Value,
    spec: &DatasetSpec,
    attributes: &[NexusAttribute],
) -> Result<(), HdfError> {
    let element_type = spec
        .r#type
        .as_deref()
        .and_then(ElementType::from_name)
        .unwrap_or_else(|| infer_element_type(values));

    let items: Vec<&Value> = match values {
        Value::Array(list) => list.iter().collect(),
        other => vec![other],
    };

    let string_size = if element_type == ElementType::Str {
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::len)
            .max()
            .unwrap_or(1)
            .max(1)
    } else {
        0
    };
    let dataset = group.create_dataset(name, element_type, 0, items.len().max(1) as u64, string_size)?;
    dataset.with_mut(|d| -> Result<(), HdfError> {
        for item in &items {
            match element_type {
                ElementType::Str => {
                    d.append_string(item.as_str().unwrap_or_default())?;
                }
                ElementType::F32 | ElementType::F64 => {
                    d.append_scalar(item.as_f64().unwrap_or_default())?;
                }
                _ => {
                    d.append_scalar(item.as_i64().unwrap_or_default())?;
                }
            }
        }
        for attribute in attributes {
            d.set_attr(&attribute.name, attribute.values.clone());
        }
        Ok(())
    })?;
    Ok(())
}

fn infer_element_type(values: &Value) -> ElementType {
    let probe = match values {
        Value::Array(list) => list.first(),
        other => Some(other),
    };
    match probe {
        Some(Value::String(_)) => ElementType::Str,
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => ElementType::I64,
        _ => ElementType::F64,
    }
}
