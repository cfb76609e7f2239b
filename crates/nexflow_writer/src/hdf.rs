//! The dataset-append contract: hierarchical groups, attributes and typed
//! append-only datasets, NeXus-shaped.
//!
//! This is the single-writer path. Handles are `Arc`-backed so a writer
//! module can keep references to the datasets it created while the file
//! tree stays owned by the writer task; all appends happen on the writer
//! loop thread.

use chrono::{SecondsFormat, Utc};
use nexflow_schema::f144::ElementType;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HdfError {
    #[error("object '{0}' already exists")]
    DuplicateName(String),
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("'{0}' is not a {1}")]
    WrongKind(String, &'static str),
    #[error("dataset '{name}' stores {stored:?}, cannot append {offered}")]
    TypeMismatch {
        name: String,
        stored: ElementType,
        offered: &'static str,
    },
    #[error("dataset '{name}' expects rows of {expected} elements, got {got}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("file is closed")]
    Closed,
    #[error("failed to persist file: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is malformed: {0}")]
    BadSnapshot(String),
}

/// Flat storage for one dataset, tagged by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetValues {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl DatasetValues {
    fn empty(element_type: ElementType) -> Self {
        match element_type {
            ElementType::I8 => DatasetValues::I8(Vec::new()),
            ElementType::U8 => DatasetValues::U8(Vec::new()),
            ElementType::I16 => DatasetValues::I16(Vec::new()),
            ElementType::U16 => DatasetValues::U16(Vec::new()),
            ElementType::I32 => DatasetValues::I32(Vec::new()),
            ElementType::U32 => DatasetValues::U32(Vec::new()),
            ElementType::I64 => DatasetValues::I64(Vec::new()),
            ElementType::U64 => DatasetValues::U64(Vec::new()),
            ElementType::F32 => DatasetValues::F32(Vec::new()),
            ElementType::F64 => DatasetValues::F64(Vec::new()),
            ElementType::Str => DatasetValues::Str(Vec::new()),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            DatasetValues::I8(_) => ElementType::I8,
            DatasetValues::U8(_) => ElementType::U8,
            DatasetValues::I16(_) => ElementType::I16,
            DatasetValues::U16(_) => ElementType::U16,
            DatasetValues::I32(_) => ElementType::I32,
            DatasetValues::U32(_) => ElementType::U32,
            DatasetValues::I64(_) => ElementType::I64,
            DatasetValues::U64(_) => ElementType::U64,
            DatasetValues::F32(_) => ElementType::F32,
            DatasetValues::F64(_) => ElementType::F64,
            DatasetValues::Str(_) => ElementType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DatasetValues::I8(v) => v.len(),
            DatasetValues::U8(v) => v.len(),
            DatasetValues::I16(v) => v.len(),
            DatasetValues::U16(v) => v.len(),
            DatasetValues::I32(v) => v.len(),
            DatasetValues::U32(v) => v.len(),
            DatasetValues::I64(v) => v.len(),
            DatasetValues::U64(v) => v.len(),
            DatasetValues::F32(v) => v.len(),
            DatasetValues::F64(v) => v.len(),
            DatasetValues::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_json(&self) -> Value {
        match self {
            DatasetValues::I8(v) => json!(v),
            DatasetValues::U8(v) => json!(v),
            DatasetValues::I16(v) => json!(v),
            DatasetValues::U16(v) => json!(v),
            DatasetValues::I32(v) => json!(v),
            DatasetValues::U32(v) => json!(v),
            DatasetValues::I64(v) => json!(v),
            DatasetValues::U64(v) => json!(v),
            DatasetValues::F32(v) => json!(v),
            DatasetValues::F64(v) => json!(v),
            DatasetValues::Str(v) => json!(v),
        }
    }
}

/// Numeric values that can be appended into any numeric dataset; the
/// dataset's stored type wins, matching HDF5's write-time conversion.
pub trait AppendElement: Copy {
    fn push_into(self, name: &str, values: &mut DatasetValues) -> Result<(), HdfError>;
}

macro_rules! impl_append_element {
    ($($src:ty),* $(,)?) => {$(
        impl AppendElement for $src {
            fn push_into(self, name: &str, values: &mut DatasetValues) -> Result<(), HdfError> {
                match values {
                    DatasetValues::I8(v) => v.push(self as i8),
                    DatasetValues::U8(v) => v.push(self as u8),
                    DatasetValues::I16(v) => v.push(self as i16),
                    DatasetValues::U16(v) => v.push(self as u16),
                    DatasetValues::I32(v) => v.push(self as i32),
                    DatasetValues::U32(v) => v.push(self as u32),
                    DatasetValues::I64(v) => v.push(self as i64),
                    DatasetValues::U64(v) => v.push(self as u64),
                    DatasetValues::F32(v) => v.push(self as f32),
                    DatasetValues::F64(v) => v.push(self as f64),
                    DatasetValues::Str(_) => {
                        return Err(HdfError::TypeMismatch {
                            name: name.to_string(),
                            stored: ElementType::Str,
                            offered: stringify!($src),
                        })
                    }
                }
                Ok(())
            }
        }
    )*};
}

impl_append_element!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// One append-only dataset.
///
/// `columns == 0` marks a scalar dataset of extent `{rows}`; `columns == N`
/// a 2-D dataset of extent `{rows, N}` stored row-major.
#[derive(Debug)]
pub struct Dataset {
    name: String,
    columns: usize,
    chunk_rows: u64,
    string_size: usize,
    values: DatasetValues,
    attributes: BTreeMap<String, Value>,
}

impl Dataset {
    fn new(
        name: String,
        element_type: ElementType,
        columns: usize,
        chunk_rows: u64,
        string_size: usize,
    ) -> Self {
        Self {
            name,
            columns,
            chunk_rows,
            string_size,
            values: DatasetValues::empty(element_type),
            attributes: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.values.element_type()
    }

    pub fn chunk_rows(&self) -> u64 {
        self.chunk_rows
    }

    pub fn string_size(&self) -> usize {
        self.string_size
    }

    pub fn rows(&self) -> usize {
        if self.columns == 0 {
            self.values.len()
        } else {
            self.values.len() / self.columns
        }
    }

    /// `{rows}` for scalar datasets, `{rows, N}` for array datasets.
    pub fn extent(&self) -> Vec<u64> {
        if self.columns == 0 {
            vec![self.rows() as u64]
        } else {
            vec![self.rows() as u64, self.columns as u64]
        }
    }

    pub fn values(&self) -> &DatasetValues {
        &self.values
    }

    pub fn set_attr(&mut self, name: &str, value: Value) {
        self.attributes.insert(name.to_string(), value);
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Append one scalar element; only legal on scalar datasets.
    pub fn append_scalar<T: AppendElement>(&mut self, value: T) -> Result<(), HdfError> {
        if self.columns != 0 {
            return Err(HdfError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.columns,
                got: 1,
            });
        }
        value.push_into(&self.name, &mut self.values)
    }

    /// Append one row of an array dataset; the slice length must equal the
    /// configured column count.
    pub fn append_row<T: AppendElement>(&mut self, row: &[T]) -> Result<(), HdfError> {
        if self.columns == 0 || row.len() != self.columns {
            return Err(HdfError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.columns,
                got: row.len(),
            });
        }
        for value in row {
            value.push_into(&self.name, &mut self.values)?;
        }
        Ok(())
    }

    /// Append one string element, truncated to the fixed string size.
    pub fn append_string(&mut self, value: &str) -> Result<(), HdfError> {
        match &mut self.values {
            DatasetValues::Str(v) => {
                let mut owned = value.to_string();
                if owned.len() > self.string_size {
                    owned.truncate(self.string_size);
                }
                v.push(owned);
                Ok(())
            }
            other => Err(HdfError::TypeMismatch {
                name: self.name.clone(),
                stored: other.element_type(),
                offered: "string",
            }),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "kind": "dataset",
            "dtype": type_name(self.element_type()),
            "extent": self.extent(),
            "chunk_rows": self.chunk_rows,
            "string_size": self.string_size,
            "attributes": self.attributes,
            "values": self.values.to_json(),
        })
    }
}

fn type_name(element_type: ElementType) -> &'static str {
    match element_type {
        ElementType::I8 => "int8",
        ElementType::U8 => "uint8",
        ElementType::I16 => "int16",
        ElementType::U16 => "uint16",
        ElementType::I32 => "int32",
        ElementType::U32 => "uint32",
        ElementType::I64 => "int64",
        ElementType::U64 => "uint64",
        ElementType::F32 => "float32",
        ElementType::F64 => "float64",
        ElementType::Str => "string",
    }
}

/// Shared handle to one dataset.
#[derive(Debug, Clone)]
pub struct DatasetRef(Arc<Mutex<Dataset>>);

impl DatasetRef {
    pub fn with<R>(&self, f: impl FnOnce(&Dataset) -> R) -> R {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Dataset) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn rows(&self) -> usize {
        self.with(|d| d.rows())
    }

    pub fn extent(&self) -> Vec<u64> {
        self.with(|d| d.extent())
    }
}

enum Child {
    Group(GroupRef),
    Dataset(DatasetRef),
}

struct GroupNode {
    name: String,
    attributes: BTreeMap<String, Value>,
    children: BTreeMap<String, Child>,
}

/// Shared handle to one group.
#[derive(Clone)]
pub struct GroupRef(Arc<Mutex<GroupNode>>);

impl GroupRef {
    fn new(name: &str) -> Self {
        Self(Arc::new(Mutex::new(GroupNode {
            name: name.to_string(),
            attributes: BTreeMap::new(),
            children: BTreeMap::new(),
        })))
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupNode> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_group(&self, name: &str) -> Result<GroupRef, HdfError> {
        let mut node = self.lock();
        if node.children.contains_key(name) {
            return Err(HdfError::DuplicateName(name.to_string()));
        }
        let group = GroupRef::new(name);
        node.children
            .insert(name.to_string(), Child::Group(group.clone()));
        Ok(group)
    }

    pub fn open_group(&self, name: &str) -> Result<GroupRef, HdfError> {
        let node = self.lock();
        match node.children.get(name) {
            Some(Child::Group(group)) => Ok(group.clone()),
            Some(Child::Dataset(_)) => Err(HdfError::WrongKind(name.to_string(), "group")),
            None => Err(HdfError::NotFound(name.to_string())),
        }
    }

    /// Open `name` if it exists, create it otherwise.
    pub fn require_group(&self, name: &str) -> Result<GroupRef, HdfError> {
        match self.open_group(name) {
            Ok(group) => Ok(group),
            Err(HdfError::NotFound(_)) => self.create_group(name),
            Err(other) => Err(other),
        }
    }

    pub fn create_dataset(
        &self,
        name: &str,
        element_type: ElementType,
        columns: usize,
        chunk_rows: u64,
        string_size: usize,
    ) -> Result<DatasetRef, HdfError> {
        let mut node = self.lock();
        if node.children.contains_key(name) {
            return Err(HdfError::DuplicateName(name.to_string()));
        }
        let dataset = DatasetRef(Arc::new(Mutex::new(Dataset::new(
            name.to_string(),
            element_type,
            columns,
            chunk_rows,
            string_size,
        ))));
        node.children
            .insert(name.to_string(), Child::Dataset(dataset.clone()));
        Ok(dataset)
    }

    pub fn open_dataset(&self, name: &str) -> Result<DatasetRef, HdfError> {
        let node = self.lock();
        match node.children.get(name) {
            Some(Child::Dataset(dataset)) => Ok(dataset.clone()),
            Some(Child::Group(_)) => Err(HdfError::WrongKind(name.to_string(), "dataset")),
            None => Err(HdfError::NotFound(name.to_string())),
        }
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.lock().children.contains_key(name)
    }

    pub fn set_attr(&self, name: &str, value: Value) {
        self.lock().attributes.insert(name.to_string(), value);
    }

    pub fn attr(&self, name: &str) -> Option<Value> {
        self.lock().attributes.get(name).cloned()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.lock().attributes.contains_key(name)
    }

    /// Walk a `a/b/c` path of nested groups.
    pub fn open_path(&self, path: &str) -> Result<GroupRef, HdfError> {
        let mut current = self.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = current.open_group(part)?;
        }
        Ok(current)
    }

    fn to_json(&self) -> Value {
        let node = self.lock();
        let children: BTreeMap<String, Value> = node
            .children
            .iter()
            .map(|(name, child)| {
                let value = match child {
                    Child::Group(group) => group.to_json(),
                    Child::Dataset(dataset) => dataset.with(|d| d.to_json()),
                };
                (name.clone(), value)
            })
            .collect();
        json!({
            "kind": "group",
            "attributes": node.attributes,
            "children": children,
        })
    }

    fn from_json(name: &str, value: &Value) -> Result<GroupRef, HdfError> {
        let group = GroupRef::new(name);
        {
            let mut node = group.lock();
            if let Some(attrs) = value.get("attributes").and_then(Value::as_object) {
                for (k, v) in attrs {
                    node.attributes.insert(k.clone(), v.clone());
                }
            }
        }
        if let Some(children) = value.get("children").and_then(Value::as_object) {
            for (child_name, child_value) in children {
                match child_value.get("kind").and_then(Value::as_str) {
                    Some("group") => {
                        let child = GroupRef::from_json(child_name, child_value)?;
                        group
                            .lock()
                            .children
                            .insert(child_name.clone(), Child::Group(child));
                    }
                    Some("dataset") => {
                        let dataset = dataset_from_json(child_name, child_value)?;
                        group
                            .lock()
                            .children
                            .insert(child_name.clone(), Child::Dataset(dataset));
                    }
                    _ => {
                        return Err(HdfError::BadSnapshot(format!(
                            "child '{}' has no kind",
                            child_name
                        )))
                    }
                }
            }
        }
        Ok(group)
    }
}

impl std::fmt::Debug for GroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.lock();
        f.debug_struct("GroupRef")
            .field("name", &node.name)
            .field("children", &node.children.len())
            .finish()
    }
}

fn dataset_from_json(name: &str, value: &Value) -> Result<DatasetRef, HdfError> {
    let bad = |msg: &str| HdfError::BadSnapshot(format!("dataset '{}': {}", name, msg));
    let dtype = value
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("missing dtype"))?;
    let element_type =
        ElementType::from_name(dtype).ok_or_else(|| bad("unknown dtype"))?;
    let extent = value
        .get("extent")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("missing extent"))?;
    let columns = if extent.len() > 1 {
        extent[1].as_u64().unwrap_or(0) as usize
    } else {
        0
    };
    let chunk_rows = value.get("chunk_rows").and_then(Value::as_u64).unwrap_or(0);
    let string_size = value
        .get("string_size")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let mut dataset = Dataset::new(
        name.to_string(),
        element_type,
        columns,
        chunk_rows,
        string_size,
    );
    if let Some(attrs) = value.get("attributes").and_then(Value::as_object) {
        for (k, v) in attrs {
            dataset.attributes.insert(k.clone(), v.clone());
        }
    }
    let raw = value
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("missing values"))?;
    for item in raw {
        match &mut dataset.values {
            DatasetValues::Str(v) => {
                v.push(item.as_str().ok_or_else(|| bad("non-string value"))?.to_string());
            }
            DatasetValues::F32(v) => {
                v.push(item.as_f64().ok_or_else(|| bad("non-numeric value"))? as f32);
            }
            DatasetValues::F64(v) => {
                v.push(item.as_f64().ok_or_else(|| bad("non-numeric value"))?);
            }
            DatasetValues::U8(v) => {
                v.push(item.as_u64().ok_or_else(|| bad("non-numeric value"))? as u8);
            }
            DatasetValues::U16(v) => {
                v.push(item.as_u64().ok_or_else(|| bad("non-numeric value"))? as u16);
            }
            DatasetValues::U32(v) => {
                v.push(item.as_u64().ok_or_else(|| bad("non-numeric value"))? as u32);
            }
            DatasetValues::U64(v) => {
                v.push(item.as_u64().ok_or_else(|| bad("non-numeric value"))?);
            }
            DatasetValues::I8(v) => {
                v.push(item.as_i64().ok_or_else(|| bad("non-numeric value"))? as i8);
            }
            DatasetValues::I16(v) => {
                v.push(item.as_i64().ok_or_else(|| bad("non-numeric value"))? as i16);
            }
            DatasetValues::I32(v) => {
                v.push(item.as_i64().ok_or_else(|| bad("non-numeric value"))? as i32);
            }
            DatasetValues::I64(v) => {
                v.push(item.as_i64().ok_or_else(|| bad("non-numeric value"))?);
            }
        }
    }
    Ok(DatasetRef(Arc::new(Mutex::new(dataset))))
}

/// One NeXus output file.
#[derive(Debug)]
pub struct NexusFile {
    root: GroupRef,
    path: PathBuf,
    swmr: bool,
    open: bool,
}

impl NexusFile {
    /// Create a fresh file with the standard root attributes.
    pub fn create(path: &Path, file_name: &str, swmr: bool) -> Self {
        let root = GroupRef::new("/");
        root.set_attr("file_name", json!(file_name));
        root.set_attr(
            "file_time",
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Self {
            root,
            path: snapshot_path(path),
            swmr,
            open: true,
        }
    }

    /// Reopen a file written by a previous run from its snapshot.
    pub fn open(path: &Path, swmr: bool) -> Result<Self, HdfError> {
        let snapshot = snapshot_path(path);
        let raw = fs::read_to_string(&snapshot)?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| HdfError::BadSnapshot(e.to_string()))?;
        let root = GroupRef::from_json("/", &value)?;
        Ok(Self {
            root,
            path: snapshot,
            swmr,
            open: true,
        })
    }

    pub fn root(&self) -> GroupRef {
        self.root.clone()
    }

    pub fn swmr(&self) -> bool {
        self.swmr
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current tree. Under SWMR the writer loop calls this
    /// after every append so readers observe committed data.
    pub fn flush(&self) -> Result<(), HdfError> {
        if !self.open {
            return Err(HdfError::Closed);
        }
        let value = self.root.to_json();
        let rendered = serde_json::to_string_pretty(&value)
            .map_err(|e| HdfError::BadSnapshot(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, rendered)?;
        Ok(())
    }

    /// Flush and mark the file closed; later appends or flushes fail.
    pub fn close(&mut self) -> Result<(), HdfError> {
        if !self.open {
            return Ok(());
        }
        self.flush()?;
        self.open = false;
        Ok(())
    }
}

/// The on-disk snapshot sits next to the requested filename.
fn snapshot_path(path: &Path) -> PathBuf {
    if path.extension().map(|e| e == "json").unwrap_or(false) {
        path.to_path_buf()
    } else {
        let mut os = path.as_os_str().to_os_string();
        os.push(".json");
        PathBuf::from(os)
    }
}
