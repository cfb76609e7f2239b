//! Reference writer module for `f144` log frames.
//!
//! Writes an NXlog group: a `time` dataset (u64 nanoseconds) and a `value`
//! dataset whose element type and shape are fixed by the stream
//! configuration. The value dataset's type is chosen once at init; the
//! write path appends into that one dataset without re-deciding.

use crate::hdf::{DatasetRef, GroupRef};
use crate::module::{
    InitResult, ModuleConfigError, ModuleInitError, WriteError, WriterModule,
};
use nexflow_protocol::defaults;
use nexflow_schema::f144::{ArrayValue, ElementType, LogFrame, LogValue, ScalarValue};
use nexflow_schema::message::FlatbufferMessage;
use serde_json::Value;
use tracing::warn;

/// Writer instance for one `f144` stream.
pub struct LogWriter {
    element_type: ElementType,
    array_size: usize,
    chunk_size: u64,
    string_size: usize,
    units: Option<String>,
    source: String,
    time: Option<DatasetRef>,
    value: Option<DatasetRef>,
}

impl LogWriter {
    pub fn new() -> Self {
        Self {
            element_type: ElementType::F64,
            array_size: 0,
            chunk_size: defaults::CHUNK_SIZE,
            string_size: defaults::STRING_SIZE as usize,
            units: None,
            source: String::new(),
            time: None,
            value: None,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn array_size(&self) -> usize {
        self.array_size
    }

    fn datasets(&self) -> Result<(&DatasetRef, &DatasetRef), WriteError> {
        match (&self.value, &self.time) {
            (Some(value), Some(time)) => Ok((value, time)),
            _ => Err(WriteError::NotInitialised),
        }
    }

    fn append_value(&self, frame: &LogFrame) -> Result<(), WriteError> {
        let (value_ds, _) = self.datasets()?;
        match &frame.value {
            LogValue::Scalar(scalar) => {
                if self.array_size != 0 {
                    return Err(WriteError::ShapeMismatch(format!(
                        "scalar sample from '{}' into array dataset",
                        frame.source_name
                    )));
                }
                append_scalar(value_ds, *scalar)?;
            }
            LogValue::Array(array) => {
                if self.array_size == 0 {
                    return Err(WriteError::ShapeMismatch(format!(
                        "array sample from '{}' into scalar dataset",
                        frame.source_name
                    )));
                }
                if array.len() != self.array_size {
                    return Err(WriteError::ShapeMismatch(format!(
                        "array of {} elements, dataset expects {}",
                        array.len(),
                        self.array_size
                    )));
                }
                append_array(value_ds, array)?;
            }
            LogValue::Str(text) => {
                if self.element_type != ElementType::Str {
                    return Err(WriteError::ShapeMismatch(format!(
                        "string sample from '{}' into numeric dataset",
                        frame.source_name
                    )));
                }
                value_ds.with_mut(|d| d.append_string(text))?;
            }
        }
        Ok(())
    }

    fn write_frame(&mut self, msg: &FlatbufferMessage, restamp: Option<u64>) -> Result<(), WriteError> {
        let frame =
            LogFrame::decode(msg.data()).map_err(|e| WriteError::BadMessage(e.to_string()))?;
        // value first so a shape failure leaves time and value aligned
        self.append_value(&frame)?;
        let (_, time_ds) = self.datasets()?;
        let ts = restamp.unwrap_or(frame.timestamp_ns);
        time_ds.with_mut(|d| d.append_scalar(ts))?;
        Ok(())
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn append_scalar(ds: &DatasetRef, scalar: ScalarValue) -> Result<(), WriteError> {
    ds.with_mut(|d| match scalar {
        ScalarValue::I8(v) => d.append_scalar(v),
        ScalarValue::U8(v) => d.append_scalar(v),
        ScalarValue::I16(v) => d.append_scalar(v),
        ScalarValue::U16(v) => d.append_scalar(v),
        ScalarValue::I32(v) => d.append_scalar(v),
        ScalarValue::U32(v) => d.append_scalar(v),
        ScalarValue::I64(v) => d.append_scalar(v),
        ScalarValue::U64(v) => d.append_scalar(v),
        ScalarValue::F32(v) => d.append_scalar(v),
        ScalarValue::F64(v) => d.append_scalar(v),
    })?;
    Ok(())
}

fn append_array(ds: &DatasetRef, array: &ArrayValue) -> Result<(), WriteError> {
    ds.with_mut(|d| match array {
        ArrayValue::I8(v) => d.append_row(v),
        ArrayValue::U8(v) => d.append_row(v),
        ArrayValue::I16(v) => d.append_row(v),
        ArrayValue::U16(v) => d.append_row(v),
        ArrayValue::I32(v) => d.append_row(v),
        ArrayValue::U32(v) => d.append_row(v),
        ArrayValue::I64(v) => d.append_row(v),
        ArrayValue::U64(v) => d.append_row(v),
        ArrayValue::F32(v) => d.append_row(v),
        ArrayValue::F64(v) => d.append_row(v),
    })?;
    Ok(())
}

impl WriterModule for LogWriter {
    fn parse_config(&mut self, config: &Value) -> Result<(), ModuleConfigError> {
        if !config.is_object() && !config.is_null() {
            return Err(ModuleConfigError::Malformed(
                "stream configuration must be an object".to_string(),
            ));
        }
        self.source = config
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(name) = config
            .get("type")
            .or_else(|| config.get("dtype"))
            .and_then(Value::as_str)
        {
            match ElementType::from_name(name) {
                Some(element_type) => self.element_type = element_type,
                None => {
                    warn!(
                        source = %self.source,
                        "Unknown data type with name \"{}\". Using double.", name
                    );
                    self.element_type = ElementType::F64;
                }
            }
        }
        if let Some(array_size) = config.get("array_size").and_then(Value::as_u64) {
            self.array_size = array_size as usize;
        }
        if let Some(chunk_size) = config.get("chunk_size").and_then(Value::as_u64) {
            if chunk_size > 0 {
                self.chunk_size = chunk_size;
            }
        }
        if let Some(units) = config.get("value_units").and_then(Value::as_str) {
            if !units.is_empty() {
                self.units = Some(units.to_string());
            }
        }
        Ok(())
    }

    fn init_hdf(&mut self, group: &GroupRef) -> InitResult {
        // refuse before creating anything so a failure is never partial
        if group.has_child("time") || group.has_child("value") {
            return Err(ModuleInitError::Other(format!(
                "group '{}' already contains log datasets",
                group.name()
            )));
        }
        let time = group.create_dataset("time", ElementType::U64, 0, self.chunk_size, 0)?;
        time.with_mut(|d| d.set_attr("units", Value::from("ns")));
        let value = if self.element_type == ElementType::Str {
            group.create_dataset(
                "value",
                ElementType::Str,
                0,
                defaults::STRING_CHUNK_SIZE,
                self.string_size,
            )?
        } else {
            group.create_dataset(
                "value",
                self.element_type,
                self.array_size,
                self.chunk_size,
                0,
            )?
        };
        if let Some(units) = &self.units {
            value.with_mut(|d| d.set_attr("units", Value::from(units.clone())));
        }
        if !group.has_attr("NX_class") {
            group.set_attr("NX_class", Value::from("NXlog"));
        }
        self.time = Some(time);
        self.value = Some(value);
        Ok(())
    }

    fn reopen(&mut self, group: &GroupRef) -> InitResult {
        let time = group.open_dataset("time")?;
        let value = group.open_dataset("value")?;
        self.time = Some(time);
        self.value = Some(value);
        Ok(())
    }

    fn write(&mut self, msg: &FlatbufferMessage) -> Result<(), WriteError> {
        self.write_frame(msg, None)
    }

    fn write_restamped(
        &mut self,
        msg: &FlatbufferMessage,
        timestamp_ns: u64,
    ) -> Result<(), WriteError> {
        self.write_frame(msg, Some(timestamp_ns))
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        self.time = None;
        self.value = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdf::{DatasetValues, NexusFile};
    use nexflow_schema::f144::LogFrameBuilder;
    use serde_json::json;

    fn fresh_group() -> GroupRef {
        let dir = tempfile::tempdir().unwrap();
        let file = NexusFile::create(&dir.path().join("t.h5"), "t.h5", false);
        file.root().create_group("stream").unwrap()
    }

    fn scalar_msg(ts: u64, value: ScalarValue) -> FlatbufferMessage {
        FlatbufferMessage::from_bytes(
            LogFrameBuilder::new("src").timestamp_ns(ts).scalar(value).encode(),
        )
    }

    #[test]
    fn scalar_f64_sequence_appends_in_order() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({"type": "double"})).unwrap();
        writer.init_hdf(&group).unwrap();
        for (ts, v) in [(1u64, 1.5f64), (2, 2.5), (3, 3.5)] {
            writer.write(&scalar_msg(ts, ScalarValue::F64(v))).unwrap();
        }
        let value = group.open_dataset("value").unwrap();
        let time = group.open_dataset("time").unwrap();
        assert_eq!(value.extent(), vec![3]);
        value.with(|d| assert_eq!(d.values(), &DatasetValues::F64(vec![1.5, 2.5, 3.5])));
        time.with(|d| assert_eq!(d.values(), &DatasetValues::U64(vec![1, 2, 3])));
    }

    #[test]
    fn each_numeric_type_round_trips() {
        let cases: Vec<(&str, ScalarValue, DatasetValues)> = vec![
            ("int8", ScalarValue::I8(-3), DatasetValues::I8(vec![-3])),
            ("uint8", ScalarValue::U8(3), DatasetValues::U8(vec![3])),
            ("int16", ScalarValue::I16(-300), DatasetValues::I16(vec![-300])),
            ("uint16", ScalarValue::U16(300), DatasetValues::U16(vec![300])),
            ("int32", ScalarValue::I32(-70_000), DatasetValues::I32(vec![-70_000])),
            ("uint32", ScalarValue::U32(70_000), DatasetValues::U32(vec![70_000])),
            (
                "int64",
                ScalarValue::I64(-5_000_000_000),
                DatasetValues::I64(vec![-5_000_000_000]),
            ),
            (
                "uint64",
                ScalarValue::U64(5_000_000_000),
                DatasetValues::U64(vec![5_000_000_000]),
            ),
            ("float32", ScalarValue::F32(0.5), DatasetValues::F32(vec![0.5])),
            ("float64", ScalarValue::F64(0.25), DatasetValues::F64(vec![0.25])),
        ];
        for (type_name, scalar, expected) in cases {
            let group = fresh_group();
            let mut writer = LogWriter::new();
            writer.parse_config(&json!({ "type": type_name })).unwrap();
            writer.init_hdf(&group).unwrap();
            writer.write(&scalar_msg(10, scalar)).unwrap();
            let value = group.open_dataset("value").unwrap();
            value.with(|d| assert_eq!(d.values(), &expected, "type {}", type_name));
        }
    }

    #[test]
    fn unknown_type_name_downgrades_to_f64() {
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({"type": "quaternion"})).unwrap();
        assert_eq!(writer.element_type(), ElementType::F64);
    }

    #[test]
    fn array_stream_builds_two_dimensional_dataset() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer
            .parse_config(&json!({"type": "int32", "array_size": 3}))
            .unwrap();
        writer.init_hdf(&group).unwrap();
        for base in [0i32, 10] {
            let msg = FlatbufferMessage::from_bytes(
                LogFrameBuilder::new("arr")
                    .timestamp_ns(base as u64)
                    .array(ArrayValue::I32(vec![base, base + 1, base + 2]))
                    .encode(),
            );
            writer.write(&msg).unwrap();
        }
        let value = group.open_dataset("value").unwrap();
        assert_eq!(value.extent(), vec![2, 3]);
        value.with(|d| {
            assert_eq!(d.values(), &DatasetValues::I32(vec![0, 1, 2, 10, 11, 12]));
        });
    }

    #[test]
    fn wrong_length_array_is_rejected_without_time_row() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer
            .parse_config(&json!({"type": "int32", "array_size": 3}))
            .unwrap();
        writer.init_hdf(&group).unwrap();
        let msg = FlatbufferMessage::from_bytes(
            LogFrameBuilder::new("arr")
                .timestamp_ns(5)
                .array(ArrayValue::I32(vec![1, 2]))
                .encode(),
        );
        assert!(matches!(
            writer.write(&msg),
            Err(WriteError::ShapeMismatch(_))
        ));
        let time = group.open_dataset("time").unwrap();
        assert_eq!(time.rows(), 0);
    }

    #[test]
    fn string_stream_uses_fixed_size_dataset() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({"type": "string"})).unwrap();
        writer.init_hdf(&group).unwrap();
        for text in ["a", "bb"] {
            let msg = FlatbufferMessage::from_bytes(
                LogFrameBuilder::new("s").timestamp_ns(1).string(text).encode(),
            );
            // identical timestamps are the filter's concern, not the writer's
            writer.write(&msg).unwrap();
        }
        let value = group.open_dataset("value").unwrap();
        value.with(|d| {
            assert_eq!(
                d.values(),
                &DatasetValues::Str(vec!["a".to_string(), "bb".to_string()])
            );
            assert_eq!(d.string_size(), 128);
        });
    }

    #[test]
    fn restamped_write_overrides_time_only() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({"type": "double"})).unwrap();
        writer.init_hdf(&group).unwrap();
        writer
            .write_restamped(&scalar_msg(50, ScalarValue::F64(9.0)), 100)
            .unwrap();
        let time = group.open_dataset("time").unwrap();
        let value = group.open_dataset("value").unwrap();
        time.with(|d| assert_eq!(d.values(), &DatasetValues::U64(vec![100])));
        value.with(|d| assert_eq!(d.values(), &DatasetValues::F64(vec![9.0])));
    }

    #[test]
    fn init_into_occupied_group_fails_cleanly() {
        let group = fresh_group();
        group
            .create_dataset("time", ElementType::U64, 0, 1, 0)
            .unwrap();
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({})).unwrap();
        assert!(writer.init_hdf(&group).is_err());
        // nothing new was created
        assert!(!group.has_child("value"));
    }

    #[test]
    fn reopen_attaches_to_existing_datasets() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({"type": "double"})).unwrap();
        writer.init_hdf(&group).unwrap();
        writer.write(&scalar_msg(1, ScalarValue::F64(1.0))).unwrap();
        writer.close().unwrap();

        let mut second = LogWriter::new();
        second.parse_config(&json!({"type": "double"})).unwrap();
        second.reopen(&group).unwrap();
        second.write(&scalar_msg(2, ScalarValue::F64(2.0))).unwrap();
        let value = group.open_dataset("value").unwrap();
        value.with(|d| assert_eq!(d.values(), &DatasetValues::F64(vec![1.0, 2.0])));
    }

    #[test]
    fn units_attribute_set_from_config() {
        let group = fresh_group();
        let mut writer = LogWriter::new();
        writer
            .parse_config(&json!({"type": "double", "value_units": "K"}))
            .unwrap();
        writer.init_hdf(&group).unwrap();
        let value = group.open_dataset("value").unwrap();
        value.with(|d| assert_eq!(d.attr("units"), Some(&Value::from("K"))));
        assert_eq!(group.attr("NX_class"), Some(Value::from("NXlog")));
    }

    #[test]
    fn write_before_init_fails() {
        let mut writer = LogWriter::new();
        writer.parse_config(&json!({})).unwrap();
        assert!(matches!(
            writer.write(&scalar_msg(1, ScalarValue::F64(0.0))),
            Err(WriteError::NotInitialised)
        ));
    }
}
