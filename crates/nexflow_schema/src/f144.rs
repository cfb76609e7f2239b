//! The `f144` log-frame codec: the reference schema for scalar, array and
//! string samples from a named source.
//!
//! Frame layout (little endian, file identifier at byte offset 4):
//!
//! ```text
//! [LEN:4][TAG:4][NAME_LEN:2][NAME:n][TIMESTAMP_NS:8][KIND:1][TYPE:1][PAYLOAD]
//! ```
//!
//! - LEN (u32): total frame length in bytes
//! - TAG: `f144`
//! - KIND (u8): 0 scalar, 1 array, 2 string
//! - TYPE (u8): element-type code
//! - PAYLOAD: scalar → one element; array → `[COUNT:4][elements]`;
//!   string → `[LEN:4][bytes]`

use crate::message::FlatbufferMessage;
use crate::reader::FlatbufferReader;
use byteorder::{ByteOrder, LittleEndian};
use nexflow_protocol::types::SchemaTag;
use thiserror::Error;

/// The `f144` file identifier.
pub const SCHEMA_TAG: SchemaTag = SchemaTag::from_bytes(*b"f144");

const HEADER_FIXED: usize = 4 + 4 + 2;
const KIND_SCALAR: u8 = 0;
const KIND_ARRAY: u8 = 1;
const KIND_STRING: u8 = 2;

/// Element types a log frame (and a log dataset) can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
}

impl ElementType {
    pub fn code(self) -> u8 {
        match self {
            ElementType::I8 => 0,
            ElementType::U8 => 1,
            ElementType::I16 => 2,
            ElementType::U16 => 3,
            ElementType::I32 => 4,
            ElementType::U32 => 5,
            ElementType::I64 => 6,
            ElementType::U64 => 7,
            ElementType::F32 => 8,
            ElementType::F64 => 9,
            ElementType::Str => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ElementType::I8,
            1 => ElementType::U8,
            2 => ElementType::I16,
            3 => ElementType::U16,
            4 => ElementType::I32,
            5 => ElementType::U32,
            6 => ElementType::I64,
            7 => ElementType::U64,
            8 => ElementType::F32,
            9 => ElementType::F64,
            10 => ElementType::Str,
            _ => return None,
        })
    }

    /// Parse a configuration type name. Accepts the canonical names plus
    /// the common aliases the original stream configurations used.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "int8" => ElementType::I8,
            "uint8" => ElementType::U8,
            "int16" | "short" => ElementType::I16,
            "uint16" => ElementType::U16,
            "int32" | "int" => ElementType::I32,
            "uint32" => ElementType::U32,
            "int64" | "long" => ElementType::I64,
            "uint64" => ElementType::U64,
            "float32" | "float" => ElementType::F32,
            "float64" | "double" => ElementType::F64,
            "string" => ElementType::Str,
            _ => return None,
        })
    }

    /// Size of one element on the wire; strings are length-prefixed.
    pub fn wire_size(self) -> Option<usize> {
        Some(match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
            ElementType::Str => return None,
        })
    }
}

/// One scalar sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn element_type(&self) -> ElementType {
        match self {
            ScalarValue::I8(_) => ElementType::I8,
            ScalarValue::U8(_) => ElementType::U8,
            ScalarValue::I16(_) => ElementType::I16,
            ScalarValue::U16(_) => ElementType::U16,
            ScalarValue::I32(_) => ElementType::I32,
            ScalarValue::U32(_) => ElementType::U32,
            ScalarValue::I64(_) => ElementType::I64,
            ScalarValue::U64(_) => ElementType::U64,
            ScalarValue::F32(_) => ElementType::F32,
            ScalarValue::F64(_) => ElementType::F64,
        }
    }
}

/// One array sample.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
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
}

impl ArrayValue {
    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayValue::I8(_) => ElementType::I8,
            ArrayValue::U8(_) => ElementType::U8,
            ArrayValue::I16(_) => ElementType::I16,
            ArrayValue::U16(_) => ElementType::U16,
            ArrayValue::I32(_) => ElementType::I32,
            ArrayValue::U32(_) => ElementType::U32,
            ArrayValue::I64(_) => ElementType::I64,
            ArrayValue::U64(_) => ElementType::U64,
            ArrayValue::F32(_) => ElementType::F32,
            ArrayValue::F64(_) => ElementType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::I8(v) => v.len(),
            ArrayValue::U8(v) => v.len(),
            ArrayValue::I16(v) => v.len(),
            ArrayValue::U16(v) => v.len(),
            ArrayValue::I32(v) => v.len(),
            ArrayValue::U32(v) => v.len(),
            ArrayValue::I64(v) => v.len(),
            ArrayValue::U64(v) => v.len(),
            ArrayValue::F32(v) => v.len(),
            ArrayValue::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The decoded value of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Scalar(ScalarValue),
    Array(ArrayValue),
    Str(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is {0} bytes, shorter than the fixed header")]
    TooShort(usize),
    #[error("frame tag is not f144")]
    BadTag,
    #[error("declared frame length {declared} does not match buffer length {actual}")]
    BadLength { declared: usize, actual: usize },
    #[error("source name is not valid UTF-8")]
    BadSourceName,
    #[error("unknown value kind {0}")]
    BadKind(u8),
    #[error("unknown element-type code {0}")]
    BadType(u8),
    #[error("payload is truncated")]
    Truncated,
}

/// A fully decoded `f144` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFrame {
    pub source_name: String,
    pub timestamp_ns: u64,
    pub value: LogValue,
}

struct Header<'a> {
    source_name: &'a str,
    timestamp_ns: u64,
    kind: u8,
    type_code: u8,
    payload: &'a [u8],
}

fn decode_header(data: &[u8]) -> Result<Header<'_>, DecodeError> {
    if data.len() < HEADER_FIXED {
        return Err(DecodeError::TooShort(data.len()));
    }
    let declared = LittleEndian::read_u32(&data[0..4]) as usize;
    if &data[4..8] != SCHEMA_TAG.as_bytes() {
        return Err(DecodeError::BadTag);
    }
    if declared != data.len() {
        return Err(DecodeError::BadLength {
            declared,
            actual: data.len(),
        });
    }
    let name_len = LittleEndian::read_u16(&data[8..10]) as usize;
    let name_end = HEADER_FIXED + name_len;
    // name + timestamp + kind + type must fit
    if data.len() < name_end + 8 + 2 {
        return Err(DecodeError::Truncated);
    }
    let source_name = std::str::from_utf8(&data[HEADER_FIXED..name_end])
        .map_err(|_| DecodeError::BadSourceName)?;
    let timestamp_ns = LittleEndian::read_u64(&data[name_end..name_end + 8]);
    let kind = data[name_end + 8];
    let type_code = data[name_end + 9];
    Ok(Header {
        source_name,
        timestamp_ns,
        kind,
        type_code,
        payload: &data[name_end + 10..],
    })
}

macro_rules! read_scalar {
    ($payload:expr, $ty:ty, $read:expr, $variant:ident) => {{
        let size = std::mem::size_of::<$ty>();
        if $payload.len() < size {
            return Err(DecodeError::Truncated);
        }
        ScalarValue::$variant($read(&$payload[..size]))
    }};
}

macro_rules! read_array {
    ($payload:expr, $count:expr, $ty:ty, $read:expr, $variant:ident) => {{
        let size = std::mem::size_of::<$ty>();
        if $payload.len() < $count * size {
            return Err(DecodeError::Truncated);
        }
        let values: Vec<$ty> = (0..$count)
            .map(|i| $read(&$payload[i * size..(i + 1) * size]))
            .collect();
        ArrayValue::$variant(values)
    }};
}

impl LogFrame {
    /// Decode a whole frame, verifying every length field.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let header = decode_header(data)?;
        let element = ElementType::from_code(header.type_code)
            .ok_or(DecodeError::BadType(header.type_code))?;
        let value = match header.kind {
            KIND_SCALAR => LogValue::Scalar(decode_scalar(element, header.payload)?),
            KIND_ARRAY => LogValue::Array(decode_array(element, header.payload)?),
            KIND_STRING => {
                if header.payload.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                let len = LittleEndian::read_u32(&header.payload[0..4]) as usize;
                let bytes = header
                    .payload
                    .get(4..4 + len)
                    .ok_or(DecodeError::Truncated)?;
                let text =
                    std::str::from_utf8(bytes).map_err(|_| DecodeError::BadSourceName)?;
                LogValue::Str(text.to_string())
            }
            other => return Err(DecodeError::BadKind(other)),
        };
        Ok(LogFrame {
            source_name: header.source_name.to_string(),
            timestamp_ns: header.timestamp_ns,
            value,
        })
    }

    /// Decode only `(source_name, timestamp_ns)`; the partition hot path
    /// never needs the payload.
    pub fn decode_routing(data: &[u8]) -> Result<(String, u64), DecodeError> {
        let header = decode_header(data)?;
        Ok((header.source_name.to_string(), header.timestamp_ns))
    }
}

fn decode_scalar(element: ElementType, payload: &[u8]) -> Result<ScalarValue, DecodeError> {
    Ok(match element {
        ElementType::I8 => read_scalar!(payload, i8, |b: &[u8]| b[0] as i8, I8),
        ElementType::U8 => read_scalar!(payload, u8, |b: &[u8]| b[0], U8),
        ElementType::I16 => read_scalar!(payload, i16, LittleEndian::read_i16, I16),
        ElementType::U16 => read_scalar!(payload, u16, LittleEndian::read_u16, U16),
        ElementType::I32 => read_scalar!(payload, i32, LittleEndian::read_i32, I32),
        ElementType::U32 => read_scalar!(payload, u32, LittleEndian::read_u32, U32),
        ElementType::I64 => read_scalar!(payload, i64, LittleEndian::read_i64, I64),
        ElementType::U64 => read_scalar!(payload, u64, LittleEndian::read_u64, U64),
        ElementType::F32 => read_scalar!(payload, f32, LittleEndian::read_f32, F32),
        ElementType::F64 => read_scalar!(payload, f64, LittleEndian::read_f64, F64),
        ElementType::Str => return Err(DecodeError::BadType(ElementType::Str.code())),
    })
}

fn decode_array(element: ElementType, payload: &[u8]) -> Result<ArrayValue, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    let count = LittleEndian::read_u32(&payload[0..4]) as usize;
    let body = &payload[4..];
    Ok(match element {
        ElementType::I8 => read_array!(body, count, i8, |b: &[u8]| b[0] as i8, I8),
        ElementType::U8 => read_array!(body, count, u8, |b: &[u8]| b[0], U8),
        ElementType::I16 => read_array!(body, count, i16, LittleEndian::read_i16, I16),
        ElementType::U16 => read_array!(body, count, u16, LittleEndian::read_u16, U16),
        ElementType::I32 => read_array!(body, count, i32, LittleEndian::read_i32, I32),
        ElementType::U32 => read_array!(body, count, u32, LittleEndian::read_u32, U32),
        ElementType::I64 => read_array!(body, count, i64, LittleEndian::read_i64, I64),
        ElementType::U64 => read_array!(body, count, u64, LittleEndian::read_u64, U64),
        ElementType::F32 => read_array!(body, count, f32, LittleEndian::read_f32, F32),
        ElementType::F64 => read_array!(body, count, f64, LittleEndian::read_f64, F64),
        ElementType::Str => return Err(DecodeError::BadType(ElementType::Str.code())),
    })
}

/// Builds encoded frames; used by tests and the send-frame tool.
#[derive(Debug, Clone)]
pub struct LogFrameBuilder {
    source_name: String,
    timestamp_ns: u64,
    value: LogValue,
}

impl LogFrameBuilder {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            timestamp_ns: 0,
            value: LogValue::Scalar(ScalarValue::F64(0.0)),
        }
    }

    pub fn timestamp_ns(mut self, ts: u64) -> Self {
        self.timestamp_ns = ts;
        self
    }

    pub fn value(mut self, value: LogValue) -> Self {
        self.value = value;
        self
    }

    pub fn scalar(self, value: ScalarValue) -> Self {
        self.value(LogValue::Scalar(value))
    }

    pub fn array(self, value: ArrayValue) -> Self {
        self.value(LogValue::Array(value))
    }

    pub fn string(self, value: impl Into<String>) -> Self {
        self.value(LogValue::Str(value.into()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::new();
        let (kind, type_code) = match &self.value {
            LogValue::Scalar(scalar) => {
                encode_scalar(&mut payload, scalar);
                (KIND_SCALAR, scalar.element_type().code())
            }
            LogValue::Array(array) => {
                payload.extend_from_slice(&(array.len() as u32).to_le_bytes());
                encode_array(&mut payload, array);
                (KIND_ARRAY, array.element_type().code())
            }
            LogValue::Str(text) => {
                payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
                payload.extend_from_slice(text.as_bytes());
                (KIND_STRING, ElementType::Str.code())
            }
        };

        let name = self.source_name.as_bytes();
        let total = HEADER_FIXED + name.len() + 8 + 2 + payload.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(SCHEMA_TAG.as_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.push(kind);
        out.push(type_code);
        out.extend_from_slice(&payload);
        out
    }

    /// Encode into a [`FlatbufferMessage`] with the given broker metadata.
    pub fn into_message(self, meta: crate::message::MessageMetaData) -> FlatbufferMessage {
        FlatbufferMessage::new(self.encode(), meta)
    }
}

fn encode_scalar(out: &mut Vec<u8>, scalar: &ScalarValue) {
    match *scalar {
        ScalarValue::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::U8(v) => out.push(v),
        ScalarValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
    }
}

fn encode_array(out: &mut Vec<u8>, array: &ArrayValue) {
    match array {
        ArrayValue::I8(v) => out.extend(v.iter().map(|x| *x as u8)),
        ArrayValue::U8(v) => out.extend_from_slice(v),
        ArrayValue::I16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        ArrayValue::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
    }
}

/// Reader-registry adapter for `f144` frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct F144Reader;

impl FlatbufferReader for F144Reader {
    fn verify(&self, msg: &FlatbufferMessage) -> bool {
        LogFrame::decode(msg.data()).is_ok()
    }

    fn source_name(&self, msg: &FlatbufferMessage) -> String {
        LogFrame::decode_routing(msg.data())
            .map(|(name, _)| name)
            .unwrap_or_default()
    }

    fn timestamp_ns(&self, msg: &FlatbufferMessage) -> u64 {
        LogFrame::decode_routing(msg.data())
            .map(|(_, ts)| ts)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let encoded = LogFrameBuilder::new("det_1")
            .timestamp_ns(150)
            .scalar(ScalarValue::F64(3.25))
            .encode();
        let frame = LogFrame::decode(&encoded).unwrap();
        assert_eq!(frame.source_name, "det_1");
        assert_eq!(frame.timestamp_ns, 150);
        assert_eq!(frame.value, LogValue::Scalar(ScalarValue::F64(3.25)));
    }

    #[test]
    fn array_round_trip() {
        let encoded = LogFrameBuilder::new("arr")
            .timestamp_ns(7)
            .array(ArrayValue::I32(vec![1, -2, 3]))
            .encode();
        let frame = LogFrame::decode(&encoded).unwrap();
        assert_eq!(frame.value, LogValue::Array(ArrayValue::I32(vec![1, -2, 3])));
    }

    #[test]
    fn string_round_trip() {
        let encoded = LogFrameBuilder::new("msg")
            .timestamp_ns(1)
            .string("hello")
            .encode();
        let frame = LogFrame::decode(&encoded).unwrap();
        assert_eq!(frame.value, LogValue::Str("hello".to_string()));
    }

    #[test]
    fn tag_sits_at_offset_four() {
        let encoded = LogFrameBuilder::new("x").encode();
        assert_eq!(&encoded[4..8], b"f144");
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut encoded = LogFrameBuilder::new("det_1")
            .scalar(ScalarValue::U64(9))
            .encode();
        encoded.truncate(encoded.len() - 3);
        assert!(LogFrame::decode(&encoded).is_err());
    }

    #[test]
    fn wrong_tag_rejected() {
        let mut encoded = LogFrameBuilder::new("det_1").encode();
        encoded[4..8].copy_from_slice(b"zzzz");
        assert_eq!(LogFrame::decode(&encoded), Err(DecodeError::BadTag));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut encoded = LogFrameBuilder::new("det_1").encode();
        encoded.push(0);
        assert!(matches!(
            LogFrame::decode(&encoded),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[test]
    fn routing_decode_skips_payload() {
        let encoded = LogFrameBuilder::new("temp_1")
            .timestamp_ns(42)
            .array(ArrayValue::F64(vec![0.5; 16]))
            .encode();
        let (source, ts) = LogFrame::decode_routing(&encoded).unwrap();
        assert_eq!(source, "temp_1");
        assert_eq!(ts, 42);
    }

    #[test]
    fn reader_adapter_verifies_and_extracts() {
        let msg = FlatbufferMessage::from_bytes(
            LogFrameBuilder::new("src")
                .timestamp_ns(11)
                .scalar(ScalarValue::I16(-4))
                .encode(),
        );
        let reader = F144Reader;
        assert!(reader.verify(&msg));
        assert_eq!(reader.source_name(&msg), "src");
        assert_eq!(reader.timestamp_ns(&msg), 11);

        let garbage = FlatbufferMessage::from_bytes(b"dumyf144".to_vec());
        assert!(!reader.verify(&garbage));
    }

    #[test]
    fn type_names_parse_with_aliases() {
        assert_eq!(ElementType::from_name("Double"), Some(ElementType::F64));
        assert_eq!(ElementType::from_name("int"), Some(ElementType::I32));
        assert_eq!(ElementType::from_name("short"), Some(ElementType::I16));
        assert_eq!(ElementType::from_name("uint64"), Some(ElementType::U64));
        assert_eq!(ElementType::from_name("strange"), None);
    }
}
