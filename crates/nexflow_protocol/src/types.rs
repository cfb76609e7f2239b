//! Canonical identifier and time types used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical job identifier across the system.
///
/// Job ids come from the start command and are caller-chosen strings; they
/// key the handler's table of active jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one running file-writer process.
///
/// Commands carrying a different service id are ignored; an absent or empty
/// service id addresses every process listening on the topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A command addresses this service when its service id is empty or
    /// matches ours exactly.
    pub fn accepts(&self, command_service_id: Option<&str>) -> bool {
        match command_service_id {
            None => true,
            Some(id) => id.is_empty() || id == self.0,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaTagError {
    #[error("schema tag must be exactly 4 bytes, got {0}")]
    InvalidKey(usize),
}

/// The 4-byte schema identifier embedded at bytes 4..8 of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaTag([u8; 4]);

impl SchemaTag {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Build a tag from an arbitrary slice; anything but exactly 4 bytes is
    /// an `InvalidKey` error.
    pub fn parse(bytes: &[u8]) -> Result<Self, SchemaTagError> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| SchemaTagError::InvalidKey(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl FromStr for SchemaTag {
    type Err = SchemaTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for SchemaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            if b.is_ascii_graphic() {
                write!(f, "{}", *b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

/// Stable hash of `(schema_tag, source_name)`; the primary key of a source
/// filter and of a writer instance within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(u64);

impl SourceKey {
    /// Derive the key from the schema tag and source name. blake3 keeps the
    /// value stable across processes and runs, unlike the std hasher.
    pub fn compute(tag: SchemaTag, source_name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tag.as_bytes());
        hasher.update(source_name.as_bytes());
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(first))
    }

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Milliseconds since the Unix epoch. Broker timestamps and job start/stop
/// times use this resolution; message data timestamps are nanoseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TimeStampMs(u64);

impl TimeStampMs {
    pub const MAX: TimeStampMs = TimeStampMs(u64::MAX);

    pub const fn new(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Same instant in nanoseconds, saturating at the representable maximum.
    pub const fn as_nanos(self) -> u64 {
        self.0.saturating_mul(1_000_000)
    }

    pub fn now() -> Self {
        let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self(ms)
    }

    pub const fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub const fn saturating_sub(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    /// True when adding `leeway_ms` would overflow the representation.
    pub const fn overflows_with(self, leeway_ms: u64) -> bool {
        self.0.checked_add(leeway_ms).is_none()
    }
}

impl fmt::Display for TimeStampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for TimeStampMs {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerAddrError {
    #[error("broker address is empty")]
    Empty,
    #[error("broker address '{0}' is not of the form host:port")]
    Malformed(String),
    #[error("broker port in '{0}' is not a number")]
    BadPort(String),
}

/// A `//host:port` broker address from the start command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    pub fn parse(input: &str) -> Result<Self, BrokerAddrError> {
        let trimmed = input.trim_start_matches("//");
        if trimmed.is_empty() {
            return Err(BrokerAddrError::Empty);
        }
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| BrokerAddrError::Malformed(input.to_string()))?;
        if host.is_empty() || host.chars().all(|c| c.is_ascii_digit()) {
            // "1234:somehost" style inputs reach here with a numeric "host"
            return Err(BrokerAddrError::Malformed(input.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BrokerAddrError::BadPort(input.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TryFrom<String> for BrokerAddr {
    type Error = BrokerAddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BrokerAddr> for String {
    fn from(value: BrokerAddr) -> Self {
        value.host_port()
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tag_requires_four_bytes() {
        assert!(SchemaTag::parse(b"tem").is_err());
        assert!(SchemaTag::parse(b"tempp").is_err());
        let tag = SchemaTag::parse(b"t3mp").unwrap();
        assert_eq!(tag.as_bytes(), b"t3mp");
    }

    #[test]
    fn source_key_is_stable_and_distinct() {
        let tag = SchemaTag::from_bytes(*b"f144");
        let a = SourceKey::compute(tag, "det_1");
        let b = SourceKey::compute(tag, "det_1");
        let c = SourceKey::compute(tag, "det_2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn broker_addr_parses_host_port() {
        let addr = BrokerAddr::parse("//somehost:1234").unwrap();
        assert_eq!(addr.host, "somehost");
        assert_eq!(addr.port, 1234);
        assert_eq!(addr.host_port(), "somehost:1234");

        let bare = BrokerAddr::parse("otherhost:9092").unwrap();
        assert_eq!(bare.host, "otherhost");
    }

    #[test]
    fn broker_addr_rejects_malformed_input() {
        assert!(BrokerAddr::parse("").is_err());
        assert!(BrokerAddr::parse("nohostport").is_err());
        assert!(BrokerAddr::parse("1234:somehost").is_err());
        assert!(BrokerAddr::parse("host:notaport").is_err());
    }

    #[test]
    fn service_id_match_rules() {
        let id = ServiceId::new("filewriter1");
        assert!(id.accepts(None));
        assert!(id.accepts(Some("")));
        assert!(id.accepts(Some("filewriter1")));
        assert!(!id.accepts(Some("filewriter2")));
    }

    #[test]
    fn timestamp_overflow_guard() {
        let near_max = TimeStampMs::new(u64::MAX - 10);
        assert!(near_max.overflows_with(100));
        assert!(!TimeStampMs::new(1_000).overflows_with(100));
    }
}
