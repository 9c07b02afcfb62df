//! Structured log events.
//!
//! An [`Event`] is built once through [`EventBuilder`] and never mutated
//! afterwards. It travels as a protobuf [`LogEvent`](crate::proto::LogEvent);
//! metadata is carried as schema-less nested values.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Error, Result};
use crate::proto;

/// Metadata attached to an event.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key holding a captured call stack.
pub const CALLSTACK_KEY: &str = "callstack";

pub const DEFAULT_PREFIX: &str = "log";

/// Event severity, totally ordered from `Trace` to `Panic`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
    Panic = 6,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
        Level::Panic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
            Level::Panic => "panic",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            "panic" => Ok(Level::Panic),
            other => Err(format!("unknown level: {other}")),
        }
    }
}

impl TryFrom<i32> for Level {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Level::ALL
            .into_iter()
            .find(|l| *l as i32 == code)
            .ok_or(Error::InvalidLevel(code))
    }
}

/// An immutable structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    time: DateTime<Utc>,
    prefix: String,
    sub: String,
    level: Level,
    message: String,
    metadata: Metadata,
}

impl Event {
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sub(&self) -> &str {
        &self.sub
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Start a builder pre-filled with this event's fields. Building it
    /// stamps a new time.
    pub fn to_builder(&self) -> EventBuilder {
        EventBuilder {
            prefix: Some(self.prefix.clone()),
            sub: Some(self.sub.clone()),
            level: Some(self.level),
            message: Some(self.message.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }

    /// Encode to the binary wire form.
    pub fn encode(&self) -> Vec<u8> {
        proto::LogEvent::from(self).encode_to_vec()
    }

    /// Decode from the binary wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let msg = proto::LogEvent::decode(buf)?;
        Event::try_from(msg)
    }

    /// Decode `buf`, or treat it as a plain text message when it is not a
    /// valid encoded event.
    pub fn from_bytes_lossy(buf: &[u8]) -> Self {
        // Plain text can parse as a protobuf made of unknown fields; a real
        // event always carries its timestamp.
        if let Ok(msg) = proto::LogEvent::decode(buf) {
            if msg.time_ns != 0 {
                if let Ok(event) = Event::try_from(msg) {
                    return event;
                }
            }
        }
        let text = String::from_utf8_lossy(buf);
        Event::builder()
            .message(text.trim_end_matches(['\r', '\n']))
            .build()
    }
}

/// Incremental, value-returning builder for [`Event`].
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    prefix: Option<String>,
    sub: Option<String>,
    level: Option<Level>,
    message: Option<String>,
    metadata: Option<Metadata>,
}

impl EventBuilder {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn sub(mut self, sub: impl Into<String>) -> Self {
        self.sub = Some(sub.into());
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Merge `metadata` into the builder's metadata, overwriting on key
    /// collision.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.get_or_insert_with(Metadata::new).extend(metadata);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Capture the current call stack into metadata under
    /// [`CALLSTACK_KEY`]. With `all_frames == false` runtime frames are
    /// dropped and only application frames remain.
    pub fn with_call_stack(self, all_frames: bool) -> Self {
        let trace = std::backtrace::Backtrace::force_capture().to_string();
        let frames = parse_backtrace(&trace, all_frames);
        self.field(CALLSTACK_KEY, Value::Array(frames))
    }

    /// Fill unset fields with defaults and stamp the current time.
    pub fn build(self) -> Event {
        Event {
            time: Utc::now(),
            prefix: self.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            sub: self.sub.unwrap_or_default(),
            level: self.level.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

const RUNTIME_FRAMES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "backtrace::",
    "__rust",
    "rlog::event::",
    "<unknown>",
];

fn parse_backtrace(trace: &str, all_frames: bool) -> Vec<Value> {
    let mut frames: Vec<Metadata> = Vec::new();

    for line in trace.lines() {
        let line = line.trim();
        if let Some(location) = line.strip_prefix("at ") {
            let Some(frame) = frames.last_mut() else {
                continue;
            };
            // file:line:column
            let mut parts = location.rsplitn(3, ':');
            let _column = parts.next();
            let line_no = parts.next().and_then(|l| l.parse::<u64>().ok());
            match (parts.next(), line_no) {
                (Some(file), Some(line_no)) => {
                    frame.insert("file".into(), Value::from(file));
                    frame.insert("line".into(), Value::from(line_no));
                }
                _ => {
                    frame.insert("file".into(), Value::from(location));
                }
            }
        } else if let Some((index, function)) = line.split_once(": ") {
            if index.chars().all(|c| c.is_ascii_digit()) {
                let mut frame = Metadata::new();
                frame.insert("function".into(), Value::from(function));
                frames.push(frame);
            }
        }
    }

    frames
        .into_iter()
        .filter(|frame| {
            all_frames
                || frame
                    .get("function")
                    .and_then(Value::as_str)
                    .is_some_and(|f| !RUNTIME_FRAMES.iter().any(|p| f.starts_with(p)))
        })
        .map(Value::Object)
        .collect()
}

// Wire conversions

impl From<&Event> for proto::LogEvent {
    fn from(e: &Event) -> Self {
        Self {
            time_ns: e.time.timestamp_nanos_opt().unwrap_or_default(),
            prefix: e.prefix.clone(),
            sub: e.sub.clone(),
            level: e.level as i32,
            message: e.message.clone(),
            metadata: Some(map_to_proto(&e.metadata)),
        }
    }
}

impl TryFrom<proto::LogEvent> for Event {
    type Error = Error;

    fn try_from(e: proto::LogEvent) -> Result<Self> {
        Ok(Self {
            time: DateTime::from_timestamp_nanos(e.time_ns),
            prefix: e.prefix,
            sub: e.sub,
            level: Level::try_from(e.level)?,
            message: e.message,
            metadata: e.metadata.map(map_from_proto).unwrap_or_default(),
        })
    }
}

fn map_to_proto(map: &Metadata) -> proto::MapValue {
    proto::MapValue {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_proto(v)))
            .collect(),
    }
}

fn map_from_proto(map: proto::MapValue) -> Metadata {
    map.fields
        .into_iter()
        .map(|(k, v)| (k, value_from_proto(v)))
        .collect()
}

fn value_to_proto(value: &Value) -> proto::Value {
    use proto::value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(true),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntValue(i)
            } else if let Some(u) = n.as_u64() {
                Kind::UintValue(u)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(proto::ListValue {
            values: items.iter().map(value_to_proto).collect(),
        }),
        Value::Object(map) => Kind::MapValue(map_to_proto(map)),
    };
    proto::Value { kind: Some(kind) }
}

fn value_from_proto(value: proto::Value) -> Value {
    use proto::value::Kind;

    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntValue(i)) => Value::from(i),
        Some(Kind::UintValue(u)) => Value::from(u),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(value_from_proto).collect())
        }
        Some(Kind::MapValue(map)) => Value::Object(map_from_proto(map)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Metadata {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn build_applies_defaults() {
        let before = Utc::now();
        let event = Event::builder().build();

        assert_eq!(event.prefix(), "log");
        assert_eq!(event.sub(), "");
        assert_eq!(event.level(), Level::Info);
        assert_eq!(event.message(), "");
        assert!(event.metadata().is_empty());
        assert!(event.time() >= before);
    }

    #[test]
    fn metadata_merges_and_overwrites() {
        let event = Event::builder()
            .metadata(meta(json!({"a": 1, "b": 2})))
            .metadata(meta(json!({"b": 3, "c": 4})))
            .field("d", "x")
            .build();

        assert_eq!(
            Value::Object(event.metadata().clone()),
            json!({"a": 1, "b": 3, "c": 4, "d": "x"})
        );
    }

    #[test]
    fn builder_is_a_value() {
        let base = Event::builder().prefix("svc");
        let a = base.clone().message("a").build();
        let b = base.message("b").build();

        assert_eq!(a.prefix(), "svc");
        assert_eq!(b.prefix(), "svc");
        assert_eq!(a.message(), "a");
        assert_eq!(b.message(), "b");
    }

    #[test]
    fn levels_are_ordered() {
        for pair in Level::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(Level::Warn >= Level::Info);
    }

    #[test]
    fn level_parsing() {
        assert_eq!("WARNING".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!(" error ".parse::<Level>().unwrap(), Level::Error);
        assert!("loud".parse::<Level>().is_err());
        assert_eq!(Level::try_from(6).unwrap(), Level::Panic);
        assert!(matches!(Level::try_from(7), Err(Error::InvalidLevel(7))));
    }

    #[test]
    fn encode_decode_preserves_every_field() {
        let event = Event::builder()
            .prefix("api")
            .sub("http")
            .level(Level::Error)
            .message("request failed ✗")
            .metadata(meta(json!({
                "ok": false,
                "status": 503,
                "negative": -7,
                "big": u64::MAX,
                "ratio": 0.25,
                "nothing": null,
                "tags": ["a", "b"],
                "nested": {"inner": {"depth": 2}},
                "hops": [{"host": "a", "ms": 3}, {"host": "b", "ms": 9}],
            })))
            .build();

        let decoded = Event::decode(&event.encode()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_rejects_unknown_level() {
        let mut msg = proto::LogEvent::from(&Event::builder().build());
        msg.level = 42;
        let bytes = msg.encode_to_vec();

        assert!(matches!(Event::decode(&bytes), Err(Error::InvalidLevel(42))));
    }

    #[test]
    fn lossy_decode_falls_back_to_text() {
        let event = Event::from_bytes_lossy(b"plain text line\n");
        assert_eq!(event.level(), Level::Info);
        assert_eq!(event.message(), "plain text line");

        let event = Event::from_bytes_lossy(b"\xffbroken\r\n");
        assert_eq!(event.message(), "\u{fffd}broken");

        let original = Event::builder().message("wire").build();
        assert_eq!(Event::from_bytes_lossy(&original.encode()), original);
    }

    #[test]
    fn call_stack_only_when_requested() {
        let plain = Event::builder().build();
        assert!(!plain.metadata().contains_key(CALLSTACK_KEY));

        let traced = Event::builder().with_call_stack(true).build();
        let frames = traced.metadata()[CALLSTACK_KEY].as_array().unwrap();
        assert!(!frames.is_empty());
    }

    #[test]
    fn parse_backtrace_filters_runtime_frames() {
        let trace = "   0: std::backtrace::Backtrace::force_capture\n             at /rustc/library/std/src/backtrace.rs:312:13\n   1: app::handler::run\n             at ./src/handler.rs:42:9\n   2: core::ops::function::FnOnce::call_once\n";

        let user = parse_backtrace(trace, false);
        assert_eq!(user.len(), 1);
        assert_eq!(user[0]["function"], "app::handler::run");
        assert_eq!(user[0]["file"], "./src/handler.rs");
        assert_eq!(user[0]["line"], 42);

        assert_eq!(parse_backtrace(trace, true).len(), 3);
    }
}
