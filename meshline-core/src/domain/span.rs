//! Span data model shared by the tracers, the span store and the export document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ids::{SpanId, TraceId};
use crate::error::CoreError;

/// Key/value context propagated from a parent span to all of its children.
pub type Baggage = BTreeMap<String, String>;

/// Attributes attached to a span or span event.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Immutable identity of a span plus the context it hands to its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baggage: Baggage,
    pub sampled: bool,
}

impl SpanContext {
    /// Creates the context of a root span.
    pub fn root(trace_id: TraceId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id: SpanId::new(),
            parent_span_id: None,
            baggage: Baggage::new(),
            sampled,
        }
    }

    /// Derives the context of a child span: same trace, baggage and sampling decision,
    /// parented on this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::new(),
            parent_span_id: Some(self.span_id),
            baggage: self.baggage.clone(),
            sampled: self.sampled,
        }
    }

    /// Returns a copy of this context carrying an extra baggage item.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl Default for SpanKind {
    fn default() -> Self {
        Self::Internal
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanKind::Internal => "internal",
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

/// Outcome of a span, with an optional human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SpanStatus {
    pub fn unset() -> Self {
        Self { code: StatusCode::Unset, message: None }
    }

    pub fn ok() -> Self {
        Self { code: StatusCode::Ok, message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code == StatusCode::Error
    }
}

impl Default for SpanStatus {
    fn default() -> Self {
        Self::unset()
    }
}

/// Attribute value restricted to the scalar types backends understand, plus
/// homogeneous lists of those scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Builds an array value, rejecting nested arrays and mixed element types.
    pub fn array(items: Vec<AttributeValue>) -> Result<Self, CoreError> {
        let mut kind = None;
        for item in &items {
            let item_kind = item.scalar_kind().ok_or_else(|| {
                CoreError::InvalidAttribute("nested arrays are not allowed".to_string())
            })?;
            match kind {
                None => kind = Some(item_kind),
                Some(k) if k != item_kind => {
                    return Err(CoreError::InvalidAttribute(format!(
                        "mixed array element types: {k} and {item_kind}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(AttributeValue::Array(items))
    }

    fn scalar_kind(&self) -> Option<&'static str> {
        match self {
            AttributeValue::Bool(_) => Some("bool"),
            AttributeValue::Int(_) => Some("int"),
            AttributeValue::Float(_) => Some("float"),
            AttributeValue::String(_) => Some("string"),
            AttributeValue::Array(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl TryFrom<serde_json::Value> for AttributeValue {
    type Error = CoreError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Bool(b) => Ok(AttributeValue::Bool(b)),
            Value::String(s) => Ok(AttributeValue::String(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(AttributeValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(AttributeValue::Float(f))
                } else {
                    Err(CoreError::InvalidAttribute(format!("unrepresentable number {n}")))
                }
            }
            Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Array(_) => Err(CoreError::InvalidAttribute(
                            "nested arrays are not allowed".to_string(),
                        )),
                        other => AttributeValue::try_from(other),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                AttributeValue::array(items)
            }
            Value::Null => Err(CoreError::InvalidAttribute("null is not an attribute value".to_string())),
            Value::Object(_) => Err(CoreError::InvalidAttribute(
                "objects are not attribute values".to_string(),
            )),
        }
    }
}

/// Timestamped annotation recorded on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            attributes,
        }
    }
}

/// Plain data of a span. Owned by a live span until it ends, then by the span store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub context: SpanContext,
    pub kind: SpanKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
}

impl SpanData {
    pub fn new(name: impl Into<String>, kind: SpanKind, context: SpanContext) -> Self {
        Self {
            context,
            kind,
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            attributes: Attributes::new(),
            events: Vec::new(),
            status: SpanStatus::unset(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
