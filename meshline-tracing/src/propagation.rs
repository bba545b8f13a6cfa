//! W3C trace context propagation (`traceparent` and `baggage` headers).

use http::header::{HeaderMap, HeaderName, HeaderValue};
use meshline_core::{Baggage, SpanContext, SpanId, TraceId};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{TraceError, TraceResult};

pub const TRACEPARENT: &str = "traceparent";
pub const BAGGAGE: &str = "baggage";

const VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

/// Carrier that trace context can be written into.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Carrier that trace context can be read from.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.insert(name, value);
        }
    }
}

impl Extractor for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        HeaderMap::get(self, key).and_then(|value| value.to_str().ok())
    }
}

/// Writes `context` into `carrier`.
pub fn inject(context: &SpanContext, carrier: &mut dyn Injector) {
    let flags = if context.sampled { FLAG_SAMPLED } else { 0 };
    carrier.set(
        TRACEPARENT,
        format!("{VERSION}-{}-{}-{flags:02x}", context.trace_id, context.span_id),
    );

    if !context.baggage.is_empty() {
        let baggage = context
            .baggage
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        carrier.set(BAGGAGE, baggage);
    }
}

/// Reads a remote parent context from `carrier`.
///
/// Returns `None` when `traceparent` is missing or malformed. The returned context carries the
/// caller's span id, so spans started with it as parent link to the remote span.
pub fn extract(carrier: &dyn Extractor) -> Option<SpanContext> {
    let header = carrier.get(TRACEPARENT)?;
    let mut context = match parse_traceparent(header) {
        Ok(context) => context,
        Err(error) => {
            debug!(%error, "Ignoring invalid traceparent header");
            return None;
        }
    };

    if let Some(baggage) = carrier.get(BAGGAGE) {
        context.baggage = parse_baggage(baggage);
    }
    Some(context)
}

/// Parses a `traceparent` header value (`version-traceid-spanid-flags`).
pub fn parse_traceparent(value: &str) -> TraceResult<SpanContext> {
    let invalid = |reason: &str| TraceError::InvalidTraceContext(format!("{value:?}: {reason}"));

    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() != 4 {
        return Err(invalid("expected 4 fields"));
    }
    if parts[0].len() != 2 || parts[0] == "ff" {
        return Err(invalid("unsupported version"));
    }
    if parts[1].len() != 32 || parts[2].len() != 16 || parts[3].len() != 2 {
        return Err(invalid("wrong field length"));
    }
    if parts.iter().any(|p| p.chars().any(|c| c.is_ascii_uppercase())) {
        return Err(invalid("hex must be lowercase"));
    }

    let trace_id = TraceId::from_hex(parts[1])?;
    let span_id = SpanId::from_hex(parts[2])?;
    let flags = u8::from_str_radix(parts[3], 16).map_err(|_| invalid("bad flags"))?;

    Ok(SpanContext {
        trace_id,
        span_id,
        parent_span_id: None,
        baggage: Baggage::new(),
        sampled: flags & FLAG_SAMPLED != 0,
    })
}

fn parse_baggage(value: &str) -> Baggage {
    value
        .split(',')
        .filter_map(|member| {
            // Member properties after ';' are not carried.
            let pair = member.split(';').next()?;
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
