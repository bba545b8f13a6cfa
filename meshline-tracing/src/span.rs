use chrono::Utc;
use meshline_core::{AttributeValue, Attributes, SpanContext, SpanData, SpanEvent, SpanKind, SpanStatus};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::context::ContextKey;
use crate::error::TraceError;

/// Handle to a live span.
///
/// Cheap to clone; all clones refer to the same span. Mutators are only honored while the
/// span is active. Once it has ended they log an [`TraceError::InvalidSpanState`] warning and
/// return without effect.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

struct SpanInner {
    context: SpanContext,
    origin: ContextKey,
    data: Mutex<SpanData>,
}

impl Span {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: SpanKind,
        context: SpanContext,
        origin: ContextKey,
    ) -> Self {
        let data = SpanData::new(name, kind, context.clone());
        Self {
            inner: Arc::new(SpanInner {
                context,
                origin,
                data: Mutex::new(data),
            }),
        }
    }

    pub fn context(&self) -> &SpanContext {
        &self.inner.context
    }

    pub fn is_sampled(&self) -> bool {
        self.inner.context.sampled
    }

    pub(crate) fn origin(&self) -> ContextKey {
        self.inner.origin
    }

    pub fn is_ended(&self) -> bool {
        self.lock().is_ended()
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let mut data = self.lock();
        if data.is_ended() {
            self.reject("set_attribute");
            return;
        }
        data.attributes.insert(key.into(), value.into());
    }

    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) {
        let mut data = self.lock();
        if data.is_ended() {
            self.reject("add_event");
            return;
        }
        data.events.push(SpanEvent::new(name, attributes));
    }

    pub fn set_status(&self, status: SpanStatus) {
        let mut data = self.lock();
        if data.is_ended() {
            self.reject("set_status");
            return;
        }
        data.status = status;
    }

    /// Records `error` as an `exception` event and marks the span as failed.
    pub fn record_error(&self, error: &dyn fmt::Display) {
        let message = error.to_string();
        let mut attributes = Attributes::new();
        attributes.insert("exception.message".to_string(), AttributeValue::from(message.as_str()));
        self.add_event("exception", attributes);
        self.set_status(SpanStatus::error(message));
    }

    /// Copy of the span data as it is right now.
    pub fn snapshot(&self) -> SpanData {
        self.lock().clone()
    }

    /// Ends the span. Returns the frozen data the first time, `None` afterwards.
    pub(crate) fn finish(&self, status: Option<SpanStatus>) -> Option<SpanData> {
        let mut data = self.lock();
        if data.is_ended() {
            return None;
        }
        if let Some(status) = status {
            data.status = status;
        }
        data.end_time = Some(Utc::now());
        Some(data.clone())
    }

    fn reject(&self, operation: &'static str) {
        let error = TraceError::InvalidSpanState {
            span_id: self.inner.context.span_id,
            operation,
        };
        warn!(trace_id = %self.inner.context.trace_id, %error, "Ignoring operation on ended span");
    }

    fn lock(&self) -> MutexGuard<'_, SpanData> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.inner.context.trace_id)
            .field("span_id", &self.inner.context.span_id)
            .field("origin", &self.inner.origin)
            .finish()
    }
}
