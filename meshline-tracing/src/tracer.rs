//! Thread-parallel tracer.
//!
//! Each worker thread sees its own "current span". The only structure shared between threads
//! is the [`SpanStore`].

use meshline_core::{SamplingDecider, SpanContext, SpanKind, SpanStatus, TraceId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TracerConfig;
use crate::context::{ContextKey, ContextTable};
use crate::error::{TraceError, TraceResult};
use crate::span::Span;
use crate::store::SpanStore;

/// State shared by [`Tracer`] and [`AsyncTracer`](crate::AsyncTracer): configuration,
/// the current-span table and the span store.
#[derive(Debug)]
pub(crate) struct TracerCore {
    config: TracerConfig,
    store: Arc<SpanStore>,
    contexts: ContextTable,
}

impl TracerCore {
    pub(crate) fn new(config: TracerConfig, store: Arc<SpanStore>) -> TraceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            contexts: ContextTable::new(),
        })
    }

    pub(crate) fn store(&self) -> &Arc<SpanStore> {
        &self.store
    }

    pub(crate) fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub(crate) fn start(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
        key: ContextKey,
    ) -> Span {
        let context = match parent {
            Some(parent) => parent.child(),
            None => {
                let trace_id = TraceId::new();
                let sampled = SamplingDecider::decide(&trace_id, self.config.sampling_rate);
                SpanContext::root(trace_id, sampled)
            }
        };

        self.contexts.push(key, context.clone());
        let span = Span::new(name, kind, context, key);
        debug!(
            trace_id = %span.context().trace_id,
            span_id = %span.context().span_id,
            sampled = span.is_sampled(),
            "Span started"
        );
        span
    }

    pub(crate) fn end(&self, span: &Span, status: Option<SpanStatus>) {
        let Some(data) = span.finish(status) else {
            let error = TraceError::InvalidSpanState {
                span_id: span.context().span_id,
                operation: "end_span",
            };
            debug!(%error, "Span already ended");
            return;
        };

        self.contexts.remove(span.origin(), data.context.span_id);
        if data.context.sampled {
            self.store.record(data);
        }
    }

    pub(crate) fn current(&self, key: ContextKey) -> Option<SpanContext> {
        self.contexts.current(key)
    }

    pub(crate) fn release(&self, key: ContextKey) -> usize {
        self.contexts.release(key)
    }

    pub(crate) fn tracked_contexts(&self) -> usize {
        self.contexts.len()
    }
}

/// Ends its span when dropped unless the span already ended.
///
/// Used by the scoped helpers so that panics and cancellations still end the span.
pub(crate) struct EndOnDrop {
    pub(crate) core: Arc<TracerCore>,
    pub(crate) span: Span,
    pub(crate) abandoned_status: fn() -> Option<SpanStatus>,
    pub(crate) abandoned_event: &'static str,
}

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        if self.span.is_ended() {
            return;
        }
        self.span.add_event(self.abandoned_event, Default::default());
        self.core.end(&self.span, (self.abandoned_status)());
    }
}

/// Tracer for thread-parallel code. Cloning is cheap and clones share all state.
#[derive(Clone, Debug)]
pub struct Tracer {
    core: Arc<TracerCore>,
}

impl Tracer {
    /// Creates a tracer with its own span store sized from `config`.
    pub fn new(config: TracerConfig) -> TraceResult<Self> {
        let store = Arc::new(SpanStore::from_config(&config));
        Self::with_store(config, store)
    }

    /// Creates a tracer that records into an existing store.
    pub fn with_store(config: TracerConfig, store: Arc<SpanStore>) -> TraceResult<Self> {
        Ok(Self {
            core: Arc::new(TracerCore::new(config, store)?),
        })
    }

    fn key() -> ContextKey {
        ContextKey::Thread(std::thread::current().id())
    }

    pub fn config(&self) -> &TracerConfig {
        self.core.config()
    }

    pub fn store(&self) -> &Arc<SpanStore> {
        self.core.store()
    }

    /// Starts a span and makes it current for the calling thread.
    ///
    /// With a `parent` the span joins the parent's trace; without one it roots a new trace.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        self.core.start(name, kind, parent, Self::key())
    }

    /// Starts a span parented on the calling thread's current span, if any.
    pub fn start_child(&self, name: impl Into<String>, kind: SpanKind) -> Span {
        let parent = self.current_context();
        self.start_span(name, kind, parent.as_ref())
    }

    /// Ends `span`. Calling it again is a no-op.
    pub fn end_span(&self, span: &Span, status: Option<SpanStatus>) {
        self.core.end(span, status);
    }

    /// Context of the calling thread's innermost open span.
    pub fn current_context(&self) -> Option<SpanContext> {
        self.core.current(Self::key())
    }

    /// Runs `f` inside a child of the current span and ends the span on every exit path.
    ///
    /// An `Err` marks the span as failed and records the message as an `exception` event.
    /// A panic inside `f` ends the span with an error status before unwinding further.
    pub fn in_span<T, E, F>(&self, name: impl Into<String>, kind: SpanKind, f: F) -> Result<T, E>
    where
        F: FnOnce(&Span) -> Result<T, E>,
        E: fmt::Display,
    {
        let span = self.start_child(name, kind);
        let guard = EndOnDrop {
            core: Arc::clone(&self.core),
            span: span.clone(),
            abandoned_status: || Some(SpanStatus::error("panicked")),
            abandoned_event: "panic",
        };

        let result = f(&span);
        if let Err(error) = &result {
            span.record_error(error);
        }
        self.core.end(&span, None);
        drop(guard);
        result
    }

    /// Forgets the calling thread's open spans. Returns how many were still open.
    ///
    /// Entries are otherwise removed only when a thread's last span ends, so worker threads
    /// that may exit with spans left open should call this before they finish. The spans
    /// themselves stay valid and can still be ended.
    pub fn release_current_thread(&self) -> usize {
        let released = self.core.release(Self::key());
        if released > 0 {
            warn!(spans = released, "Released open spans of an exiting thread");
        }
        released
    }

    /// Number of threads that currently have an open span.
    pub fn tracked_contexts(&self) -> usize {
        self.core.tracked_contexts()
    }
}
