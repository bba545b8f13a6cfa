//! Tracer for cooperative tasks.
//!
//! Tasks migrate between worker threads, so the current span cannot be keyed by thread.
//! [`AsyncTracer::scope`] installs a task-local key instead; every span started inside the
//! scope is tracked under that key, and the key's table entry is released when the scope
//! future completes or is dropped.

use meshline_core::{SpanContext, SpanKind, SpanStatus};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::TracerConfig;
use crate::context::ContextKey;
use crate::error::TraceResult;
use crate::span::Span;
use crate::store::SpanStore;
use crate::tracer::{EndOnDrop, TracerCore};

tokio::task_local! {
    static TASK_KEY: u64;
}

static NEXT_TASK_KEY: AtomicU64 = AtomicU64::new(1);

struct ReleaseOnDrop {
    core: Arc<TracerCore>,
    key: ContextKey,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let open = self.core.release(self.key);
        if open > 0 {
            debug!(key = ?self.key, open, "Task scope closed with spans still open");
        }
    }
}

/// Tracer for async code. Cloning is cheap and clones share all state.
#[derive(Clone, Debug)]
pub struct AsyncTracer {
    core: Arc<TracerCore>,
}

impl AsyncTracer {
    pub fn new(config: TracerConfig) -> TraceResult<Self> {
        let store = Arc::new(SpanStore::from_config(&config));
        Self::with_store(config, store)
    }

    pub fn with_store(config: TracerConfig, store: Arc<SpanStore>) -> TraceResult<Self> {
        Ok(Self {
            core: Arc::new(TracerCore::new(config, store)?),
        })
    }

    fn key() -> ContextKey {
        TASK_KEY
            .try_with(|key| ContextKey::Task(*key))
            .unwrap_or(ContextKey::Detached)
    }

    /// Whether the caller runs inside a [`scope`](Self::scope).
    pub fn in_scope() -> bool {
        TASK_KEY.try_with(|_| ()).is_ok()
    }

    pub fn config(&self) -> &TracerConfig {
        self.core.config()
    }

    pub fn store(&self) -> &Arc<SpanStore> {
        self.core.store()
    }

    /// Runs `fut` as a new logical task with its own current-span stack.
    ///
    /// The stack is released when the returned future completes, fails or is dropped.
    pub fn scope<F>(&self, fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let core = Arc::clone(&self.core);
        let key = NEXT_TASK_KEY.fetch_add(1, Ordering::Relaxed);
        async move {
            let _release = ReleaseOnDrop {
                core,
                key: ContextKey::Task(key),
            };
            TASK_KEY.scope(key, fut).await
        }
    }

    /// Spawns `fut` on the runtime inside a fresh scope.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.scope(fut))
    }

    /// Starts a span. Inside a scope it becomes the task's current span; outside one the
    /// span is detached and never current.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        self.core.start(name, kind, parent, Self::key())
    }

    pub fn start_child(&self, name: impl Into<String>, kind: SpanKind) -> Span {
        let parent = self.current_context();
        self.start_span(name, kind, parent.as_ref())
    }

    /// Ends `span`. Calling it again is a no-op.
    pub fn end_span(&self, span: &Span, status: Option<SpanStatus>) {
        self.core.end(span, status);
    }

    pub fn current_context(&self) -> Option<SpanContext> {
        self.core.current(Self::key())
    }

    /// Runs the future produced by `f` inside a child of the current span.
    ///
    /// Opens a scope first when the caller is not inside one. If the returned future is
    /// dropped before completion the span ends with a `cancelled` event.
    pub async fn in_span<T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Span) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if Self::in_scope() {
            self.run_in_span(name.into(), kind, f).await
        } else {
            self.scope(self.run_in_span(name.into(), kind, f)).await
        }
    }

    async fn run_in_span<T, E, F, Fut>(&self, name: String, kind: SpanKind, f: F) -> Result<T, E>
    where
        F: FnOnce(Span) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let span = self.start_child(name, kind);
        let guard = EndOnDrop {
            core: Arc::clone(&self.core),
            span: span.clone(),
            abandoned_status: || Some(SpanStatus::error("cancelled")),
            abandoned_event: "cancelled",
        };

        let result = f(span.clone()).await;
        if let Err(error) = &result {
            span.record_error(error);
        }
        self.core.end(&span, None);
        drop(guard);
        result
    }

    /// Number of task scopes that currently have an open span.
    pub fn tracked_contexts(&self) -> usize {
        self.core.tracked_contexts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracer() -> AsyncTracer {
        AsyncTracer::new(TracerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_outside_scope_spans_are_detached() {
        let tracer = tracer();
        let span = tracer.start_span("detached", SpanKind::Internal, None);
        assert!(!AsyncTracer::in_scope());
        assert_eq!(tracer.current_context(), None);
        assert_eq!(tracer.tracked_contexts(), 0);

        tracer.end_span(&span, None);
        assert_eq!(tracer.store().stats().pending_spans, 1);
    }

    #[tokio::test]
    async fn test_scope_tracks_current_span() {
        let tracer = tracer();
        let inner = tracer.clone();
        tracer
            .scope(async move {
                let span = inner.start_span("root", SpanKind::Server, None);
                assert_eq!(inner.current_context(), Some(span.context().clone()));
                tokio::task::yield_now().await;

                let child = inner.start_child("child", SpanKind::Client);
                assert_eq!(child.context().parent_span_id, Some(span.context().span_id));
                inner.end_span(&child, None);
                inner.end_span(&span, None);
                assert_eq!(inner.current_context(), None);
            })
            .await;
        assert_eq!(tracer.tracked_contexts(), 0);
    }

    #[tokio::test]
    async fn test_scope_releases_unended_spans() {
        let tracer = tracer();
        let inner = tracer.clone();
        tracer
            .scope(async move {
                let _leaked = inner.start_span("never-ended", SpanKind::Internal, None);
                assert_eq!(inner.tracked_contexts(), 1);
            })
            .await;
        assert_eq!(tracer.tracked_contexts(), 0);
    }

    #[tokio::test]
    async fn test_in_span_records_error() {
        let tracer = tracer();
        let result: Result<(), String> = tracer
            .in_span("lookup", SpanKind::Client, |_| async { Err("not found".to_string()) })
            .await;
        assert!(result.is_err());

        let trace_id = tracer.store().trace_ids()[0];
        let document = tracer.store().export(&trace_id).unwrap();
        assert_eq!(document.spans[0].status.message.as_deref(), Some("not found"));
        assert_eq!(tracer.tracked_contexts(), 0);
    }

    #[tokio::test]
    async fn test_nested_in_span_shares_trace() {
        let tracer = tracer();
        let inner = tracer.clone();
        let (outer_ctx, inner_ctx) = tracer
            .in_span("outer", SpanKind::Server, |outer| async move {
                let inner_ctx = inner
                    .in_span("inner", SpanKind::Internal, |span| async move {
                        Ok::<_, String>(span.context().clone())
                    })
                    .await?;
                Ok::<_, String>((outer.context().clone(), inner_ctx))
            })
            .await
            .unwrap();

        assert_eq!(inner_ctx.trace_id, outer_ctx.trace_id);
        assert_eq!(inner_ctx.parent_span_id, Some(outer_ctx.span_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_span() {
        let tracer = tracer();
        let slow = tracer.in_span("slow", SpanKind::Client, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });

        let outcome = tokio::time::timeout(Duration::from_secs(1), slow).await;
        assert!(outcome.is_err());
        assert_eq!(tracer.tracked_contexts(), 0);

        let trace_id = tracer.store().trace_ids()[0];
        let document = tracer.store().export(&trace_id).unwrap();
        let span = &document.spans[0];
        assert!(span.end_time.is_some());
        assert!(span.events.iter().any(|e| e.name == "cancelled"));
    }
}
