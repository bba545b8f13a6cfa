//! Span lifecycle, current-span tracking and buffered export.
//!
//! [`Tracer`] serves thread-parallel code, [`AsyncTracer`] serves tokio tasks. Both record
//! ended, sampled spans into a shared [`SpanStore`], which exporters drain.

pub mod async_tracer;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod propagation;
pub mod span;
pub mod store;
pub mod tracer;

pub use async_tracer::AsyncTracer;
pub use config::{TracerConfig, TracerConfigBuilder};
pub use context::ContextKey;
pub use error::{TraceError, TraceResult};
pub use export::{spawn_flush_loop, HttpExporter, LogExporter, SpanExporter};
pub use span::Span;
pub use store::{ExportedSpan, FlushReport, SpanStore, StoreStats, TraceDocument};
pub use tracer::Tracer;
