//! Bounded in-memory buffer of ended spans awaiting export.
//!
//! Spans are grouped per trace, traces are ordered by first arrival. When a span of a new
//! trace arrives and the buffer already holds `max_traces` traces, the oldest trace is evicted
//! before the new span is accepted. Every span is emitted at most once: spans handed to an
//! exporter successfully (or returned by [`SpanStore::export`]) are never emitted again.
//! While a flush is delivering a document its spans are held in flight, out of reach of
//! [`SpanStore::export`], and only return to pending when the exporter reports failure.

use chrono::{DateTime, Utc};
use meshline_core::{Attributes, SpanData, SpanEvent, SpanId, SpanKind, SpanStatus, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::config::TracerConfig;
use crate::error::TraceResult;
use crate::export::SpanExporter;

/// Export document for one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDocument {
    pub trace_id: TraceId,
    pub spans: Vec<ExportedSpan>,
}

impl TraceDocument {
    pub fn to_json(&self) -> TraceResult<String> {
        serde_json::to_string(self).map_err(|e| meshline_core::CoreError::from(e).into())
    }
}

/// One span inside a [`TraceDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedSpan {
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub kind: SpanKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
}

impl From<&SpanData> for ExportedSpan {
    fn from(span: &SpanData) -> Self {
        Self {
            span_id: span.context.span_id,
            parent_span_id: span.context.parent_span_id,
            kind: span.kind,
            name: span.name.clone(),
            start_time: span.start_time,
            end_time: span.end_time,
            attributes: span.attributes.clone(),
            events: span.events.clone(),
            status: span.status.clone(),
        }
    }
}

/// Counters describing the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub traces: usize,
    pub pending_spans: usize,
    pub exported_spans: u64,
    pub evicted_spans: u64,
    pub dropped_spans: u64,
}

/// Outcome of one [`SpanStore::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub exported_traces: usize,
    pub exported_spans: usize,
    pub failed_traces: usize,
}

#[derive(Debug, Default)]
struct TraceBuffer {
    pending: Vec<SpanData>,
    in_flight: Vec<SpanData>,
    exported: usize,
}

impl TraceBuffer {
    fn held(&self) -> usize {
        self.pending.len() + self.in_flight.len() + self.exported
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    traces: HashMap<TraceId, TraceBuffer>,
    order: VecDeque<TraceId>,
}

/// Thread-safe span buffer. One mutex guards all trace mutation; reads for export take it
/// only long enough to copy or take the pending spans.
#[derive(Debug)]
pub struct SpanStore {
    max_traces: usize,
    max_spans_per_trace: usize,
    inner: Mutex<StoreInner>,
    flush_lock: tokio::sync::Mutex<()>,
    exported: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
}

impl SpanStore {
    pub fn new(max_traces: usize, max_spans_per_trace: usize) -> Self {
        Self {
            max_traces: max_traces.max(1),
            max_spans_per_trace: max_spans_per_trace.max(1),
            inner: Mutex::new(StoreInner::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            exported: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &TracerConfig) -> Self {
        Self::new(config.max_traces, config.max_spans_per_trace)
    }

    /// Appends an ended span to its trace.
    pub fn record(&self, span: SpanData) {
        let trace_id = span.context.trace_id;
        let mut inner = self.lock();

        if !inner.traces.contains_key(&trace_id) {
            while inner.traces.len() >= self.max_traces {
                let Some(oldest) = inner.order.pop_front() else { break };
                if let Some(evicted) = inner.traces.remove(&oldest) {
                    let count = evicted.pending.len() as u64;
                    self.evicted.fetch_add(count, Ordering::Relaxed);
                    metrics::counter!("meshline_spans_evicted_total").increment(count);
                    if count > 0 {
                        warn!(trace_id = %oldest, spans = count, "Span store full, evicted oldest trace");
                    }
                }
            }
            inner.order.push_back(trace_id);
        }

        let buffer = inner.traces.entry(trace_id).or_default();
        if buffer.held() >= self.max_spans_per_trace {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("meshline_spans_dropped_total").increment(1);
            debug!(trace_id = %trace_id, "Trace reached max spans, dropping span");
            return;
        }
        buffer.pending.push(span);
    }

    /// Takes the not-yet-exported spans of `trace_id` as an export document.
    ///
    /// Returns `None` when the trace is unknown or has nothing pending. Spans a running flush
    /// is delivering are not pending.
    pub fn export(&self, trace_id: &TraceId) -> Option<TraceDocument> {
        let mut inner = self.lock();
        let buffer = inner.traces.get_mut(trace_id)?;
        if buffer.pending.is_empty() {
            return None;
        }

        let spans = std::mem::take(&mut buffer.pending);
        buffer.exported += spans.len();
        self.exported.fetch_add(spans.len() as u64, Ordering::Relaxed);

        Some(TraceDocument {
            trace_id: *trace_id,
            spans: spans.iter().map(ExportedSpan::from).collect(),
        })
    }

    /// Sends every trace with pending spans to `exporter`.
    ///
    /// Spans are marked exported only after the exporter accepted the document; a failed
    /// document goes back to pending for the next flush. Concurrent flushes are serialized.
    ///
    /// If a previous flush was cancelled while delivering, its in-flight spans may already
    /// have reached the exporter; they are discarded and counted as dropped.
    pub async fn flush(&self, exporter: &dyn SpanExporter) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        self.discard_abandoned();
        let mut report = FlushReport::default();

        for document in self.take_pending_documents() {
            match exporter.export(&document).await {
                Ok(()) => {
                    let committed = self.commit(&document);
                    report.exported_traces += 1;
                    report.exported_spans += committed;
                }
                Err(error) => {
                    self.restore(&document);
                    report.failed_traces += 1;
                    metrics::counter!("meshline_export_failures_total").increment(1);
                    warn!(
                        trace_id = %document.trace_id,
                        exporter = exporter.name(),
                        %error,
                        "Export failed, spans retained for next flush"
                    );
                }
            }
        }

        report
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            traces: inner.traces.len(),
            pending_spans: inner
                .traces
                .values()
                .map(|b| b.pending.len() + b.in_flight.len())
                .sum(),
            exported_spans: self.exported.load(Ordering::Relaxed),
            evicted_spans: self.evicted.load(Ordering::Relaxed),
            dropped_spans: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Trace ids currently buffered, oldest first.
    pub fn trace_ids(&self) -> Vec<TraceId> {
        self.lock().order.iter().copied().collect()
    }

    /// Moves every trace's pending spans in flight and builds their documents.
    fn take_pending_documents(&self) -> Vec<TraceDocument> {
        let mut inner = self.lock();
        let StoreInner { traces, order } = &mut *inner;
        order
            .iter()
            .filter_map(|trace_id| {
                let buffer = traces.get_mut(trace_id)?;
                if buffer.pending.is_empty() {
                    return None;
                }
                buffer.in_flight = std::mem::take(&mut buffer.pending);
                Some(TraceDocument {
                    trace_id: *trace_id,
                    spans: buffer.in_flight.iter().map(ExportedSpan::from).collect(),
                })
            })
            .collect()
    }

    /// Marks the in-flight spans of `document` exported. Spans of a trace evicted during
    /// delivery still count, since the exporter took them.
    fn commit(&self, document: &TraceDocument) -> usize {
        let mut inner = self.lock();
        let committed = match inner.traces.get_mut(&document.trace_id) {
            Some(buffer) => {
                let committed = buffer.in_flight.len();
                buffer.in_flight.clear();
                buffer.exported += committed;
                committed
            }
            None => document.spans.len(),
        };
        self.exported.fetch_add(committed as u64, Ordering::Relaxed);
        committed
    }

    /// Puts the in-flight spans of a failed document back in front of anything recorded since.
    fn restore(&self, document: &TraceDocument) {
        let mut inner = self.lock();
        match inner.traces.get_mut(&document.trace_id) {
            Some(buffer) => {
                let mut restored = std::mem::take(&mut buffer.in_flight);
                restored.append(&mut buffer.pending);
                buffer.pending = restored;
            }
            None => {
                let count = document.spans.len() as u64;
                self.evicted.fetch_add(count, Ordering::Relaxed);
                metrics::counter!("meshline_spans_evicted_total").increment(count);
            }
        }
    }

    fn discard_abandoned(&self) {
        let mut inner = self.lock();
        let abandoned: usize = inner
            .traces
            .values_mut()
            .map(|buffer| std::mem::take(&mut buffer.in_flight).len())
            .sum();
        if abandoned > 0 {
            self.dropped.fetch_add(abandoned as u64, Ordering::Relaxed);
            metrics::counter!("meshline_spans_dropped_total").increment(abandoned as u64);
            warn!(spans = abandoned, "Discarding spans of an interrupted flush");
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
