//! Span exporters and the background flush loop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{TraceError, TraceResult};
use crate::store::{SpanStore, TraceDocument};

/// Destination for trace documents.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Delivers one trace document. An error leaves the spans pending in the store.
    async fn export(&self, document: &TraceDocument) -> TraceResult<()>;

    /// Returns the name of this exporter
    fn name(&self) -> &str;
}

/// Writes each trace document as a structured log event.
#[derive(Debug, Clone, Default)]
pub struct LogExporter;

#[async_trait]
impl SpanExporter for LogExporter {
    async fn export(&self, document: &TraceDocument) -> TraceResult<()> {
        let json = document.to_json()?;
        info!(
            target: "meshline::trace_export",
            trace_id = %document.trace_id,
            spans = document.spans.len(),
            document = %json,
            "trace exported"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// POSTs trace documents as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExporter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> TraceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TraceError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SpanExporter for HttpExporter {
    async fn export(&self, document: &TraceDocument) -> TraceResult<()> {
        self.client
            .post(&self.endpoint)
            .json(document)
            .send()
            .await?
            .error_for_status()?;

        debug!(trace_id = %document.trace_id, endpoint = %self.endpoint, "Trace posted");
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Flushes `store` into `exporter` every `interval` until `shutdown` flips to `true`,
/// then performs a final flush.
pub fn spawn_flush_loop(
    store: Arc<SpanStore>,
    exporter: Arc<dyn SpanExporter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = store.flush(exporter.as_ref()).await;
                    if report.exported_spans > 0 || report.failed_traces > 0 {
                        debug!(?report, "Flush cycle completed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let report = store.flush(exporter.as_ref()).await;
        info!(?report, "Final span flush completed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meshline_core::{SpanContext, SpanData, SpanKind, TraceId};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FlakyExporter {
        fail: AtomicBool,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl SpanExporter for FlakyExporter {
        async fn export(&self, document: &TraceDocument) -> TraceResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TraceError::Export("collector down".to_string()));
            }
            self.delivered.fetch_add(document.spans.len(), Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn ended(trace_id: TraceId) -> SpanData {
        let mut data = SpanData::new("op", SpanKind::Internal, SpanContext::root(trace_id, true));
        data.end_time = Some(Utc::now());
        data
    }

    #[tokio::test]
    async fn test_failed_export_is_retried_on_next_flush() {
        let store = SpanStore::new(8, 8);
        let exporter = FlakyExporter {
            fail: AtomicBool::new(true),
            delivered: AtomicUsize::new(0),
        };
        store.record(ended(TraceId::new()));

        let report = store.flush(&exporter).await;
        assert_eq!(report.failed_traces, 1);
        assert_eq!(store.stats().pending_spans, 1);

        exporter.fail.store(false, Ordering::SeqCst);
        let report = store.flush(&exporter).await;
        assert_eq!(report.exported_spans, 1);
        assert_eq!(store.stats().pending_spans, 0);

        // Nothing is re-emitted.
        let report = store.flush(&exporter).await;
        assert_eq!(report.exported_spans, 0);
        assert_eq!(exporter.delivered.load(Ordering::SeqCst), 1);
    }

    /// Exports directly from the store while a document is being delivered.
    struct ReentrantExporter {
        store: Arc<SpanStore>,
        emitted: AtomicUsize,
    }

    #[async_trait]
    impl SpanExporter for ReentrantExporter {
        async fn export(&self, document: &TraceDocument) -> TraceResult<()> {
            self.emitted.fetch_add(document.spans.len(), Ordering::SeqCst);
            if let Some(direct) = self.store.export(&document.trace_id) {
                self.emitted.fetch_add(direct.spans.len(), Ordering::SeqCst);
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "reentrant"
        }
    }

    #[tokio::test]
    async fn test_direct_export_during_flush_skips_spans_in_flight() {
        let store = Arc::new(SpanStore::new(8, 8));
        let trace_id = TraceId::new();
        store.record(ended(trace_id));
        let exporter = ReentrantExporter {
            store: Arc::clone(&store),
            emitted: AtomicUsize::new(0),
        };

        let report = store.flush(&exporter).await;

        assert_eq!(report.exported_spans, 1);
        assert_eq!(exporter.emitted.load(Ordering::SeqCst), 1);
        assert!(store.export(&trace_id).is_none());
        assert_eq!(store.stats().exported_spans, 1);
    }

    #[tokio::test]
    async fn test_failed_export_keeps_span_order() {
        let store = SpanStore::new(8, 8);
        let exporter = FlakyExporter {
            fail: AtomicBool::new(true),
            delivered: AtomicUsize::new(0),
        };
        let trace_id = TraceId::new();
        let mut first = ended(trace_id);
        first.name = "first".to_string();
        store.record(first);

        store.flush(&exporter).await;
        let mut second = ended(trace_id);
        second.name = "second".to_string();
        store.record(second);

        let document = store.export(&trace_id).unwrap();
        let names: Vec<_> = document.spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_log_exporter_accepts_documents() {
        let store = SpanStore::new(8, 8);
        store.record(ended(TraceId::new()));
        let report = store.flush(&LogExporter).await;
        assert_eq!(report.exported_traces, 1);
    }

    #[tokio::test]
    async fn test_http_exporter_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let exporter =
            HttpExporter::new(format!("{}/v1/traces", server.uri()), Duration::from_secs(2)).unwrap();
        let store = SpanStore::new(8, 8);
        store.record(ended(TraceId::new()));

        let report = store.flush(&exporter).await;
        assert_eq!(report.exported_spans, 1);
    }

    #[tokio::test]
    async fn test_http_exporter_server_error_keeps_spans() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let exporter = HttpExporter::new(server.uri(), Duration::from_secs(2)).unwrap();
        let store = SpanStore::new(8, 8);
        store.record(ended(TraceId::new()));

        let report = store.flush(&exporter).await;
        assert_eq!(report.failed_traces, 1);
        assert_eq!(store.stats().pending_spans, 1);
    }

    #[tokio::test]
    async fn test_flush_loop_final_flush_on_shutdown() {
        let store = Arc::new(SpanStore::new(8, 8));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_flush_loop(
            Arc::clone(&store),
            Arc::new(LogExporter),
            Duration::from_secs(3600),
            rx,
        );

        // Let the immediate first tick pass, then record and shut down.
        tokio::task::yield_now().await;
        store.record(ended(TraceId::new()));
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.stats().pending_spans, 0);
    }
}
