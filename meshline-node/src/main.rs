use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use meshline_core::{SpanKind, SpanStatus};
use meshline_mesh::resilience::timeout::middleware::request_timeout;
use meshline_mesh::{ConsulRegistry, HealthState, InMemoryRegistry, MeshIntegrator, Registry};
use meshline_tracing::propagation::extract;
use meshline_tracing::{spawn_flush_loop, AsyncTracer, HttpExporter, LogExporter, SpanExporter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod settings;

use settings::{ExporterKind, LogFormat, LoggingSettings, RegistryBackend, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_logging(&settings.logging)?;
    info!(service = %settings.service.name, "Starting meshline node");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    let backend: Arc<dyn Registry> = match settings.registry.backend {
        RegistryBackend::Memory => Arc::new(InMemoryRegistry::new()),
        RegistryBackend::Consul => Arc::new(
            ConsulRegistry::new(
                settings.registry.consul_url.clone(),
                settings.registry.consul_token.clone(),
            )?
            .with_check_interval(settings.check_interval()),
        ),
    };
    info!(backend = backend.name(), "Registry backend selected");

    let mesh = Arc::new(MeshIntegrator::new(backend, settings.mesh_config())?);
    mesh.start(settings.descriptor())
        .await
        .context("failed to join the mesh")?;

    let tracer_config = settings.tracer_config();
    let tracer = AsyncTracer::new(tracer_config.clone())?;
    let exporter: Arc<dyn SpanExporter> = match settings.tracing.exporter {
        ExporterKind::Log => Arc::new(LogExporter),
        ExporterKind::Http => {
            let url = settings
                .tracing
                .collector_url
                .clone()
                .context("tracing.collector_url is required for the http exporter")?;
            Arc::new(HttpExporter::new(url, tracer_config.export_timeout)?)
        }
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_task = spawn_flush_loop(
        Arc::clone(tracer.store()),
        exporter,
        tracer_config.flush_interval,
        shutdown_rx,
    );

    let request_timeout_after = settings.request_timeout();
    let app = meshline_mesh::router(HealthState::new(mesh.subscribe_health()))
        .merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(prometheus),
        )
        .layer(middleware::from_fn(move |request, next| {
            request_timeout(request, next, request_timeout_after)
        }))
        .layer(middleware::from_fn_with_state(tracer.clone(), trace_requests))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if let Err(error) = mesh.shutdown().await {
        warn!(%error, "Failed to leave the mesh cleanly");
    }
    let _ = shutdown_tx.send(true);
    if let Err(error) = flush_task.await {
        warn!(%error, "Span flush task failed");
    }
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingSettings) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)),
    };

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

/// Opens a server span per request, continuing a caller's trace when one is propagated.
async fn trace_requests(State(tracer): State<AsyncTracer>, request: Request, next: Next) -> Response {
    let parent = extract(request.headers());
    let name = format!("{} {}", request.method(), request.uri().path());

    let scoped = tracer.clone();
    tracer
        .scope(async move {
            let span = scoped.start_span(name, SpanKind::Server, parent.as_ref());
            let response = next.run(request).await;

            let status = response.status();
            span.set_attribute("http.status_code", i64::from(status.as_u16()));
            let outcome = if status.is_server_error() {
                SpanStatus::error(status.to_string())
            } else {
                SpanStatus::ok()
            };
            scoped.end_span(&span, Some(outcome));
            response
        })
        .await
}

/// GET /metrics
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
