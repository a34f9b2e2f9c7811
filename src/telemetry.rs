use opentelemetry::trace::TraceId;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Trace id of the current span, for exemplars and log correlation.
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured log level. With the `telemetry` feature enabled spans are
/// also exported over OTLP.
pub async fn init(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    #[cfg(feature = "telemetry")]
    {
        use opentelemetry::trace::TracerProvider as _;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .expect("failed to build otlp span exporter");
        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());

        registry
            .with(
                tracing_opentelemetry::layer()
                    .with_tracer(provider.tracer("simple-database-provisioner")),
            )
            .init();
    }

    #[cfg(not(feature = "telemetry"))]
    registry.init();
}
