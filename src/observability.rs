use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const SERVICE_NAME: &str = "token-ledger";

#[derive(Clone, Debug, Default)]
pub struct TracingOptions {
    pub json_logs: bool,
    pub otel: bool,
    pub otel_endpoint: Option<String>,
}

/// Keeps exporters alive; dropping it flushes pending spans.
#[derive(Debug, Default)]
pub struct TracingGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

pub fn init_tracing(options: &TracingOptions) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    if options.otel {
        return init_with_otel(options);
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .try_init()?;
    Ok(TracingGuard::default())
}

#[cfg(feature = "otel")]
fn init_with_otel(options: &TracingOptions) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;

    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = options.otel_endpoint.as_deref() {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(SERVICE_NAME)
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(SERVICE_NAME);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .with(otel_layer)
        .try_init()?;

    Ok(TracingGuard {
        provider: Some(provider),
    })
}

#[cfg(not(feature = "otel"))]
fn init_with_otel(_options: &TracingOptions) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    Err("otel export requires building with `--features otel`".into())
}
