use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[cfg(feature = "gateway-otel")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "gateway-otel")]
use opentelemetry_otlp::WithExportConfig as _;

#[derive(Clone, Debug, Default)]
pub struct TracingOptions {
    pub json_logs: bool,
    /// Export spans over OTLP/HTTP. Only honoured with the `gateway-otel` feature.
    pub otel: bool,
    pub otel_endpoint: Option<String>,
}

/// Keeps exporters alive; flushes them when dropped.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "gateway-otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "gateway-otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`), plain or JSON
/// formatting, and optionally an OTLP span exporter.
pub fn init_tracing(
    service_name: &str,
    options: &TracingOptions,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if options.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    #[cfg(feature = "gateway-otel")]
    {
        let provider = if options.otel {
            Some(otel_provider(service_name, options.otel_endpoint.as_deref())?)
        } else {
            None
        };
        let otel_layer = provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
        Ok(TelemetryGuard { provider })
    }

    #[cfg(not(feature = "gateway-otel"))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
        if options.otel {
            tracing::warn!(service = service_name, "otel export requested but the gateway-otel feature is not enabled");
        }
        Ok(TelemetryGuard::default())
    }
}

#[cfg(feature = "gateway-otel")]
fn otel_provider(
    service_name: &str,
    endpoint: Option<&str>,
) -> Result<opentelemetry_sdk::trace::SdkTracerProvider, Box<dyn std::error::Error>> {
    let mut exporter = opentelemetry_otlp::SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
