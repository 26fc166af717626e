use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{SERVICE_NAME, SERVICE_VERSION},
    resource::DEPLOYMENT_ENVIRONMENT_NAME,
};
use rocket::{
    Data, Request, Response,
    fairing::{Fairing, Info, Kind},
};
use std::time::Instant;
use tonic::metadata::MetadataMap;
use tracing::{Span, debug, info_span, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const HONEYCOMB_ENDPOINT: &str = "https://api.honeycomb.io:443";

/// Opens one span per request and logs how it finished.
pub struct TelemetryFairing;

/// Kept in the request-local cache between `on_request` and `on_response`.
struct RequestSpan {
    span: Span,
    started: Instant,
}

#[rocket::async_trait]
impl Fairing for TelemetryFairing {
    fn info(&self) -> Info {
        Info {
            name: "Request tracing",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        let method = request.method().as_str();
        // Query strings carry filenames and subject ids, so only the path is recorded.
        let path = request.uri().path().to_string();

        let span = info_span!(
            "http_request",
            otel.name = %format!("{} {}", method, path),
            http.method = method,
            http.path = %path,
            http.client_ip = request.client_ip().map(|ip| ip.to_string()),
            http.status_code = tracing::field::Empty,
            http.duration_ms = tracing::field::Empty,
        );

        request.local_cache(|| RequestSpan {
            span,
            started: Instant::now(),
        });
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let RequestSpan { span, started } = request.local_cache(|| RequestSpan {
            span: info_span!("http_request"),
            started: Instant::now(),
        });

        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.record("http.status_code", status.code);
        span.record("http.duration_ms", elapsed_ms);

        let _entered = span.enter();
        if status.code >= 500 {
            warn!(status = status.code, elapsed_ms, "Request failed");
        } else {
            debug!(status = status.code, elapsed_ms, "Request completed");
        }
    }
}

fn resource() -> Resource {
    let environment =
        dotenvy::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());

    Resource::builder()
        .with_schema_url(
            [
                KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, environment),
            ],
            SCHEMA_URL,
        )
        .build()
}

/// Builds the OTLP exporter when an endpoint or a Honeycomb key is configured.
fn init_tracer_provider() -> Result<Option<SdkTracerProvider>, Box<dyn std::error::Error>> {
    let honeycomb_api_key = dotenvy::var("HONEYCOMB_API_KEY").ok();
    let endpoint = match (
        dotenvy::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        &honeycomb_api_key,
    ) {
        (Some(endpoint), _) => endpoint,
        (None, Some(_)) => HONEYCOMB_ENDPOINT.to_string(),
        (None, None) => return Ok(None),
    };

    let mut metadata = MetadataMap::new();
    if let Some(key) = honeycomb_api_key {
        metadata.insert("x-honeycomb-team", key.parse()?);
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
        .with_protocol(Protocol::Grpc)
        .with_metadata(metadata)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build();

    Ok(Some(tracer_provider))
}

/// Flushes and shuts down the exporter when dropped. Rocket keeps it as
/// managed state so spans are flushed when the server stops.
pub struct OtelGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

pub fn init_tracing() -> OtelGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let tracer_provider = match init_tracer_provider() {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialise OpenTelemetry exporter: {}", e);
            None
        }
    };

    let otel_layer = tracer_provider
        .as_ref()
        .map(|provider| OpenTelemetryLayer::new(provider.tracer("study-server")));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .try_init();

    if let Err(e) = result {
        eprintln!("Tracing subscriber already initialised: {}", e);
    }

    OtelGuard { tracer_provider }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("Failed to shut down tracer provider: {:?}", err);
            }
        }
    }
}
