use std::env;

use opentelemetry::sdk::trace::Tracer;
use opentelemetry_otlp::WithExportConfig;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, Registry};

fn get_otlp_tracer(api_key: &str) -> Tracer {
    let mut map = tonic::metadata::MetadataMap::with_capacity(2);

    map.insert("x-otlp-api-key", api_key.parse().unwrap());
    if let Ok(dataset) = env::var("OTLP_DATASET") {
        map.insert("x-otlp-dataset", dataset.parse().unwrap());
    }
    let endpoint =
        env::var("OTLP_ENDPOINT").unwrap_or_else(|_| "https://api.honeycomb.io".into());
    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_metadata(map);
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .install_simple()
        .unwrap()
}

/// Install the global subscriber: INFO filter, stdout fmt layer, and an
/// OTLP span exporter when `OTLP_API_KEY` is present.
pub fn init_tracing() {
    let registry = Registry::default()
        .with(LevelFilter::INFO)
        .with(tracing_subscriber::fmt::Layer::default());
    match env::var("OTLP_API_KEY") {
        Ok(key) => {
            let subscriber =
                registry.with(tracing_opentelemetry::layer().with_tracer(get_otlp_tracer(&key)));
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to install tracing subscriber.");
        }
        Err(_) => {
            tracing::subscriber::set_global_default(registry)
                .expect("Failed to install tracing subscriber.");
        }
    }
}
