use actix_web::{HttpResponse, Responder};
use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntGauge, TextEncoder};

lazy_static! {
    pub static ref HUB_METHOD_DURATION_SECONDS: HistogramVec = prometheus::register_histogram_vec!(
        "hub_method_duration_seconds",
        "Hub call latency per method",
        &["method", "outcome"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("hub_method_duration_seconds registers once");

    pub static ref HUB_CONNECTIONS_ACTIVE: IntGauge = prometheus::register_int_gauge!(
        "hub_connections_active",
        "Open realtime connections"
    )
    .expect("hub_connections_active registers once");
}

pub fn observe_hub_call(method: &str, outcome: &str, seconds: f64) {
    HUB_METHOD_DURATION_SECONDS
        .with_label_values(&[method, outcome])
        .observe(seconds);
}

/// Prometheus text exposition of the default registry.
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
