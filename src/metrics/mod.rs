//! Prometheus metrics for registrations and watches.
//!
//! Collectors are process-wide statics; [`gather`] renders them in the text
//! exposition format for whatever endpoint the embedding service exposes.

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;


pub(crate) const METRICS_NAMESPACE: &str = "kv_registry";

lazy_static! {
    pub static ref REGISTRATION_ATTEMPTS: IntCounter = IntCounter::new(
        "registration_attempts",
        "Number of registration attempts (grant, put, monitor)"
    )
    .expect("metric can not be created");

    pub static ref REGISTRATION_EXITS: IntCounterVec = IntCounterVec::new(
        Opts::new("registration_exits", "Registration attempt exits by reason"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_REGISTRATIONS: IntGauge = IntGauge::new(
        "active_registrations",
        "Registrations currently holding their key"
    )
    .expect("metric can not be created");

    pub static ref WATCH_DELIVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_deliveries", "Snapshots handed to watch handlers"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_RESTARTS: IntCounter = IntCounter::new(
        "watch_restarts",
        "Prefix watch sessions interrupted by a store failure"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new_custom(Some(METRICS_NAMESPACE.to_string()), None)
            .expect("registry can not be created");
        register_custom_metrics(&registry);
        registry
    };
}

pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(REGISTRATION_ATTEMPTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(REGISTRATION_EXITS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ACTIVE_REGISTRATIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_DELIVERIES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_RESTARTS.clone()))
        .expect("collector can be registered");
}

/// Renders every registry metric in the Prometheus text format.
pub fn gather() -> String {
    encode(&REGISTRY)
}

pub(crate) fn encode(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "could not encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
