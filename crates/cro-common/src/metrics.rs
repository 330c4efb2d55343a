//! OpenTelemetry instruments for the reconcile loop and provider calls
//!
//! Instruments are no-ops until [`crate::telemetry::init_telemetry`] installs
//! a meter provider.

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("cloud-resource-operator"));

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `kind`: redis, blobstorage
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cro_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconcile passes
///
/// Labels:
/// - `kind`: redis, blobstorage
/// - `class`: configuration, external, invariant, cancelled, internal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cro_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of calls to external provider APIs
///
/// Labels:
/// - `provider`: provider name
/// - `operation`: API operation
/// - `result`: success, error
pub static PROVIDER_CALLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cro_provider_calls_total")
        .with_description("Total number of external provider API calls")
        .with_unit("{calls}")
        .build()
});

/// Record a finished reconcile pass
pub fn record_reconcile(kind: &str, elapsed: Duration, error_class: Option<&'static str>) {
    let result = if error_class.is_some() { "error" } else { "success" };
    RECONCILE_DURATION.record(
        elapsed.as_secs_f64(),
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", result),
        ],
    );
    if let Some(class) = error_class {
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("class", class),
            ],
        );
    }
}

/// Record one external API call
pub fn record_provider_call(provider: &str, operation: &'static str, success: bool) {
    PROVIDER_CALLS.add(
        1,
        &[
            KeyValue::new("provider", provider.to_string()),
            KeyValue::new("operation", operation),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}
