//! Metric instrument factories for rushbuy.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("rushbuy")
}

/// Counter: attempts spawned by the scheduler.
/// Labels: `mode`.
pub fn attempts_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.attempts.dispatched")
        .with_description("Purchase attempts spawned")
        .build()
}

/// Counter: dispatch slots not filled.
/// Labels: `reason` ("no_account" | "in_flight" | "capacity" | "backoff").
pub fn attempts_skipped() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.attempts.skipped")
        .with_description("Dispatch slots skipped under backpressure")
        .build()
}

/// Counter: orders created.
pub fn orders_created() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.orders.created")
        .with_description("Orders successfully created")
        .build()
}

/// Counter: preflight calls that errored.
pub fn preflight_failures() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.preflight.failures")
        .with_description("Failed preflight calls")
        .build()
}

/// Counter: captcha solve calls.
/// Labels: `result` ("ok" | "error" | "cancelled").
pub fn captcha_solves() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.captcha.solves")
        .with_description("Slider challenge solve calls")
        .build()
}

/// Counter: browser pages discarded and rebuilt.
pub fn pages_discarded() -> Counter<u64> {
    meter()
        .u64_counter("rushbuy.captcha.pages.discarded")
        .with_description("Challenge pages discarded")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rushbuy.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub fn record_skip(reason: &'static str) {
    attempts_skipped().add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_duration(operation: &'static str, started: std::time::Instant) {
    operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}
