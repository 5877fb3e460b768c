#![allow(clippy::expect_used)] // it is safe to unwrap static metrics

use std::iter::repeat;
use std::ops::Mul;

use clippy_utilities::NumericCast;
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

/// Returns a vector of time buckets for the reconcile duration histogram.
fn exponential_time_bucket(start: f64, factor: f64, count: usize) -> Vec<f64> {
    repeat(factor)
        .enumerate()
        .take(count)
        .map(|(i, f)| start.mul(f.powi(i.numeric_cast())))
        .collect::<Vec<_>>()
}

lazy_static! {
    /// The operator metrics registry
    pub(crate) static ref REGISTRY: Registry = Registry::new();
    /// Duration of one reconciliation tick
    pub(crate) static ref RECONCILE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "operator_reconcile_duration_seconds",
            "Duration of one reconciliation tick in seconds",
        )
        .buckets(exponential_time_bucket(0.1, 2.0, 10))
    )
    .expect("failed to create operator_reconcile_duration_seconds histogram");
    /// Number of failed reconciliation ticks, by error kind
    pub(crate) static ref RECONCILE_FAILED_COUNT: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "operator_reconcile_failed_count",
            "Number of failed times the reconciliation tick has run"
        ),
        &["reason"]
    )
    .expect("failed to create operator_reconcile_failed_count counter");
    /// Number of clusters this operator currently manages
    pub(crate) static ref MANAGED_CLUSTERS: IntGauge = IntGauge::new(
        "operator_managed_clusters",
        "Number of clusters this operator currently manages"
    )
    .expect("failed to create operator_managed_clusters gauge");
}

/// init metrics
pub(crate) fn init() {
    REGISTRY
        .register(Box::new(RECONCILE_DURATION.clone()))
        .expect("failed to register operator_reconcile_duration_seconds histogram");
    REGISTRY
        .register(Box::new(RECONCILE_FAILED_COUNT.clone()))
        .expect("failed to register operator_reconcile_failed_count counter");
    REGISTRY
        .register(Box::new(MANAGED_CLUSTERS.clone()))
        .expect("failed to register operator_managed_clusters gauge");
}
