use opentelemetry::trace::TraceId;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter, exemplar::HistogramWithExemplars, family::Family,
    },
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("provisioner");
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
        }
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub passes: Counter,
    pub failures: Family<FailureLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabels>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            passes: Counter::default(),
            failures: Family::<FailureLabels, Counter>::default(),
            duration: HistogramWithExemplars::new(
                [0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter(),
            ),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TraceLabels {
    pub trace_id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub kind: String,
    pub resource: String,
    pub error: String,
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile pass duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "records that ended a pass in error state",
            self.failures.clone(),
        );
        r.register("reconcile_passes", "reconcile passes", self.passes.clone());
        self
    }

    pub fn set_failure(&self, kind: &str, resource: &str, error: &str) {
        self.failures
            .get_or_create(&FailureLabels {
                kind: kind.to_string(),
                resource: resource.to_string(),
                error: error.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.passes.inc();

        ReconcileMeasurer {
            start: Instant::now(),
            labels: TraceLabels {
                trace_id: trace_id.to_string(),
            },
            metric: self.duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: TraceLabels,
    metric: HistogramWithExemplars<TraceLabels>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(
            duration,
            Some(self.labels.clone()),
            Some(std::time::SystemTime::now()),
        );
    }
}
