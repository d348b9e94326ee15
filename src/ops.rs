//! Ops metric descriptors and the bridge that forwards [OpsSample]s to statsd.

use std::time::Duration;

use serde_json::Value;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, trace};

use crate::{
    client::StatsdClient,
    config::Settings,
    error::Result,
    sampler::{OpsSample, OpsSampler},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpsMetricKind {
    Gauge,
    Timing,
}

/// Maps a canonical stat name to a field of [OpsSample].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpsMetric {
    pub name: &'static str,
    /// JSON pointer into the serialized sample, e.g. `/osload/0`.
    pub field: &'static str,
    pub kind: OpsMetricKind,
}

impl OpsMetric {
    const fn gauge(name: &'static str, field: &'static str) -> Self {
        Self {
            name,
            field,
            kind: OpsMetricKind::Gauge,
        }
    }

    const fn timing(name: &'static str, field: &'static str) -> Self {
        Self {
            name,
            field,
            kind: OpsMetricKind::Timing,
        }
    }

    /// `None` when the sample has no numeric value at this metric's field.
    pub fn value(&self, sample: &Value) -> Option<f64> {
        sample.pointer(self.field).and_then(Value::as_f64)
    }

    pub fn emit(&self, client: &StatsdClient, value: f64) -> Result<()> {
        let no_tags: &[&str] = &[];
        match self.kind {
            OpsMetricKind::Gauge => client.gauge(self.name, value, no_tags),
            OpsMetricKind::Timing => client.timing(self.name, value, no_tags),
        }
    }
}

pub const OPS_METRICS: &[OpsMetric] = &[
    OpsMetric::gauge("os.load.1", "/osload/0"),
    OpsMetric::gauge("os.load.5", "/osload/1"),
    OpsMetric::gauge("os.load.15", "/osload/2"),
    OpsMetric::gauge("os.mem.total", "/osmem/total"),
    OpsMetric::gauge("os.mem.free", "/osmem/free"),
    OpsMetric::gauge("os.uptime", "/osup"),
    OpsMetric::gauge("proc.uptime", "/psup"),
    OpsMetric::gauge("proc.mem.rss", "/psmem/rss"),
    OpsMetric::gauge("proc.mem.virtual", "/psmem/virtual"),
    OpsMetric::timing("proc.delay", "/psdelay"),
];

pub fn lookup(name: &str) -> Option<&'static OpsMetric> {
    OPS_METRICS.iter().find(|metric| metric.name == name)
}

/// `None` enables the whole table in table order. Otherwise known names are kept
/// in the order given and unknown names are dropped.
pub fn resolve_metrics(enabled: Option<&[String]>) -> Vec<&'static OpsMetric> {
    match enabled {
        None => OPS_METRICS.iter().collect(),
        Some(names) => names
            .iter()
            .filter_map(|name| {
                let metric = lookup(name);
                if metric.is_none() {
                    debug!(%name, "ignoring unknown ops metric");
                }
                metric
            })
            .collect(),
    }
}

pub fn project(sample: &OpsSample, metrics: &[&'static OpsMetric], client: &StatsdClient) {
    match serde_json::to_value(sample) {
        Ok(data) => project_value(&data, metrics, client),
        Err(err) => debug!("Couldn't serialize ops sample, was: {err}"),
    }
}

/// Emits `metrics` in order. Fields missing from `data` are skipped.
pub fn project_value(data: &Value, metrics: &[&'static OpsMetric], client: &StatsdClient) {
    for metric in metrics {
        match metric.value(data) {
            Some(value) => {
                let _ = metric
                    .emit(client, value)
                    .map_err(|err| debug!("Got error emitting {}, was: {err}", metric.name));
            }
            None => trace!(metric = metric.name, field = metric.field, "ops sample has no value"),
        }
    }
}

/// Runs an [OpsSampler] and forwards each of its samples to the client.
pub struct OpsBridge {
    sampler: OpsSampler,
    forwarder: JoinHandle<()>,
    metrics: Vec<&'static OpsMetric>,
}

impl OpsBridge {
    /// Returns `None`, without sampling anything, when the interval is not positive
    /// or none of the configured metric names are known.
    /// Must be called from within a tokio runtime.
    pub fn start(settings: &Settings, client: &StatsdClient) -> Option<Self> {
        if settings.ops_interval_ms <= 0 {
            debug!(
                ops_interval_ms = settings.ops_interval_ms,
                "ops sampling disabled"
            );
            return None;
        }
        let metrics = resolve_metrics(settings.ops_metrics.as_deref());
        if metrics.is_empty() {
            debug!("no known ops metrics enabled, not sampling");
            return None;
        }

        let mut sampler = OpsSampler::new();
        let mut samples = sampler.subscribe();
        let forward_client = client.clone();
        let forward_metrics = metrics.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(sample) => project(&sample, &forward_metrics, &forward_client),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ops bridge fell behind the sampler")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let interval = Duration::from_millis(settings.ops_interval_ms as u64);
        sampler.start(interval);
        info!(
            ops_interval_ms = settings.ops_interval_ms,
            metrics = metrics.len(),
            "started ops sampling"
        );
        Some(Self {
            sampler,
            forwarder,
            metrics,
        })
    }

    pub fn metrics(&self) -> &[&'static OpsMetric] {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.sampler.is_running()
    }

    /// Stops the sampler, then the forwarder.
    pub fn stop(&mut self) {
        self.sampler.stop();
        self.forwarder.abort();
    }
}

impl Drop for OpsBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
