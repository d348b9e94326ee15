use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, trace};

// Subscribers that fall further behind than this skip samples.
const SAMPLE_CHANNEL_CAPACITY: usize = 16;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// One periodic snapshot of OS and process figures.
/// Field names are the paths [OpsMetric](crate::ops::OpsMetric) descriptors address.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OpsSample {
    /// 1, 5 and 15 minute load averages.
    pub osload: [f64; 3],
    pub osmem: OsMemory,
    /// Host uptime in seconds.
    pub osup: f64,
    /// Process uptime in seconds.
    pub psup: f64,
    pub psmem: ProcessMemory,
    /// How long a yield to the runtime scheduler took, in milliseconds.
    pub psdelay: f64,
}

/// Bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct OsMemory {
    pub total: f64,
    pub free: f64,
}

/// Bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ProcessMemory {
    pub rss: f64,
    #[serde(rename = "virtual")]
    pub virt: f64,
}

struct Probe {
    system: System,
    pid: Option<Pid>,
}

impl Probe {
    fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|err| debug!("Couldn't resolve own pid, process figures will be zero: {err}"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }

    async fn sample(&mut self) -> OpsSample {
        let psdelay = scheduler_delay().await;
        self.system.refresh_memory();
        let load = System::load_average();
        let (psup, psmem) = self.process_figures().unwrap_or_default();
        OpsSample {
            osload: [load.one, load.five, load.fifteen],
            osmem: OsMemory {
                total: self.system.total_memory() as f64,
                free: self.system.free_memory() as f64,
            },
            osup: System::uptime() as f64,
            psup,
            psmem,
            psdelay,
        }
    }

    fn process_figures(&mut self) -> Option<(f64, ProcessMemory)> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            trace!(%pid, "process refresh found nothing");
        }
        let process = self.system.process(pid)?;
        let memory = ProcessMemory {
            rss: process.memory() as f64,
            virt: process.virtual_memory() as f64,
        };
        Some((process.run_time() as f64, memory))
    }
}

async fn scheduler_delay() -> f64 {
    let start = Instant::now();
    tokio::task::yield_now().await;
    start.elapsed().as_nanos() as f64 / 1_000_000.0
}

/// Periodically samples OS and process figures and broadcasts them to subscribers.
pub struct OpsSampler {
    sender: broadcast::Sender<Arc<OpsSample>>,
    task: Option<JoinHandle<()>>,
}

impl Default for OpsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsSampler {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self { sender, task: None }
    }

    /// Receives every sample published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OpsSample>> {
        self.sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// The first sample is published one `interval` after starting.
    /// Restarts the sampling task if it was already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, interval: Duration) {
        self.stop();
        let interval = interval.max(MIN_INTERVAL);
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            let mut probe = Probe::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sample = probe.sample().await;
                if sender.send(Arc::new(sample)).is_err() {
                    trace!("ops sample dropped, nobody is subscribed");
                }
            }
        });
        debug!(?interval, "started ops sampler");
        self.task = Some(task);
    }

    /// Samples already in flight to subscribers are not drained.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("stopped ops sampler");
        }
    }
}

impl Drop for OpsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sample_shape() {
        let sample = OpsSample {
            osload: [0.5, 0.25, 0.125],
            psmem: ProcessMemory {
                rss: 2048.0,
                virt: 4096.0,
            },
            ..Default::default()
        };
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value.pointer("/osload/1").and_then(|v| v.as_f64()), Some(0.25));
        assert_eq!(
            value.pointer("/psmem/virtual").and_then(|v| v.as_f64()),
            Some(4096.0)
        );
        assert_eq!(value.pointer("/psmem/rss").and_then(|v| v.as_f64()), Some(2048.0));
        assert!(value.pointer("/osmem/free").is_some());
        assert!(value.pointer("/psdelay").is_some());
    }

    #[tokio::test]
    async fn test_sampler_publishes_samples() {
        let mut sampler = OpsSampler::new();
        let mut samples = sampler.subscribe();
        assert!(!sampler.is_running());
        sampler.start(Duration::from_millis(10));
        assert!(sampler.is_running());

        let sample = tokio::time::timeout(Duration::from_secs(5), samples.recv())
            .await
            .expect("no sample within timeout")
            .expect("sampler channel closed");
        assert!(sample.psdelay >= 0.0);
        assert!(sample.osload.iter().all(|load| load.is_finite()));
        assert!(sample.psmem.rss >= 0.0);
        assert!(sample.osmem.total >= sample.osmem.free);

        sampler.stop();
        assert!(!sampler.is_running());
        // Stopping twice is harmless.
        sampler.stop();
    }

    #[tokio::test]
    async fn test_no_sample_before_first_interval() {
        let mut sampler = OpsSampler::new();
        let mut samples = sampler.subscribe();
        sampler.start(Duration::from_secs(60));
        let early = tokio::time::timeout(Duration::from_millis(50), samples.recv()).await;
        assert!(early.is_err());
        sampler.stop();
    }
}
