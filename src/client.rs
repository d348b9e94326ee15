use std::{borrow::Cow, env, sync::Arc};

use dogstatsd::{Client, Options};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    config::ClientConfig,
    error::{Error, Result},
    metric::{Emission, MetricKind},
};

pub const STATSD_HOST_ENV: &str = "STATSD_HOST";
pub const STATSD_PORT_ENV: &str = "STATSD_PORT";
const DEFAULT_ORIGIN: &str = "0.0.0.0:0";
// Port 8125(UDP) is for metrics,
// port 8126(TCP) is for Datadog APM (tracing)

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "8125";

type Recorder = Arc<Mutex<Vec<Emission>>>;

enum Transport {
    Udp(Client),
    Mock(Recorder),
}

/// Fire-and-forget statsd client shared by the request observer, the ops bridge
/// and application handlers. Clones share one underlying socket.
#[derive(Clone)]
pub struct StatsdClient {
    /// `None` once the client has been closed.
    transport: Arc<RwLock<Option<Transport>>>,
    /// Outlives `close` so tests can inspect what was sent.
    recorder: Option<Recorder>,
}

pub(crate) fn get_default_tags() -> Vec<String> {
    let env = env::var("DD_ENV").map(|t| format!("env:{}", t));
    let version = env::var("DD_VERSION").map(|t| format!("version:{}", t));
    let service = env::var("DD_SERVICE").map(|t| format!("service:{}", t));
    let optional_tags = vec![env, version, service];
    optional_tags.into_iter().filter_map(|t| t.ok()).collect()
}

impl StatsdClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        if config.mock {
            return Ok(Self::mock());
        }
        let mut extra_default_tags = config.tags.clone();
        extra_default_tags.sort();

        let statsd_host = config
            .host
            .clone()
            .or_else(|| env::var(STATSD_HOST_ENV).ok())
            .unwrap_or(DEFAULT_HOST.to_string());
        let statsd_port = config
            .port
            .map(|port| port.to_string())
            .or_else(|| env::var(STATSD_PORT_ENV).ok())
            .unwrap_or(DEFAULT_PORT.to_string());
        let udp_target = format!("{}:{}", statsd_host, statsd_port);
        // dogstatsd puts its own '.' between namespace and stat
        let namespace = config.namespace.trim_end_matches('.').to_string();
        let mut default_tags = get_default_tags();
        default_tags.extend(extra_default_tags);
        debug!(%udp_target, %namespace, "creating statsd client");
        let options = Options {
            socket_path: None,
            batching_options: None,
            default_tags,
            from_addr: DEFAULT_ORIGIN.to_string(),
            to_addr: udp_target,
            namespace,
        };
        let client = Client::new(options)?;
        Ok(Self {
            transport: Arc::new(RwLock::new(Some(Transport::Udp(client)))),
            recorder: None,
        })
    }

    /// A client that records every call in memory instead of sending it.
    pub fn mock() -> Self {
        let recorder: Recorder = Arc::default();
        Self {
            transport: Arc::new(RwLock::new(Some(Transport::Mock(recorder.clone())))),
            recorder: Some(recorder),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.read().is_none()
    }

    /// Calls recorded so far, in call order. Always empty for a UDP client.
    pub fn mock_buffer(&self) -> Vec<Emission> {
        self.recorder
            .as_ref()
            .map(|recorder| recorder.lock().clone())
            .unwrap_or_default()
    }

    /// Drains the recorded calls.
    pub fn take_mock_buffer(&self) -> Vec<Emission> {
        self.recorder
            .as_ref()
            .map(|recorder| std::mem::take(&mut *recorder.lock()))
            .unwrap_or_default()
    }

    fn with_transport<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transport) -> Result<()>,
    {
        let transport = self.transport.read();
        match &*transport {
            Some(transport) => f(transport),
            None => Err(Error::Closed),
        }
    }

    pub fn increment<'a, I, S, T>(&self, stat: S, value: i64, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        self.with_transport(|transport| match transport {
            Transport::Udp(client) => Ok(client.count(stat, value, tags)?),
            Transport::Mock(recorder) => {
                let emission = Emission::new(MetricKind::Count, stat, value as f64, tags);
                recorder.lock().push(emission);
                Ok(())
            }
        })
    }

    pub fn gauge<'a, I, S, T>(&self, stat: S, value: f64, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        self.with_transport(|transport| match transport {
            Transport::Udp(client) => Ok(client.gauge(stat, value.to_string(), tags)?),
            Transport::Mock(recorder) => {
                recorder
                    .lock()
                    .push(Emission::new(MetricKind::Gauge, stat, value, tags));
                Ok(())
            }
        })
    }

    pub fn histogram<'a, I, S, T>(&self, stat: S, value: f64, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        self.with_transport(|transport| match transport {
            Transport::Udp(client) => Ok(client.histogram(stat, value.to_string(), tags)?),
            Transport::Mock(recorder) => {
                recorder
                    .lock()
                    .push(Emission::new(MetricKind::Histogram, stat, value, tags));
                Ok(())
            }
        })
    }

    /// statsd timings are whole milliseconds on the wire, so `milliseconds` is rounded.
    pub fn timing<'a, I, S, T>(&self, stat: S, milliseconds: f64, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        self.with_transport(|transport| match transport {
            Transport::Udp(client) => Ok(client.timing(stat, milliseconds.round() as i64, tags)?),
            Transport::Mock(recorder) => {
                recorder
                    .lock()
                    .push(Emission::new(MetricKind::Timing, stat, milliseconds, tags));
                Ok(())
            }
        })
    }

    /// Releases the socket for every clone of this client and then runs `callback`.
    /// Closing an already closed client only runs `callback`.
    pub fn close<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>),
    {
        let transport = self.transport.write().take();
        match transport {
            Some(_) => debug!("closed statsd client"),
            None => trace!("statsd client was already closed"),
        }
        drop(transport);
        callback(Ok(()))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use maplit::btreeset;

    use super::*;

    #[test]
    fn test_mock_records_in_call_order() {
        let client = StatsdClient::mock();
        let tags = btreeset! {"method:GET".to_string()};
        client.increment("request.received", 1, &tags).unwrap();
        client.gauge("proc.mem.rss", 1024.0, &[] as &[&str]).unwrap();
        client.histogram("request.response_time", 1.5, &tags).unwrap();
        client.timing("proc.delay", 0.4, &[] as &[&str]).unwrap();

        let buffer = client.mock_buffer();
        let kinds: Vec<MetricKind> = buffer.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MetricKind::Count,
                MetricKind::Gauge,
                MetricKind::Histogram,
                MetricKind::Timing
            ]
        );
        assert_eq!(buffer[0].stat, "request.received");
        assert_eq!(buffer[0].value, 1.0);
        assert_eq!(buffer[0].tags, vec!["method:GET"]);
        assert_eq!(buffer[3].value, 0.4);
    }

    #[test]
    fn test_clones_share_recorder() {
        let client = StatsdClient::mock();
        let other = client.clone();
        other.increment("custom.metric", 3, &[] as &[&str]).unwrap();
        assert_eq!(client.mock_buffer().len(), 1);
        assert_eq!(client.take_mock_buffer().len(), 1);
        assert!(other.mock_buffer().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let client = StatsdClient::mock();
        let calls = AtomicUsize::new(0);
        client.close(|result| {
            assert!(result.is_ok());
            calls.fetch_add(1, Ordering::SeqCst);
        });
        client.close(|result| {
            assert!(result.is_ok());
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(client.is_closed());
    }

    #[test]
    fn test_emit_after_close_fails() {
        let client = StatsdClient::mock();
        client.increment("before", 1, &[] as &[&str]).unwrap();
        client.clone().close(|_| {});
        let err = client.increment("after", 1, &[] as &[&str]).unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert_eq!(client.mock_buffer().len(), 1);
    }

    #[test]
    fn test_udp_client_from_config() {
        let config = ClientConfig {
            host: Some("127.0.0.1".into()),
            port: Some(8125),
            namespace: "tallyho.".into(),
            tags: vec!["team:edge".into()],
            mock: false,
        };
        let client = StatsdClient::new(&config).expect("Failed to instantiate client!");
        assert!(!client.is_mock());
        // UDP is connectionless, nothing has to be listening
        let _ = client.increment("tallyho.test.incr", 1, &["outcome:success"]);
        assert!(client.mock_buffer().is_empty());
        client.close(|result| assert!(result.is_ok()));
        assert!(client.is_closed());
    }
}
