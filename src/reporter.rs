use std::{future::Future, sync::Arc};

use axum::{middleware, Extension, Router};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    client::StatsdClient,
    config::Settings,
    error::Result,
    naming::NamingPolicy,
    observer::{observe_request, RequestObserver},
    ops::OpsBridge,
};

/// Owns the statsd client for a server, observes its requests and, when
/// enabled, forwards periodic ops samples.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    settings: Settings,
    client: StatsdClient,
    observer: RequestObserver,
    ops: Mutex<Option<OpsBridge>>,
}

impl Reporter {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let client = StatsdClient::new(&settings.statsd)?;
        let observer = RequestObserver::new(client.clone(), NamingPolicy::from(&settings.naming));
        Ok(Self {
            inner: Arc::new(ReporterInner {
                settings,
                client,
                observer,
                ops: Mutex::new(None),
            }),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The client every observation goes through. Application code can emit
    /// its own metrics with it, or take it from handlers as
    /// `Extension<StatsdClient>` once the router is attached.
    pub fn client(&self) -> &StatsdClient {
        &self.inner.client
    }

    /// Observes every route (and the fallback) already added to `router`,
    /// exposes the client to handlers, and starts ops sampling when enabled.
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.start_ops();
        router
            .layer(middleware::from_fn_with_state(
                self.inner.observer.clone(),
                observe_request,
            ))
            .layer(Extension(self.inner.client.clone()))
    }

    fn start_ops(&self) {
        if self.inner.client.is_closed() {
            debug!("reporter is closed, not sampling ops");
            return;
        }
        let mut ops = self.inner.ops.lock();
        if ops.is_none() {
            *ops = OpsBridge::start(&self.inner.settings, &self.inner.client);
        }
    }

    /// Whether an ops sampler was started and has not been stopped.
    pub fn ops_active(&self) -> bool {
        self.inner.ops.lock().is_some()
    }

    /// Stops ops sampling first, then closes the client. Safe to call more than once.
    /// Attaching after this no longer starts ops sampling.
    pub fn close<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>),
    {
        if let Some(mut bridge) = self.inner.ops.lock().take() {
            bridge.stop();
            debug!("stopped ops bridge");
        }
        self.inner.client.close(callback);
    }

    /// Waits for `signal` and then closes. Hand it to
    /// `axum::serve(..).with_graceful_shutdown(..)` to close on server stop.
    pub async fn close_on<F>(self, signal: F)
    where
        F: Future<Output = ()> + Send,
    {
        signal.await;
        info!("server stopping, closing metrics reporter");
        self.close(|result| {
            if let Err(err) = result {
                debug!("Got error closing statsd client, was: {err}");
            }
        });
    }
}
