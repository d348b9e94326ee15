//! tallyho reports request and process metrics from axum servers to a Datadog statsd agent.
//! Attach a [Reporter] to your router and every request emits a status count, a request
//! count and a response time. With ops sampling enabled, load averages, memory figures,
//! uptimes and scheduler delay are sent as gauges and timings on a fixed interval.
//!
//! ### Example: attaching a [Reporter] to an axum server
//!
//! ```rust,ignore
//! use axum::{routing::get, Router};
//! use tallyho::*;
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let settings = config::load_from_file("tallyho.yaml").expect("Failed to load settings!");
//!     let reporter = Reporter::new(settings).expect("Failed to instantiate reporter!");
//!     let app = reporter.attach(
//!         Router::new()
//!             .route("/", get(|| async { "Success!" }))
//!             .route("/test/:param", get(|| async { "Success!" })),
//!     );
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app)
//!         .with_graceful_shutdown(reporter.clone().close_on(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         }))
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! # Usage
//!
//! ## Request metrics
//!
//! With the default tagged naming, each request produces:
//!
//! * `request.status.<code>`, a count of 1
//! * `request.received`, a count of 1
//! * `request.response_time`, a histogram of milliseconds
//!
//! All three carry the same `path:`, `method:` and `status:` tags. The path is the route
//! template (`/test/:param`), never the concrete URL. Requests nothing matched are
//! recorded under `/{notFound*}` and CORS preflights under `/{cors*}`, so scanners can't
//! blow up your tag cardinality. When a response exposes no status, only the response
//! time is sent.
//!
//! Templated naming folds everything into the stat name instead. With the default
//! template `{path}.{method}.{statusCode}` a `GET /test/123` answered by `/test/:param`
//! is counted and timed as `test_:param.GET.200`.
//!
//! Handlers that fail should return [Fault](observer::Fault) so the recorded status is the
//! one the failure maps to.
//!
//! ## Ops metrics
//!
//! `ops_interval_ms` controls sampling, `0` turns it off. `ops_metrics` picks which
//! names from [OPS_METRICS](ops::OPS_METRICS) are sent; unknown names are ignored and if
//! nothing known is left no sampler is started at all.
//!
//! ## Custom metrics
//!
//! The reporter's [StatsdClient] is added to every route as an `Extension`, so handlers
//! can send their own metrics over the same socket.
//!

/// [StatsdClient] sends to the statsd agent, or records calls in memory when mocked.
pub mod client;
/// [Settings](config::Settings) and YAML loading.
pub mod config;
pub mod error;
/// [Emission](metric::Emission) and [MetricKind](metric::MetricKind) describe calls made on the client.
pub mod metric;
/// Route bucketing and the tagged and templated naming policies.
pub mod naming;
/// The request observer middleware.
pub mod observer;
/// The ops metric table and the bridge from samples to the client.
pub mod ops;
/// [Reporter] ties the client, the observer and ops sampling to one server.
pub mod reporter;
pub mod sampler;

pub use client::StatsdClient;
pub use config::{NamingConfig, Settings};
pub use error::{Error, Result};
pub use observer::Fault;
pub use reporter::Reporter;
