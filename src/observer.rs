use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::trace;

use crate::{
    client::StatsdClient,
    naming::{NamingPolicy, Observation, ResponseOutcome, RouteKind},
};

/// A failed request, as opposed to a handler that chose to answer with an error
/// status. The observer records the status the fault was mapped to.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("request failed with {status}")]
pub struct Fault {
    status: StatusCode,
}

impl Fault {
    pub fn new(status: StatusCode) -> Self {
        Self { status }
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        let mut response = self.status.into_response();
        response.extensions_mut().insert(self);
        response
    }
}

pub fn outcome_of(response: &Response) -> ResponseOutcome {
    match response.extensions().get::<Fault>() {
        Some(fault) => ResponseOutcome::Fault(fault.status().as_u16()),
        None => ResponseOutcome::Status(response.status().as_u16()),
    }
}

/// Middleware state: where to send observations and how to name them.
#[derive(Clone)]
pub struct RequestObserver {
    client: StatsdClient,
    policy: NamingPolicy,
}

impl RequestObserver {
    pub fn new(client: StatsdClient, policy: NamingPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &NamingPolicy {
        &self.policy
    }

    pub fn record(
        &self,
        route: &RouteKind,
        method: &str,
        elapsed: Duration,
        outcome: ResponseOutcome,
    ) {
        let observation = Observation::new(route, method, elapsed, outcome);
        trace!(
            path = %observation.path,
            method = %observation.method,
            status = ?observation.status,
            elapsed_ms = observation.elapsed_millis(),
            "observed request"
        );
        self.policy.emit(&self.client, &observation);
    }
}

/// Records every request that passes through it and returns the response untouched.
///
/// Layer it with [Router::layer](axum::Router::layer) so it also sees requests
/// answered by the fallback:
///
/// ```ignore
/// let app = Router::new()
///     .route("/test/:param", get(handler))
///     .layer(axum::middleware::from_fn_with_state(observer, observe_request));
/// ```
pub async fn observe_request(
    State(observer): State<RequestObserver>,
    request: Request,
    next: Next,
) -> Response {
    let received = Instant::now();
    let method = request.method().as_str().to_owned();
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned());

    let response = next.run(request).await;

    let outcome = outcome_of(&response);
    let route = RouteKind::classify(&method, matched_path.as_deref(), outcome);
    observer.record(&route, &method, received.elapsed(), outcome);
    response
}

#[cfg(test)]
mod test {
    use axum::{
        body::Body,
        http::{Method, Request},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::metric::MetricKind;

    async fn ok() -> &'static str {
        "Success!"
    }

    async fn fail() -> Result<&'static str, Fault> {
        Err(Fault::internal())
    }

    async fn teapot() -> StatusCode {
        StatusCode::IM_A_TEAPOT
    }

    fn app(client: &StatsdClient) -> Router {
        let observer = RequestObserver::new(client.clone(), NamingPolicy::Tagged);
        Router::new()
            .route("/", get(ok).options(ok))
            .route("/err", get(fail))
            .route("/teapot", get(teapot))
            .route("/test/:param", get(ok))
            .layer(middleware::from_fn_with_state(observer, observe_request))
    }

    async fn send(app: Router, method: Method, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap()
    }

    #[test]
    fn test_outcome_of_fault_and_plain_response() {
        let response = Fault::new(StatusCode::BAD_GATEWAY).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(outcome_of(&response), ResponseOutcome::Fault(502));

        let response = StatusCode::NO_CONTENT.into_response();
        assert_eq!(outcome_of(&response), ResponseOutcome::Status(204));
    }

    #[tokio::test]
    async fn test_records_route_template() {
        let client = StatsdClient::mock();
        let response = send(app(&client), Method::GET, "/test/123").await;
        assert_eq!(response.status(), StatusCode::OK);

        let buffer = client.mock_buffer();
        assert_eq!(buffer.len(), 3);
        for emission in &buffer {
            assert!(emission.has_tag("path:/test/:param"));
            assert!(emission.has_tag("method:GET"));
            assert!(emission.has_tag("status:200"));
        }
    }

    #[tokio::test]
    async fn test_unmatched_paths_share_one_bucket() {
        let client = StatsdClient::mock();
        for uri in ["/wont/find/this", "/random/1", "/random/2"] {
            let response = send(app(&client), Method::GET, uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let buffer = client.mock_buffer();
        assert_eq!(buffer.len(), 9);
        assert!(buffer.iter().all(|e| e.has_tag("path:/{notFound*}")));
        assert_eq!(buffer[0].stat, "request.status.404");
    }

    #[tokio::test]
    async fn test_preflight_paths_are_cors() {
        let client = StatsdClient::mock();
        send(app(&client), Method::OPTIONS, "/").await;
        send(app(&client), Method::OPTIONS, "/unrouted").await;
        let buffer = client.mock_buffer();
        assert_eq!(buffer.len(), 6);
        assert!(buffer.iter().all(|e| e.has_tag("path:/{cors*}")));
        assert!(buffer.iter().all(|e| e.has_tag("method:OPTIONS")));
    }

    #[tokio::test]
    async fn test_undeclared_method_on_route_is_bucketed() {
        let client = StatsdClient::mock();
        let response = send(app(&client), Method::OPTIONS, "/test/123").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let response = send(app(&client), Method::POST, "/test/123").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let buffer = client.mock_buffer();
        assert_eq!(buffer.len(), 6);
        assert!(buffer[..3].iter().all(|e| e.has_tag("path:/{cors*}")));
        assert!(buffer[3..].iter().all(|e| e.has_tag("path:/{notFound*}")));
        assert_eq!(buffer[0].stat, "request.status.405");
        assert!(buffer.iter().all(|e| !e.has_tag("path:/test/:param")));
    }

    #[tokio::test]
    async fn test_fault_status_is_recorded_and_kept() {
        let client = StatsdClient::mock();
        let response = send(app(&client), Method::GET, "/err").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let buffer = client.mock_buffer();
        assert_eq!(buffer[0].stat, "request.status.500");
        assert_eq!(buffer[1].stat, "request.received");
        assert_eq!(buffer[2].kind, MetricKind::Histogram);
        assert!(buffer[2].has_tag("status:500"));
    }

    #[tokio::test]
    async fn test_error_status_without_fault() {
        let client = StatsdClient::mock();
        let response = send(app(&client), Method::GET, "/teapot").await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(client.mock_buffer()[0].stat, "request.status.418");
    }

    #[tokio::test]
    async fn test_response_body_untouched() {
        let client = StatsdClient::mock();
        let response = send(app(&client), Method::GET, "/").await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Success!");
    }
}
