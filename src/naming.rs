//! Turns one completed request into stat names, tags and values.
//!
//! Unmatched URLs are collapsed into two fixed buckets so a scanner walking random
//! paths cannot create a new metric series per URL.

use std::time::Duration;

use maplit::btreeset;
use tracing::debug;

use crate::{
    client::StatsdClient,
    config::NamingConfig,
    metric::{tag, Tags},
};

pub const NOT_FOUND_PATH: &str = "/{notFound*}";
pub const CORS_PATH: &str = "/{cors*}";

pub const REQUEST_RECEIVED: &str = "request.received";
pub const REQUEST_RESPONSE_TIME: &str = "request.response_time";
const REQUEST_STATUS_PREFIX: &str = "request.status";

/// Status rendered into a templated name when the response exposed none.
const UNKNOWN_STATUS: &str = "unknown";

const METHOD_NOT_ALLOWED: u16 = 405;

/// Which route handled a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// A declared route, identified by its path template.
    Matched(String),
    /// Nothing matched, the fallback answered.
    NotFound,
    /// A CORS preflight, either unmatched or against the root route.
    Cors,
}

impl RouteKind {
    /// A plain 405 from a matched path means the path exists but declares no handler
    /// for the method, so the request is bucketed as if nothing had matched.
    pub fn classify(method: &str, matched_path: Option<&str>, outcome: ResponseOutcome) -> Self {
        let is_options = method.eq_ignore_ascii_case("OPTIONS");
        let method_not_routed = outcome == ResponseOutcome::Status(METHOD_NOT_ALLOWED);
        match matched_path {
            None if is_options => RouteKind::Cors,
            None => RouteKind::NotFound,
            Some(_) if method_not_routed && is_options => RouteKind::Cors,
            Some(_) if method_not_routed => RouteKind::NotFound,
            Some("/") if is_options => RouteKind::Cors,
            Some(path) => RouteKind::Matched(path.to_string()),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            RouteKind::Matched(path) => path,
            RouteKind::NotFound => NOT_FOUND_PATH,
            RouteKind::Cors => CORS_PATH,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// A regular response and its status.
    Status(u16),
    /// A fault and the status it was mapped to on output.
    Fault(u16),
    /// The response exposed no status.
    Unknown,
}

impl ResponseOutcome {
    pub fn status_code(&self) -> Option<u16> {
        match *self {
            ResponseOutcome::Status(code) | ResponseOutcome::Fault(code) => Some(code),
            ResponseOutcome::Unknown => None,
        }
    }
}

/// Everything recorded about one request. Never outlives the request.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub path: String,
    /// Always upper case.
    pub method: String,
    pub elapsed: Duration,
    pub status: Option<u16>,
}

impl Observation {
    pub fn new(route: &RouteKind, method: &str, elapsed: Duration, outcome: ResponseOutcome) -> Self {
        Self {
            path: route.path().to_string(),
            method: method.to_ascii_uppercase(),
            elapsed,
            status: outcome.status_code(),
        }
    }

    pub fn elapsed_millis(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / 1_000_000.0
    }

    pub fn tags(&self) -> Tags {
        let mut tags = btreeset! {
            tag("path", &self.path),
            tag("method", &self.method),
        };
        if let Some(code) = self.status {
            tags.insert(tag("status", code));
        }
        tags
    }
}

/// Builds composite stat names such as `test_{param}.GET.200`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatTemplate {
    separator: String,
    template: String,
}

impl StatTemplate {
    pub fn new(separator: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            template: template.into(),
        }
    }

    /// `/a/b` becomes `a_b` with the default separator; `/` becomes empty.
    pub fn normalize_path(&self, path: &str) -> String {
        path.trim_start_matches('/').replace('/', &self.separator)
    }

    pub fn render(&self, observation: &Observation) -> String {
        let path = self.normalize_path(&observation.path);
        let status = observation
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
        let name = substitute(&self.template, |key| match key {
            "path" => Some(path.as_str()),
            "method" => Some(observation.method.as_str()),
            "statusCode" => Some(status.as_str()),
            _ => None,
        });
        if path.is_empty() {
            self.trim_leading_separators(&name).to_string()
        } else {
            name
        }
    }

    fn trim_leading_separators<'n>(&self, mut name: &'n str) -> &'n str {
        loop {
            if let Some(rest) = name.strip_prefix('.') {
                name = rest;
            } else if let Some(rest) = name
                .strip_prefix(self.separator.as_str())
                .filter(|_| !self.separator.is_empty())
            {
                name = rest;
            } else {
                return name;
            }
        }
    }
}

/// Single pass over `template`; substituted values are never expanded again.
/// Unknown placeholders are kept verbatim.
fn substitute<'v, F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'v str>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match lookup(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// How an [Observation] is turned into statsd calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamingPolicy {
    Tagged,
    Templated(StatTemplate),
}

impl From<&NamingConfig> for NamingPolicy {
    fn from(config: &NamingConfig) -> Self {
        match config {
            NamingConfig::Tagged => NamingPolicy::Tagged,
            NamingConfig::Templated {
                separator,
                template,
            } => NamingPolicy::Templated(StatTemplate::new(separator.as_str(), template.as_str())),
        }
    }
}

impl NamingPolicy {
    /// Emits every call for one request. Failures are logged, never returned.
    pub fn emit(&self, client: &StatsdClient, observation: &Observation) {
        let elapsed = observation.elapsed_millis();
        match self {
            NamingPolicy::Tagged => {
                let tags = observation.tags();
                if let Some(code) = observation.status {
                    let status_stat = format!("{REQUEST_STATUS_PREFIX}.{code}");
                    let _ = client
                        .increment(status_stat, 1, &tags)
                        .map_err(|err| debug!("Got error emitting request status, was: {err}"));
                    let _ = client
                        .increment(REQUEST_RECEIVED, 1, &tags)
                        .map_err(|err| debug!("Got error emitting request count, was: {err}"));
                }
                let _ = client
                    .histogram(REQUEST_RESPONSE_TIME, elapsed, &tags)
                    .map_err(|err| debug!("Got error emitting response time, was: {err}"));
            }
            NamingPolicy::Templated(template) => {
                let name = template.render(observation);
                let no_tags: &[&str] = &[];
                if observation.status.is_some() {
                    let _ = client
                        .increment(name.as_str(), 1, no_tags)
                        .map_err(|err| debug!("Got error emitting {name}, was: {err}"));
                }
                let _ = client
                    .timing(name.as_str(), elapsed, no_tags)
                    .map_err(|err| debug!("Got error emitting {name}, was: {err}"));
            }
        }
    }
}
