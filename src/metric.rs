use std::{borrow::Cow, collections::BTreeSet};

use derive_more::Display;

/// Tags for one emission. A set keeps emissions for the same request byte-identical
/// regardless of the order tags were added in.
pub type Tags = BTreeSet<String>;

pub fn tag<V: std::fmt::Display>(key: &str, value: V) -> String {
    format!("{key}:{value}")
}

/// What kind of statsd call an emission was.
#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq)]
pub enum MetricKind {
    #[display("count")]
    Count,
    #[display("gauge")]
    Gauge,
    #[display("histogram")]
    Histogram,
    #[display("timing")]
    Timing,
}

/// A single call recorded by a mock [StatsdClient](crate::client::StatsdClient).
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    pub kind: MetricKind,
    /// Stat name as passed by the caller, without the client namespace.
    pub stat: String,
    pub value: f64,
    pub tags: Vec<String>,
}

impl Emission {
    pub(crate) fn new<'a, I, S, T>(kind: MetricKind, stat: S, value: f64, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        Self {
            kind,
            stat: stat.into().into_owned(),
            value,
            tags: tags.into_iter().map(|t| t.as_ref().to_string()).collect(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod test {
    use maplit::btreeset;

    use super::*;

    #[test]
    fn test_tag_format() {
        assert_eq!(tag("path", "/test/{param}"), "path:/test/{param}");
        assert_eq!(tag("status", 404), "status:404");
    }

    #[test]
    fn test_emission_keeps_tag_order() {
        let tags: Tags = btreeset! {tag("path", "/"), tag("method", "GET")};
        let emission = Emission::new(MetricKind::Count, "request.received", 1.0, &tags);
        assert_eq!(emission.tags, vec!["method:GET", "path:/"]);
        assert!(emission.has_tag("path:/"));
        assert!(!emission.has_tag("status:200"));
        assert_eq!(emission.kind.to_string(), "count");
    }
}
