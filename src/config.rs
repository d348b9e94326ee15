//! Reporter settings, parsed strictly from YAML.
//!
//! Every field has a default so an empty document yields [Settings::default].

use std::fs;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "axum";
pub const DEFAULT_OPS_INTERVAL_MS: i64 = 1_000;
pub const DEFAULT_PATH_SEPARATOR: &str = "_";
pub const DEFAULT_NAME_TEMPLATE: &str = "{path}.{method}.{statusCode}";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub statsd: ClientConfig,

    /// Zero or negative disables ops sampling.
    #[serde(default = "default_ops_interval_ms")]
    pub ops_interval_ms: i64,

    /// `None` enables every known ops metric.
    #[serde(default)]
    pub ops_metrics: Option<Vec<String>>,

    #[serde(default)]
    pub naming: NamingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            statsd: ClientConfig::default(),
            ops_interval_ms: default_ops_interval_ms(),
            ops_metrics: None,
            naming: NamingConfig::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.naming.validate()
    }

    pub fn with_ops_interval_ms(mut self, ops_interval_ms: i64) -> Self {
        self.ops_interval_ms = ops_interval_ms;
        self
    }

    pub fn with_ops_metrics<I, S>(mut self, ops_metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ops_metrics = Some(ops_metrics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_naming(mut self, naming: NamingConfig) -> Self {
        self.naming = naming;
        self
    }

    /// Record emissions in memory instead of sending them.
    pub fn mocked(mut self) -> Self {
        self.statsd.mock = true;
        self
    }
}

/// Handed to [StatsdClient::new](crate::client::StatsdClient::new) as-is.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Falls back to `STATSD_HOST`, then `0.0.0.0`.
    #[serde(default)]
    pub host: Option<String>,
    /// Falls back to `STATSD_PORT`, then `8125`.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mock: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            namespace: default_namespace(),
            tags: Vec::new(),
            mock: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum NamingConfig {
    /// Stable stat names with `path`, `method` and `status` tags.
    #[default]
    Tagged,
    /// One composite stat name per request built from a template.
    Templated {
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default = "default_template")]
        template: String,
    },
}

impl NamingConfig {
    pub fn templated() -> Self {
        NamingConfig::Templated {
            separator: default_separator(),
            template: default_template(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            NamingConfig::Tagged => Ok(()),
            NamingConfig::Templated {
                separator,
                template,
            } => {
                if separator.is_empty() {
                    return Err(Error::Config(
                        "naming.separator must not be empty".into(),
                    ));
                }
                if template.trim().is_empty() {
                    return Err(Error::Config("naming.template must not be empty".into()));
                }
                Ok(())
            }
        }
    }
}

pub fn load_from_file(path: &str) -> Result<Settings> {
    let s = fs::read_to_string(path)?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<Settings> {
    // An empty document deserializes to unit, not to an empty mapping.
    let settings: Settings = if s.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(s)?
    };
    settings.validate()?;
    Ok(settings)
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}
fn default_ops_interval_ms() -> i64 {
    DEFAULT_OPS_INTERVAL_MS
}
fn default_separator() -> String {
    DEFAULT_PATH_SEPARATOR.into()
}
fn default_template() -> String {
    DEFAULT_NAME_TEMPLATE.into()
}
