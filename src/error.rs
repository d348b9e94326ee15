use dogstatsd::DogstatsdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("reading configuration failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("statsd client error: {0}")]
    Statsd(#[from] DogstatsdError),
    #[error("statsd client is closed")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
