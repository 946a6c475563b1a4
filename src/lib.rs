use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot manage Camel application of kind {0:?}")]
    UnsupportedKind(String),

    #[error("source workload {kind} {namespace}/{name} is missing")]
    SourceMissing {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod adapter;
pub mod api;
pub mod config;
pub mod events;
pub mod operator;
pub mod patch;
pub mod scrape;
pub mod sli;
pub mod synthetic;
pub mod telemetry;
