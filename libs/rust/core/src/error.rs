//! Error taxonomy shared by the dataplane and both transports.

use thiserror::Error;

pub type Result<T, E = DataplaneError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataplaneError {
    #[error("Model with name {0} does not exist.")]
    ModelNotFound(String),
    #[error("Model with name {name} is not ready.{}", fmt_detail(.detail))]
    ModelNotReady { name: String, detail: Option<String> },
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    InferenceError(String),
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    Timeout(String),
    #[error("Model missing at path: {0}")]
    ModelMissing(String),
}

fn fmt_detail(detail: &Option<String>) -> String { detail.as_ref().map(|d| format!(" {d}")).unwrap_or_default() }

impl DataplaneError {
    pub fn not_ready(name: impl Into<String>) -> Self { Self::ModelNotReady { name: name.into(), detail: None } }

    /// Short variant name, used in log fields and in load failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "ModelNotFound",
            Self::ModelNotReady { .. } => "ModelNotReady",
            Self::InvalidInput(_) => "InvalidInput",
            Self::InferenceError(_) => "InferenceError",
            Self::UnsupportedProtocol(_) => "UnsupportedProtocol",
            Self::NotImplemented(_) => "NotImplemented",
            Self::Timeout(_) => "Timeout",
            Self::ModelMissing(_) => "ModelMissingError",
        }
    }

    /// HTTP status for the REST transport.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ModelNotFound(_) => 404,
            Self::ModelNotReady { .. } => 503,
            Self::InvalidInput(_) | Self::UnsupportedProtocol(_) => 400,
            Self::NotImplemented(_) => 501,
            Self::Timeout(_) => 504,
            Self::InferenceError(_) | Self::ModelMissing(_) => 500,
        }
    }

    /// Whether a client may retry the same request later.
    pub fn is_transient(&self) -> bool { matches!(self, Self::ModelNotReady { .. } | Self::Timeout(_)) }
}

impl From<dataplane_resilience::ResilienceError> for DataplaneError {
    fn from(e: dataplane_resilience::ResilienceError) -> Self { DataplaneError::InferenceError(e.to_string()) }
}

impl From<serde_json::Error> for DataplaneError {
    fn from(e: serde_json::Error) -> Self { DataplaneError::InvalidInput(format!("Unrecognized request format: {e}")) }
}
