use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to fetch manifest {url}: HTTP {status}")]
    ManifestFetch { url: String, status: u16 },

    #[error("failed to fetch manifest {url}: {source}")]
    ManifestRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("manifest {id} failed integrity check: expected {expected}, computed {actual}")]
    ManifestIntegrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    #[error("extension {extension} is not permitted to use {action}")]
    PermissionDenied { extension: String, action: String },

    #[error("handler for {action} failed: {message}")]
    Handler { action: String, message: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("extension {extension} was unloaded")]
    Unloaded { extension: String },

    #[error("request {action} to {extension} timed out")]
    Timeout { extension: String, action: String },

    #[error("extension {id} is not registered")]
    NotRegistered { id: String },

    #[error("sandbox error: {message}")]
    Sandbox { message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn permission_denied(extension: impl Into<String>, action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            extension: extension.into(),
            action: action.into(),
        }
    }

    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unloaded(extension: impl Into<String>) -> Self {
        Self::Unloaded {
            extension: extension.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl palisade_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

palisade_common::impl_context!();
