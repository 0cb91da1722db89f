use std::sync::Arc;

use reqwest::StatusCode;

/// Boxed error returned by [`KeyValueStore`](crate::KeyValueStore) implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Represents a result type for operations in the Shinara SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Shinara SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The SDK is misconfigured: API key is missing or rejected, or the platform is not supported.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server could not be reached or refused to validate the code.
    #[error("failed to validate code")]
    ValidationFailed(#[source] TransportError),

    /// The server responded, but the response does not describe a usable code.
    #[error("code is not valid")]
    InvalidCode,

    /// The operation requires a referral code and none has been validated yet.
    #[error("no referral code stored, validate a code first")]
    NoReferralCode,

    /// The current platform requires a purchase token and none was provided.
    #[error("purchase token is required on this platform")]
    MissingToken,

    /// Reading from the key-value store failed.
    #[error("failed to read {key} from storage")]
    StorageRead {
        /// Storage key that was being read.
        key: &'static str,
        /// Underlying store error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Writing to the key-value store failed.
    #[error("failed to write {key} to storage")]
    StorageWrite {
        /// Storage key that was being written.
        key: &'static str,
        /// Underlying store error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Device descriptor could not be collected.
    #[error("failed to collect device info: {0}")]
    DeviceInfo(String),

    /// Request to the backend failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub(crate) fn storage_read(key: &'static str, source: StoreError) -> Error {
        Error::StorageRead {
            key,
            source: Arc::from(source),
        }
    }

    pub(crate) fn storage_write(key: &'static str, source: StoreError) -> Error {
        Error::StorageWrite {
            key,
            source: Arc::from(source),
        }
    }

    /// Returns `true` if the error carries an HTTP status returned by the server.
    pub fn is_http_status(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Http { .. })
                | Error::ValidationFailed(TransportError::Http { .. })
        )
    }
}

/// Failure of a single request to the backend.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// The server responded with a non-2xx status.
    #[error("HTTP error, status: {status}")]
    Http {
        /// Status code returned by the server.
        status: StatusCode,
    },

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// Response body is not valid JSON.
    #[error("failed to decode response body")]
    Decode(#[source] Arc<serde_json::Error>),
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => TransportError::Http { status },
            None => TransportError::Network(Arc::new(value.without_url())),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(value: serde_json::Error) -> Self {
        TransportError::Decode(Arc::new(value))
    }
}
