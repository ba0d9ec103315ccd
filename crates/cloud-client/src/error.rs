//! Cloud client errors

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when interacting with the cloud API
#[derive(Debug, Error)]
pub enum CloudError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cloud API returned an error
    #[error("cloud API error {status} {code}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Cloud error code
        code: String,
        /// Cloud error message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object does not exist (`NoSuchObject`)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Interface does not exist (`EniNotFound`)
    #[error("ENI not found: {0}")]
    EniNotFound(String),

    /// Cloud side throttled the request
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Waiting for a rate limiter slot exceeded the allowed time
    #[error("rate limiter wait for {operation} exceeded {waited:?}")]
    RateLimitTimeout {
        /// Operation being limited
        operation: String,
        /// Maximum time the caller was allowed to wait
        waited: Duration,
    },

    /// Rate limiter configuration could not be parsed
    #[error("invalid rate limiter configuration: {0}")]
    InvalidLimiterConfig(String),

    /// The endpoint or instance family does not offer the operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CloudError {
    /// Object or interface is gone on the cloud side
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::EniNotFound(_))
    }

    /// Cloud side rejected the call for exceeding its quota
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    /// Limiter gave up waiting for a slot
    pub fn is_rate_limit_timeout(&self) -> bool {
        matches!(self, Self::RateLimitTimeout { .. })
    }

    /// Endpoint does not implement the call
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Map a cloud error code into the matching variant
    pub fn from_api(status: u16, code: String, message: String) -> Self {
        match code.as_str() {
            "NoSuchObject" => Self::NotFound(message),
            "EniNotFound" | "Eni.NotFound" => Self::EniNotFound(message),
            "RequestLimitExceeded" | "TooManyRequests" => Self::Throttled(message),
            "UnsupportedOperation" | "OperationNotSupported" => Self::Unsupported(message),
            _ if status == 429 => Self::Throttled(message),
            _ if status == 501 => Self::Unsupported(message),
            _ if status == 404 => Self::NotFound(message),
            _ => Self::Api {
                status,
                code,
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_codes_map_to_variants() {
        assert!(CloudError::from_api(400, "NoSuchObject".into(), "eni-1".into()).is_not_found());
        assert!(CloudError::from_api(400, "EniNotFound".into(), "eni-1".into()).is_not_found());
        assert!(CloudError::from_api(429, String::new(), "slow down".into()).is_throttled());
        assert!(CloudError::from_api(404, String::new(), "gone".into()).is_not_found());
        assert!(CloudError::from_api(400, "UnsupportedOperation".into(), "hpc".into()).is_unsupported());
        assert!(CloudError::from_api(501, String::new(), "no route tables".into()).is_unsupported());

        let other = CloudError::from_api(500, "InternalError".into(), "boom".into());
        assert!(!other.is_not_found());
        assert_eq!(other.to_string(), "cloud API error 500 InternalError: boom");
    }
}
