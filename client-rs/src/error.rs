//! Error types for tokenbus clients

use thiserror::Error;

/// Errors raised while setting up a client
///
/// Once running, clients report through `AuthError` and `DeliveryError`
/// like their in-process counterparts.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Building the HTTP client failed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = ClientError::Config("broker url must start with ws:// or wss://".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: broker url must start with ws:// or wss://"
        );
    }
}
