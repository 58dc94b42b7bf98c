use thiserror::Error;

/// Unified error type for the rotating proxy client
#[derive(Error, Debug)]
pub enum RotaError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    // Connect errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Connect timed out")]
    ConnectTimeout,

    // Errors after the connection is established
    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Connection not available")]
    ConnectionNotAvailable,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type alias for Rota operations
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Whether the error happened while establishing a connection.
    ///
    /// These are the only failures a rotating connection recovers from by
    /// switching to another proxy.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            RotaError::ProxyConnectionFailed(_) | RotaError::ConnectTimeout
        )
    }

    /// Whether the error is a fatal configuration problem
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            RotaError::InvalidConfig(_)
                | RotaError::InvalidProxyAddress(_)
                | RotaError::UnsupportedProtocol(_)
                | RotaError::NoProxiesAvailable
                | RotaError::Tls(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RotaError {
    fn from(err: hyper::Error) -> Self {
        RotaError::Http(err.to_string())
    }
}

impl From<http::Error> for RotaError {
    fn from(err: http::Error) -> Self {
        RotaError::InvalidRequest(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotaError {
    fn from(err: url::ParseError) -> Self {
        RotaError::InvalidProxyAddress(err.to_string())
    }
}

impl From<rustls::Error> for RotaError {
    fn from(err: rustls::Error) -> Self {
        RotaError::Tls(err.to_string())
    }
}
