//! Error types for the client core.

/// Boxed underlying cause carried by transport and decode failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The category of a [`NetworkError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request could not be built; nothing was sent.
    Build,
    /// Connection, timeout, cancellation or TLS handshake failure.
    Transport,
    /// The server answered with a status other than 200.
    HttpStatus,
    /// The server answered 200 but the body did not decode into the target type.
    DecodeFailure,
    /// The response could not be interpreted as an HTTP response.
    Unknown,
    /// Certificate loading or TLS configuration failed.
    Tls,
}

/// Errors produced by the client core.
///
/// Every variant is fully populated when it is constructed. Use the accessor
/// methods ([`kind`](Self::kind), [`code`](Self::code),
/// [`diagnostic_message`](Self::diagnostic_message),
/// [`raw_response`](Self::raw_response)) for a uniform view.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Malformed request, detected before any network activity.
    #[error("Failed to build request: {message}")]
    Build { message: String },

    /// Transport-level failure.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: BoxError,
    },

    /// Non-200 response.
    #[error("HTTP {status}")]
    HttpStatus {
        status: u16,
        diagnostic: String,
        raw_response: String,
    },

    /// 200 response whose body does not match the expected shape.
    #[error("Failed to decode response body: {source}")]
    Decode {
        status: u16,
        diagnostic: String,
        raw_response: String,
        #[source]
        source: serde_json::Error,
    },

    /// The transport result is not an interpretable HTTP response.
    #[error("Unknown error: {message}")]
    Unknown { message: String },

    /// TLS configuration or certificate loading failure.
    #[error("TLS error: {message}")]
    Tls { message: String },
}

impl NetworkError {
    /// Create a build error.
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    /// Wrap an underlying transport failure.
    pub fn transport(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Create a TLS configuration error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create an unknown-response error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Build { .. } => ErrorKind::Build,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Decode { .. } => ErrorKind::DecodeFailure,
            Self::Unknown { .. } => ErrorKind::Unknown,
            Self::Tls { .. } => ErrorKind::Tls,
        }
    }

    /// The HTTP status code as a string, for errors produced from a response.
    pub fn code(&self) -> Option<String> {
        self.status().map(|status| status.to_string())
    }

    /// The HTTP status code, for errors produced from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } | Self::Decode { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable diagnostics for operators.
    ///
    /// Response errors carry the endpoint, request body, status, token excerpt
    /// and failure reason. Other variants return their message.
    pub fn diagnostic_message(&self) -> &str {
        match self {
            Self::Build { message }
            | Self::Transport { message, .. }
            | Self::Unknown { message }
            | Self::Tls { message } => message,
            Self::HttpStatus { diagnostic, .. } | Self::Decode { diagnostic, .. } => diagnostic,
        }
    }

    /// The raw response body as text, for errors produced from a response.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { raw_response, .. } | Self::Decode { raw_response, .. } => {
                Some(raw_response)
            }
            _ => None,
        }
    }

    /// Check if the request timed out at the transport level.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "Request timed out".to_string()
        } else if err.is_connect() {
            format!("Connection error: {err}")
        } else if err.is_builder() {
            // Rejected by the transport before dispatch, still a build problem.
            return Self::build(err.to_string());
        } else {
            format!("HTTP request error: {err}")
        };
        Self::transport(message, err)
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> Self {
        Self::build(format!("Invalid URL: {err}"))
    }
}

impl From<http::header::InvalidHeaderName> for NetworkError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::build(format!("Invalid header: {err}"))
    }
}

impl From<http::header::InvalidHeaderValue> for NetworkError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::build(format!("Invalid header: {err}"))
    }
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accessors() {
        let err = NetworkError::HttpStatus {
            status: 401,
            diagnostic: "Reason: Unauthorized".to_string(),
            raw_response: "{\"error\":\"nope\"}".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::HttpStatus);
        assert_eq!(err.code().as_deref(), Some("401"));
        assert_eq!(err.raw_response(), Some("{\"error\":\"nope\"}"));
        assert!(err.diagnostic_message().contains("Unauthorized"));
    }

    #[test]
    fn test_build_error_has_no_code() {
        let err = NetworkError::build("empty URL");
        assert_eq!(err.kind(), ErrorKind::Build);
        assert!(err.code().is_none());
        assert!(err.raw_response().is_none());
        assert_eq!(err.diagnostic_message(), "empty URL");
    }

    #[test]
    fn test_transport_keeps_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = NetworkError::transport("Connection error", io);
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.source().is_some());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_url_parse_error_is_build() {
        let err: NetworkError = url::Url::parse("not a url").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Build);
    }
}
