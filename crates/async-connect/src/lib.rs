//! Application-facing HTTP client core.
//!
//! - [`RequestBuilder`] turns a method, path, parameters, headers and an API
//!   version into a [`RequestDescriptor`].
//! - [`ApiClient`] executes descriptors over a TLS transport guarded by a
//!   [`CertificatePinningValidator`], and hands the responses to
//!   [`ResponseProcessor`].
//! - Multipart uploads report progress through a [`ProgressTracker`].
//!
//! Failures of every stage are reported as a [`NetworkError`] carrying a
//! status code, a diagnostic block and the raw response where available.
//!
//! ```ignore
//! use async_connect::{ApiClient, PinningMode, PinnedCertificates};
//!
//! let client = ApiClient::builder("https://api.example.com")
//!     .pinning(PinningMode::Enabled(PinnedCertificates::from_file("api.der")?))
//!     .default_header("Authorization", format!("Bearer {}", token))
//!     .build()?;
//!
//! let user: User = client.send(client.get("/users/42")).await?;
//! ```

mod error;
pub mod http;
pub mod tls;

pub use error::{BoxError, ErrorKind, NetworkError, Result};

pub use http::{
    ApiClient, ApiClientBuilder, ClientConfig, HttpMethod, MultipartBody, MultipartField,
    ParameterEncoding, ProgressCallback, ProgressTracker, RawResponse, RequestBuilder,
    RequestDescriptor, ResponseProcessor, TaskId,
};
pub use tls::{
    Certificate, CertificatePinningValidator, Challenge, PinRejection, PinnedCertificates,
    PinningMode, ServerTrust, TlsConfig, TrustDecision,
};
