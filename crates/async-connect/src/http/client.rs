//! HTTP transport client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use serde::de::DeserializeOwned;

use super::multipart::{self, MultipartBody, MultipartField};
use super::progress::{ProgressCallback, ProgressTracker, TaskId};
use super::request::{RequestBuilder, RequestDescriptor, resolve_url};
use super::response::{RawResponse, ResponseProcessor};
use crate::error::{NetworkError, Result};
use crate::tls::{Certificate, PinnedCertificates, PinningMode, TlsConfig};

const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration for the API client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// User agent string.
    pub user_agent: Option<String>,
    /// API version appended to request paths when `has_version` is set.
    pub version: Option<String>,
    /// Whether the version is emitted as a trailing path segment.
    pub has_version: bool,
    /// Size of the chunks an upload body is streamed in.
    pub upload_chunk_size: usize,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl ClientConfig {
    /// Create a configuration with defaults for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            user_agent: Some(format!("AsyncConnect/{} (Rust)", env!("CARGO_PKG_VERSION"))),
            version: None,
            has_version: false,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            tls: TlsConfig::default(),
        }
    }
}

/// Builder for [`ApiClient`].
///
/// # Example
///
/// ```ignore
/// use async_connect::{ApiClient, PinnedCertificates, PinningMode};
///
/// let client = ApiClient::builder("https://api.example.com")
///     .version("v2")
///     .has_version(true)
///     .default_header("Accept-Language", "en")
///     .pin_certificate_file("/etc/app/api.der")?
///     .build()?;
/// ```
pub struct ApiClientBuilder {
    config: ClientConfig,
    default_headers: Vec<(String, String)>,
}

impl ApiClientBuilder {
    /// Create a new builder for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(base_url),
            default_headers: Vec::new(),
        }
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Disable request timeout.
    pub fn no_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Set the API version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = Some(version.into());
        self
    }

    /// Emit the API version as a trailing path segment.
    pub fn has_version(mut self, has_version: bool) -> Self {
        self.config.has_version = has_version;
        self
    }

    /// Add a header sent with every request. Per-request headers win.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Set the certificate pinning mode.
    pub fn pinning(mut self, mode: PinningMode) -> Self {
        self.config.tls.pinning = mode;
        self
    }

    /// Pin the certificate stored at `path`.
    ///
    /// Fails if the file cannot be read or holds no certificate.
    pub fn pin_certificate_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let pins = PinnedCertificates::from_file(path)?;
        Ok(self.pinning(PinningMode::Enabled(pins)))
    }

    /// Add a custom root certificate to trust.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.config.tls.root_certificates.push(cert);
        self
    }

    /// Use only the provided root certificates.
    pub fn tls_certs_only(mut self) -> Self {
        self.config.tls.use_only_custom_roots = true;
        self
    }

    /// Set the chunk size uploads are streamed in.
    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        self.config.upload_chunk_size = size.max(1);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<ApiClient> {
        // Fail on a malformed base URL now rather than on the first call
        resolve_url(&self.config.base_url, "")?;

        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = self.config.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(ref ua) = self.config.user_agent {
            builder = builder.user_agent(ua);
        }

        builder = builder.use_preconfigured_tls(self.config.tls.build_rustls_config()?);

        let client = builder.build()?;

        tracing::debug!(
            target: "async_connect::http",
            base_url = %self.config.base_url,
            pinning = matches!(self.config.tls.pinning, PinningMode::Enabled(_)),
            "Created API client"
        );

        Ok(ApiClient {
            inner: Arc::new(ApiClientInner {
                client,
                config: self.config,
                default_headers: self.default_headers,
                tracker: Arc::new(ProgressTracker::new()),
            }),
        })
    }
}

impl std::fmt::Debug for ApiClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Header values may carry credentials
        let header_names: Vec<&str> = self
            .default_headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        f.debug_struct("ApiClientBuilder")
            .field("config", &self.config)
            .field("default_headers", &header_names)
            .finish()
    }
}

struct ApiClientInner {
    client: reqwest::Client,
    config: ClientConfig,
    default_headers: Vec<(String, String)>,
    tracker: Arc<ProgressTracker>,
}

/// Client for a JSON API rooted at a base URL.
///
/// Cheap to clone; clones share the connection pool and the progress tracker.
///
/// ```ignore
/// let user: User = client.send(client.get("/users/42")).await?;
///
/// let created: Created = client
///     .send(client.post("/users").param("name", "A"))
///     .await?;
/// ```
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

impl ApiClient {
    /// Create a builder for a client rooted at `base_url`.
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Create a client with default configuration.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        ApiClientBuilder::new(base_url).build()
    }

    /// Get the client's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The progress tracker shared by this client's uploads.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.inner.tracker
    }

    /// GET request builder for `path`.
    pub fn get(&self, path: impl Into<String>) -> RequestBuilder {
        self.prefill(RequestBuilder::get(self.inner.config.base_url.clone(), path))
    }

    /// POST request builder for `path` with a JSON body.
    pub fn post(&self, path: impl Into<String>) -> RequestBuilder {
        self.prefill(RequestBuilder::post(self.inner.config.base_url.clone(), path))
    }

    /// POST request builder for `path` with query parameters.
    pub fn post_query(&self, path: impl Into<String>) -> RequestBuilder {
        self.prefill(RequestBuilder::post_query(
            self.inner.config.base_url.clone(),
            path,
        ))
    }

    fn prefill(&self, builder: RequestBuilder) -> RequestBuilder {
        let config = &self.inner.config;
        let mut builder = builder.has_version(config.has_version);
        if let Some(version) = &config.version {
            builder = builder.version(version.clone());
        }
        for (name, value) in &self.inner.default_headers {
            builder = builder.default_header(name.clone(), value.clone());
        }
        builder
    }

    /// Build and execute a request, decoding the response into `T`.
    pub async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.execute(&builder.build()?).await
    }

    /// Build and execute a request, returning the raw body.
    pub async fn send_raw(&self, builder: RequestBuilder) -> Result<RawResponse> {
        self.execute_raw(&builder.build()?).await
    }

    /// Upload `attachments` as a multipart POST.
    ///
    /// The builder's parameters become leading text fields.
    pub async fn send_multipart<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        attachments: Vec<MultipartField>,
        progress: Option<ProgressCallback>,
    ) -> Result<T> {
        let (request, mut fields) = builder.build_multipart()?;
        fields.extend(attachments);
        let body = multipart::encode(&fields);
        self.execute_upload(&request, body, progress).await
    }

    /// GET an absolute URL, returning the raw body.
    pub async fn get_raw(&self, url: impl Into<String>) -> Result<RawResponse> {
        let request = RequestBuilder::get(url, "").build()?;
        self.execute_raw(&request).await
    }

    /// Execute a request and decode the response into `T`.
    pub async fn execute<T: DeserializeOwned>(&self, request: &RequestDescriptor) -> Result<T> {
        let response = self.dispatch(request, request.body.clone().map(reqwest::Body::from)).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let endpoint = response.url().clone();
        let body = read_body(request, response).await?;
        ResponseProcessor.process_at(request, &endpoint, &body, status, &headers)
    }

    /// Execute a request without decoding.
    ///
    /// Fails with an `HttpStatus` error when the status is not 200.
    pub async fn execute_raw(&self, request: &RequestDescriptor) -> Result<RawResponse> {
        let response = self.dispatch(request, request.body.clone().map(reqwest::Body::from)).await?;
        let status = response.status().as_u16();
        let endpoint = response.url().clone();
        let body = read_body(request, response).await?;
        ResponseProcessor.process_raw_at(request, &endpoint, body, status)
    }

    /// Upload a multipart body, reporting progress to `progress`.
    ///
    /// The callback is registered before dispatch and removed when the call
    /// completes, fails or is dropped. An empty body produces no events.
    pub async fn execute_upload<T: DeserializeOwned>(
        &self,
        request: &RequestDescriptor,
        body: MultipartBody,
        progress: Option<ProgressCallback>,
    ) -> Result<T> {
        let task_id = TaskId::next();
        let _registration = progress.map(|callback| {
            self.inner.tracker.register(Some(task_id), callback);
            ProgressRegistration {
                tracker: &self.inner.tracker,
                task_id,
            }
        });

        let mut request = request.clone();
        let content_type = HeaderValue::try_from(body.content_type())?;
        request.headers.insert(CONTENT_TYPE, content_type);
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        request.body = None;

        let (bytes, _) = body.into_parts();
        let stream = progress_stream(
            bytes,
            self.inner.config.upload_chunk_size,
            self.inner.tracker.clone(),
            task_id,
        );

        tracing::debug!(
            target: "async_connect::http",
            task = task_id.get(),
            url = %request.url,
            "Starting upload"
        );

        let response = self
            .dispatch(&request, Some(reqwest::Body::wrap_stream(stream)))
            .await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let endpoint = response.url().clone();
        let body = read_body(&request, response).await?;
        ResponseProcessor.process_at(&request, &endpoint, &body, status, &headers)
    }

    async fn dispatch(
        &self,
        request: &RequestDescriptor,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response> {
        tracing::debug!(
            target: "async_connect::http",
            method = %request.method,
            url = %request.url,
            "Sending request"
        );

        let mut builder = self
            .inner
            .client
            .request(request.method.to_reqwest(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|e| {
            tracing::warn!(
                target: "async_connect::http",
                url = %request.url,
                error = %e,
                "Request failed"
            );
            transport_error(request, e)
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url)
            .field("has_version", &self.inner.config.has_version)
            .finish_non_exhaustive()
    }
}

/// Removes an upload's progress entry when dropped.
struct ProgressRegistration<'a> {
    tracker: &'a ProgressTracker,
    task_id: TaskId,
}

impl Drop for ProgressRegistration<'_> {
    fn drop(&mut self) {
        self.tracker.remove(Some(self.task_id));
    }
}

fn progress_stream(
    body: Bytes,
    chunk_size: usize,
    tracker: Arc<ProgressTracker>,
    task_id: TaskId,
) -> impl futures_util::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let expected = body.len();
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..expected)
        .step_by(chunk_size)
        .map(|start| body.slice(start..(start + chunk_size).min(expected)))
        .collect();

    let mut sent = 0usize;
    futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        if expected > 0 {
            tracker.update_progress(task_id, sent as f64 / expected as f64);
        }
        Ok(chunk)
    }))
}

async fn read_body(request: &RequestDescriptor, response: reqwest::Response) -> Result<Bytes> {
    response
        .bytes()
        .await
        .map_err(|e| transport_error(request, e))
}

fn transport_error(request: &RequestDescriptor, error: reqwest::Error) -> NetworkError {
    let what = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "could not connect"
    } else {
        "failed"
    };
    NetworkError::transport(format!("{} {} {}", request.method, request.url, what), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::HttpMethod;
    use futures_util::StreamExt;
    use parking_lot::Mutex;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("https://api.example.com/");
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert!(config.user_agent.as_deref().unwrap().starts_with("AsyncConnect/"));
        assert!(!config.has_version);
        assert_eq!(config.upload_chunk_size, 64 * 1024);
    }

    #[test]
    fn test_builder_rejects_bad_base_url() {
        let err = ApiClient::builder("not a url").build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Build);

        let err = ApiClient::builder("ftp://files.example.com").build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Build);
    }

    #[test]
    fn test_builder_debug_hides_header_values() {
        let builder = ApiClient::builder("https://api.example.com")
            .default_header("Authorization", "Bearer top-secret");
        let debug = format!("{:?}", builder);
        assert!(debug.contains("Authorization"));
        assert!(!debug.contains("top-secret"));

        let err = builder
            .pin_certificate_file("/nonexistent/pin.der")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Tls);
    }

    #[test]
    fn test_builder_rejects_missing_pin_file() {
        assert!(
            ApiClient::builder("https://api.example.com")
                .pin_certificate_file("/nonexistent/pin.der")
                .is_err()
        );
    }

    #[test]
    fn test_prefilled_builders() {
        let client = ApiClient::builder("https://api.example.com")
            .version("v2")
            .has_version(true)
            .default_header("X-Client", "tests")
            .build()
            .unwrap();

        let request = client
            .get("/users")
            .header("X-Client", "override")
            .build()
            .unwrap();
        assert_eq!(request.url.as_str(), "https://api.example.com/users/v2");
        assert_eq!(request.header("X-Client"), Some("override"));

        let request = client.post("/users").param("a", 1).build().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(request.header("X-Client"), Some("tests"));

        let request = client.post_query("/search").param("q", "x").build().unwrap();
        assert!(request.body.is_none());
        assert_eq!(request.url.query(), Some("q=x"));
    }

    #[tokio::test]
    async fn test_progress_stream_chunks_and_fractions() {
        let tracker = Arc::new(ProgressTracker::new());
        let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
        let sink = seen.clone();
        let task_id = TaskId::next();
        tracker.register(Some(task_id), Arc::new(move |f: f64| sink.lock().push(f)));

        let body = Bytes::from(vec![7u8; 1000]);
        let chunks: Vec<Bytes> = progress_stream(body, 300, tracker.clone(), task_id)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![300, 300, 300, 100]
        );
        assert_eq!(*seen.lock(), vec![0.3, 0.6, 0.9, 1.0]);
    }

    #[tokio::test]
    async fn test_progress_stream_empty_body_emits_nothing() {
        let tracker = Arc::new(ProgressTracker::new());
        let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
        let sink = seen.clone();
        let task_id = TaskId::next();
        tracker.register(Some(task_id), Arc::new(move |f: f64| sink.lock().push(f)));

        let chunks: Vec<_> = progress_stream(Bytes::new(), 16, tracker, task_id)
            .collect()
            .await;

        assert!(chunks.is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_registration_guard_removes_entry() {
        let tracker = ProgressTracker::new();
        let task_id = TaskId::next();
        tracker.register(Some(task_id), Arc::new(|_: f64| {}));
        {
            let _guard = ProgressRegistration {
                tracker: &tracker,
                task_id,
            };
            assert!(tracker.contains(task_id));
        }
        assert!(!tracker.contains(task_id));
    }
}
