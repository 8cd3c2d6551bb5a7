//! Request construction.
//!
//! A [`RequestBuilder`] collects the typed description of a call and turns it
//! into an immutable [`RequestDescriptor`]. All validation happens in
//! [`RequestBuilder::build`], so a malformed request fails before any network
//! activity.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use super::multipart::{MultipartField, fields_from_map};
use crate::error::{NetworkError, Result};

/// HTTP request methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method.
    Post,
}

impl HttpMethod {
    /// Convert to reqwest method.
    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Where request parameters are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterEncoding {
    /// Serialized as URL query components.
    Query,
    /// Serialized as a JSON object in the request body.
    Json,
}

/// A fully formed request, ready to be handed to the transport.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    /// The HTTP method.
    pub method: HttpMethod,
    /// Absolute request URL, query included.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<Bytes>,
    /// API version the request was built for.
    pub api_version: Option<String>,
}

impl RequestDescriptor {
    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request body as text, or `"-"` when there is none.
    pub(crate) fn body_text(&self) -> String {
        match &self.body {
            Some(body) => String::from_utf8_lossy(body).into_owned(),
            None => "-".to_string(),
        }
    }
}

/// Builder for [`RequestDescriptor`]s.
///
/// ```ignore
/// let request = RequestBuilder::get("https://api.example.com", "/users")
///     .params(&Search { page: 2 })
///     .header("Authorization", "Bearer token")
///     .build()?;
/// ```
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    method: HttpMethod,
    encoding: ParameterEncoding,
    base_url: String,
    path: String,
    params: Option<std::result::Result<Map<String, Value>, String>>,
    default_headers: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    version: Option<String>,
    has_version: bool,
}

impl RequestBuilder {
    /// Create a new request builder.
    ///
    /// GET requests always use query encoding.
    pub fn new(
        method: HttpMethod,
        encoding: ParameterEncoding,
        base_url: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let encoding = match method {
            HttpMethod::Get => ParameterEncoding::Query,
            HttpMethod::Post => encoding,
        };
        Self {
            method,
            encoding,
            base_url: base_url.into(),
            path: path.into(),
            params: None,
            default_headers: Vec::new(),
            headers: Vec::new(),
            version: None,
            has_version: false,
        }
    }

    /// GET request with query parameters.
    pub fn get(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, ParameterEncoding::Query, base_url, path)
    }

    /// POST request with a JSON body.
    pub fn post(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, ParameterEncoding::Json, base_url, path)
    }

    /// POST request with query parameters and no body.
    pub fn post_query(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, ParameterEncoding::Query, base_url, path)
    }

    /// The request method.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Where parameters will be placed.
    pub fn encoding(&self) -> ParameterEncoding {
        self.encoding
    }

    /// Set the parameters from any value that serializes to a JSON object.
    ///
    /// Values that are not string-keyed maps are reported by [`build`](Self::build).
    pub fn params<P: Serialize + ?Sized>(mut self, params: &P) -> Self {
        let map = match serde_json::to_value(params) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(Value::Null) => Ok(Map::new()),
            Ok(other) => Err(format!(
                "parameters must serialize to a JSON object, got {}",
                json_type_name(&other)
            )),
            Err(e) => Err(format!("failed to serialize parameters: {}", e)),
        };
        self.params = Some(map);
        self
    }

    /// Add a single parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Ok(map) = self.params.get_or_insert_with(|| Ok(Map::new())) {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Add a header. Caller headers override defaults of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add multiple headers.
    pub fn headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add a default header, applied before caller headers.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Set the API version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether the version is emitted as a trailing path segment.
    pub fn has_version(mut self, has_version: bool) -> Self {
        self.has_version = has_version;
        self
    }

    /// Build the request descriptor.
    pub fn build(self) -> Result<RequestDescriptor> {
        let params = match self.params {
            Some(Ok(map)) => map,
            Some(Err(message)) => return Err(NetworkError::build(message)),
            None => Map::new(),
        };

        let mut url = resolve_url(&self.base_url, &self.path)?;

        let version = self.version.filter(|v| !v.is_empty());
        if self.has_version
            && let Some(version) = &version
        {
            url.path_segments_mut()
                .map_err(|()| NetworkError::build("URL cannot carry a path"))?
                .pop_if_empty()
                .push(version);
        }

        let mut headers = HeaderMap::new();
        let mut body = None;

        match self.encoding {
            ParameterEncoding::Query => {
                let pairs: Vec<(&String, String)> = params
                    .iter()
                    .filter_map(|(key, value)| query_value(value).map(|v| (key, v)))
                    .collect();
                if !pairs.is_empty() {
                    url.query_pairs_mut()
                        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                }
            }
            ParameterEncoding::Json => {
                let bytes = serde_json::to_vec(&params)
                    .map_err(|e| NetworkError::build(format!("failed to encode body: {}", e)))?;
                body = Some(Bytes::from(bytes));
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }

        for (name, value) in self.default_headers.iter().chain(self.headers.iter()) {
            let name = HeaderName::try_from(name.as_str())?;
            let value = HeaderValue::try_from(value.as_str())?;
            headers.insert(name, value);
        }

        Ok(RequestDescriptor {
            method: self.method,
            url,
            headers,
            body,
            api_version: version,
        })
    }
}

impl RequestBuilder {
    /// Build a POST descriptor without a body, turning the parameters into
    /// leading text fields of a multipart upload.
    pub(crate) fn build_multipart(mut self) -> Result<(RequestDescriptor, Vec<MultipartField>)> {
        let fields = match self.params.take() {
            Some(Ok(map)) => fields_from_map(map),
            Some(Err(message)) => return Err(NetworkError::build(message)),
            None => Vec::new(),
        };
        self.method = HttpMethod::Post;
        self.encoding = ParameterEncoding::Query;
        Ok((self.build()?, fields))
    }
}

/// Join a base URL and a path into an absolute URL.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> Result<Url> {
    let base = base_url.trim_end_matches('/');
    let full = if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };

    if full.is_empty() {
        return Err(NetworkError::build("URL is empty"));
    }

    let url = Url::parse(&full)?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(NetworkError::build(format!(
            "'{}' is not an absolute URL with a host",
            full
        )));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NetworkError::build(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
