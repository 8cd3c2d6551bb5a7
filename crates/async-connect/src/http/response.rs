//! Response classification and decoding.

use std::fmt::Write as _;

use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use url::Url;

use super::request::RequestDescriptor;
use crate::error::{NetworkError, Result};

const EMPTY_TOKEN: &str = "empty";
const TOKEN_EXCERPT_CHARS: usize = 24;

/// A response returned without JSON decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status_code: u16,
    /// The response body.
    pub bytes: Bytes,
}

impl RawResponse {
    /// The body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Turns a wire response into a decoded value or a [`NetworkError`].
///
/// Only status 200 is treated as success. Stateless; one instance can be shared
/// by any number of concurrent calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseProcessor;

impl ResponseProcessor {
    /// Classify and decode a response.
    ///
    /// - status outside the HTTP range: `Unknown`
    /// - status other than 200: `HttpStatus`, no decode attempt
    /// - status 200 and a body that does not decode into `T`: `Decode`
    pub fn process<T: DeserializeOwned>(
        &self,
        request: &RequestDescriptor,
        body: &[u8],
        status: u16,
        headers: &HeaderMap,
    ) -> Result<T> {
        self.process_at(request, &request.url, body, status, headers)
    }

    /// Like [`process`](Self::process), reporting `endpoint` as the URL that
    /// produced the response (after redirects).
    pub fn process_at<T: DeserializeOwned>(
        &self,
        request: &RequestDescriptor,
        endpoint: &Url,
        body: &[u8],
        status: u16,
        headers: &HeaderMap,
    ) -> Result<T> {
        let status = check_status(status)?;

        if status != 200 {
            let reason = (status == 401).then_some("Unauthorized");
            tracing::warn!(
                target: "async_connect::http",
                url = %endpoint,
                status,
                "Request failed with HTTP status"
            );
            return Err(NetworkError::HttpStatus {
                status,
                diagnostic: diagnostic("API Error", request, endpoint, status, reason),
                raw_response: body_text(body),
            });
        }

        match serde_json::from_slice::<T>(body) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    target: "async_connect::http",
                    url = %endpoint,
                    content_type = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
                    error = %err,
                    "Failed to decode response body"
                );
                Err(NetworkError::Decode {
                    status,
                    diagnostic: diagnostic(
                        "Decode Failed",
                        request,
                        endpoint,
                        status,
                        Some(&err.to_string()),
                    ),
                    raw_response: body_text(body),
                    source: err,
                })
            }
        }
    }

    /// Accept a response as raw bytes when its status is 200.
    pub fn process_raw(
        &self,
        request: &RequestDescriptor,
        body: Bytes,
        status: u16,
    ) -> Result<RawResponse> {
        self.process_raw_at(request, &request.url, body, status)
    }

    /// Like [`process_raw`](Self::process_raw), reporting `endpoint` as the
    /// URL that produced the response.
    pub fn process_raw_at(
        &self,
        request: &RequestDescriptor,
        endpoint: &Url,
        body: Bytes,
        status: u16,
    ) -> Result<RawResponse> {
        let status = check_status(status)?;
        if status != 200 {
            return Err(NetworkError::HttpStatus {
                status,
                diagnostic: diagnostic("API Error", request, endpoint, status, None),
                raw_response: body_text(&body),
            });
        }
        Ok(RawResponse {
            status_code: status,
            bytes: body,
        })
    }
}

fn check_status(status: u16) -> Result<u16> {
    http::StatusCode::from_u16(status)
        .map(|s| s.as_u16())
        .map_err(|_| NetworkError::unknown("failed to parse response"))
}

fn body_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

/// The token shown in diagnostics: `Authorization`, else `Authorize`, else `"empty"`.
///
/// Only a prefix is kept. Purely informational.
pub(crate) fn token_excerpt(request: &RequestDescriptor) -> String {
    let Some(token) = request
        .header("Authorization")
        .or_else(|| request.header("Authorize"))
    else {
        return EMPTY_TOKEN.to_string();
    };

    let mut chars = token.chars();
    let excerpt: String = chars.by_ref().take(TOKEN_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", excerpt)
    } else {
        excerpt
    }
}

fn diagnostic(
    title: &str,
    request: &RequestDescriptor,
    endpoint: &Url,
    status: u16,
    reason: Option<&str>,
) -> String {
    let mut out = format!("=========== {} ===========", title);
    let _ = write!(out, "\nEndpoint: \n{}", endpoint);
    let _ = write!(out, "\nRequest Body: \n{}", request.body_text());
    let _ = write!(out, "\nResponse Code: \n{}", status);
    let _ = write!(out, "\nToken: \n{}", token_excerpt(request));
    if let Some(reason) = reason {
        let _ = write!(out, "\nReason: \n{}", reason);
    }
    out
}
