//! `multipart/form-data` body encoding.
//!
//! Encoding is a pure function of the ordered field list and a boundary
//! token. [`encode`] picks a fresh random token, [`encode_with_boundary`]
//! takes a fixed one.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{NetworkError, Result};

const BOUNDARY_PREFIX: &str = "AsyncConnectBoundary";
const BOUNDARY_ENTROPY: usize = 32;

/// One part of a multipart body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultipartField {
    /// A plain form field.
    Text {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// A file attachment.
    File {
        /// Field name.
        name: String,
        /// File name reported to the server.
        filename: String,
        /// MIME type of the content.
        mime_type: String,
        /// Raw file content.
        data: Bytes,
    },
}

impl MultipartField {
    /// Create a text field.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Create a file attachment.
    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::File {
            name: name.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// The field name.
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }
}

/// An encoded multipart body and the boundary it was encoded with.
#[derive(Clone, Debug)]
pub struct MultipartBody {
    body: Bytes,
    boundary: String,
}

impl MultipartBody {
    /// The encoded body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The boundary token used in the body delimiters.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The `Content-Type` header value carrying this body's boundary.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Split into body bytes and boundary token.
    pub fn into_parts(self) -> (Bytes, String) {
        (self.body, self.boundary)
    }
}

/// Generate a random boundary token.
pub fn generate_boundary() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BOUNDARY_ENTROPY)
        .map(char::from)
        .collect();
    format!("{}{}", BOUNDARY_PREFIX, token)
}

/// Encode `fields` with a freshly generated boundary.
pub fn encode(fields: &[MultipartField]) -> MultipartBody {
    encode_with_boundary(fields, generate_boundary())
}

/// Encode `fields` with the given boundary token.
///
/// Fields are emitted in order, and the output is deterministic for a given
/// field list and boundary.
pub fn encode_with_boundary(fields: &[MultipartField], boundary: impl Into<String>) -> MultipartBody {
    let boundary = boundary.into();
    let mut out = BytesMut::with_capacity(estimate_len(fields, &boundary));

    for field in fields {
        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"\r\n");

        match field {
            MultipartField::Text { name, value } => {
                put_header(
                    &mut out,
                    &format!("Content-Disposition: form-data; name=\"{}\"", escape(name)),
                );
                out.put_slice(b"\r\n");
                out.put_slice(value.as_bytes());
            }
            MultipartField::File {
                name,
                filename,
                mime_type,
                data,
            } => {
                put_header(
                    &mut out,
                    &format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                        escape(name),
                        escape(filename)
                    ),
                );
                put_header(
                    &mut out,
                    &format!("Content-Type: {}", escape_line_breaks(mime_type)),
                );
                out.put_slice(b"\r\n");
                out.put_slice(data);
            }
        }
        out.put_slice(b"\r\n");
    }

    out.put_slice(b"--");
    out.put_slice(boundary.as_bytes());
    out.put_slice(b"--\r\n");

    MultipartBody {
        body: out.freeze(),
        boundary,
    }
}

/// Turn a serializable object into text fields, one per top-level key.
///
/// String values are used verbatim, other values in their JSON form, and
/// nulls are skipped.
pub fn fields_from_params<P: Serialize + ?Sized>(params: &P) -> Result<Vec<MultipartField>> {
    let value = serde_json::to_value(params)
        .map_err(|e| NetworkError::build(format!("failed to serialize parameters: {}", e)))?;

    let map = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(NetworkError::build(
                "multipart parameters must serialize to a JSON object",
            ));
        }
    };

    Ok(fields_from_map(map))
}

pub(crate) fn fields_from_map(map: Map<String, Value>) -> Vec<MultipartField> {
    map.into_iter()
        .filter_map(|(name, value)| match value {
            Value::Null => None,
            Value::String(s) => Some(MultipartField::text(name, s)),
            other => Some(MultipartField::text(name, other.to_string())),
        })
        .collect()
}

fn put_header(out: &mut BytesMut, line: &str) {
    out.put_slice(line.as_bytes());
    out.put_slice(b"\r\n");
}

/// Percent-encode the characters that would break a quoted header parameter.
fn escape(value: &str) -> String {
    escape_line_breaks(value).replace('"', "%22")
}

/// Percent-encode CR and LF so a value stays on its header line.
fn escape_line_breaks(value: &str) -> String {
    value.replace('\r', "%0D").replace('\n', "%0A")
}

fn estimate_len(fields: &[MultipartField], boundary: &str) -> usize {
    let per_part = boundary.len() + 128;
    fields
        .iter()
        .map(|field| match field {
            MultipartField::Text { value, .. } => value.len() + per_part,
            MultipartField::File { data, .. } => data.len() + per_part,
        })
        .sum::<usize>()
        + boundary.len()
        + 8
}
