//! HTTP request building, execution and response handling.
//!
//! ```ignore
//! use async_connect::http::ApiClient;
//!
//! let client = ApiClient::new("https://api.example.com")?;
//! let user: User = client.send(client.get("/users/42")).await?;
//! ```
//!
//! # Uploads
//!
//! ```ignore
//! use async_connect::http::MultipartField;
//!
//! let photo = MultipartField::file("photo", "a.jpg", "image/jpeg", bytes);
//! let saved: Saved = client
//!     .send_multipart(
//!         client.post("/photos").param("album", "summer"),
//!         vec![photo],
//!         Some(Arc::new(|fraction| println!("{:.0}%", fraction * 100.0))),
//!     )
//!     .await?;
//! ```

mod client;
mod multipart;
mod progress;
mod request;
mod response;

pub use client::{ApiClient, ApiClientBuilder, ClientConfig};
pub use multipart::{
    MultipartBody, MultipartField, encode as encode_multipart,
    encode_with_boundary as encode_multipart_with_boundary, fields_from_params,
    generate_boundary,
};
pub use progress::{ProgressCallback, ProgressTracker, TaskId};
pub use request::{HttpMethod, ParameterEncoding, RequestBuilder, RequestDescriptor};
pub use response::{RawResponse, ResponseProcessor};
