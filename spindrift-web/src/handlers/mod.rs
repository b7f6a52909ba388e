//! Request handlers.

mod media;
mod progress;
mod stream;

pub use media::{add_media, delete_media, get_media, health, list_media, retry_download};
pub use progress::progress_stream;
pub use stream::stream_media;

use axum::body::Body;
use axum::http::{Response, StatusCode, header};

/// JSON error body with a user-displayable message.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let body = serde_json::json!({ "error": message.into() }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}
