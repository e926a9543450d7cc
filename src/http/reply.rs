//! Response shaping: JSON bodies pass through the redactor on the way out.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::core::redact::redact;

/// JSON responder that scrubs the serialized body before it leaves the
/// server. Replacement markers contain no JSON metacharacters, so scrubbing
/// the serialized text cannot break the document structure.
pub struct RedactedJson<T>(pub T);

impl<T: Serialize> IntoResponse for RedactedJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_string(&self.0) {
            Ok(serialized) => (
                [(header::CONTENT_TYPE, "application/json")],
                redact(&serialized),
            )
                .into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}
