// Request parsing utilities for HTTP handlers

use futures_util::StreamExt;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, warn};
use serde::de::DeserializeOwned;

use super::response_helpers::json_error;

/// Form fields accepted as the uploaded image even without a filename.
const IMAGE_FIELD_NAMES: [&str; 2] = ["image", "file"];

/// Read the whole body, refusing anything larger than `limit` bytes.
pub async fn read_body_limited(mut body: Body, limit: usize) -> Result<Bytes, Response<Body>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("[REQUEST] Failed to read request body: {e}");
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "Failed to read request body",
                ));
            }
        };
        if buf.len() + chunk.len() > limit {
            return Err(json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// Parse a JSON request body into a typed structure.
///
/// An empty body is treated as `{}` so missing fields surface as
/// validation errors rather than as a JSON syntax error.
pub async fn parse_json_body<T: DeserializeOwned>(
    body: Body,
    limit: usize,
) -> Result<T, Response<Body>> {
    let body_bytes = read_body_limited(body, limit).await?;
    let raw: &[u8] = if body_bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &body_bytes
    };

    match serde_json::from_slice::<T>(raw) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            debug!("[REQUEST] JSON parsing error: {e}");
            Err(json_error(StatusCode::BAD_REQUEST, "Invalid JSON format"))
        }
    }
}

/// Pull the uploaded image out of a `multipart/form-data` request.
///
/// Returns `Ok(None)` when the request is not multipart or carries no
/// non-empty file part. The first part with a filename (or named `image` /
/// `file`) wins.
pub async fn read_image_upload(
    req: Request<Body>,
    limit: usize,
) -> Result<Option<Vec<u8>>, Response<Body>> {
    let boundary = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok());
    let Some(boundary) = boundary else {
        return Ok(None);
    };

    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().whole_stream(limit as u64));
    let mut multipart = multer::Multipart::with_constraints(req.into_body(), boundary, constraints);

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err(multipart_error(e)),
        };

        let is_file = field.file_name().is_some()
            || field
                .name()
                .map(|name| IMAGE_FIELD_NAMES.contains(&name))
                .unwrap_or(false);
        if !is_file {
            continue;
        }

        let bytes = field.bytes().await.map_err(multipart_error)?;
        if bytes.is_empty() {
            continue;
        }
        return Ok(Some(bytes.to_vec()));
    }
}

fn multipart_error(err: multer::Error) -> Response<Body> {
    match err {
        multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. } => {
            json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
        }
        other => {
            debug!("[REQUEST] Multipart parsing error: {other}");
            json_error(StatusCode::BAD_REQUEST, "Malformed multipart body")
        }
    }
}
