//! Streaming playback of stored files.

use crate::{
    auth::Authenticated, errors::AppError, models::stored_object::StoredObject,
    services::streaming::Playback, state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};

/// `GET /play/{filename}`: relay the stored bytes as they are read.
pub async fn play(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let Playback {
        content_type,
        object,
        body,
    } = state.retrieval.stream_by_name(&filename).await?;

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    set_playback_headers(response.headers_mut(), &content_type, &object);
    Ok(response)
}

fn set_playback_headers(
    headers: &mut HeaderMap,
    content_type: &str,
    object: &StoredObject,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(object.length.max(0)),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(md5) = object.md5.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", md5)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(completed_at) = object.completed_at {
        let http_date = completed_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}
