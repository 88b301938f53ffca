//! HTTP handlers for uploads and metadata queries.
//! File bodies are streamed straight into the upload pipeline and never
//! buffered whole.

use crate::{
    auth::Authenticated,
    errors::AppError,
    models::{
        song::{ArtistCount, SongMetadata},
        stored_object::StoredObject,
    },
    services::{
        error::{ServiceError, StoreFault},
        upload_pipeline::{FilePart, UploadReceipt, UploadRequest},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ArtistQuery {
    pub artist: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub song: SongMetadata,
    pub object: ObjectSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub filename: String,
    pub content_type: Option<String>,
    pub length: i64,
    pub md5: Option<String>,
}

impl From<StoredObject> for ObjectSummary {
    fn from(object: StoredObject) -> Self {
        Self {
            filename: object.filename,
            content_type: object.content_type,
            length: object.length,
            md5: object.md5,
        }
    }
}

impl From<UploadReceipt> for UploadResponse {
    fn from(receipt: UploadReceipt) -> Self {
        Self {
            message: "File uploaded successfully".into(),
            song: receipt.song,
            object: receipt.object.into(),
        }
    }
}

/// `POST /upload`, a multipart form with `title`, `artist`, `album`,
/// `language` and a `file` part. Metadata parts must come first.
pub async fn upload_song(
    State(state): State<AppState>,
    _auth: Authenticated,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };

        if name == "file" {
            let file = FilePart {
                filename: field.file_name().map(str::to_owned),
                content_type: field.content_type().map(str::to_owned),
            };
            let body = field.map(|frame| frame.map_err(io::Error::other));
            let receipt = state
                .uploads
                .upload(request, file, body)
                .await
                .map_err(upload_error)?;
            return Ok(Json(receipt.into()));
        }

        let value = field.text().await.map_err(bad_multipart)?;
        if !request.set(&name, value) {
            debug!("ignoring unknown upload field `{}`", name);
        }
    }

    Err(ServiceError::missing_fields(&request.missing_fields(None)).into())
}

/// `GET /songs/{language}`
pub async fn songs_by_language(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(language): Path<String>,
) -> Result<Json<Vec<SongMetadata>>, AppError> {
    let songs = state.index.query_by_language(&language).await?;
    if songs.is_empty() {
        return Err(AppError::not_found(format!(
            "no songs found for language `{language}`"
        )));
    }
    Ok(Json(songs))
}

/// `GET /songs?artist=X`
pub async fn songs_by_artist(
    State(state): State<AppState>,
    _auth: Authenticated,
    Query(query): Query<ArtistQuery>,
) -> Result<Json<Vec<SongMetadata>>, AppError> {
    let artist = query
        .artist
        .filter(|artist| !artist.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("query parameter `artist` is required"))?;

    let songs = state.index.query_by_artist(&artist).await?;
    if songs.is_empty() {
        return Err(AppError::not_found(format!(
            "no songs found for artist `{artist}`"
        )));
    }
    Ok(Json(songs))
}

/// `GET /artist/{name}/songs`, the public variant of the artist query.
pub async fn artist_songs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<SongMetadata>>, AppError> {
    let songs = state.index.query_by_artist(&name).await?;
    if songs.is_empty() {
        return Err(AppError::not_found(format!(
            "no songs found for artist `{name}`"
        )));
    }
    Ok(Json(songs))
}

/// `GET /top-artists`
pub async fn top_artists(
    State(state): State<AppState>,
) -> Result<Json<Vec<ArtistCount>>, AppError> {
    Ok(Json(state.retrieval.aggregate_by_artist().await?))
}

fn bad_multipart(err: MultipartError) -> AppError {
    AppError::new(err.status(), "invalid_multipart", err.body_text())
}

/// A file body that failed to arrive (too large, malformed) keeps the
/// multipart status instead of being reported as a storage fault.
fn upload_error(err: ServiceError) -> AppError {
    match err {
        ServiceError::StorageWrite {
            source: StoreFault::Io(io),
            name,
        } if io.get_ref().is_some_and(|inner| inner.is::<MultipartError>()) => {
            match io.into_inner().map(|inner| inner.downcast::<MultipartError>()) {
                Some(Ok(multipart)) => bad_multipart(*multipart),
                _ => AppError::internal(format!("upload of `{name}` failed")),
            }
        }
        other => other.into(),
    }
}
