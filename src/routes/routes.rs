//! Defines routes for song uploads, queries and playback.
//!
//! ## Structure
//! - **Protected** (bearer token required)
//!   - `POST /upload`             - multipart upload of a file plus metadata
//!   - `GET  /songs/{language}`   - songs in a language
//!   - `GET  /songs?artist=X`     - songs by an exact artist credit
//!   - `GET  /play/{filename}`    - stream a stored file
//!
//! - **Public**
//!   - `GET  /top-artists`           - song counts per artist
//!   - `GET  /artist/{name}/songs`   - songs by an exact artist credit
//!   - `POST /register`, `POST /login` - accounts and tokens
//!   - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        auth_handlers::{login, register},
        health_handlers::{healthz, readyz},
        playback_handlers::play,
        song_handlers::{
            artist_songs, songs_by_artist, songs_by_language, top_artists, upload_song,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router for all routes.
///
/// Protection is per handler through the `Authenticated` extractor, so the
/// route table mixes public and protected endpoints freely.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // accounts
        .route("/register", post(register))
        .route("/login", post(login))
        // songs
        .route(
            "/upload",
            post(upload_song).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/songs", get(songs_by_artist))
        .route("/songs/{language}", get(songs_by_language))
        .route("/top-artists", get(top_artists))
        .route("/artist/{name}/songs", get(artist_songs))
        .route("/play/{filename}", get(play))
}
