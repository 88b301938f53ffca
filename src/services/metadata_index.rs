//! Metadata index over stored songs, backed by the `songs` table.

use crate::{
    models::song::{ArtistList, NewSong, SongMetadata, SongRow},
    services::error::{ServiceError, ServiceResult},
};
use chrono::Utc;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

const SONG_COLUMNS: &str = "id, filename, title, artist, album, language, uploaded_at";

#[derive(Clone)]
pub struct MetadataIndex {
    db: SqlitePool,
}

impl MetadataIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert the record for `song.filename`, replacing an earlier record of
    /// the same file (uploads with an existing name overwrite it).
    pub async fn register(&self, song: &NewSong) -> ServiceResult<SongMetadata> {
        upsert_song(&self.db, song, None)
            .await
            .map_err(|source| index_write(song, true, source))?
            .map(SongMetadata::from)
            .ok_or_else(|| {
                ServiceError::Internal(format!("upsert of `{}` returned no row", song.filename))
            })
    }

    /// Like [`MetadataIndex::register`], but only while `object_id` is still
    /// the complete object for the file. Returns `None` when a newer upload
    /// has replaced it in the meantime; its record is then left untouched.
    pub async fn register_live(
        &self,
        song: &NewSong,
        object_id: Uuid,
    ) -> ServiceResult<Option<SongMetadata>> {
        let row = upsert_song(&self.db, song, Some(object_id))
            .await
            .map_err(|source| index_write(song, true, source))?;
        Ok(row.map(SongMetadata::from))
    }

    /// Exact match on language. An empty result is not an error.
    pub async fn query_by_language(&self, language: &str) -> ServiceResult<Vec<SongMetadata>> {
        self.fetch_where("language = ?", language).await
    }

    /// Exact match on the whole artist field after normalizing `artist` the
    /// same way records are normalized on write. `"A,B"` finds songs stored
    /// as `"A, B"` but not songs by `"A"` alone.
    pub async fn query_by_artist(&self, artist: &str) -> ServiceResult<Vec<SongMetadata>> {
        let normalized = ArtistList::parse(artist).to_string();
        self.fetch_where("artist = ?", &normalized).await
    }

    /// Full scan, used by the aggregate view.
    pub async fn all(&self) -> ServiceResult<Vec<SongMetadata>> {
        let rows = sqlx::query_as::<_, SongRow>(&format!(
            "SELECT {SONG_COLUMNS} FROM songs ORDER BY uploaded_at, id"
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(SongMetadata::from).collect())
    }

    async fn fetch_where(&self, filter: &str, value: &str) -> ServiceResult<Vec<SongMetadata>> {
        let rows = sqlx::query_as::<_, SongRow>(&format!(
            "SELECT {SONG_COLUMNS} FROM songs WHERE {filter} ORDER BY uploaded_at, id"
        ))
        .bind(value)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(SongMetadata::from).collect())
    }
}

/// Upsert `song` on its filename. With `live_object` set the write only
/// happens while that object is the complete one for the name.
///
/// Runs on any executor so the chunk store can apply it inside its publish
/// transaction.
pub(crate) async fn upsert_song<'e, E>(
    executor: E,
    song: &NewSong,
    live_object: Option<Uuid>,
) -> Result<Option<SongRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SongRow>(&format!(
        "INSERT INTO songs (filename, title, artist, album, language, uploaded_at)
         SELECT ?, ?, ?, ?, ?, ?
         WHERE ? IS NULL
            OR EXISTS (SELECT 1 FROM objects WHERE id = ? AND state = 'complete')
         ON CONFLICT(filename) DO UPDATE SET
            title = excluded.title,
            artist = excluded.artist,
            album = excluded.album,
            language = excluded.language,
            uploaded_at = excluded.uploaded_at
         RETURNING {SONG_COLUMNS}"
    ))
    .bind(&song.filename)
    .bind(&song.title)
    .bind(song.artists.to_string())
    .bind(&song.album)
    .bind(&song.language)
    .bind(Utc::now())
    .bind(live_object)
    .bind(live_object)
    .fetch_optional(executor)
    .await
}

pub(crate) fn index_write(
    song: &NewSong,
    object_stored: bool,
    source: sqlx::Error,
) -> ServiceError {
    ServiceError::IndexWrite {
        filename: song.filename.clone(),
        object_stored,
        source,
    }
}
