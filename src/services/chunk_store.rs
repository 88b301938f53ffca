//! src/services/chunk_store.rs
//!
//! ChunkStore: payloads persisted in SQLite as an ordered sequence of
//! fixed-size chunk rows plus one file record per upload attempt.
//!
//! A write lands under a fresh `pending` record and becomes visible only when
//! the publish transaction flips it to `complete`. The same transaction
//! retires any earlier complete object of the same name, so a reader sees
//! either the previous version or the new one, never a mix.

use crate::{
    models::{
        song::{NewSong, SongMetadata},
        stored_object::StoredObject,
    },
    services::{
        error::{ServiceError, ServiceResult, StoreFault},
        metadata_index::{index_write, upsert_song},
    },
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{io, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 255 KiB, small enough to keep per-stream memory flat and large enough to
/// keep the row count of a typical track in the low hundreds.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;
pub const DEFAULT_SUPERSEDED_GRACE: Duration = Duration::from_secs(300);

const MAX_OBJECT_NAME_LEN: usize = 1024;

const OBJECT_COLUMNS: &str = "id, filename, content_type, length, chunk_size, chunk_count, md5, \
                              state, created_at, completed_at";

#[derive(Clone)]
pub struct ChunkStore {
    db: SqlitePool,
    chunk_size: usize,
    superseded_grace: Duration,
}

struct WriteSummary {
    length: i64,
    chunk_count: i64,
    digest: Context,
}

impl ChunkStore {
    pub fn new(db: SqlitePool, chunk_size: usize) -> Self {
        Self {
            db,
            chunk_size: chunk_size.max(1),
            superseded_grace: DEFAULT_SUPERSEDED_GRACE,
        }
    }

    /// How long a replaced version stays readable for streams that opened it.
    pub fn with_superseded_grace(mut self, grace: Duration) -> Self {
        self.superseded_grace = grace;
        self
    }

    /// Reject names that cannot be addressed as a single URL path segment.
    pub fn ensure_name_safe(name: &str) -> ServiceResult<()> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("file name is empty".into()));
        }
        if name.len() > MAX_OBJECT_NAME_LEN {
            return Err(ServiceError::Validation(format!(
                "file name exceeds {MAX_OBJECT_NAME_LEN} bytes"
            )));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(ServiceError::Validation(format!(
                "file name `{name}` contains a path separator"
            )));
        }
        if name == "." || name == ".." {
            return Err(ServiceError::Validation(format!(
                "file name `{name}` is a relative path component"
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(ServiceError::Validation(
                "file name contains control characters".into(),
            ));
        }
        Ok(())
    }

    /// Stream `stream` into the store under `name`.
    ///
    /// - Splits the input into `chunk_size` rows as it arrives; at most one
    ///   chunk is buffered regardless of how the caller frames its bytes.
    /// - Computes length and MD5 while streaming.
    /// - Publishes atomically, replacing a previous complete object of the
    ///   same name.
    ///
    /// On any failure the pending record and its chunks are removed and the
    /// error is returned as `StorageWrite`.
    pub async fn write<S>(
        &self,
        name: &str,
        content_type: Option<&str>,
        stream: S,
    ) -> ServiceResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let (object, _) = self.write_inner(name, content_type, stream, None).await?;
        Ok(object)
    }

    /// Store the payload of `song` and publish it under `song.filename`.
    ///
    /// When the name already has a complete object, the song record is
    /// upserted in the publish transaction, so payload and metadata are
    /// replaced together or not at all. The returned record is `Some` in that
    /// case. For a first upload of the name the record is left to the caller
    /// and `None` is returned.
    pub async fn write_song<S>(
        &self,
        song: &NewSong,
        content_type: Option<&str>,
        stream: S,
    ) -> ServiceResult<(StoredObject, Option<SongMetadata>)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.write_inner(&song.filename, content_type, stream, Some(song))
            .await
    }

    async fn write_inner<S>(
        &self,
        name: &str,
        content_type: Option<&str>,
        stream: S,
        song: Option<&NewSong>,
    ) -> ServiceResult<(StoredObject, Option<SongMetadata>)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::ensure_name_safe(name)?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO objects (id, filename, content_type, chunk_size, state, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(id)
        .bind(name)
        .bind(content_type)
        .bind(self.chunk_size as i64)
        .bind(Utc::now())
        .execute(&self.db)
        .await
        .map_err(|err| ServiceError::storage_write(name, err))?;

        let published = match self.write_chunks(id, stream).await {
            Ok(summary) => self.publish(id, name, summary, song).await,
            Err(fault) => Err(ServiceError::storage_write(name, fault)),
        };

        match published {
            Ok((object, song)) => {
                debug!(
                    "published object {} ({} bytes in {} chunks)",
                    name, object.length, object.chunk_count
                );
                self.prune_superseded().await;
                Ok((object, song))
            }
            Err(err) => {
                self.discard(id).await;
                Err(err)
            }
        }
    }

    async fn write_chunks<S>(&self, id: Uuid, stream: S) -> Result<WriteSummary, StoreFault>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut summary = WriteSummary {
            length: 0,
            chunk_count: 0,
            digest: Context::new(),
        };

        pin_mut!(stream);
        while let Some(frame) = stream.next().await {
            let mut frame = frame?;
            while !frame.is_empty() {
                let take = (self.chunk_size - buffer.len()).min(frame.len());
                buffer.extend_from_slice(&frame.split_to(take));
                if buffer.len() == self.chunk_size {
                    self.insert_chunk(id, &mut summary, &buffer).await?;
                    buffer.clear();
                }
            }
        }
        if !buffer.is_empty() {
            self.insert_chunk(id, &mut summary, &buffer).await?;
        }

        Ok(summary)
    }

    /// Each chunk is its own autocommit insert, so no write lock is held
    /// while waiting on the caller's stream.
    async fn insert_chunk(
        &self,
        id: Uuid,
        summary: &mut WriteSummary,
        data: &[u8],
    ) -> Result<(), StoreFault> {
        sqlx::query("INSERT INTO chunks (object_id, n, data) VALUES (?, ?, ?)")
            .bind(id)
            .bind(summary.chunk_count)
            .bind(data)
            .execute(&self.db)
            .await?;

        summary.digest.consume(data);
        summary.chunk_count += 1;
        summary.length += data.len() as i64;
        Ok(())
    }

    async fn publish(
        &self,
        id: Uuid,
        name: &str,
        summary: WriteSummary,
        song: Option<&NewSong>,
    ) -> ServiceResult<(StoredObject, Option<SongMetadata>)> {
        let now = Utc::now();
        let md5 = format!("{:x}", summary.digest.compute());
        let fault = |err: sqlx::Error| ServiceError::storage_write(name, err);

        let mut tx = self.db.begin().await.map_err(fault)?;

        let retired = sqlx::query(
            "UPDATE objects SET state = 'superseded', superseded_at = ?
             WHERE filename = ? AND state = 'complete'",
        )
        .bind(now.timestamp_millis())
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(fault)?
        .rows_affected();

        let object = sqlx::query_as::<_, StoredObject>(&format!(
            "UPDATE objects
             SET state = 'complete', length = ?, chunk_count = ?, md5 = ?, completed_at = ?
             WHERE id = ? AND state = 'pending'
             RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(summary.length)
        .bind(summary.chunk_count)
        .bind(&md5)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(fault)?;

        // A replaced name swaps its record in the same transaction; a failed
        // upsert drops `tx` and the previous version stays live.
        let record = match song {
            Some(song) if retired > 0 => {
                let row = upsert_song(&mut *tx, song, None)
                    .await
                    .map_err(|err| index_write(song, false, err))?
                    .ok_or_else(|| {
                        ServiceError::Internal(format!("upsert of `{name}` returned no row"))
                    })?;
                Some(SongMetadata::from(row))
            }
            _ => None,
        };

        tx.commit().await.map_err(fault)?;

        if retired > 0 {
            info!("object {} replaced by a new upload", name);
        }
        Ok((object, record))
    }

    /// Best-effort removal of a pending record and its chunks.
    async fn discard(&self, id: Uuid) {
        let result = async {
            let mut tx = self.db.begin().await?;
            sqlx::query("DELETE FROM chunks WHERE object_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM objects WHERE id = ? AND state = 'pending'")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            warn!("failed to discard pending object {}: {}", id, err);
        }
    }

    /// Delete superseded versions whose grace period has elapsed.
    async fn prune_superseded(&self) {
        let grace_ms = i64::try_from(self.superseded_grace.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(grace_ms);
        match self.delete_objects("state = 'superseded' AND superseded_at <= ?", Some(cutoff)).await
        {
            Ok(0) => {}
            Ok(pruned) => debug!("pruned {} superseded objects", pruned),
            Err(err) => warn!("failed to prune superseded objects: {}", err),
        }
    }

    /// Startup sweep: drop pending writes left by a previous process and
    /// every superseded version. Must run before the server accepts requests.
    pub async fn recover(&self) -> Result<u64, sqlx::Error> {
        let removed = self
            .delete_objects("state IN ('pending', 'superseded')", None)
            .await?;
        if removed > 0 {
            info!("removed {} stale object records", removed);
        }
        Ok(removed)
    }

    async fn delete_objects(&self, filter: &str, cutoff: Option<i64>) -> Result<u64, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let chunk_sql =
            format!("DELETE FROM chunks WHERE object_id IN (SELECT id FROM objects WHERE {filter})");
        let mut delete_chunks = sqlx::query(&chunk_sql);
        if let Some(cutoff) = cutoff {
            delete_chunks = delete_chunks.bind(cutoff);
        }
        delete_chunks.execute(&mut *tx).await?;

        let object_sql = format!("DELETE FROM objects WHERE {filter}");
        let mut delete_objects = sqlx::query(&object_sql);
        if let Some(cutoff) = cutoff {
            delete_objects = delete_objects.bind(cutoff);
        }
        let removed = delete_objects.execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    /// File record of the complete object named `name`.
    pub async fn head(&self, name: &str) -> ServiceResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE filename = ? AND state = 'complete'"
        ))
        .bind(name)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| ServiceError::storage_read(name, err))?
        .ok_or_else(|| ServiceError::NotFound(format!("file `{name}`")))
    }

    pub async fn exists(&self, name: &str) -> ServiceResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM objects WHERE filename = ? AND state = 'complete')",
        )
        .bind(name)
        .fetch_one(&self.db)
        .await
        .map_err(|err| ServiceError::storage_read(name, err))
    }

    /// Open a forward-only reader over the complete object named `name`.
    pub async fn open_read(&self, name: &str) -> ServiceResult<ObjectReader> {
        let object = self.head(name).await?;
        Ok(ObjectReader {
            db: self.db.clone(),
            object,
            next: 0,
            delivered: 0,
        })
    }

    /// Number of complete objects.
    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE state = 'complete'")
            .fetch_one(&self.db)
            .await
    }
}

/// Pull-based cursor over one object's chunks.
///
/// Each call to [`ObjectReader::next_chunk`] fetches exactly one chunk row,
/// so memory stays at one chunk no matter how slowly the caller drains it.
pub struct ObjectReader {
    db: SqlitePool,
    object: StoredObject,
    next: i64,
    delivered: i64,
}

impl ObjectReader {
    pub fn object(&self) -> &StoredObject {
        &self.object
    }

    /// Next chunk in order, or `None` once the whole payload was delivered.
    pub async fn next_chunk(&mut self) -> ServiceResult<Option<Bytes>> {
        let name = &self.object.filename;
        if self.next >= self.object.chunk_count {
            if self.delivered != self.object.length {
                return Err(ServiceError::storage_read(
                    name,
                    StoreFault::Corrupt(format!(
                        "expected {} bytes, read {}",
                        self.object.length, self.delivered
                    )),
                ));
            }
            return Ok(None);
        }

        let data = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM chunks WHERE object_id = ? AND n = ?",
        )
        .bind(self.object.id)
        .bind(self.next)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| ServiceError::storage_read(name, err))?
        .ok_or_else(|| {
            ServiceError::storage_read(
                name,
                StoreFault::Corrupt(format!(
                    "chunk {} of {} is missing",
                    self.next, self.object.chunk_count
                )),
            )
        })?;

        self.next += 1;
        self.delivered += data.len() as i64;
        Ok(Some(Bytes::from(data)))
    }

    /// Adapt the reader into a stream that fetches a chunk per poll.
    pub fn into_stream(self) -> impl Stream<Item = ServiceResult<Bytes>> + Send + 'static {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }
}
