//! Upload pipeline: validate, stream into the chunk store, then index.
//!
//! Replacing an existing file swaps payload and metadata record in one
//! transaction. The first upload of a name registers its record after the
//! object is published; an index failure at that point is reported as
//! `IndexWrite` and the stored object is left in place.

use crate::{
    models::{
        song::{ArtistList, NewSong, SongMetadata},
        stored_object::StoredObject,
    },
    services::{
        chunk_store::ChunkStore,
        error::{ServiceError, ServiceResult},
        metadata_index::MetadataIndex,
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use std::io;
use tracing::{info, warn};

/// Metadata fields of an upload as received; any may still be missing.
#[derive(Clone, Debug, Default)]
pub struct UploadRequest {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub language: Option<String>,
}

impl UploadRequest {
    /// Set a metadata field by its form name. Returns false for unknown names.
    pub fn set(&mut self, field: &str, value: String) -> bool {
        let slot = match field {
            "title" => &mut self.title,
            "artist" => &mut self.artist,
            "album" => &mut self.album,
            "language" => &mut self.language,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    /// Names of required inputs that are absent or blank.
    pub fn missing_fields(&self, file: Option<&FilePart>) -> Vec<&'static str> {
        let blank = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());

        let mut missing = Vec::new();
        if blank(&self.title) {
            missing.push("title");
        }
        if self
            .artist
            .as_deref()
            .is_none_or(|raw| ArtistList::parse(raw).is_empty())
        {
            missing.push("artist");
        }
        if blank(&self.album) {
            missing.push("album");
        }
        if blank(&self.language) {
            missing.push("language");
        }
        if file.is_none_or(|file| file.filename.as_deref().is_none_or(|n| n.trim().is_empty())) {
            missing.push("file");
        }
        missing
    }
}

/// Descriptor of the uploaded file part.
#[derive(Clone, Debug, Default)]
pub struct FilePart {
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Outcome of a fully successful upload.
#[derive(Debug)]
pub struct UploadReceipt {
    pub song: SongMetadata,
    pub object: StoredObject,
}

#[derive(Clone)]
pub struct UploadPipeline {
    store: ChunkStore,
    index: MetadataIndex,
    allow_empty: bool,
}

impl UploadPipeline {
    pub fn new(store: ChunkStore, index: MetadataIndex) -> Self {
        Self {
            store,
            index,
            allow_empty: false,
        }
    }

    /// Whether a 0-byte file is stored as an empty object (`true`) or
    /// rejected as a validation error (`false`, the default).
    pub fn with_empty_uploads(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Check every required input and build the record to register.
    /// Has no side effects.
    pub fn validate(&self, request: &UploadRequest, file: &FilePart) -> ServiceResult<NewSong> {
        let missing = request.missing_fields(Some(file));
        if !missing.is_empty() {
            return Err(ServiceError::missing_fields(&missing));
        }

        let field = |value: &Option<String>| value.as_deref().unwrap_or_default().trim().to_string();
        let filename = field(&file.filename);
        ChunkStore::ensure_name_safe(&filename)?;

        Ok(NewSong {
            filename,
            title: field(&request.title),
            artists: ArtistList::parse(request.artist.as_deref().unwrap_or_default()),
            album: field(&request.album),
            language: field(&request.language),
        })
    }

    /// Run the whole upload for one file.
    pub async fn upload<S>(
        &self,
        request: UploadRequest,
        file: FilePart,
        body: S,
    ) -> ServiceResult<UploadReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let song = self.validate(&request, &file)?;

        // Look for the first non-empty frame so an empty file can be
        // rejected before the store is touched.
        pin_mut!(body);
        let first = loop {
            match body.next().await {
                Some(Ok(frame)) if frame.is_empty() => continue,
                other => break other,
            }
        };
        if first.is_none() && !self.allow_empty {
            return Err(ServiceError::Validation(format!(
                "file `{}` is empty",
                song.filename
            )));
        }

        let content_type = file
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|ct| !ct.is_empty());
        let (object, replaced) = self
            .store
            .write_song(&song, content_type, stream::iter(first).chain(body))
            .await?;

        let song = match replaced {
            Some(record) => record,
            None => match self.index.register_live(&song, object.id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    return Err(ServiceError::Conflict(format!(
                        "file `{}` was replaced by a concurrent upload",
                        object.filename
                    )));
                }
                Err(err) => {
                    warn!(
                        "object {} stored but not indexed, it is unreachable by queries: {}",
                        object.filename, err
                    );
                    return Err(err);
                }
            },
        };

        info!(
            "uploaded {} ({} bytes, {} chunks)",
            object.filename, object.length, object.chunk_count
        );
        Ok(UploadReceipt { song, object })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use futures::TryStreamExt;
    use sqlx::SqlitePool;

    fn request() -> UploadRequest {
        UploadRequest {
            title: Some("Hallelujah".into()),
            artist: Some("Leonard Cohen, Jeff Buckley".into()),
            album: Some("Various Positions".into()),
            language: Some("english".into()),
        }
    }

    fn file(name: &str) -> FilePart {
        FilePart {
            filename: Some(name.into()),
            content_type: Some("audio/mpeg".into()),
        }
    }

    fn body(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let frames: Vec<io::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(frames)
    }

    fn pipeline(db: &SqlitePool) -> (UploadPipeline, ChunkStore, MetadataIndex) {
        let store = ChunkStore::new(db.clone(), 3);
        let index = MetadataIndex::new(db.clone());
        (UploadPipeline::new(store.clone(), index.clone()), store, index)
    }

    #[tokio::test]
    async fn upload_stores_object_then_indexes_it() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        let receipt = uploads
            .upload(request(), file("hallelujah.mp3"), body(&[b"hello ", b"world"]))
            .await
            .unwrap();

        assert_eq!(receipt.object.length, 11);
        assert_eq!(receipt.song.filename, "hallelujah.mp3");
        assert_eq!(
            receipt.song.artists.names(),
            ["Leonard Cohen", "Jeff Buckley"]
        );

        let chunks: Vec<Bytes> = store
            .open_read("hallelujah.mp3")
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"hello world");
        assert_eq!(index.query_by_language("english").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_fields_have_no_side_effects() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        let cases: [(&str, fn(&mut UploadRequest)); 4] = [
            ("title", |r| r.title = None),
            ("artist", |r| r.artist = Some(" , ".into())),
            ("album", |r| r.album = Some("   ".into())),
            ("language", |r| r.language = None),
        ];
        for (field, strip) in cases {
            let mut req = request();
            strip(&mut req);
            let err = uploads
                .upload(req, file("x.mp3"), body(&[b"data"]))
                .await
                .unwrap_err();
            match err {
                ServiceError::Validation(msg) => assert!(msg.contains(field), "{msg}"),
                other => panic!("expected validation error, got {other:?}"),
            }
        }

        let err = uploads
            .upload(request(), FilePart::default(), body(&[b"data"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref msg) if msg.contains("file")));

        assert!(!store.exists("x.mp3").await.unwrap());
        assert!(index.all().await.unwrap().is_empty());
    }

    #[test]
    fn missing_fields_lists_everything_absent() {
        let missing = UploadRequest::default().missing_fields(None);
        assert_eq!(missing, ["title", "artist", "album", "language", "file"]);
        assert!(request().missing_fields(Some(&file("a.mp3"))).is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_rejected_by_default() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, _) = pipeline(&db);

        for _ in 0..2 {
            let err = uploads
                .upload(request(), file("empty.mp3"), body(&[b"", b""]))
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{err:?}");
        }
        assert!(!store.exists("empty.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn empty_file_is_stored_when_allowed() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, _) = pipeline(&db);
        let uploads = uploads.with_empty_uploads(true);

        for _ in 0..2 {
            let receipt = uploads
                .upload(request(), file("empty.mp3"), body(&[]))
                .await
                .unwrap();
            assert_eq!(receipt.object.length, 0);
        }
        assert!(store.exists("empty.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn index_failure_is_reported_after_object_is_stored() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, _) = pipeline(&db);
        sqlx::query("DROP TABLE songs").execute(&db).await.unwrap();

        let err = uploads
            .upload(request(), file("orphan.mp3"), body(&[b"abc"]))
            .await
            .unwrap_err();

        assert!(
            matches!(err, ServiceError::IndexWrite { object_stored: true, .. }),
            "{err:?}"
        );
        assert!(store.exists("orphan.mp3").await.unwrap());
    }

    async fn read_back(store: &ChunkStore, name: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = store
            .open_read(name)
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    fn titled(title: &str) -> UploadRequest {
        UploadRequest {
            title: Some(title.into()),
            ..request()
        }
    }

    #[tokio::test]
    async fn reupload_replaces_bytes_and_metadata_together() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        uploads
            .upload(titled("old"), file("s.mp3"), body(&[b"OLD"]))
            .await
            .unwrap();
        let receipt = uploads
            .upload(titled("new"), file("s.mp3"), body(&[b"NEW!"]))
            .await
            .unwrap();

        assert_eq!(receipt.song.title, "new");
        assert_eq!(read_back(&store, "s.mp3").await, b"NEW!");
        let all = index.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "new");
    }

    #[tokio::test]
    async fn failed_reindex_keeps_previous_version_live() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        uploads
            .upload(titled("old"), file("s.mp3"), body(&[b"OLD"]))
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER songs_frozen BEFORE UPDATE ON songs
             BEGIN SELECT RAISE(ABORT, 'songs are read-only'); END",
        )
        .execute(&db)
        .await
        .unwrap();

        let err = uploads
            .upload(titled("new"), file("s.mp3"), body(&[b"NEW"]))
            .await
            .unwrap_err();

        assert!(
            matches!(err, ServiceError::IndexWrite { object_stored: false, .. }),
            "{err:?}"
        );
        assert_eq!(read_back(&store, "s.mp3").await, b"OLD");
        assert_eq!(index.all().await.unwrap()[0].title, "old");
        let leftovers: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE state != 'complete'")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn first_upload_overtaken_by_replacement_keeps_newer_record() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        // First upload published, its record not yet written.
        let first = uploads.validate(&titled("first"), &file("s.mp3")).unwrap();
        let early = store.write("s.mp3", None, body(&[b"AAA"])).await.unwrap();

        uploads
            .upload(titled("second"), file("s.mp3"), body(&[b"BBB"]))
            .await
            .unwrap();

        assert!(index.register_live(&first, early.id).await.unwrap().is_none());
        assert_eq!(read_back(&store, "s.mp3").await, b"BBB");
        assert_eq!(index.all().await.unwrap()[0].title, "second");
    }

    #[tokio::test]
    async fn storage_failure_skips_indexing() {
        let (_dir, db) = test_pool().await;
        let (uploads, store, index) = pipeline(&db);

        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::other("reset")),
        ]);
        let err = uploads
            .upload(request(), file("cut.mp3"), failing)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::StorageWrite { .. }), "{err:?}");
        assert!(!store.exists("cut.mp3").await.unwrap());
        assert!(index.all().await.unwrap().is_empty());
    }
}
