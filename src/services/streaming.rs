//! Streaming retrieval and the artist aggregate view.

use crate::{
    models::{
        song::{ArtistCount, SongMetadata},
        stored_object::StoredObject,
    },
    services::{
        chunk_store::{ChunkStore, ObjectReader},
        error::ServiceResult,
        metadata_index::MetadataIndex,
    },
};
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Served when an object was stored without a content type.
pub const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";
pub const DEFAULT_RELAY_BUFFER: usize = 4;

/// An object ready to be relayed to a client.
pub struct Playback {
    pub content_type: String,
    pub object: StoredObject,
    pub body: BoxStream<'static, ServiceResult<Bytes>>,
}

#[derive(Clone)]
pub struct StreamingRetrieval {
    store: ChunkStore,
    index: MetadataIndex,
    relay_buffer: usize,
}

impl StreamingRetrieval {
    pub fn new(store: ChunkStore, index: MetadataIndex) -> Self {
        Self {
            store,
            index,
            relay_buffer: DEFAULT_RELAY_BUFFER,
        }
    }

    /// Number of chunks that may sit between the store reader and the client.
    pub fn with_relay_buffer(mut self, chunks: usize) -> Self {
        self.relay_buffer = chunks.max(1);
        self
    }

    /// Open the complete object named `name` and start relaying it.
    pub async fn stream_by_name(&self, name: &str) -> ServiceResult<Playback> {
        let reader = self.store.open_read(name).await?;
        let object = reader.object().clone();
        let content_type = object
            .content_type
            .clone()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        Ok(Playback {
            content_type,
            object,
            body: relay(reader, self.relay_buffer),
        })
    }

    /// Song counts per individual artist, sorted by artist name.
    pub async fn aggregate_by_artist(&self) -> ServiceResult<Vec<ArtistCount>> {
        let songs = self.index.all().await?;
        Ok(count_artists(&songs))
    }
}

/// Relay `reader` through a channel holding at most `capacity` chunks.
///
/// The reader task fetches the next chunk only after the previous one fit
/// into the channel, so a stalled consumer stalls the store read. Dropping
/// the returned stream closes the channel and ends the task.
pub fn relay(mut reader: ObjectReader, capacity: usize) -> BoxStream<'static, ServiceResult<Bytes>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let name = reader.object().filename.clone();

    tokio::spawn(async move {
        loop {
            let item = match reader.next_chunk().await {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => break,
                Err(err) => {
                    warn!("stream of {} aborted: {}", name, err);
                    Err(err)
                }
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("consumer of {} went away, stopping relay", name);
                break;
            }
            if failed {
                break;
            }
        }
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Split each record's artist list and count songs per name.
/// A song credited to "A, B" counts once for A and once for B.
pub fn count_artists(songs: &[SongMetadata]) -> Vec<ArtistCount> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for song in songs {
        for name in song.artists.names() {
            *counts.entry(name.as_str()).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .map(|(name, song_count)| ArtistCount {
            artist_name: name.to_string(),
            song_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool,
        models::song::{ArtistList, NewSong},
        services::error::ServiceError,
    };
    use chrono::Utc;
    use futures::{TryStreamExt, stream};
    use std::{io, time::Duration};

    fn record(artist: &str) -> SongMetadata {
        SongMetadata {
            id: 0,
            filename: "f.mp3".into(),
            title: "t".into(),
            artists: ArtistList::parse(artist),
            album: "a".into(),
            language: "l".into(),
            uploaded_at: Utc::now(),
        }
    }

    fn count(name: &str, song_count: u64) -> ArtistCount {
        ArtistCount {
            artist_name: name.into(),
            song_count,
        }
    }

    #[test]
    fn count_artists_splits_and_sorts() {
        let counts = count_artists(&[record("A, B"), record("A")]);
        assert_eq!(counts, vec![count("A", 2), count("B", 1)]);
    }

    #[test]
    fn count_artists_orders_lexicographically() {
        let counts = count_artists(&[record("Zoe"), record("adam,Bea"), record("Bea")]);
        assert_eq!(
            counts,
            vec![count("Bea", 2), count("Zoe", 1), count("adam", 1)]
        );
        assert!(count_artists(&[]).is_empty());
    }

    #[tokio::test]
    async fn aggregate_reads_whole_index() {
        let (_dir, db) = test_pool().await;
        let index = MetadataIndex::new(db.clone());
        for (file, artist) in [("1.mp3", "A, B"), ("2.mp3", "A")] {
            index
                .register(&NewSong {
                    filename: file.into(),
                    title: "t".into(),
                    artists: ArtistList::parse(artist),
                    album: "a".into(),
                    language: "l".into(),
                })
                .await
                .unwrap();
        }
        let retrieval = StreamingRetrieval::new(ChunkStore::new(db, 4), index);

        assert_eq!(
            retrieval.aggregate_by_artist().await.unwrap(),
            vec![count("A", 2), count("B", 1)]
        );
    }

    #[tokio::test]
    async fn stream_relays_every_byte_in_order() {
        let (_dir, db) = test_pool().await;
        let store = ChunkStore::new(db.clone(), 64);
        let payload: Vec<u8> = (0..=255u8).cycle().take(4099).collect();
        store
            .write(
                "big.flac",
                Some("audio/flac"),
                stream::iter(
                    payload
                        .chunks(333)
                        .map(|c| Ok::<_, io::Error>(Bytes::copy_from_slice(c)))
                        .collect::<Vec<_>>(),
                ),
            )
            .await
            .unwrap();

        let retrieval =
            StreamingRetrieval::new(store, MetadataIndex::new(db)).with_relay_buffer(1);
        let playback = retrieval.stream_by_name("big.flac").await.unwrap();
        assert_eq!(playback.content_type, "audio/flac");
        assert_eq!(playback.object.length, 4099);

        let received: Vec<Bytes> = playback.body.try_collect().await.unwrap();
        assert_eq!(received.concat(), payload);
    }

    #[tokio::test]
    async fn missing_content_type_falls_back_to_audio() {
        let (_dir, db) = test_pool().await;
        let store = ChunkStore::new(db.clone(), 5);
        store
            .write("raw", None, stream::iter(vec![Ok(Bytes::from_static(b"x"))]))
            .await
            .unwrap();

        let retrieval = StreamingRetrieval::new(store, MetadataIndex::new(db));
        let playback = retrieval.stream_by_name("raw").await.unwrap();
        assert_eq!(playback.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn concurrent_requests_for_missing_name_all_get_not_found() {
        let (_dir, db) = test_pool().await;
        let retrieval = StreamingRetrieval::new(ChunkStore::new(db.clone(), 5), MetadataIndex::new(db));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let retrieval = retrieval.clone();
                tokio::spawn(async move { retrieval.stream_by_name("ghost.mp3").await })
            })
            .collect();

        for task in tasks {
            let result = tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("lookup hung")
                .unwrap();
            assert!(matches!(result, Err(ServiceError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_relay() {
        let (_dir, db) = test_pool().await;
        let store = ChunkStore::new(db.clone(), 1);
        store
            .write("long.mp3", None, stream::iter(vec![Ok(Bytes::from(vec![7u8; 64]))]))
            .await
            .unwrap();

        let reader = store.open_read("long.mp3").await.unwrap();
        let mut body = relay(reader, 1);
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(&[7]));
        drop(body);

        // The store stays usable for other readers once the relay gave up.
        let again: Vec<Bytes> = store
            .open_read("long.mp3")
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(again.concat().len(), 64);
    }
}
