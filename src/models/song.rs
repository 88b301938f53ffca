//! Song metadata records and the artist aggregate view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::fmt;

/// Ordered list of artist names.
///
/// Stored and serialized as one `", "`-joined string; parsing splits on
/// commas, trims each name and drops empty entries, so `"A,B "` and
/// `"A, B"` normalize to the same value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtistList(Vec<String>);

impl ArtistList {
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ArtistList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

impl Serialize for ArtistList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtistList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Row shape of the `songs` table.
#[derive(Clone, FromRow, Debug)]
pub struct SongRow {
    pub id: i64,
    pub filename: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub language: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One indexed song. `filename` names the stored object holding the audio.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SongMetadata {
    pub id: i64,
    pub filename: String,
    pub title: String,
    #[serde(rename = "artist")]
    pub artists: ArtistList,
    pub album: String,
    pub language: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<SongRow> for SongMetadata {
    fn from(row: SongRow) -> Self {
        Self {
            id: row.id,
            filename: row.filename,
            title: row.title,
            artists: ArtistList::parse(&row.artist),
            album: row.album,
            language: row.language,
            uploaded_at: row.uploaded_at,
        }
    }
}

/// A metadata record about to be registered.
#[derive(Clone, Debug)]
pub struct NewSong {
    pub filename: String,
    pub title: String,
    pub artists: ArtistList,
    pub album: String,
    pub language: String,
}

/// Entry of the top-artists view.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtistCount {
    pub artist_name: String,
    pub song_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artist_list_normalizes_delimited_input() {
        let list = ArtistList::parse(" Ana ,Bruno,, ");
        assert_eq!(list.names(), ["Ana", "Bruno"]);
        assert_eq!(list.to_string(), "Ana, Bruno");
        assert!(ArtistList::parse(" , ").is_empty());
    }

    #[test]
    fn artist_list_serializes_as_joined_string() {
        let list = ArtistList::parse("A,B");
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json, serde_json::json!("A, B"));

        let back: ArtistList = serde_json::from_value(json).unwrap();
        assert_eq!(back, list);
    }
}
