use std::time::Duration;

use mini_moka::sync::Cache;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::models::{format_duration, Song};

pub const UNKNOWN_TRACK_TITLE: &str = "Unknown track";

const METADATA_CACHE_CAPACITY: u64 = 100;
const METADATA_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not extract a stream: {0}")]
    Extraction(#[from] songbird::input::error::Error),
    #[error("the source did not report a playable url")]
    MissingUrl,
    #[error("failed to run yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("yt-dlp returned no playlist entries: {0}")]
    EmptyPlaylist(String),
}

/// One line of `yt-dlp -j --flat-playlist` output. Entries that fail to
/// parse are skipped rather than failing the whole playlist.
#[derive(Deserialize)]
struct PlaylistEntry {
    pub url: String,
    pub title: String,
    pub duration: Option<f64>,
    #[serde(rename = "duration_string")]
    pub duration_string: Option<String>,
}

/// Resolves user input (url or search terms) into queueable songs, caching
/// metadata so repeated requests skip the extractor round trip.
pub struct SourceResolver {
    cache: Cache<String, Song>,
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceResolver {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(METADATA_CACHE_CAPACITY)
                .time_to_live(METADATA_CACHE_TTL)
                .build(),
        }
    }

    /// Resolves a single url or search query into a song. The stream itself
    /// is fetched again at playback time; only metadata is kept here.
    pub async fn resolve(
        &self,
        user_input: &str,
        requested_by: Option<String>,
    ) -> Result<Song, SourceError> {
        let direct_url = user_input.starts_with("http");
        if direct_url {
            if let Some(mut cached) = self.cache.get(&user_input.to_string()) {
                debug!("metadata cache hit for {user_input}");
                cached.requested_by = requested_by;
                return Ok(cached);
            }
        }

        let input = if direct_url {
            songbird::ytdl(user_input).await?
        } else {
            songbird::input::ytdl_search(user_input).await?
        };

        let source_url = input.metadata.source_url.ok_or(SourceError::MissingUrl)?;
        let title = input
            .metadata
            .title
            .unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string());
        let duration = input.metadata.duration;
        let thumbnail = input.metadata.thumbnail;

        let song = Song {
            title,
            url: source_url.clone(),
            duration,
            duration_text: format_duration(duration),
            thumbnail,
            requested_by,
        };

        let mut cached = song.clone();
        cached.requested_by = None;
        self.cache.insert(source_url, cached);

        Ok(song)
    }

    /// Expands a playlist url into its songs using a flat listing, so no
    /// individual stream is resolved up front.
    pub async fn playlist(
        &self,
        url: &str,
        requested_by: Option<String>,
    ) -> Result<Vec<Song>, SourceError> {
        info!("expanding playlist {url}");

        let output = Command::new("yt-dlp")
            .arg("-j")
            .arg("--flat-playlist")
            .arg(url)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SourceError::EmptyPlaylist(stderr));
        }

        let songs = parse_playlist_output(&stdout, requested_by);
        Ok(songs)
    }
}

fn parse_playlist_output(stdout: &str, requested_by: Option<String>) -> Vec<Song> {
    let lines: Vec<&str> = stdout.lines().filter(|line| !line.trim().is_empty()).collect();

    let songs: Vec<Song> = lines
        .iter()
        .filter_map(|line| {
            let entry: PlaylistEntry = serde_json::from_str(line).ok()?;

            let duration: Option<Duration> = entry
                .duration
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64);

            let duration_text = entry
                .duration_string
                .unwrap_or_else(|| format_duration(duration));

            Some(Song {
                title: entry.title,
                url: entry.url,
                duration,
                duration_text,
                thumbnail: None,
                requested_by: requested_by.clone(),
            })
        })
        .collect();

    if songs.len() < lines.len() {
        warn!(
            "skipped {} playlist entries that failed to parse",
            lines.len() - songs.len()
        );
    }

    songs
}

/// Playlist links carry a `list=` query parameter; plain video links and
/// search terms do not.
pub fn is_playlist_url(user_input: &str) -> bool {
    user_input.starts_with("http")
        && (user_input.contains("?list=") || user_input.contains("&list="))
}
