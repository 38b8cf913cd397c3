use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::thread_rng;
use serenity::async_trait;
use serenity::client::Context;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use serenity::prelude::TypeMapKey;
use songbird::tracks::TrackHandle;
use songbird::TrackEvent::End;
use songbird::{ytdl, Event, EventContext, EventHandler as VoiceEventHandler};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::controls;
use crate::models::{GuildQueue, LoopMode, Song};

/// How many consecutive unplayable sources are dropped before giving up.
pub const MAX_STREAM_FAILURES: usize = 5;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("not connected to a voice channel")]
    NotInVoice,
    #[error("gave up after {0} sources failed to stream")]
    TooManyFailures(usize),
    #[error("track control failed: {0}")]
    Track(#[from] songbird::tracks::TrackError),
}

/// Playback state of one guild. The epoch counts forced track
/// replacements: end events carry the epoch they were registered under,
/// and stale ones are dropped instead of advancing the queue twice.
pub struct GuildPlayer {
    pub queue: GuildQueue,
    pub track_handle: Option<TrackHandle>,
    pub epoch: u64,
    pub controls_message: Option<(ChannelId, MessageId)>,
}

impl GuildPlayer {
    fn new() -> Self {
        Self {
            queue: GuildQueue::new(),
            track_handle: None,
            epoch: 0,
            controls_message: None,
        }
    }

    /// Pauses playback, transport call first: when the transport fails the
    /// model keeps reporting what is actually coming out of the speakers.
    /// Generic over the transport call so tests can inject failures.
    fn pause_with<F>(&mut self, pause_transport: F) -> Result<bool, PlayerError>
    where
        F: FnOnce() -> Result<(), songbird::tracks::TrackError>,
    {
        if !self.queue.is_playing() || self.queue.is_paused() {
            return Ok(false);
        }
        pause_transport()?;
        self.queue.pause();
        Ok(true)
    }

    fn resume_with<F>(&mut self, resume_transport: F) -> Result<bool, PlayerError>
    where
        F: FnOnce() -> Result<(), songbird::tracks::TrackError>,
    {
        if !self.queue.is_playing() || !self.queue.is_paused() {
            return Ok(false);
        }
        resume_transport()?;
        self.queue.resume();
        Ok(true)
    }
}

/// All guild players. Each guild gets its own lock, so a slow source
/// resolution in one guild never blocks commands in another.
#[derive(Default)]
pub struct Players {
    guilds: RwLock<HashMap<u64, Arc<Mutex<GuildPlayer>>>>,
}

impl Players {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, guild_id: u64) -> Arc<Mutex<GuildPlayer>> {
        {
            let guilds = self.guilds.read().await;
            if let Some(player) = guilds.get(&guild_id) {
                return player.clone();
            }
        }

        let mut guilds = self.guilds.write().await;
        guilds
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildPlayer::new())))
            .clone()
    }

    pub async fn get(&self, guild_id: u64) -> Option<Arc<Mutex<GuildPlayer>>> {
        self.guilds.read().await.get(&guild_id).cloned()
    }
}

pub struct PlayersKey;

impl TypeMapKey for PlayersKey {
    type Value = Arc<Players>;
}

pub async fn registry(ctx: &Context) -> Arc<Players> {
    ctx.data
        .read()
        .await
        .get::<PlayersKey>()
        .expect("Players registry placed in at initialisation.")
        .clone()
}

/// Snapshot of the active track for the now-playing embed.
pub struct NowPlaying {
    pub song: Song,
    pub position: Duration,
    pub paused: bool,
    pub loop_mode: LoopMode,
    pub upcoming: usize,
}

/// Adds a song and starts playback when the guild was idle. Returns
/// whether playback started.
pub async fn enqueue(
    ctx: &Context,
    guild_id: GuildId,
    channel_id: ChannelId,
    song: Song,
) -> Result<bool, PlayerError> {
    let entry = registry(ctx).await.get_or_create(guild_id.0).await;
    let mut player = entry.lock().await;

    let should_start = player.queue.enqueue(song);
    if should_start {
        play_front(ctx, guild_id, channel_id, &mut player).await?;
    }

    Ok(should_start)
}

/// Adds a batch of songs (playlist expansion). Returns how many were added
/// and whether playback started.
pub async fn enqueue_many(
    ctx: &Context,
    guild_id: GuildId,
    channel_id: ChannelId,
    songs: Vec<Song>,
) -> Result<(usize, bool), PlayerError> {
    let entry = registry(ctx).await.get_or_create(guild_id.0).await;
    let mut player = entry.lock().await;

    let (added, should_start) = player.queue.enqueue_all(songs);
    if should_start {
        play_front(ctx, guild_id, channel_id, &mut player).await?;
    }

    Ok((added, should_start))
}

/// Stops the active track; the end event then advances the queue under
/// the current loop mode.
pub async fn skip(ctx: &Context, guild_id: GuildId) -> Result<bool, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(false);
    };
    let player = entry.lock().await;

    match &player.track_handle {
        Some(handle) => {
            handle.stop()?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub async fn pause(ctx: &Context, guild_id: GuildId) -> Result<bool, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(false);
    };
    let mut player = entry.lock().await;

    let Some(handle) = player.track_handle.clone() else {
        return Ok(false);
    };
    player.pause_with(|| handle.pause())
}

pub async fn resume(ctx: &Context, guild_id: GuildId) -> Result<bool, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(false);
    };
    let mut player = entry.lock().await;

    let Some(handle) = player.track_handle.clone() else {
        return Ok(false);
    };
    player.resume_with(|| handle.play())
}

/// Pause or resume from the control buttons. `None` means nothing is
/// active; otherwise the returned flag is the new paused state.
pub async fn toggle_pause(ctx: &Context, guild_id: GuildId) -> Result<Option<bool>, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(None);
    };
    let mut player = entry.lock().await;

    let Some(handle) = player.track_handle.clone() else {
        return Ok(None);
    };

    if player.resume_with(|| handle.play())? {
        Ok(Some(false))
    } else if player.pause_with(|| handle.pause())? {
        Ok(Some(true))
    } else {
        Ok(None)
    }
}

/// Replays the most recently finished track. The interrupted one stays
/// queued right behind it.
pub async fn previous(
    ctx: &Context,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<bool, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(false);
    };
    let mut player = entry.lock().await;

    if !player.queue.previous_restore() {
        return Ok(false);
    }

    // The replaced track must not advance the queue when its end event
    // arrives.
    player.epoch += 1;
    if let Some(handle) = player.track_handle.take() {
        let _ = handle.stop();
    }

    play_front(ctx, guild_id, channel_id, &mut player).await?;
    Ok(true)
}

/// Stops playback and empties the queue, keeping the play history.
/// Returns how many queued songs were removed.
pub async fn clear_and_stop(ctx: &Context, guild_id: GuildId) -> Result<usize, PlayerError> {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return Ok(0);
    };
    let mut player = entry.lock().await;

    player.epoch += 1;
    if let Some(handle) = player.track_handle.take() {
        let _ = handle.stop();
    }
    let removed = player.queue.clear();

    if let Some((channel, message)) = player.controls_message.take() {
        let _ = channel.delete_message(&ctx.http, message).await;
    }

    Ok(removed)
}

pub async fn shuffle(ctx: &Context, guild_id: GuildId) -> bool {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return false;
    };
    let mut player = entry.lock().await;
    player.queue.shuffle_with(&mut thread_rng())
}

pub async fn set_loop(ctx: &Context, guild_id: GuildId, mode: LoopMode) -> LoopMode {
    let entry = registry(ctx).await.get_or_create(guild_id.0).await;
    let mut player = entry.lock().await;
    player.queue.set_loop_mode(mode);
    mode
}

pub async fn cycle_loop(ctx: &Context, guild_id: GuildId) -> LoopMode {
    let entry = registry(ctx).await.get_or_create(guild_id.0).await;
    let mut player = entry.lock().await;
    player.queue.cycle_loop_mode()
}

pub async fn now_playing(ctx: &Context, guild_id: GuildId) -> Option<NowPlaying> {
    let entry = registry(ctx).await.get(guild_id.0).await?;
    let player = entry.lock().await;

    player.queue.current().cloned().map(|song| NowPlaying {
        song,
        position: player.queue.position(),
        paused: player.queue.is_paused(),
        loop_mode: player.queue.loop_mode(),
        upcoming: player.queue.len().saturating_sub(1),
    })
}

/// Queue contents plus loop mode, for the paginated queue embed.
pub async fn queue_snapshot(ctx: &Context, guild_id: GuildId) -> (Vec<Song>, LoopMode) {
    let Some(entry) = registry(ctx).await.get(guild_id.0).await else {
        return (Vec::new(), LoopMode::Off);
    };
    let player = entry.lock().await;
    (player.queue.snapshot(), player.queue.loop_mode())
}

/// Streams the front song into the voice call. Unplayable fronts are
/// dropped and the next one is tried, up to a bounded number of failures.
/// The caller holds the guild lock.
async fn play_front(
    ctx: &Context,
    guild_id: GuildId,
    channel_id: ChannelId,
    player: &mut GuildPlayer,
) -> Result<(), PlayerError> {
    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();
    let Some(call) = manager.get(guild_id) else {
        return Err(PlayerError::NotInVoice);
    };

    let mut failures = 0;
    while failures < MAX_STREAM_FAILURES {
        let Some(song) = player.queue.front().cloned() else {
            return Ok(());
        };

        let source = match ytdl(&song.url).await {
            Ok(source) => source,
            Err(why) => {
                warn!("could not stream {}: {why}", song.url);
                controls::check_msg(
                    channel_id
                        .say(&ctx.http, format!("Could not play **{}**, skipping it", song.title))
                        .await,
                );
                player.queue.drop_front();
                failures += 1;
                continue;
            }
        };

        let track_handle = {
            let mut call = call.lock().await;
            call.stop(); // Just in case something was playing before
            call.play_source(source)
        };

        track_handle.add_event(
            Event::Track(End),
            TrackEndNotifier {
                guild_id,
                channel_id,
                epoch: player.epoch,
                ctx: ctx.clone(),
            },
        )?;

        player.track_handle = Some(track_handle);
        player.queue.mark_playing();
        info!("now playing {} in guild {}", song.title, guild_id.0);

        replace_controls_message(ctx, channel_id, player).await;
        return Ok(());
    }

    Err(PlayerError::TooManyFailures(failures))
}

/// Posts a fresh now-playing message with control buttons and deletes the
/// previous one, so the controls always sit near the bottom of the channel.
async fn replace_controls_message(ctx: &Context, channel_id: ChannelId, player: &mut GuildPlayer) {
    if let Some((channel, message)) = player.controls_message.take() {
        let _ = channel.delete_message(&ctx.http, message).await;
    }

    let Some(song) = player.queue.current().cloned() else {
        return;
    };
    let view = NowPlaying {
        song,
        position: Duration::ZERO,
        paused: player.queue.is_paused(),
        loop_mode: player.queue.loop_mode(),
        upcoming: player.queue.len().saturating_sub(1),
    };

    match controls::send_now_playing(ctx, channel_id, &view).await {
        Ok(message) => player.controls_message = Some((channel_id, message.id)),
        Err(why) => info!("Error sending message: {why:?}"),
    }
}

struct TrackEndNotifier {
    guild_id: GuildId,
    channel_id: ChannelId,
    epoch: u64,
    ctx: Context,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let Some(entry) = registry(&self.ctx).await.get(self.guild_id.0).await else {
            return None;
        };
        let mut player = entry.lock().await;

        if player.epoch != self.epoch {
            info!("ignoring stale track end in guild {}", self.guild_id.0);
            return None;
        }

        player.track_handle = None;
        if player.queue.advance() {
            if let Err(why) =
                play_front(&self.ctx, self.guild_id, self.channel_id, &mut player).await
            {
                warn!("could not continue playback: {why}");
                controls::check_msg(
                    self.channel_id
                        .say(&self.ctx.http, format!("Playback stopped: {why}"))
                        .await,
                );
            }
        } else if let Some((channel, message)) = player.controls_message.take() {
            let _ = channel.delete_message(&self.ctx.http, message).await;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use songbird::tracks::TrackError;

    fn playing_player() -> GuildPlayer {
        let mut player = GuildPlayer::new();
        player.queue.enqueue(Song {
            title: "a".to_string(),
            url: "https://example.com/a".to_string(),
            duration: Some(Duration::from_secs(180)),
            duration_text: "3:00".to_string(),
            thumbnail: None,
            requested_by: None,
        });
        player.queue.mark_playing();
        player
    }

    #[test]
    fn pause_and_resume_flip_the_model_after_the_transport() {
        let mut player = playing_player();
        assert!(matches!(player.pause_with(|| Ok(())), Ok(true)));
        assert!(player.queue.is_paused());
        assert!(matches!(player.resume_with(|| Ok(())), Ok(true)));
        assert!(!player.queue.is_paused());
    }

    #[test]
    fn failed_transport_pause_leaves_the_model_running() {
        let mut player = playing_player();
        assert!(player.pause_with(|| Err(TrackError::Finished)).is_err());
        assert!(!player.queue.is_paused());
        assert!(player.queue.is_playing());
    }

    #[test]
    fn failed_transport_resume_stays_paused() {
        let mut player = playing_player();
        player.pause_with(|| Ok(())).unwrap();
        assert!(player.resume_with(|| Err(TrackError::Finished)).is_err());
        assert!(player.queue.is_paused());
    }

    #[test]
    fn wrong_state_never_touches_the_transport() {
        let mut player = GuildPlayer::new();
        assert!(matches!(player.pause_with(|| unreachable!()), Ok(false)));
        assert!(matches!(player.resume_with(|| unreachable!()), Ok(false)));

        let mut player = playing_player();
        assert!(matches!(player.resume_with(|| unreachable!()), Ok(false)));
    }
}
