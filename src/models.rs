use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

/// How many finished tracks are kept for the `previous` command.
pub const HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Song,
    Queue,
}

impl LoopMode {
    pub fn cycled(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Song,
            LoopMode::Song => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LoopMode::Off => "Off",
            LoopMode::Song => "Song",
            LoopMode::Queue => "Queue",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "off" | "none" => Some(LoopMode::Off),
            "song" | "track" | "one" => Some(LoopMode::Song),
            "queue" | "all" => Some(LoopMode::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Song {
    pub title: String,
    pub url: String,
    pub duration: Option<Duration>,
    pub duration_text: String,
    pub thumbnail: Option<String>,
    pub requested_by: Option<String>,
}

/// Per-guild playback state. While a track is active it stays at the front
/// of `songs`; `advance` applies the loop mode once that track ends.
#[derive(Debug, Default)]
pub struct GuildQueue {
    songs: VecDeque<Song>,
    history: VecDeque<Song>,
    loop_mode: LoopMode,
    playing: bool,
    paused: bool,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl GuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a song to the back of the queue. Returns `true` when nothing is
    /// active and the caller should start playback of the front.
    pub fn enqueue(&mut self, song: Song) -> bool {
        self.songs.push_back(song);
        !self.playing
    }

    /// Adds a batch of songs, returning how many were added and whether
    /// playback should start.
    pub fn enqueue_all(&mut self, songs: Vec<Song>) -> (usize, bool) {
        let added = songs.len();
        for song in songs {
            self.songs.push_back(song);
        }
        (added, added > 0 && !self.playing)
    }

    /// Stamps the front song as the active track.
    pub fn mark_playing(&mut self) {
        self.playing = true;
        self.paused = false;
        self.started_at = Some(Instant::now());
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
    }

    pub fn mark_stopped(&mut self) {
        self.playing = false;
        self.paused = false;
        self.started_at = None;
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
    }

    pub fn current(&self) -> Option<&Song> {
        if self.playing {
            self.songs.front()
        } else {
            None
        }
    }

    pub fn front(&self) -> Option<&Song> {
        self.songs.front()
    }

    /// Applies the loop mode after the active track ended. Returns `true`
    /// when a next track is waiting at the front.
    pub fn advance(&mut self) -> bool {
        self.mark_stopped();
        match self.loop_mode {
            LoopMode::Off => {
                if let Some(done) = self.songs.pop_front() {
                    self.push_history(done);
                }
            }
            LoopMode::Song => {}
            LoopMode::Queue => {
                if let Some(done) = self.songs.pop_front() {
                    self.push_history(done.clone());
                    self.songs.push_back(done);
                }
            }
        }
        !self.songs.is_empty()
    }

    /// Removes an unplayable front song without recording it as played.
    pub fn drop_front(&mut self) -> Option<Song> {
        self.mark_stopped();
        self.songs.pop_front()
    }

    pub fn pause(&mut self) -> bool {
        if !self.playing || self.paused {
            return false;
        }
        self.paused = true;
        self.paused_at = Some(Instant::now());
        true
    }

    pub fn resume(&mut self) -> bool {
        if !self.playing || !self.paused {
            return false;
        }
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
        self.paused = false;
        true
    }

    /// Moves the most recently played track back to the front. The
    /// interrupted current track stays in the queue right behind it.
    pub fn previous_restore(&mut self) -> bool {
        match self.history.pop_back() {
            Some(last) => {
                self.songs.push_front(last);
                true
            }
            None => false,
        }
    }

    /// Empties the queue, keeping the play history. Returns how many songs
    /// were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.songs.len();
        self.songs.clear();
        self.mark_stopped();
        removed
    }

    /// Shuffles everything behind the front slot. Returns `false` when there
    /// are not at least two songs.
    pub fn shuffle_with<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.songs.len() < 2 {
            return false;
        }
        self.songs.make_contiguous()[1..].shuffle(rng);
        true
    }

    /// Elapsed playback time of the active track, excluding time spent
    /// paused. Zero while paused or when nothing is active.
    pub fn position(&self) -> Duration {
        if !self.playing || self.paused {
            return Duration::ZERO;
        }
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let elapsed = started_at
            .elapsed()
            .checked_sub(self.paused_total)
            .unwrap_or_default();
        match self.current().and_then(|song| song.duration) {
            Some(total) => elapsed.min(total),
            None => elapsed,
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn cycle_loop_mode(&mut self) -> LoopMode {
        self.loop_mode = self.loop_mode.cycled();
        self.loop_mode
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_played(&self) -> Option<&Song> {
        self.history.back()
    }

    pub fn snapshot(&self) -> Vec<Song> {
        self.songs.iter().cloned().collect()
    }

    fn push_history(&mut self, song: Song) {
        self.history.push_back(song);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }
}

pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "?:??".to_string();
    };
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn song(title: &str) -> Song {
        Song {
            title: title.to_string(),
            url: format!("https://example.com/{title}"),
            duration: Some(Duration::from_secs(180)),
            duration_text: "3:00".to_string(),
            thumbnail: None,
            requested_by: None,
        }
    }

    fn playing_queue(titles: &[&str]) -> GuildQueue {
        let mut queue = GuildQueue::new();
        for title in titles {
            queue.enqueue(song(title));
        }
        queue.mark_playing();
        queue
    }

    #[test]
    fn enqueue_signals_start_only_when_idle() {
        let mut queue = GuildQueue::new();
        assert!(queue.enqueue(song("a")));
        queue.mark_playing();
        assert!(!queue.enqueue(song("b")));
        queue.pause();
        assert!(!queue.enqueue(song("c")));
    }

    #[test]
    fn advance_with_loop_off_moves_current_to_history() {
        let mut queue = playing_queue(&["a", "b", "c"]);
        assert!(queue.advance());
        assert_eq!(queue.front().map(|s| s.title.as_str()), Some("b"));
        assert_eq!(queue.last_played().map(|s| s.title.as_str()), Some("a"));
        assert_eq!(queue.history_len(), 1);
        assert!(!queue.is_playing());
    }

    #[test]
    fn advance_with_loop_song_replays_current() {
        let mut queue = playing_queue(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Song);
        assert!(queue.advance());
        assert_eq!(queue.front().map(|s| s.title.as_str()), Some("a"));
        assert_eq!(queue.history_len(), 0);
    }

    #[test]
    fn advance_with_loop_queue_rotates_to_back() {
        let mut queue = playing_queue(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);
        assert!(queue.advance());
        let titles: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["b", "c", "a"]);
        assert_eq!(queue.last_played().map(|s| s.title.as_str()), Some("a"));
    }

    #[test]
    fn full_pass_under_loop_queue_restores_the_order() {
        let mut queue = playing_queue(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);
        let before: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();

        for _ in 0..3 {
            assert!(queue.advance());
            queue.mark_playing();
        }

        let after: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();
        assert_eq!(before, after);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn advance_on_drained_queue_reports_nothing_left() {
        let mut queue = playing_queue(&["a"]);
        assert!(!queue.advance());
        assert!(queue.is_empty());
        assert_eq!(queue.history_len(), 1);
    }

    #[test]
    fn history_drops_oldest_beyond_capacity() {
        let mut queue = GuildQueue::new();
        for i in 0..HISTORY_CAPACITY + 5 {
            queue.enqueue(song(&format!("s{i:02}")));
        }
        queue.mark_playing();
        while queue.advance() {}
        assert_eq!(queue.history_len(), HISTORY_CAPACITY);
        assert_eq!(queue.last_played().map(|s| s.title.as_str()), Some("s14"));
    }

    #[test]
    fn previous_restores_last_played_ahead_of_current() {
        let mut queue = playing_queue(&["a", "b"]);
        queue.advance();
        queue.mark_playing();
        assert!(queue.previous_restore());
        let titles: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert_eq!(queue.history_len(), 0);
    }

    #[test]
    fn previous_on_empty_history_is_rejected() {
        let mut queue = playing_queue(&["a"]);
        assert!(!queue.previous_restore());
    }

    #[test]
    fn pause_and_resume_reject_invalid_transitions() {
        let mut queue = GuildQueue::new();
        assert!(!queue.pause());
        queue.enqueue(song("a"));
        queue.mark_playing();
        assert!(queue.pause());
        assert!(!queue.pause());
        assert!(queue.resume());
        assert!(!queue.resume());
    }

    #[test]
    fn shuffle_keeps_active_front_in_place() {
        let mut queue = playing_queue(&["a", "b", "c", "d", "e", "f"]);
        let before: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(queue.shuffle_with(&mut rng));
        let after: Vec<_> = queue.snapshot().into_iter().map(|s| s.title).collect();
        assert_eq!(after[0], "a");
        assert_ne!(before, after);
        let mut sorted_before = before;
        let mut sorted_after = after;
        sorted_before.sort();
        sorted_after.sort();
        assert_eq!(sorted_before, sorted_after);
    }

    #[test]
    fn shuffle_needs_at_least_two_songs() {
        let mut queue = playing_queue(&["a"]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(!queue.shuffle_with(&mut rng));
    }

    #[test]
    fn clear_empties_queue_but_keeps_history() {
        let mut queue = playing_queue(&["a", "b", "c"]);
        queue.advance();
        queue.mark_playing();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_playing());
        assert_eq!(queue.history_len(), 1);
    }

    #[test]
    fn position_is_zero_when_idle_and_while_paused() {
        let mut queue = GuildQueue::new();
        assert_eq!(queue.position(), Duration::ZERO);
        queue.enqueue(song("a"));
        queue.mark_playing();
        assert!(queue.position() < Duration::from_secs(1));
        queue.pause();
        assert_eq!(queue.position(), Duration::ZERO);
        queue.resume();
        assert!(queue.position() < Duration::from_secs(1));
    }

    #[test]
    fn position_is_capped_at_track_duration() {
        let mut queue = GuildQueue::new();
        let mut short = song("a");
        short.duration = Some(Duration::ZERO);
        queue.enqueue(short);
        queue.mark_playing();
        assert_eq!(queue.position(), Duration::ZERO);
    }

    #[test]
    fn loop_mode_cycles_off_song_queue() {
        let mut queue = GuildQueue::new();
        assert_eq!(queue.cycle_loop_mode(), LoopMode::Song);
        assert_eq!(queue.cycle_loop_mode(), LoopMode::Queue);
        assert_eq!(queue.cycle_loop_mode(), LoopMode::Off);
    }

    #[test]
    fn format_duration_handles_hours_and_unknown() {
        assert_eq!(format_duration(Some(Duration::from_secs(61))), "1:01");
        assert_eq!(format_duration(Some(Duration::from_secs(3725))), "1:02:05");
        assert_eq!(format_duration(None), "?:??");
    }
}
