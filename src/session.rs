use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::client::Context;
use serenity::model::id::{GuildId, UserId};
use serenity::prelude::TypeMapKey;
use songbird::tracks::TrackHandle;
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::{self, CaptureBuffer, VoiceReceiver};
use crate::chat::ChatStore;
use crate::llm::{ChatClient, LlmError};
use crate::stt::SttClient;
use crate::tts::SpeechClient;
use crate::wake::{contains_wake_phrase, BurstDetector};
use crate::{ConfigKey, ServicesKey};

/// Decoded voice frames buffered between the driver callback and the
/// listener task. Each frame is 20 ms, so this is about five seconds.
const FRAME_CHANNEL: usize = 256;
const DETECTION_CHANNEL: usize = 4;
const BATCH_CHANNEL: usize = 32;

/// Pause after an interruption, so leftover playback drains out of the
/// voice buffer before the next capture window opens.
const INTERRUPT_GRACE: Duration = Duration::from_millis(300);

/// How long to wait for the next sentence batch before giving up on a
/// stalled response.
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Captures smaller than this (in encoded bytes) are treated as silence.
const MIN_CAPTURE_BYTES: usize = 1000;

const APOLOGY_UNHEARD: &str = "Sorry, I didn't catch that.";
const APOLOGY_FAILED: &str = "Sorry, I'm having trouble answering right now.";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("voice session stopped")]
    Stopped,
    #[error("voice features are not configured")]
    NotConfigured,
    #[error("not connected to a voice channel")]
    NotInVoice,
    #[error("speech synthesis failed: {0}")]
    Tts(#[from] crate::tts::TtsError),
    #[error("audio encoding failed: {0}")]
    Audio(#[from] crate::audio::AudioError),
    #[error("could not load speech clip: {0}")]
    Source(#[from] songbird::input::error::Error),
    #[error("track control failed: {0}")]
    Track(#[from] songbird::tracks::TrackError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sent by the listener whenever the wake phrase is heard.
struct Detection;

struct SessionHandle {
    stop: CancellationToken,
}

/// Active voice sessions, one per guild at most.
#[derive(Default)]
pub struct Sessions {
    inner: RwLock<HashMap<u64, SessionHandle>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_active(&self, guild_id: u64) -> bool {
        self.inner.read().await.contains_key(&guild_id)
    }
}

pub struct SessionsKey;

impl TypeMapKey for SessionsKey {
    type Value = Arc<Sessions>;
}

pub async fn sessions(ctx: &Context) -> Arc<Sessions> {
    ctx.data
        .read()
        .await
        .get::<SessionsKey>()
        .expect("Sessions registry placed in at initialisation.")
        .clone()
}

/// Starts listening in the guild's voice call. Returns `Ok(false)` when a
/// session is already running there. Replies are spoken into the call and
/// the conversation history is kept under the invoking user.
pub async fn start(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<bool, SessionError> {
    let (config, services) = {
        let data = ctx.data.read().await;
        let config = data
            .get::<ConfigKey>()
            .expect("Config placed in at initialisation.")
            .clone();
        let services = data
            .get::<ServicesKey>()
            .expect("Services placed in at initialisation.")
            .clone();
        (config, services)
    };

    let (Some(chat), Some(stt), Some(tts)) = (
        services.chat.clone(),
        services.stt.clone(),
        services.tts.clone(),
    ) else {
        return Err(SessionError::NotConfigured);
    };

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();
    let Some(call) = manager.get(guild_id) else {
        return Err(SessionError::NotInVoice);
    };

    let sessions = sessions(ctx).await;
    let stop = CancellationToken::new();
    {
        let mut active = sessions.inner.write().await;
        if active.contains_key(&guild_id.0) {
            return Ok(false);
        }
        active.insert(guild_id.0, SessionHandle { stop: stop.clone() });
    }

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL);
    let (detection_tx, detection_rx) = mpsc::channel(DETECTION_CHANNEL);
    let capture = Arc::new(CaptureBuffer::default());
    let detector_paused = Arc::new(AtomicBool::new(false));

    call.lock().await.add_global_event(
        Event::Core(CoreEvent::VoicePacket),
        VoiceReceiver::new(frame_tx),
    );

    let listener = WakeListener {
        guild_id,
        frames: frame_rx,
        capture: capture.clone(),
        detector_paused: detector_paused.clone(),
        stt: stt.clone(),
        wake_phrase: config.wake_phrase.clone(),
        detections: detection_tx,
        stop: stop.clone(),
    };
    tokio::spawn(listener.run());

    let session = VoiceSession {
        guild_id,
        user_id: user_id.0,
        capture,
        detector_paused,
        chat,
        stt,
        chat_store: services.chat_store.clone(),
        capture_window: Duration::from_secs(config.capture_seconds),
        batch_chars: config.sentence_batch_chars,
        stop,
        sessions: sessions.clone(),
    };
    let speaker = TtsSpeaker {
        call,
        tts,
        active: None,
    };
    tokio::spawn(session.run(speaker, detection_rx));

    info!("voice session started in guild {}", guild_id.0);
    Ok(true)
}

/// Tears down the guild's session, if any. Returns whether one was running.
pub async fn stop(ctx: &Context, guild_id: GuildId) -> bool {
    let sessions = sessions(ctx).await;
    let handle = sessions.inner.write().await.remove(&guild_id.0);
    let Some(handle) = handle else {
        return false;
    };
    handle.stop.cancel();

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();
    if let Some(call) = manager.get(guild_id) {
        call.lock().await.remove_all_global_events();
    }

    info!("voice session stopped in guild {}", guild_id.0);
    true
}

/// Plays response audio into the call. The receiver resolves when the
/// clip finishes on its own.
#[async_trait]
trait Speaker: Send {
    async fn begin(&mut self, text: &str) -> Result<oneshot::Receiver<()>, SessionError>;
    async fn halt(&mut self);
}

struct TtsSpeaker {
    call: Arc<Mutex<Call>>,
    tts: Arc<SpeechClient>,
    active: Option<(TrackHandle, NamedTempFile)>,
}

impl TtsSpeaker {
    async fn play_tone(&mut self) -> Result<oneshot::Receiver<()>, SessionError> {
        let clip = audio::attention_tone_wav()?;
        self.play_clip(clip, ".wav").await
    }

    /// The temp file must outlive the track; ffmpeg reads it while the
    /// clip streams.
    async fn play_clip(
        &mut self,
        bytes: Vec<u8>,
        suffix: &str,
    ) -> Result<oneshot::Receiver<()>, SessionError> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        file.write_all(&bytes)?;
        file.flush()?;

        let source = songbird::input::ffmpeg(file.path()).await?;
        let handle = {
            let mut call = self.call.lock().await;
            call.play_source(source)
        };

        let (tx, rx) = oneshot::channel();
        handle.add_event(Event::Track(TrackEvent::End), SpeechEndNotifier::new(tx))?;
        self.active = Some((handle, file));
        Ok(rx)
    }
}

#[async_trait]
impl Speaker for TtsSpeaker {
    async fn begin(&mut self, text: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        let clip = self.tts.synthesize(text).await?;
        self.play_clip(clip, ".mp3").await
    }

    async fn halt(&mut self) {
        if let Some((handle, _file)) = self.active.take() {
            let _ = handle.stop();
        }
    }
}

struct SpeechEndNotifier {
    done: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl SpeechEndNotifier {
    fn new(done: oneshot::Sender<()>) -> Self {
        Self {
            done: std::sync::Mutex::new(Some(done)),
        }
    }
}

#[async_trait]
impl VoiceEventHandler for SpeechEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if let Ok(mut done) = self.done.lock() {
            if let Some(done) = done.take() {
                let _ = done.send(());
            }
        }

        None
    }
}

/// Reads decoded voice frames, segments them into speech bursts and fires
/// a detection when a burst transcribes to the wake phrase. While a
/// capture window is open the frames feed the capture buffer instead.
struct WakeListener {
    guild_id: GuildId,
    frames: mpsc::Receiver<Vec<i16>>,
    capture: Arc<CaptureBuffer>,
    detector_paused: Arc<AtomicBool>,
    stt: Arc<SttClient>,
    wake_phrase: String,
    detections: mpsc::Sender<Detection>,
    stop: CancellationToken,
}

impl WakeListener {
    async fn run(mut self) {
        let mut detector = BurstDetector::new();

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                frame = self.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let samples = audio::downmix_to_16k_mono(&frame);
            if self.capture.is_capturing() {
                self.capture.extend(&samples);
                continue;
            }
            if self.detector_paused.load(Ordering::SeqCst) {
                detector.reset();
                continue;
            }

            let Some(burst) = detector.feed(&samples) else {
                continue;
            };
            let wav = match audio::pcm_to_wav(&burst, audio::TARGET_SAMPLE_RATE) {
                Ok(wav) => wav,
                Err(why) => {
                    warn!("could not encode speech burst: {why}");
                    continue;
                }
            };
            let transcript = match self.stt.transcribe(wav).await {
                Ok(transcript) => transcript,
                Err(why) => {
                    warn!("could not transcribe speech burst: {why}");
                    continue;
                }
            };

            if contains_wake_phrase(&transcript, &self.wake_phrase) {
                info!("wake phrase heard in guild {}", self.guild_id.0);
                let _ = self.detections.try_send(Detection);
            }
        }
    }
}

enum ExchangeEnd {
    Done,
    Interrupted,
}

/// One guild's assistant loop: waits for a wake detection, then runs
/// capture/transcribe/answer exchanges until the session stops.
struct VoiceSession {
    guild_id: GuildId,
    user_id: u64,
    capture: Arc<CaptureBuffer>,
    detector_paused: Arc<AtomicBool>,
    chat: Arc<ChatClient>,
    stt: Arc<SttClient>,
    chat_store: Arc<ChatStore>,
    capture_window: Duration,
    batch_chars: usize,
    stop: CancellationToken,
    sessions: Arc<Sessions>,
}

impl VoiceSession {
    async fn run(self, mut speaker: TtsSpeaker, mut detections: mpsc::Receiver<Detection>) {
        info!("voice session active in guild {}", self.guild_id.0);

        'session: loop {
            // Detections fired during the previous response are stale; a
            // fresh wake phrase is needed to open the next exchange.
            while detections.try_recv().is_ok() {}

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break 'session,
                detection = detections.recv() => {
                    if detection.is_none() {
                        break 'session;
                    }
                }
            }

            loop {
                match self.exchange(&mut speaker, &mut detections).await {
                    Ok(ExchangeEnd::Interrupted) => continue,
                    Ok(ExchangeEnd::Done) => break,
                    Err(SessionError::Stopped) => break 'session,
                    Err(why) => {
                        warn!("voice exchange failed in guild {}: {why}", self.guild_id.0);
                        break;
                    }
                }
            }
        }

        speaker.halt().await;
        if !self.stop.is_cancelled() {
            self.sessions.inner.write().await.remove(&self.guild_id.0);
        }
        info!("voice session ended in guild {}", self.guild_id.0);
    }

    /// One round: tone, capture window, transcription, then the streamed
    /// answer. An interruption by the wake phrase reports back so the
    /// caller can go straight into a new capture.
    async fn exchange(
        &self,
        speaker: &mut TtsSpeaker,
        detections: &mut mpsc::Receiver<Detection>,
    ) -> Result<ExchangeEnd, SessionError> {
        self.detector_paused.store(true, Ordering::SeqCst);
        let captured = self.capture_question(speaker).await;
        self.detector_paused.store(false, Ordering::SeqCst);
        let samples = captured?;

        if samples.len() * 2 < MIN_CAPTURE_BYTES {
            info!("capture too short in guild {}", self.guild_id.0);
            return self.apologize(speaker, APOLOGY_UNHEARD).await;
        }

        let wav = audio::pcm_to_wav(&samples, audio::TARGET_SAMPLE_RATE)?;
        let question = match self.stt.transcribe(wav).await {
            Ok(question) => question,
            Err(why) => {
                warn!("could not transcribe question: {why}");
                return self.apologize(speaker, APOLOGY_UNHEARD).await;
            }
        };
        if question.is_empty() {
            return self.apologize(speaker, APOLOGY_UNHEARD).await;
        }
        info!("guild {} question: {question}", self.guild_id.0);

        self.chat_store.push_user(self.user_id, &question);
        let messages = self.chat_store.messages_for(self.user_id);

        let (batch_tx, mut batch_rx) = mpsc::channel(BATCH_CHANNEL);
        let cancel = CancellationToken::new();
        let generator = tokio::spawn({
            let chat = self.chat.clone();
            let cancel = cancel.clone();
            let batch_chars = self.batch_chars;
            async move {
                chat.stream_sentences(messages, batch_chars, cancel, batch_tx)
                    .await
            }
        });

        match speak_and_record(
            speaker,
            &mut batch_rx,
            detections,
            &cancel,
            &self.stop,
            generator,
            &self.chat_store,
            self.user_id,
        )
        .await
        {
            ResponseEnd::Done => Ok(ExchangeEnd::Done),
            ResponseEnd::Failed => self.apologize(speaker, APOLOGY_FAILED).await,
            ResponseEnd::Interrupted => Ok(ExchangeEnd::Interrupted),
            ResponseEnd::Stopped => Err(SessionError::Stopped),
        }
    }

    /// Rings the attention tone, then records the capture window. The
    /// interrupted question audio is discarded when the session stops.
    async fn capture_question(&self, speaker: &mut TtsSpeaker) -> Result<Vec<i16>, SessionError> {
        let ring = speaker.play_tone().await?;
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                speaker.halt().await;
                return Err(SessionError::Stopped);
            }
            _ = ring => {}
        }

        self.capture.begin();
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.capture.end();
                return Err(SessionError::Stopped);
            }
            _ = tokio::time::sleep(self.capture_window) => {}
        }
        Ok(self.capture.end())
    }

    async fn apologize(
        &self,
        speaker: &mut TtsSpeaker,
        line: &str,
    ) -> Result<ExchangeEnd, SessionError> {
        let done = match speaker.begin(line).await {
            Ok(done) => done,
            Err(why) => {
                warn!("could not speak apology: {why}");
                return Ok(ExchangeEnd::Done);
            }
        };

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                speaker.halt().await;
                Err(SessionError::Stopped)
            }
            _ = done => Ok(ExchangeEnd::Done),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ResponseEnd {
    Done,
    Failed,
    Interrupted,
    Stopped,
}

/// The speaking half of an exchange. Wake phrases heard while the question
/// was still being captured or transcribed are stale, not interruptions,
/// so they are drained before the first batch plays. The finished answer
/// is recorded in the conversation history; an answer cut short by an
/// interruption or stop never is.
async fn speak_and_record<S: Speaker>(
    speaker: &mut S,
    batches: &mut mpsc::Receiver<String>,
    detections: &mut mpsc::Receiver<Detection>,
    cancel: &CancellationToken,
    stop: &CancellationToken,
    generator: JoinHandle<Result<String, LlmError>>,
    chat_store: &ChatStore,
    user_id: u64,
) -> ResponseEnd {
    while detections.try_recv().is_ok() {}

    match speak_batches(speaker, batches, detections, cancel, stop).await {
        SpeakOutcome::Finished => match generator.await {
            Ok(Ok(answer)) => {
                let answer = answer.trim();
                if !answer.is_empty() {
                    chat_store.push_assistant(user_id, answer);
                }
                ResponseEnd::Done
            }
            Ok(Err(LlmError::Cancelled)) => ResponseEnd::Done,
            Ok(Err(why)) => {
                warn!("could not answer question: {why}");
                ResponseEnd::Failed
            }
            Err(why) => {
                warn!("generator task failed: {why}");
                ResponseEnd::Done
            }
        },
        SpeakOutcome::Interrupted => {
            generator.abort();
            ResponseEnd::Interrupted
        }
        SpeakOutcome::TimedOut => {
            warn!("response stalled, dropping the rest");
            generator.abort();
            ResponseEnd::Done
        }
        SpeakOutcome::Stopped => {
            generator.abort();
            ResponseEnd::Stopped
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SpeakOutcome {
    Finished,
    Interrupted,
    TimedOut,
    Stopped,
}

/// Speaks sentence batches as they arrive until the channel closes. A wake
/// detection interrupts the current clip and discards everything queued
/// behind it; `cancel` tells the generator to stop producing.
async fn speak_batches<S: Speaker>(
    speaker: &mut S,
    batches: &mut mpsc::Receiver<String>,
    detections: &mut mpsc::Receiver<Detection>,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> SpeakOutcome {
    loop {
        let batch = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                cancel.cancel();
                speaker.halt().await;
                return SpeakOutcome::Stopped;
            }
            Some(_) = detections.recv() => {
                return interrupt(speaker, batches, cancel).await;
            }
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => return SpeakOutcome::Finished,
            },
            _ = tokio::time::sleep(BATCH_TIMEOUT) => {
                cancel.cancel();
                speaker.halt().await;
                return SpeakOutcome::TimedOut;
            }
        };

        let done = match speaker.begin(&batch).await {
            Ok(done) => done,
            Err(why) => {
                warn!("could not speak batch: {why}");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                cancel.cancel();
                speaker.halt().await;
                return SpeakOutcome::Stopped;
            }
            Some(_) = detections.recv() => {
                return interrupt(speaker, batches, cancel).await;
            }
            _ = done => {}
        }
    }
}

async fn interrupt<S: Speaker>(
    speaker: &mut S,
    batches: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> SpeakOutcome {
    cancel.cancel();
    speaker.halt().await;
    while batches.try_recv().is_ok() {}
    tokio::time::sleep(INTERRUPT_GRACE).await;
    SpeakOutcome::Interrupted
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct MockSpeaker {
        spoken: Vec<String>,
        halted: usize,
    }

    #[async_trait]
    impl Speaker for MockSpeaker {
        async fn begin(&mut self, text: &str) -> Result<oneshot::Receiver<()>, SessionError> {
            self.spoken.push(text.to_string());
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(());
            Ok(rx)
        }

        async fn halt(&mut self) {
            self.halted += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batches_play_in_order_when_uninterrupted() {
        let mut speaker = MockSpeaker::default();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (_detection_tx, mut detection_rx) = mpsc::channel::<Detection>(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        batch_tx.send("One.".to_string()).await.unwrap();
        batch_tx.send("Two.".to_string()).await.unwrap();
        drop(batch_tx);

        let outcome =
            speak_batches(&mut speaker, &mut batch_rx, &mut detection_rx, &cancel, &stop).await;

        assert_eq!(outcome, SpeakOutcome::Finished);
        assert_eq!(speaker.spoken, vec!["One.".to_string(), "Two.".to_string()]);
        assert!(!cancel.is_cancelled());
        assert_eq!(speaker.halted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_detection_discards_the_whole_response() {
        let mut speaker = MockSpeaker::default();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (detection_tx, mut detection_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        batch_tx.send("First sentence.".to_string()).await.unwrap();
        batch_tx.send("Second sentence.".to_string()).await.unwrap();
        detection_tx.send(Detection).await.unwrap();

        let outcome =
            speak_batches(&mut speaker, &mut batch_rx, &mut detection_rx, &cancel, &stop).await;

        assert_eq!(outcome, SpeakOutcome::Interrupted);
        assert!(cancel.is_cancelled());
        assert!(speaker.spoken.is_empty());
        assert_eq!(speaker.halted, 1);
        assert!(batch_rx.try_recv().is_err());
    }

    /// Speaker whose clips never finish on their own, so an interruption
    /// has to cut them short.
    struct StallingSpeaker {
        spoken: Arc<StdMutex<Vec<String>>>,
        halted: Arc<AtomicUsize>,
        keep: Vec<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl Speaker for StallingSpeaker {
        async fn begin(&mut self, text: &str) -> Result<oneshot::Receiver<()>, SessionError> {
            self.spoken.lock().unwrap().push(text.to_string());
            let (tx, rx) = oneshot::channel();
            self.keep.push(tx);
            Ok(rx)
        }

        async fn halt(&mut self) {
            self.halted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wake_during_playback_interrupts_the_current_clip() {
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let halted = Arc::new(AtomicUsize::new(0));
        let mut speaker = StallingSpeaker {
            spoken: spoken.clone(),
            halted: halted.clone(),
            keep: Vec::new(),
        };

        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (detection_tx, mut detection_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let stop = CancellationToken::new();

        batch_tx.send("A long sentence.".to_string()).await.unwrap();

        let task = tokio::spawn(async move {
            speak_batches(
                &mut speaker,
                &mut batch_rx,
                &mut detection_rx,
                &task_cancel,
                &stop,
            )
            .await
        });

        // Let the task start playing the batch before the wake fires.
        tokio::task::yield_now().await;
        assert_eq!(spoken.lock().unwrap().len(), 1);

        detection_tx.send(Detection).await.unwrap();
        let outcome = task.await.unwrap();

        assert_eq!(outcome, SpeakOutcome::Interrupted);
        assert!(cancel.is_cancelled());
        assert!(halted.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detections_from_the_capture_phase_do_not_interrupt() {
        let mut speaker = MockSpeaker::default();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (detection_tx, mut detection_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let store = ChatStore::new(String::new());

        // Heard while the question was still being transcribed.
        detection_tx.send(Detection).await.unwrap();

        batch_tx.send("The answer.".to_string()).await.unwrap();
        drop(batch_tx);
        let generator = tokio::spawn(async { Ok::<_, LlmError>("The answer.".to_string()) });

        let end = speak_and_record(
            &mut speaker,
            &mut batch_rx,
            &mut detection_rx,
            &cancel,
            &stop,
            generator,
            &store,
            1,
        )
        .await;

        assert_eq!(end, ResponseEnd::Done);
        assert_eq!(speaker.spoken, vec!["The answer.".to_string()]);
        assert_eq!(store.history_len(1), 1);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_answer_is_not_recorded() {
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let halted = Arc::new(AtomicUsize::new(0));
        let mut speaker = StallingSpeaker {
            spoken: spoken.clone(),
            halted: halted.clone(),
            keep: Vec::new(),
        };

        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (detection_tx, mut detection_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let store = Arc::new(ChatStore::new(String::new()));
        store.push_user(1, "what time is it");

        batch_tx.send("It is noon.".to_string()).await.unwrap();
        let generator =
            tokio::spawn(async { futures::future::pending::<Result<String, LlmError>>().await });

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let store = store.clone();
            async move {
                speak_and_record(
                    &mut speaker,
                    &mut batch_rx,
                    &mut detection_rx,
                    &cancel,
                    &stop,
                    generator,
                    &store,
                    1,
                )
                .await
            }
        });

        // Let the answer start playing before the wake phrase cuts in.
        tokio::task::yield_now().await;
        assert_eq!(spoken.lock().unwrap().len(), 1);

        detection_tx.send(Detection).await.unwrap();
        let end = task.await.unwrap();

        assert_eq!(end, ResponseEnd::Interrupted);
        assert!(cancel.is_cancelled());
        assert!(halted.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.history_len(1), 1);
        assert_eq!(
            store.messages_for(1).last().map(|m| m.role.clone()),
            Some("user".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_ends_the_response() {
        let mut speaker = MockSpeaker::default();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (_detection_tx, mut detection_rx) = mpsc::channel::<Detection>(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        batch_tx.send("Never spoken.".to_string()).await.unwrap();
        stop.cancel();

        let outcome =
            speak_batches(&mut speaker, &mut batch_rx, &mut detection_rx, &cancel, &stop).await;

        assert_eq!(outcome, SpeakOutcome::Stopped);
        assert!(cancel.is_cancelled());
        assert!(speaker.spoken.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generator_times_out() {
        let mut speaker = MockSpeaker::default();
        let (_batch_tx, mut batch_rx) = mpsc::channel::<String>(8);
        let (_detection_tx, mut detection_rx) = mpsc::channel::<Detection>(4);
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        let outcome =
            speak_batches(&mut speaker, &mut batch_rx, &mut detection_rx, &cancel, &stop).await;

        assert_eq!(outcome, SpeakOutcome::TimedOut);
        assert!(cancel.is_cancelled());
        assert!(speaker.spoken.is_empty());
    }
}
