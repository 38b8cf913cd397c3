use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serenity::async_trait;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler};
use thiserror::Error;
use tokio::sync::mpsc;

/// Sample rate the transcription endpoint expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of decoded voice packets (stereo interleaved).
pub const DISCORD_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Reduces 48 kHz interleaved stereo to 16 kHz mono by taking the left
/// channel and then every third sample. Good enough for speech.
pub fn downmix_to_16k_mono(stereo_48k: &[i16]) -> Vec<i16> {
    stereo_48k.iter().step_by(2).step_by(3).copied().collect()
}

/// Wraps raw mono samples in a WAV container.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// A short sine tone played before the capture window opens, so speakers
/// know the bot is recording. Faded in and out to avoid clicks.
pub fn attention_tone_wav() -> Result<Vec<u8>, AudioError> {
    const FREQUENCY: f32 = 440.0;
    const AMPLITUDE: f32 = 6000.0;
    const SECONDS: f32 = 0.25;

    let total = (DISCORD_SAMPLE_RATE as f32 * SECONDS) as usize;
    let fade = DISCORD_SAMPLE_RATE as usize / 100;

    let samples: Vec<i16> = (0..total)
        .map(|i| {
            let t = i as f32 / DISCORD_SAMPLE_RATE as f32;
            let envelope = (i.min(total - i) as f32 / fade as f32).min(1.0);
            (AMPLITUDE * envelope * (TAU * FREQUENCY * t).sin()) as i16
        })
        .collect();

    pcm_to_wav(&samples, DISCORD_SAMPLE_RATE)
}

/// Accumulates downmixed samples while a capture window is open. Writers
/// outside the window are ignored.
#[derive(Default)]
pub struct CaptureBuffer {
    capturing: AtomicBool,
    samples: Mutex<Vec<i16>>,
}

impl CaptureBuffer {
    pub fn begin(&self) {
        self.lock().clear();
        self.capturing.store(true, Ordering::SeqCst);
    }

    /// Closes the window and hands back everything recorded during it.
    pub fn end(&self) -> Vec<i16> {
        self.capturing.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.lock())
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn extend(&self, samples: &[i16]) {
        if !self.is_capturing() {
            return;
        }
        self.lock().extend_from_slice(samples);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<i16>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards decoded voice packets out of the driver callback to the
/// session's listener task. Packets are dropped when the channel is full
/// rather than blocking the driver.
pub struct VoiceReceiver {
    frames: mpsc::Sender<Vec<i16>>,
}

impl VoiceReceiver {
    pub fn new(frames: mpsc::Sender<Vec<i16>>) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::VoicePacket(data) = ctx {
            if let Some(audio) = data.audio {
                if !audio.is_empty() {
                    let _ = self.frames.try_send(audio.clone());
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_takes_left_channel_of_every_third_frame() {
        // Interleaved frames: (10,-10) (11,-11) ... left channel of frames
        // 0, 3, 6, ... survives the 48k -> 16k decimation.
        let stereo: Vec<i16> = (0..8i16).flat_map(|i| [10 + i, -(10 + i)]).collect();
        assert_eq!(downmix_to_16k_mono(&stereo), vec![10, 13, 16]);
    }

    #[test]
    fn wav_output_has_riff_header_and_sample_data() {
        let wav = pcm_to_wav(&[0, 1, -1, 32767], TARGET_SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4 * 2);
    }

    #[test]
    fn attention_tone_is_a_nonempty_wav() {
        let wav = attention_tone_wav().unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert!(wav.len() > 44);
    }

    #[test]
    fn capture_buffer_records_only_inside_the_window() {
        let buffer = CaptureBuffer::default();
        buffer.extend(&[1, 2, 3]);
        assert!(!buffer.is_capturing());

        buffer.begin();
        assert!(buffer.is_capturing());
        buffer.extend(&[4, 5]);
        buffer.extend(&[6]);

        assert_eq!(buffer.end(), vec![4, 5, 6]);
        assert!(!buffer.is_capturing());
        buffer.extend(&[7]);
        assert_eq!(buffer.end(), Vec::<i16>::new());
    }
}
