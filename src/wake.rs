use tracing::trace;

/// Minimum RMS energy to consider a frame speech.
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum amount of speech for a burst to be worth transcribing
/// (samples at 16 kHz, 0.3 seconds).
const MIN_SPEECH_SAMPLES: usize = 4_800;

/// Trailing silence that ends a burst (0.5 seconds).
const SILENCE_SAMPLES: usize = 8_000;

/// Hard cap on a single burst (5 seconds), in case someone never pauses.
const MAX_BURST_SAMPLES: usize = 16_000 * 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Speaking,
    Trailing,
}

/// Segments the incoming mono stream into speech bursts using RMS energy.
/// A burst is returned once speech is followed by enough silence; the
/// caller transcribes it and checks for the wake phrase.
pub struct BurstDetector {
    state: DetectorState,
    buffer: Vec<i16>,
    speech_samples: usize,
    silence_samples: usize,
}

impl Default for BurstDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BurstDetector {
    pub fn new() -> Self {
        Self {
            state: DetectorState::Idle,
            buffer: Vec::new(),
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    pub fn feed(&mut self, frame: &[i16]) -> Option<Vec<i16>> {
        if frame.is_empty() {
            return None;
        }

        let energy = frame_energy(frame);
        let is_speech = energy >= ENERGY_THRESHOLD;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    trace!(energy, "speech started");
                    self.state = DetectorState::Speaking;
                    self.buffer.extend_from_slice(frame);
                    self.speech_samples = frame.len();
                    self.silence_samples = 0;
                }
            }
            DetectorState::Speaking | DetectorState::Trailing => {
                self.buffer.extend_from_slice(frame);
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.speech_samples += frame.len();
                    self.silence_samples = 0;
                } else {
                    self.state = DetectorState::Trailing;
                    self.silence_samples += frame.len();
                    if self.silence_samples >= SILENCE_SAMPLES {
                        return self.finish_burst();
                    }
                }
            }
        }

        if self.buffer.len() >= MAX_BURST_SAMPLES {
            return self.finish_burst();
        }

        None
    }

    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.buffer.clear();
        self.speech_samples = 0;
        self.silence_samples = 0;
    }

    fn finish_burst(&mut self) -> Option<Vec<i16>> {
        let long_enough = self.speech_samples >= MIN_SPEECH_SAMPLES;
        let burst = std::mem::take(&mut self.buffer);
        self.reset();
        long_enough.then_some(burst)
    }
}

/// RMS energy of a frame, with samples normalized to [-1, 1].
fn frame_energy(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = frame
        .iter()
        .map(|&s| {
            let normalized = f32::from(s) / 32_768.0;
            normalized * normalized
        })
        .sum();
    (sum_squares / frame.len() as f32).sqrt()
}

/// Whether the transcript contains the wake phrase. Case and punctuation
/// are ignored so "Hey, Jarvis!" matches the phrase "hey jarvis".
pub fn contains_wake_phrase(transcript: &str, phrase: &str) -> bool {
    let normalized = normalize(transcript);
    let phrase = normalize(phrase);
    !phrase.is_empty() && normalized.contains(&phrase)
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech(frames: usize) -> Vec<Vec<i16>> {
        vec![vec![8_000; 1_600]; frames]
    }

    fn silence(frames: usize) -> Vec<Vec<i16>> {
        vec![vec![0; 1_600]; frames]
    }

    fn feed_all(detector: &mut BurstDetector, frames: &[Vec<i16>]) -> Option<Vec<i16>> {
        let mut result = None;
        for frame in frames {
            if let Some(burst) = detector.feed(frame) {
                result = Some(burst);
            }
        }
        result
    }

    #[test]
    fn energy_separates_silence_from_speech() {
        assert!(frame_energy(&vec![0; 100]) < 0.001);
        assert!(frame_energy(&vec![16_384; 100]) > 0.4);
        assert_eq!(frame_energy(&[]), 0.0);
    }

    #[test]
    fn silence_never_produces_a_burst() {
        let mut detector = BurstDetector::new();
        assert!(feed_all(&mut detector, &silence(20)).is_none());
    }

    #[test]
    fn speech_followed_by_silence_produces_a_burst() {
        let mut detector = BurstDetector::new();
        assert!(feed_all(&mut detector, &speech(4)).is_none());
        let burst = feed_all(&mut detector, &silence(5)).expect("burst");
        assert_eq!(burst.len(), 4 * 1_600 + 5 * 1_600);
    }

    #[test]
    fn short_blips_are_discarded() {
        let mut detector = BurstDetector::new();
        assert!(feed_all(&mut detector, &speech(1)).is_none());
        assert!(feed_all(&mut detector, &silence(6)).is_none());

        // The detector is back to idle and a real burst still works.
        assert!(feed_all(&mut detector, &speech(4)).is_none());
        assert!(feed_all(&mut detector, &silence(5)).is_some());
    }

    #[test]
    fn runaway_speech_is_capped() {
        let mut detector = BurstDetector::new();
        let burst = feed_all(&mut detector, &speech(60)).expect("capped burst");
        assert_eq!(burst.len(), MAX_BURST_SAMPLES);
    }

    #[test]
    fn brief_dips_do_not_split_a_burst() {
        let mut detector = BurstDetector::new();
        assert!(feed_all(&mut detector, &speech(2)).is_none());
        assert!(feed_all(&mut detector, &silence(2)).is_none());
        assert!(feed_all(&mut detector, &speech(2)).is_none());
        let burst = feed_all(&mut detector, &silence(5)).expect("burst");
        assert_eq!(burst.len(), 11 * 1_600);
    }

    #[test]
    fn wake_phrase_matching_ignores_case_and_punctuation() {
        assert!(contains_wake_phrase("Hey, Jarvis! What's up?", "hey jarvis"));
        assert!(contains_wake_phrase("JARVIS", "jarvis"));
        assert!(contains_wake_phrase("uh jarvis?", "jarvis"));
        assert!(!contains_wake_phrase("completely unrelated", "jarvis"));
        assert!(!contains_wake_phrase("hey jar vis", "jarvis"));
        assert!(!contains_wake_phrase("anything", ""));
    }
}
