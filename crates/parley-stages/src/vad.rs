//! Energy-based Voice Activity Detection (VAD).

/// Samples per second the bundled stages assume.
pub const SAMPLE_RATE: u32 = 16_000;

/// Analysis frame length in ms.
pub const FRAME_MS: u64 = 20;

/// Samples in one 20ms analysis frame at 16kHz.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as u64 * FRAME_MS / 1000) as usize;

/// State change reported by [`VoiceActivityDetector::process_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    /// Enough consecutive silent frames followed speech: the utterance is over.
    SpeechEnded,
}

/// Root-mean-square energy of a PCM frame; 0 for an empty frame.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
    (energy / samples.len() as f64).sqrt()
}

/// Energy-threshold speech detector over fixed-size PCM frames.
///
/// Speech starts on the first frame above the threshold and ends after
/// `hangover_frames` consecutive frames at or below it.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    rms_threshold: f64,
    hangover_frames: usize,
    in_speech: bool,
    silence_run: usize,
}

impl VoiceActivityDetector {
    pub fn new(rms_threshold: f64, hangover_frames: usize) -> Self {
        Self {
            rms_threshold,
            hangover_frames: hangover_frames.max(1),
            in_speech: false,
            silence_run: 0,
        }
    }

    /// Hangover given as a silence duration, rounded up to whole frames.
    pub fn with_silence_ms(rms_threshold: f64, silence_ms: u64) -> Self {
        Self::new(rms_threshold, silence_ms.div_ceil(FRAME_MS) as usize)
    }

    /// Threshold 300, ~300ms hangover.
    pub fn default_16khz() -> Self {
        Self::with_silence_ms(300.0, 300)
    }

    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadEvent> {
        let loud = rms(pcm) > self.rms_threshold;

        match (self.in_speech, loud) {
            (false, true) => {
                self.in_speech = true;
                self.silence_run = 0;
                Some(VadEvent::SpeechStarted)
            }
            (true, true) => {
                self.silence_run = 0;
                None
            }
            (true, false) => {
                self.silence_run += 1;
                if self.silence_run < self.hangover_frames {
                    return None;
                }
                self.reset();
                Some(VadEvent::SpeechEnded)
            }
            (false, false) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.in_speech
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_run = 0;
    }
}
