//! Utterance segmentation: the VAD phase machine.
//!
//! Frames are classified one at a time and drive a four-phase machine:
//! Silence → Speaking ⇄ Pause → SpeechComplete → (reset) → Silence.
//! A completed utterance is the buffered audio from speech onset minus padding
//! to silence onset plus padding. Buffers are cleared after every completion so
//! memory stays bounded between utterances.

use crate::audio::{ms_to_samples, pcm16_samples, pcm16_to_wav, samples_to_ms, BYTES_PER_SAMPLE};
use crate::error::VoiceResult;
use crate::vad::{FrameClassifier, SpeechClassifier, VadConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// While waiting for speech, the buffer is trimmed once it grows past this.
const SILENCE_BUFFER_MAX_MS: u32 = 5000;

/// Tail kept after trimming, so onset padding still has audio to draw from.
const SILENCE_TAIL_MS: u32 = 500;

/// Phase of the segmentation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechPhase {
    /// No speech detected.
    Silence,
    /// User is actively speaking.
    Speaking,
    /// Speech paused; counting silence toward the end-of-speech threshold.
    Pause,
    /// Speech finished; reported for the frame that closed the utterance.
    SpeechComplete,
}

impl SpeechPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechPhase::Silence => "silence",
            SpeechPhase::Speaking => "speaking",
            SpeechPhase::Pause => "pause",
            SpeechPhase::SpeechComplete => "complete",
        }
    }
}

/// A completed utterance: padded PCM from speech onset to silence onset.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// 16-bit little-endian mono PCM.
    pub audio: Vec<u8>,
    /// Sample rate of `audio`.
    pub sample_rate: u32,
    /// Offset of the first byte within the processor's buffer, in ms.
    pub start_ms: f64,
    /// Offset of the end within the processor's buffer, in ms.
    pub end_ms: f64,
    /// Speech duration counted from speech frames.
    pub speech_duration: Duration,
    /// When the utterance was closed.
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    /// Length of the emitted audio in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        samples_to_ms((self.audio.len() / BYTES_PER_SAMPLE) as u64, self.sample_rate)
    }

    /// Encode the utterance as a mono WAV file.
    pub fn to_wav(&self) -> Vec<u8> {
        pcm16_to_wav(&self.audio, self.sample_rate, 1)
    }
}

/// What happened while processing one frame.
#[derive(Debug, Clone)]
pub struct VadOutcome {
    /// Phase after the frame (`SpeechComplete` on the frame that closed an utterance).
    pub phase: SpeechPhase,
    /// Verdict for this frame.
    pub is_speech: bool,
    /// True on the frame where speech onset was detected.
    pub speech_started: bool,
    /// Set when an utterance was completed and long enough to keep.
    pub utterance: Option<Utterance>,
    /// True when an utterance closed but was too short and was dropped as noise.
    pub discarded: bool,
    /// Speech accumulated in the current (or just-closed) utterance.
    pub speech_duration_ms: f64,
}

impl VadOutcome {
    pub fn is_speech_complete(&self) -> bool {
        self.utterance.is_some()
    }
}

/// Hook fired on speech onset or on utterance completion.
pub type SpeechHook = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Segments a stream of PCM frames into utterances.
pub struct VadProcessor {
    config: VadConfig,
    classifier: FrameClassifier,
    phase: SpeechPhase,

    // Audio buffered since the last reset or trim
    buffer: Vec<u8>,
    buffered_samples: u64,

    // Offsets into `buffer`, in samples
    speech_start: Option<u64>,
    speech_end: Option<u64>,

    silence_frames: u32,
    silence_samples: u64,
    speech_frames: u32,

    on_speech_start: Option<SpeechHook>,
    on_speech_end: Option<SpeechHook>,
}

impl VadProcessor {
    /// Create an energy-only processor.
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        config.validate()?;
        let classifier = FrameClassifier::energy_only(config.clone());
        Ok(Self::build(config, classifier))
    }

    /// Create a processor backed by a speech classifier.
    pub fn with_classifier(
        config: VadConfig,
        classifier: Box<dyn SpeechClassifier>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        let classifier = FrameClassifier::with_model(config.clone(), classifier);
        Ok(Self::build(config, classifier))
    }

    fn build(config: VadConfig, classifier: FrameClassifier) -> Self {
        info!(
            threshold = config.threshold,
            silence_ms = config.silence_threshold_ms,
            min_speech_ms = config.min_speech_duration_ms,
            sample_rate = config.sample_rate,
            "VAD processor created"
        );
        Self {
            config,
            classifier,
            phase: SpeechPhase::Silence,
            buffer: Vec::new(),
            buffered_samples: 0,
            speech_start: None,
            speech_end: None,
            silence_frames: 0,
            silence_samples: 0,
            speech_frames: 0,
            on_speech_start: None,
            on_speech_end: None,
        }
    }

    /// Install hooks for speech onset and utterance completion.
    pub fn set_callbacks(
        &mut self,
        on_speech_start: Option<SpeechHook>,
        on_speech_end: Option<SpeechHook>,
    ) {
        self.on_speech_start = on_speech_start;
        self.on_speech_end = on_speech_end;
    }

    pub fn phase(&self) -> SpeechPhase {
        self.phase
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Audio currently held in the buffer, in milliseconds.
    pub fn buffered_ms(&self) -> f64 {
        samples_to_ms(self.buffered_samples, self.config.sample_rate)
    }

    /// Whether frames are still scored by the installed classifier.
    pub fn uses_classifier(&self) -> bool {
        self.classifier.uses_model()
    }

    /// Process one frame of 16-bit little-endian mono PCM.
    pub fn process_frame(&mut self, frame: &[u8]) -> VadOutcome {
        let samples = pcm16_samples(frame);
        let frame_samples = samples.len() as u64;
        let is_speech = self.classifier.is_speech(&samples);

        let frame_start = self.buffered_samples;
        self.buffer
            .extend_from_slice(&frame[..samples.len() * BYTES_PER_SAMPLE]);
        self.buffered_samples += frame_samples;

        let pad = ms_to_samples(self.config.speech_pad_ms as f64, self.config.sample_rate);
        let mut speech_started = false;

        match (self.phase, is_speech) {
            (SpeechPhase::Silence | SpeechPhase::SpeechComplete, true) => {
                self.phase = SpeechPhase::Speaking;
                self.speech_frames = 1;
                self.silence_frames = 0;
                self.silence_samples = 0;
                self.speech_start = Some(frame_start.saturating_sub(pad));
                speech_started = true;
                self.fire_speech_start();
                debug!(buffer_ms = self.buffered_ms(), "Speech started");
            }
            (SpeechPhase::Silence | SpeechPhase::SpeechComplete, false) => {
                self.trim_silence();
            }
            (SpeechPhase::Speaking | SpeechPhase::Pause, true) => {
                self.phase = SpeechPhase::Speaking;
                self.speech_frames += 1;
                self.silence_frames = 0;
                self.silence_samples = 0;
            }
            (SpeechPhase::Speaking | SpeechPhase::Pause, false) => {
                self.phase = SpeechPhase::Pause;
                self.silence_frames += 1;
                self.silence_samples += frame_samples;
                let end_threshold = ms_to_samples(
                    self.config.silence_threshold_ms as f64,
                    self.config.sample_rate,
                );
                if self.silence_samples >= end_threshold {
                    self.phase = SpeechPhase::SpeechComplete;
                    let silence_onset = self.buffered_samples - self.silence_samples;
                    self.speech_end = Some(silence_onset + pad);
                }
            }
        }

        let speech_duration_ms =
            (self.speech_frames as u64 * self.config.frame_duration_ms as u64) as f64;

        if self.phase != SpeechPhase::SpeechComplete {
            return VadOutcome {
                phase: self.phase,
                is_speech,
                speech_started,
                utterance: None,
                discarded: false,
                speech_duration_ms,
            };
        }

        let utterance = self.finish_utterance(speech_duration_ms);
        let discarded = utterance.is_none();
        self.reset();

        VadOutcome {
            phase: SpeechPhase::SpeechComplete,
            is_speech,
            speech_started,
            utterance,
            discarded,
            speech_duration_ms,
        }
    }

    /// Return to Silence and drop all buffered audio. Safe to call at any time.
    pub fn reset(&mut self) {
        self.phase = SpeechPhase::Silence;
        self.buffer.clear();
        self.buffered_samples = 0;
        self.speech_start = None;
        self.speech_end = None;
        self.silence_frames = 0;
        self.silence_samples = 0;
        self.speech_frames = 0;
        self.classifier.reset();
        debug!("VAD state reset");
    }

    fn finish_utterance(&mut self, speech_duration_ms: f64) -> Option<Utterance> {
        let min_frames = self.config.min_speech_frames();
        if self.speech_frames < min_frames {
            debug!(
                speech_frames = self.speech_frames,
                min_required = min_frames,
                "Speech too short, ignoring"
            );
            return None;
        }

        let start = self.speech_start?;
        let end = self
            .speech_end
            .unwrap_or(self.buffered_samples)
            .min(self.buffered_samples);
        let start_byte = (start as usize * BYTES_PER_SAMPLE).min(self.buffer.len());
        let end_byte = (end as usize * BYTES_PER_SAMPLE).max(start_byte);
        let audio = self.buffer[start_byte..end_byte].to_vec();

        let utterance = Utterance {
            audio,
            sample_rate: self.config.sample_rate,
            start_ms: samples_to_ms(start, self.config.sample_rate),
            end_ms: samples_to_ms(end, self.config.sample_rate),
            speech_duration: Duration::from_millis(speech_duration_ms as u64),
            timestamp: Utc::now(),
        };

        self.fire_speech_end();
        info!(
            speech_frames = self.speech_frames,
            duration_ms = speech_duration_ms,
            audio_size = utterance.audio.len(),
            "Speech complete"
        );
        Some(utterance)
    }

    fn trim_silence(&mut self) {
        if self.buffered_ms() <= SILENCE_BUFFER_MAX_MS as f64 {
            return;
        }
        let keep_ms = SILENCE_TAIL_MS.max(self.config.speech_pad_ms);
        let keep = ms_to_samples(keep_ms as f64, self.config.sample_rate).min(self.buffered_samples);
        let drop_bytes = ((self.buffered_samples - keep) as usize) * BYTES_PER_SAMPLE;
        self.buffer.drain(..drop_bytes);
        self.buffered_samples = keep;
    }

    fn fire_speech_start(&mut self) {
        if let Some(hook) = self.on_speech_start.as_mut() {
            if let Err(e) = hook() {
                warn!(error = %e, "Speech start callback failed");
            }
        }
    }

    fn fire_speech_end(&mut self) {
        if let Some(hook) = self.on_speech_end.as_mut() {
            if let Err(e) = hook() {
                warn!(error = %e, "Speech end callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_pcm16;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const FRAME: usize = 480; // 30ms at 16kHz

    fn config() -> VadConfig {
        VadConfig {
            sample_rate: 16000,
            ..Default::default()
        }
    }

    fn silence() -> Vec<u8> {
        samples_to_pcm16(&[0; FRAME])
    }

    fn speech() -> Vec<u8> {
        samples_to_pcm16(&[8000; FRAME])
    }

    #[test]
    fn test_speech_onset_moves_to_speaking() {
        let mut vad = VadProcessor::new(config()).unwrap();
        let outcome = vad.process_frame(&silence());
        assert_eq!(outcome.phase, SpeechPhase::Silence);

        let outcome = vad.process_frame(&speech());
        assert!(outcome.speech_started);
        assert_eq!(vad.phase(), SpeechPhase::Speaking);
    }

    #[test]
    fn test_pause_then_resume() {
        let mut vad = VadProcessor::new(config()).unwrap();
        vad.process_frame(&speech());
        vad.process_frame(&silence());
        assert_eq!(vad.phase(), SpeechPhase::Pause);
        vad.process_frame(&speech());
        assert_eq!(vad.phase(), SpeechPhase::Speaking);
    }

    #[test]
    fn test_short_speech_is_discarded() {
        let mut vad = VadProcessor::new(config()).unwrap();
        for _ in 0..3 {
            vad.process_frame(&speech());
        }
        let mut discarded = false;
        for _ in 0..20 {
            let outcome = vad.process_frame(&silence());
            assert!(outcome.utterance.is_none());
            discarded |= outcome.discarded;
        }
        assert!(discarded);
        assert_eq!(vad.phase(), SpeechPhase::Silence);
    }

    #[test]
    fn test_hooks_fire_once_per_utterance() {
        let starts = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let mut vad = VadProcessor::new(config()).unwrap();
        let s = Arc::clone(&starts);
        let e = Arc::clone(&ends);
        vad.set_callbacks(
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Some(Box::new(move || {
                e.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("observer unavailable")
            })),
        );

        for _ in 0..10 {
            vad.process_frame(&speech());
        }
        for _ in 0..20 {
            vad.process_frame(&silence());
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_silence_buffer_is_trimmed() {
        let mut vad = VadProcessor::new(config()).unwrap();
        for _ in 0..200 {
            vad.process_frame(&silence());
        }
        assert!(vad.buffered_ms() <= SILENCE_BUFFER_MAX_MS as f64);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut vad = VadProcessor::new(config()).unwrap();
        vad.process_frame(&speech());
        vad.reset();
        vad.reset();
        assert_eq!(vad.phase(), SpeechPhase::Silence);
        assert_eq!(vad.buffered_ms(), 0.0);
        let outcome = vad.process_frame(&speech());
        assert!(outcome.speech_started);
    }
}
