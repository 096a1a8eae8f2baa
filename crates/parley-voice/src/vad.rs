//! Per-frame speech classification.
//!
//! A frame passes through a cheap energy prefilter first; frames that survive are
//! scored by a pluggable [`SpeechClassifier`] (a neural VAD, WebRTC, ...). When no
//! classifier is installed, or the installed one fails, classification falls back
//! to energy alone for the rest of the processor's life.

use crate::audio::normalized_rms;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Configuration for voice activity detection and utterance segmentation.
///
/// Field names match the flat keys used in a flow document's global settings,
/// so the struct can be flattened straight into them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability at or above which a frame counts as speech (0.0-1.0)
    #[serde(rename = "vad_threshold")]
    pub threshold: f32,

    /// Minimum speech duration for an utterance to be emitted (default: 250ms)
    pub min_speech_duration_ms: u32,

    /// Silence duration that ends an utterance (default: 500ms)
    pub silence_threshold_ms: u32,

    /// Longest expected pause inside one utterance (default: 800ms). Carried
    /// for hosts; segmentation only looks at `silence_threshold_ms`.
    pub max_pause_duration_ms: u32,

    /// Padding kept before and after detected speech (default: 100ms)
    pub speech_pad_ms: u32,

    /// Sample rate of the incoming PCM stream (default: 24000 Hz)
    pub sample_rate: u32,

    /// Nominal frame duration (default: 30ms)
    pub frame_duration_ms: u32,

    /// Reject obviously silent frames before running the classifier
    pub energy_filter_enabled: bool,

    /// Normalised RMS energy threshold for the prefilter
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_duration_ms: 250,
            silence_threshold_ms: 500,
            max_pause_duration_ms: 800,
            speech_pad_ms: 100,
            sample_rate: 24000,
            frame_duration_ms: 30,
            energy_filter_enabled: true,
            energy_threshold: 0.01,
        }
    }
}

impl VadConfig {
    /// Check the values the state machine divides by or compares against.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::Config("sample_rate must be positive".to_string()));
        }
        if self.frame_duration_ms == 0 {
            return Err(VoiceError::Config(
                "frame_duration_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(VoiceError::Config(format!(
                "vad_threshold must be within 0.0..=1.0, got {}",
                self.threshold
            )));
        }
        if self.energy_threshold < 0.0 {
            return Err(VoiceError::Config(format!(
                "energy_threshold must not be negative, got {}",
                self.energy_threshold
            )));
        }
        Ok(())
    }

    /// Speech frames required before an utterance is emitted.
    pub fn min_speech_frames(&self) -> u32 {
        self.min_speech_duration_ms / self.frame_duration_ms.max(1)
    }
}

/// A model that scores one frame of audio.
///
/// Implementations may keep state between frames (RNN hidden state, smoothing
/// windows); `reset` is called between utterances.
pub trait SpeechClassifier: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "speech-classifier"
    }

    /// Probability that the frame contains speech.
    fn speech_probability(&mut self, samples: &[i16], sample_rate: u32) -> VoiceResult<f32>;

    /// Clear any internal state.
    fn reset(&mut self) {}
}

/// Turns frames into a speech / silence verdict.
pub struct FrameClassifier {
    config: VadConfig,
    model: Option<Box<dyn SpeechClassifier>>,
}

impl FrameClassifier {
    /// Energy-only classification.
    pub fn energy_only(config: VadConfig) -> Self {
        info!(
            energy_threshold = config.energy_threshold,
            "No speech classifier installed, using energy-based detection"
        );
        Self {
            config,
            model: None,
        }
    }

    /// Classification backed by a speech model, with the energy prefilter in front.
    pub fn with_model(config: VadConfig, model: Box<dyn SpeechClassifier>) -> Self {
        info!(
            classifier = model.name(),
            threshold = config.threshold,
            "Speech classifier installed"
        );
        Self {
            config,
            model: Some(model),
        }
    }

    /// Whether a model is still in use (false after a permanent fallback).
    pub fn uses_model(&self) -> bool {
        self.model.is_some()
    }

    /// Classify one frame of decoded samples.
    pub fn is_speech(&mut self, samples: &[i16]) -> bool {
        let energy = normalized_rms(samples);

        if self.config.energy_filter_enabled && energy <= self.config.energy_threshold {
            return false;
        }

        if let Some(model) = self.model.as_mut() {
            match model.speech_probability(samples, self.config.sample_rate) {
                Ok(probability) => {
                    debug!(probability, "classifier verdict");
                    return probability >= self.config.threshold;
                }
                Err(e) => {
                    warn!(
                        classifier = model.name(),
                        error = %e,
                        "Speech classifier failed, falling back to energy-based detection"
                    );
                    self.model = None;
                }
            }
        }

        energy > self.config.energy_threshold * 2.0
    }

    /// Reset the model state between utterances.
    pub fn reset(&mut self) {
        if let Some(model) = self.model.as_mut() {
            model.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f32);

    impl SpeechClassifier for Fixed {
        fn speech_probability(&mut self, _: &[i16], _: u32) -> VoiceResult<f32> {
            Ok(self.0)
        }
    }

    struct Broken {
        calls: usize,
    }

    impl SpeechClassifier for Broken {
        fn speech_probability(&mut self, _: &[i16], _: u32) -> VoiceResult<f32> {
            self.calls += 1;
            Err(VoiceError::Classifier("model not loaded".to_string()))
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = VadConfig::default();
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.min_speech_frames(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = VadConfig {
            frame_duration_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = VadConfig {
            threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefilter_rejects_silence_before_model() {
        let mut classifier = FrameClassifier::with_model(VadConfig::default(), Box::new(Fixed(1.0)));
        assert!(!classifier.is_speech(&[0; 720]));
        assert!(classifier.is_speech(&[8000; 720]));
    }

    #[test]
    fn test_model_threshold_applies() {
        let mut classifier = FrameClassifier::with_model(VadConfig::default(), Box::new(Fixed(0.2)));
        assert!(!classifier.is_speech(&[8000; 720]));
    }

    #[test]
    fn test_failed_model_falls_back_permanently() {
        let mut classifier =
            FrameClassifier::with_model(VadConfig::default(), Box::new(Broken { calls: 0 }));
        assert!(classifier.uses_model());
        assert!(classifier.is_speech(&[8000; 720]));
        assert!(!classifier.uses_model());
        // energy-only from now on
        assert!(classifier.is_speech(&[8000; 720]));
        assert!(!classifier.is_speech(&[100; 720]));
    }

    #[test]
    fn test_energy_only_uses_doubled_threshold() {
        let config = VadConfig {
            energy_filter_enabled: false,
            ..Default::default()
        };
        let mut classifier = FrameClassifier::energy_only(config);
        // 0.015 normalised: above the prefilter threshold, below twice of it
        assert!(!classifier.is_speech(&[492; 720]));
        assert!(classifier.is_speech(&[1000; 720]));
    }
}
