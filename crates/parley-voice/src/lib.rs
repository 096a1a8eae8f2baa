//! # Parley Voice - audio side of a voice session
//!
//! Voice Activity Detection, utterance segmentation and barge-in playback control
//! for the parley flow engine. Audio arrives as 16-bit little-endian mono PCM frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Voice Session                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │  PCM frames  │→ │   Frame      │→ │  VadProcessor    │    │
//! │  │ (transport)  │  │  Classifier  │  │ (phase machine)  │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! │                                        ↓ utterance           │
//! │  ┌──────────────┐                    ┌──────────────────┐    │
//! │  │  AudioSink   │←── interrupt ──────│   Transcriber    │    │
//! │  │  (playback)  │   on speech onset  │  (text → flow)   │    │
//! │  └──────────────┘                    └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod error;
pub mod stt;
pub mod turn;
pub mod vad;
pub mod voice_output;

pub use audio::{pcm16_samples, pcm16_to_wav, samples_to_pcm16};
pub use error::{VoiceError, VoiceResult};
pub use stt::{transcribe_utterance, ScriptedTranscriber, Transcriber};
pub use turn::{SpeechHook, SpeechPhase, Utterance, VadOutcome, VadProcessor};
pub use vad::{FrameClassifier, SpeechClassifier, VadConfig};
pub use voice_output::{play_chunks, AudioSink, BufferSink, PlaybackHandle, PlaybackOutcome};
