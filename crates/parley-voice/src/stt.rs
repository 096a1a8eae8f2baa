//! **Speech-to-Text**: turn a completed utterance into text for the flow engine.
//!
//! Implement `Transcriber` for a local or remote backend. `ScriptedTranscriber`
//! returns canned transcripts and is what the test suites drive the audio path with.

use crate::error::{VoiceError, VoiceResult};
use crate::turn::Utterance;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Backend converting 16-bit PCM to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw PCM. `Ok(None)` (or an empty string) means nothing was recognised.
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
        channels: u16,
        language: &str,
    ) -> VoiceResult<Option<String>>;
}

/// Transcribe an utterance, normalising blank results to `None`.
pub async fn transcribe_utterance(
    transcriber: &dyn Transcriber,
    utterance: &Utterance,
    channels: u16,
    language: &str,
) -> VoiceResult<Option<String>> {
    if utterance.audio.is_empty() {
        return Ok(None);
    }
    let text = transcriber
        .transcribe(&utterance.audio, utterance.sample_rate, channels, language)
        .await?;
    Ok(text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

/// Returns queued transcripts in order, then `None` once the queue is drained.
#[derive(Debug, Default)]
pub struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<VoiceResult<Option<String>>>>,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transcript.
    pub fn with_transcript(self, text: impl Into<String>) -> Self {
        self.push(Ok(Some(text.into())));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Err(VoiceError::Transcription(message.into())));
        self
    }

    fn push(&self, item: VoiceResult<Option<String>>) {
        if let Ok(mut queue) = self.transcripts.lock() {
            queue.push_back(item);
        }
    }

    /// Transcripts not yet handed out.
    pub fn remaining(&self) -> usize {
        self.transcripts.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
        _channels: u16,
        language: &str,
    ) -> VoiceResult<Option<String>> {
        debug!(bytes = audio.len(), sample_rate, language, "scripted transcription");
        let mut queue = self
            .transcripts
            .lock()
            .map_err(|_| VoiceError::Transcription("transcript queue poisoned".to_string()))?;
        queue.pop_front().unwrap_or(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn utterance(audio: Vec<u8>) -> Utterance {
        Utterance {
            audio,
            sample_rate: 16000,
            start_ms: 0.0,
            end_ms: 30.0,
            speech_duration: Duration::from_millis(30),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_scripted_transcripts_in_order() {
        let stt = ScriptedTranscriber::new()
            .with_transcript("  hello  ")
            .with_transcript("");
        let u = utterance(vec![0; 960]);
        assert_eq!(
            transcribe_utterance(&stt, &u, 1, "en").await.unwrap(),
            Some("hello".to_string())
        );
        assert_eq!(transcribe_utterance(&stt, &u, 1, "en").await.unwrap(), None);
        assert_eq!(stt.remaining(), 0);
        assert_eq!(transcribe_utterance(&stt, &u, 1, "en").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_audio_skips_backend() {
        let stt = ScriptedTranscriber::new().with_transcript("unused");
        let u = utterance(Vec::new());
        assert_eq!(transcribe_utterance(&stt, &u, 1, "en").await.unwrap(), None);
        assert_eq!(stt.remaining(), 1);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let stt = ScriptedTranscriber::new().with_failure("backend down");
        let u = utterance(vec![0; 960]);
        assert!(matches!(
            transcribe_utterance(&stt, &u, 1, "en").await,
            Err(VoiceError::Transcription(_))
        ));
    }
}
