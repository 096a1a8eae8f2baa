//! **Voice output**: synthesized-speech playback and the barge-in kill switch.
//!
//! Playback streams chunks into an [`AudioSink`] and checks a shared
//! [`PlaybackHandle`] at every chunk boundary. When the VAD reports speech onset
//! while the handle is playing, the session calls `interrupt()` and playback stops
//! before the next chunk is written.

use crate::error::VoiceResult;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct PlaybackState {
    playing: AtomicBool,
    interrupted: AtomicBool,
}

/// Shared playback flag. Clones observe and control the same playback.
#[derive(Debug, Clone, Default)]
pub struct PlaybackHandle {
    state: Arc<PlaybackState>,
}

impl PlaybackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a `play_chunks` call is writing audio.
    pub fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::SeqCst)
    }

    /// True if the last playback was cut short.
    pub fn was_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Request that playback stop at the next chunk boundary.
    /// Returns whether anything was playing.
    pub fn interrupt(&self) -> bool {
        let was_playing = self.state.playing.load(Ordering::SeqCst);
        if was_playing {
            self.state.interrupted.store(true, Ordering::SeqCst);
            info!("Playback interrupted by user speech");
        }
        was_playing
    }

    fn begin(&self) {
        self.state.interrupted.store(false, Ordering::SeqCst);
        self.state.playing.store(true, Ordering::SeqCst);
    }

    fn finish(&self, cut_off: bool) {
        self.state.playing.store(false, Ordering::SeqCst);
        // An interrupt after the last chunk did not cut anything short
        self.state.interrupted.store(cut_off, Ordering::SeqCst);
    }
}

/// Destination for synthesized audio (a telephony leg, a WebRTC track, a speaker).
#[async_trait]
pub trait AudioSink: Send {
    /// Write one chunk of audio.
    async fn write_chunk(&mut self, chunk: &[u8]) -> VoiceResult<()>;

    /// Drop anything queued downstream. Called after an interruption.
    async fn clear(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Collects written chunks in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub chunks: Vec<Vec<u8>>,
    pub cleared: bool,
}

#[async_trait]
impl AudioSink for BufferSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> VoiceResult<()> {
        self.chunks.push(chunk.to_vec());
        Ok(())
    }

    async fn clear(&mut self) -> VoiceResult<()> {
        self.cleared = true;
        Ok(())
    }
}

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed { chunks_played: usize },
    Interrupted { chunks_played: usize },
}

impl PlaybackOutcome {
    pub fn was_interrupted(&self) -> bool {
        matches!(self, PlaybackOutcome::Interrupted { .. })
    }
}

/// Stream `chunks` into `sink` until exhausted or interrupted through `handle`.
pub async fn play_chunks<S, A>(
    handle: &PlaybackHandle,
    mut chunks: S,
    sink: &mut A,
) -> VoiceResult<PlaybackOutcome>
where
    S: Stream<Item = Vec<u8>> + Unpin,
    A: AudioSink + ?Sized,
{
    handle.begin();
    let mut chunks_played = 0usize;
    let mut cut_off = false;

    while let Some(chunk) = chunks.next().await {
        if handle.was_interrupted() {
            cut_off = true;
            break;
        }
        if let Err(e) = sink.write_chunk(&chunk).await {
            handle.finish(false);
            return Err(e);
        }
        chunks_played += 1;
        // Let the audio task run so barge-in can land between chunks
        tokio::task::yield_now().await;
    }

    handle.finish(cut_off);

    if cut_off {
        sink.clear().await?;
        debug!(chunks_played, "Playback stopped early");
        return Ok(PlaybackOutcome::Interrupted { chunks_played });
    }
    Ok(PlaybackOutcome::Completed { chunks_played })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_playback_completes() {
        let handle = PlaybackHandle::new();
        let mut sink = BufferSink::default();
        let chunks = stream::iter(vec![vec![1u8; 4], vec![2u8; 4]]);
        let outcome = play_chunks(&handle, chunks, &mut sink).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { chunks_played: 2 });
        assert!(!handle.is_playing());
        assert!(!sink.cleared);
    }

    #[test]
    fn test_interrupt_when_idle_is_noop() {
        let handle = PlaybackHandle::new();
        assert!(!handle.interrupt());
        assert!(!handle.was_interrupted());
    }

    #[test]
    fn test_empty_stream_completes_immediately() {
        let handle = PlaybackHandle::new();
        let mut sink = BufferSink::default();
        let chunks = stream::iter(Vec::<Vec<u8>>::new());
        let outcome = tokio_test::block_on(play_chunks(&handle, chunks, &mut sink)).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { chunks_played: 0 });
        assert!(!handle.is_playing());
    }

    struct InterruptingSink {
        handle: PlaybackHandle,
        written: usize,
    }

    #[async_trait]
    impl AudioSink for InterruptingSink {
        async fn write_chunk(&mut self, _chunk: &[u8]) -> VoiceResult<()> {
            self.written += 1;
            if self.written == 2 {
                assert!(self.handle.interrupt());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interrupt_stops_at_chunk_boundary() {
        let handle = PlaybackHandle::new();
        let mut sink = InterruptingSink {
            handle: handle.clone(),
            written: 0,
        };
        let chunks = stream::iter((0..5).map(|i| vec![i as u8; 8]));
        let outcome = play_chunks(&handle, chunks, &mut sink).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Interrupted { chunks_played: 2 });
        assert_eq!(sink.written, 2);
        assert!(!handle.is_playing());
        assert!(handle.was_interrupted());
    }

    #[tokio::test]
    async fn test_interrupt_during_last_chunk_completes() {
        let handle = PlaybackHandle::new();
        let mut sink = InterruptingSink {
            handle: handle.clone(),
            written: 0,
        };
        let chunks = stream::iter(vec![vec![0u8; 8], vec![1u8; 8]]);
        let outcome = play_chunks(&handle, chunks, &mut sink).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { chunks_played: 2 });
        assert!(!handle.was_interrupted());
    }
}
