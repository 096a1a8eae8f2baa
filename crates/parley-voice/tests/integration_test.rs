//! Integration tests for utterance segmentation and transcription hand-off

use parley_voice::{
    samples_to_pcm16, transcribe_utterance, ScriptedTranscriber, SpeechClassifier, SpeechPhase,
    VadConfig, VadProcessor, VoiceError, VoiceResult,
};

const FRAME_SAMPLES: usize = 480; // 30ms at 16kHz

fn config() -> VadConfig {
    VadConfig {
        sample_rate: 16000,
        frame_duration_ms: 30,
        speech_pad_ms: 100,
        silence_threshold_ms: 500,
        min_speech_duration_ms: 250,
        ..Default::default()
    }
}

fn frame(amplitude: i16) -> Vec<u8> {
    samples_to_pcm16(&[amplitude; FRAME_SAMPLES])
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_single_utterance_is_padded() {
    init_tracing();
    let mut vad = VadProcessor::new(config()).expect("valid config");

    let mut stream = Vec::new();
    stream.extend((0..10).map(|_| frame(0)));
    stream.extend((0..20).map(|_| frame(8000)));
    stream.extend((0..20).map(|_| frame(0)));

    let mut whole = Vec::new();
    let mut utterances = Vec::new();
    for f in &stream {
        whole.extend_from_slice(f);
        let outcome = vad.process_frame(f);
        if let Some(u) = outcome.utterance {
            assert_eq!(outcome.phase, SpeechPhase::SpeechComplete);
            utterances.push(u);
        }
    }

    assert_eq!(utterances.len(), 1);
    let utterance = &utterances[0];
    // speech onset at 300ms minus 100ms pad, silence onset at 900ms plus 100ms pad
    assert_eq!(utterance.audio.len(), 25_600);
    assert_eq!(utterance.audio.as_slice(), &whole[6_400..32_000]);
    assert!((utterance.start_ms - 200.0).abs() < 1e-6);
    assert!((utterance.end_ms - 1000.0).abs() < 1e-6);
    assert_eq!(utterance.speech_duration.as_millis(), 600);
    assert_eq!(vad.phase(), SpeechPhase::Silence);

    let wav = utterance.to_wav();
    assert_eq!(wav.len(), 44 + 25_600);
}

#[test]
fn test_pause_shorter_than_threshold_keeps_one_utterance() {
    init_tracing();
    let mut vad = VadProcessor::new(VadConfig {
        silence_threshold_ms: 1200,
        ..config()
    })
    .expect("valid config");

    let stream = (0..20)
        .map(|_| frame(8000))
        .chain((0..30).map(|_| frame(0)))
        .chain((0..20).map(|_| frame(8000)))
        .chain((0..50).map(|_| frame(0)));

    let mut completed_at = Vec::new();
    for (i, f) in stream.enumerate() {
        if let Some(u) = vad.process_frame(&f).utterance {
            completed_at.push((i, u));
        }
    }

    assert_eq!(completed_at.len(), 1);
    let (index, utterance) = &completed_at[0];
    // 1200ms of silence is 40 frames after the second burst ends at frame 70
    assert_eq!(*index, 109);
    assert_eq!(utterance.speech_duration.as_millis(), 1200);
}

#[test]
fn test_short_burst_emits_nothing() {
    init_tracing();
    let mut vad = VadProcessor::new(config()).expect("valid config");
    let burst = (0..5)
        .map(|_| frame(0))
        .chain((0..4).map(|_| frame(8000)))
        .chain((0..30).map(|_| frame(0)));

    for f in burst {
        assert!(vad.process_frame(&f).utterance.is_none());
    }
}

#[test]
fn test_two_utterances_in_one_stream() {
    let mut vad = VadProcessor::new(config()).expect("valid config");
    let speech = frame(8000);
    let silence = frame(0);

    let mut count = 0;
    for _ in 0..2 {
        for _ in 0..15 {
            vad.process_frame(&speech);
        }
        for _ in 0..20 {
            if vad.process_frame(&silence).utterance.is_some() {
                count += 1;
            }
        }
    }
    assert_eq!(count, 2);
}

struct Flaky;

impl SpeechClassifier for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn speech_probability(&mut self, _: &[i16], _: u32) -> VoiceResult<f32> {
        Err(VoiceError::Classifier("inference failed".to_string()))
    }
}

#[test]
fn test_classifier_failure_keeps_segmenting() {
    let mut vad = VadProcessor::with_classifier(config(), Box::new(Flaky)).expect("valid config");
    let mut got = None;
    for _ in 0..12 {
        vad.process_frame(&frame(8000));
    }
    assert!(!vad.uses_classifier());
    for _ in 0..20 {
        if let Some(u) = vad.process_frame(&frame(0)).utterance {
            got = Some(u);
        }
    }
    assert!(got.is_some());
}

#[tokio::test]
async fn test_utterance_transcription() {
    let mut vad = VadProcessor::new(config()).expect("valid config");
    let stt = ScriptedTranscriber::new().with_transcript("next Tuesday");

    let mut utterance = None;
    for _ in 0..12 {
        vad.process_frame(&frame(8000));
    }
    for _ in 0..20 {
        if let Some(u) = vad.process_frame(&frame(0)).utterance {
            utterance = Some(u);
        }
    }

    let utterance = utterance.expect("utterance emitted");
    let text = transcribe_utterance(&stt, &utterance, 1, "en")
        .await
        .expect("transcription");
    assert_eq!(text.as_deref(), Some("next Tuesday"));
}
