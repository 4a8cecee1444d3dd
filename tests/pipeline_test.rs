use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lectern::capture::{CaptureDevice, SinePcmSource, WebmOpusDevice};
use lectern::lecture::{LectureStore, MemoryLectureStore};
use lectern::merge::{self, MergedAudio};
use lectern::openai::{ApiError, ChatModel, SpeechToText};
use lectern::pipeline::{Pipeline, PipelineError, TRANSCRIBE_LIMIT_BYTES};
use lectern::remote::{chunk_object_key, MemoryObjectStore, ObjectStore};

/// Produce real capture chunks: header chunk plus continuation clusters
fn capture_chunks(total_secs: f64, interval_ms: u64) -> Vec<Vec<u8>> {
    let source = SinePcmSource::new(48000, 440.0).with_duration_secs(total_secs);
    let mut device = WebmOpusDevice::new(Box::new(source));
    let mut stream = device.open(Duration::from_millis(interval_ms)).unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().unwrap() {
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
    }
    let last = stream.finish().unwrap();
    if !last.is_empty() {
        chunks.push(last);
    }
    chunks
}

/// Scripted transcription service; can fail specific calls
struct FakeStt {
    calls: AtomicU32,
    fail_calls: Vec<u32>,
    inputs: Mutex<Vec<usize>>,
}

impl FakeStt {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_calls: Vec::new(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(calls: &[u32]) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_calls: calls.to_vec(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechToText for FakeStt {
    fn transcribe(&self, audio: &[u8], _name: &str, _media: &str) -> Result<String, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.inputs.lock().unwrap().push(audio.len());
        if self.fail_calls.contains(&call) {
            return Err(ApiError::Api {
                status: 500,
                body: "transcription overloaded".to_string(),
            });
        }
        Ok(format!("segment {} of the lecture about waves", call))
    }
}

/// Scripted chat model answering each pipeline pass by prompt shape
struct FakeChat {
    calls: AtomicU32,
}

impl FakeChat {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

impl ChatModel for FakeChat {
    fn complete(&self, system: &str, _user: &str, _temperature: f32) -> Result<String, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if system.contains("Subject area") {
            return Ok(
                "SUBJECT: physics\nTOPICS: waves, interference\nKEY_TERMS: wavelength\nCONTEXT: university lecture"
                    .to_string(),
            );
        }
        if system.contains("suggested lecture title") {
            return Ok("TITLE: Waves and Interference\nSUBJECT: physics\nTOPICS:\n1. waves".to_string());
        }
        if system.contains("cleaning up an audio transcript") {
            return Ok("A cleaned passage about waves.".to_string());
        }
        if system.contains("structured class notes") {
            return Ok("## Waves\n\n### Key Concepts\n- **Wave**: a disturbance".to_string());
        }
        if system.contains("create a summary") {
            return Ok("## Summary\n- Waves carry energy".to_string());
        }
        Ok("unexpected prompt".to_string())
    }
}

struct Fixture {
    objects: Arc<MemoryObjectStore>,
    stt: Arc<FakeStt>,
    chat: Arc<FakeChat>,
    lectures: Arc<MemoryLectureStore>,
    pipeline: Arc<Pipeline>,
}

fn fixture_with(stt: FakeStt) -> Fixture {
    let objects = Arc::new(MemoryObjectStore::new());
    let stt = Arc::new(stt);
    let chat = Arc::new(FakeChat::new());
    let lectures = Arc::new(MemoryLectureStore::new());
    let pipeline = Arc::new(Pipeline::new(
        objects.clone(),
        stt.clone(),
        chat.clone(),
        lectures.clone(),
    ));
    Fixture {
        objects,
        stt,
        chat,
        lectures,
        pipeline,
    }
}

fn upload_session_chunks(objects: &MemoryObjectStore, user: &str, session: &str, secs: f64) {
    let chunks = capture_chunks(secs, 5000);
    for (i, chunk) in chunks.iter().enumerate() {
        let key = chunk_object_key(user, session, i as u32, "audio/webm;codecs=opus");
        objects
            .put_object(&key, chunk, "audio/webm;codecs=opus")
            .unwrap();
    }
}

#[test]
fn reassembled_chunks_preserve_total_duration() {
    // Three 1 s chunks: header+data, data, data
    let chunks = capture_chunks(3.0, 1000);
    assert_eq!(chunks.len(), 3);

    match merge::merge_session_chunks(&chunks, "audio/webm") {
        MergedAudio::Normalized(audio) => {
            assert!(
                (audio.duration_secs() - 3.0).abs() < 0.1,
                "duration {} not within re-mux tolerance of 3.0",
                audio.duration_secs()
            );
        }
        MergedAudio::Raw { .. } => panic!("expected normalized audio"),
    }
}

#[test]
fn small_session_is_transcribed_in_one_call_and_completes() {
    let fixture = fixture_with(FakeStt::new());
    upload_session_chunks(&fixture.objects, "u1", "s1", 3.0);

    let result = fixture.pipeline.process("s1", "u1").unwrap();

    // One transcription call for audio under the limit
    assert_eq!(fixture.stt.call_count(), 1);
    assert_eq!(result.total_chunks, 1);
    assert!((result.duration_secs - 3.0).abs() < 0.1);
    assert!(result.notes.starts_with("# Waves and Interference"));
    assert!(result.notes.contains("## Summary"));
    assert!(!result.transcript_clean.is_empty());

    // Status written before each stage, then the final merge
    assert_eq!(
        fixture.lectures.status_history(),
        vec!["transcribing", "cleaning", "completed"]
    );
    let record = fixture.lectures.get("u1", "s1").unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["totalChunks"], 1);
    assert_eq!(record["sessionId"], "s1");
    assert!(record["startedAt"].is_i64());
    assert!(record["completedAt"].is_i64());
    assert!(record["topicAnalysis"]
        .as_str()
        .unwrap()
        .starts_with("SUBJECT: physics"));
}

#[test]
fn oversized_audio_is_split_into_bounded_segments() {
    let fixture_stt = FakeStt::new();
    let objects = Arc::new(MemoryObjectStore::new());
    let stt = Arc::new(fixture_stt);
    let lectures = Arc::new(MemoryLectureStore::new());
    let pipeline = Pipeline::new(
        objects.clone(),
        stt.clone(),
        Arc::new(FakeChat::new()),
        lectures.clone(),
    )
    // Force the split path: a 1-byte "limit" with 10 s segments
    .with_transcribe_limit(1)
    .with_segment_secs(10);

    upload_session_chunks(&objects, "u1", "s2", 25.0);

    let result = pipeline.process("s2", "u1").unwrap();

    // 25 s at 10 s per segment: three independent transcription calls
    assert_eq!(stt.call_count(), 3);
    assert_eq!(
        result.transcript_raw,
        "segment 1 of the lecture about waves segment 2 of the lecture about waves segment 3 of the lecture about waves"
    );
}

#[test]
fn failed_segment_is_skipped_not_fatal() {
    let objects = Arc::new(MemoryObjectStore::new());
    let stt = Arc::new(FakeStt::failing_on(&[2]));
    let lectures = Arc::new(MemoryLectureStore::new());
    let pipeline = Pipeline::new(
        objects.clone(),
        stt.clone(),
        Arc::new(FakeChat::new()),
        lectures.clone(),
    )
    .with_transcribe_limit(1)
    .with_segment_secs(10);

    upload_session_chunks(&objects, "u1", "s3", 25.0);

    let result = pipeline.process("s3", "u1").unwrap();

    assert_eq!(stt.call_count(), 3);
    // The middle segment is missing but the job still completed
    assert_eq!(
        result.transcript_raw,
        "segment 1 of the lecture about waves segment 3 of the lecture about waves"
    );
    let record = lectures.get("u1", "s3").unwrap();
    assert_eq!(record["status"], "completed");
}

#[test]
fn missing_chunks_fail_the_job_with_status_failed() {
    let fixture = fixture_with(FakeStt::new());

    let err = fixture.pipeline.process("nothing-here", "u1").unwrap_err();
    assert!(matches!(err, PipelineError::NoChunksFound));
    assert_eq!(err.to_string(), "No chunks found for session");

    let record = fixture.lectures.get("u1", "nothing-here").unwrap();
    assert_eq!(record["status"], "failed");
    assert_eq!(record["error"], "No chunks found for session");
    assert!(record["failedAt"].is_i64());
    // No chat or transcription calls were made
    assert_eq!(fixture.stt.call_count(), 0);
    assert_eq!(fixture.chat.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn undecodable_upload_falls_back_to_raw_passthrough() {
    let fixture = fixture_with(FakeStt::new());

    // A whole-file upload that is not a WebM capture stream
    let garbage = b"ID3\x04\x00 not really audio".to_vec();
    fixture
        .objects
        .put_object(
            "users/u1/recordings/s4/chunk_000000.webm",
            &garbage,
            "audio/webm",
        )
        .unwrap();

    let result = fixture.pipeline.process("s4", "u1").unwrap();

    // Raw bytes went straight to transcription
    assert_eq!(fixture.stt.call_count(), 1);
    assert_eq!(fixture.stt.inputs.lock().unwrap()[0], garbage.len());
    // Duration falls back to the per-chunk estimate
    assert!((result.duration_secs - 5.0).abs() < f64::EPSILON);
}

/// Transcription that parks until released, to hold a run in flight
struct SlowStt {
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl SpeechToText for SlowStt {
    fn transcribe(&self, _a: &[u8], _n: &str, _m: &str) -> Result<String, ApiError> {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(std::time::Duration::from_secs(10));
        Ok("held transcript".to_string())
    }
}

#[test]
fn concurrent_trigger_for_same_session_is_rejected() {
    let objects = Arc::new(MemoryObjectStore::new());
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let stt = Arc::new(SlowStt {
        release: Mutex::new(release_rx),
    });
    let lectures = Arc::new(MemoryLectureStore::new());
    let pipeline = Arc::new(Pipeline::new(
        objects.clone(),
        stt,
        Arc::new(FakeChat::new()),
        lectures,
    ));

    upload_session_chunks(&objects, "u1", "s5", 3.0);

    let first = {
        let pipeline = pipeline.clone();
        std::thread::spawn(move || pipeline.process("s5", "u1"))
    };

    // Wait until the first run is inside the transcription stage
    std::thread::sleep(Duration::from_millis(300));
    let second = pipeline.process("s5", "u1");
    assert!(matches!(second, Err(PipelineError::AlreadyProcessing(_))));

    release_tx.send(()).unwrap();
    let first = first.join().unwrap();
    assert!(first.is_ok());

    // With the first run finished the session can be processed again
    release_tx.send(()).unwrap();
    let third = pipeline.process("s5", "u1");
    assert!(third.is_ok());
}

#[test]
fn transcription_limit_matches_service_contract() {
    assert_eq!(TRANSCRIBE_LIMIT_BYTES, 24 * 1024 * 1024);
}
