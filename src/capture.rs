use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, warn};
use opus::{Application, Bitrate as OpusBitrate, Channels, Encoder as OpusEncoder};
use std::error::Error as StdError;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::{create_opus_id_header, resample};
use crate::store::{
    now_ms, AudioChunk, ChunkStore, RecordingSession, SessionStatus, SessionUpdate,
};
use crate::webm;

/// Capture interval: one chunk is emitted per boundary
pub const CHUNK_INTERVAL_MS: u64 = 5_000;

const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME_SAMPLES: usize = 960; // 20 ms at 48 kHz
const OPUS_FRAME_MS: u64 = 20;
const DEFAULT_BITRATE_BPS: i32 = 16_000;

/// Capture media types in preference order, mirroring what recording
/// front ends typically support.
pub const MEDIA_TYPE_PREFERENCES: [&str; 4] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/mp4",
];

/// Pick the recording media type from a capability list.
/// Pure so it can be tested without a device.
pub fn choose_media_type(supported: &[&str]) -> &'static str {
    for preference in MEDIA_TYPE_PREFERENCES {
        if supported.contains(&preference) {
            return preference;
        }
    }
    "audio/webm"
}

#[derive(Debug)]
pub enum DeviceError {
    /// Permission denied or device revoked
    AccessDenied(String),
    /// No usable capture device/source
    NotFound(String),
    /// Error in the running capture stream
    Stream(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::AccessDenied(msg) => write!(f, "capture device access denied: {}", msg),
            DeviceError::NotFound(msg) => write!(f, "capture device not found: {}", msg),
            DeviceError::Stream(msg) => write!(f, "capture stream error: {}", msg),
        }
    }
}

impl StdError for DeviceError {}

/// Recorder state machine: inactive -> recording <-> paused -> inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Inactive,
    Recording,
    Paused,
}

impl RecorderState {
    pub fn allows(self, next: RecorderState) -> bool {
        use RecorderState::*;
        matches!(
            (self, next),
            (Inactive, Recording)
                | (Recording, Paused)
                | (Paused, Recording)
                | (Recording, Inactive)
                | (Paused, Inactive)
        )
    }
}

/// Events emitted by the capture loop, in the order state actually changed
#[derive(Debug)]
pub enum RecorderEvent {
    StateChange(RecorderState),
    ChunkSaved {
        session_id: String,
        chunk_index: u32,
        bytes: usize,
    },
    Error(String),
}

/// A source of mono s16le PCM samples
pub trait PcmSource: Send {
    fn sample_rate(&self) -> u32;
    /// Fill `buf` with samples; returns 0 at end of input
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError>;
}

/// An opened capture stream producing container chunks at interval boundaries
pub trait CaptureStream: Send {
    fn media_type(&self) -> &str;
    /// Produce the next chunk. `Ok(None)` means the source is exhausted.
    /// Non-realtime sources return as soon as an interval worth of samples
    /// has been read.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeviceError>;
    /// Flush buffered-but-not-yet-emitted audio as a final chunk
    fn finish(self: Box<Self>) -> Result<Vec<u8>, DeviceError>;
}

/// A capture device that can be opened into a stream
pub trait CaptureDevice: Send {
    fn open(&mut self, chunk_interval: Duration) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

enum Command {
    Pause,
    Resume,
    Stop,
}

/// Owns the capture lifecycle for one store. Collaborators (device, store
/// path, event channel) are injected so instances are isolated.
pub struct Recorder {
    store_path: PathBuf,
}

pub struct RecorderHandle {
    session_id: String,
    commands: Sender<Command>,
    state: Arc<Mutex<RecorderState>>,
    chunk_count: Arc<AtomicU32>,
    thread: Option<JoinHandle<Result<(), String>>>,
}

impl Recorder {
    pub fn new(store_path: &Path) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
        }
    }

    /// Acquire the device, create a session, and start the capture loop.
    /// Device acquisition failure is fatal to starting; stream errors after
    /// that are reported as events and do not stop the recording.
    pub fn start(
        &self,
        device: &mut dyn CaptureDevice,
        events: Sender<RecorderEvent>,
    ) -> Result<RecorderHandle, Box<dyn StdError + Send + Sync>> {
        let stream = device.open(Duration::from_millis(CHUNK_INTERVAL_MS))?;
        let store = ChunkStore::open(&self.store_path)?;

        let session_id = Uuid::new_v4().to_string();
        store.create_session(&RecordingSession {
            id: session_id.clone(),
            started_at_ms: now_ms(),
            ended_at_ms: None,
            status: SessionStatus::Recording,
            total_chunks: 0,
            uploaded_chunks: 0,
        })?;

        let state = Arc::new(Mutex::new(RecorderState::Recording));
        let chunk_count = Arc::new(AtomicU32::new(0));
        let (cmd_tx, cmd_rx) = unbounded();

        let _ = events.send(RecorderEvent::StateChange(RecorderState::Recording));

        let thread = {
            let session_id = session_id.clone();
            let state = Arc::clone(&state);
            let chunk_count = Arc::clone(&chunk_count);
            thread::spawn(move || {
                capture_loop(stream, store, events, cmd_rx, session_id, state, chunk_count)
            })
        };

        Ok(RecorderHandle {
            session_id,
            commands: cmd_tx,
            state,
            chunk_count,
            thread: Some(thread),
        })
    }
}

impl RecorderHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RecorderState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count.load(Ordering::Relaxed)
    }

    /// Only valid while recording; a no-op otherwise
    pub fn pause(&self) {
        if self.state() != RecorderState::Recording {
            warn!("pause ignored: recorder not recording");
            return;
        }
        let _ = self.commands.send(Command::Pause);
    }

    /// Only valid while paused; a no-op otherwise
    pub fn resume(&self) {
        if self.state() != RecorderState::Paused {
            warn!("resume ignored: recorder not paused");
            return;
        }
        let _ = self.commands.send(Command::Resume);
    }

    /// Stop the recording. Flushes buffered audio, marks the session as
    /// ready to upload, and returns the session identifier.
    pub fn stop(mut self) -> Result<String, Box<dyn StdError + Send + Sync>> {
        let _ = self.commands.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let result = thread
                .join()
                .map_err(|_| "capture thread panicked".to_string())?;
            result?;
        }
        Ok(self.session_id)
    }
}

fn capture_loop(
    mut stream: Box<dyn CaptureStream>,
    store: ChunkStore,
    events: Sender<RecorderEvent>,
    commands: Receiver<Command>,
    session_id: String,
    state: Arc<Mutex<RecorderState>>,
    chunk_count: Arc<AtomicU32>,
) -> Result<(), String> {
    let media_type = stream.media_type().to_string();
    let mut index: u32 = 0;

    let set_state = |next: RecorderState| {
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.allows(next) {
            *guard = next;
            drop(guard);
            let _ = events.send(RecorderEvent::StateChange(next));
        }
    };

    let persist = |index: u32, data: Vec<u8>| -> bool {
        let bytes = data.len();
        let chunk = AudioChunk {
            session_id: session_id.clone(),
            chunk_index: index,
            media_type: media_type.clone(),
            data,
            created_at_ms: now_ms(),
            uploaded: false,
        };
        let saved = store.save_chunk(&chunk).and_then(|_| {
            store.update_session(
                &session_id,
                &SessionUpdate {
                    total_chunks: Some(index + 1),
                    ..Default::default()
                },
            )
        });
        match saved {
            Ok(()) => {
                chunk_count.store(index + 1, Ordering::Relaxed);
                debug!("saved chunk {} ({} bytes)", chunk.chunk_id(), bytes);
                let _ = events.send(RecorderEvent::ChunkSaved {
                    session_id: session_id.clone(),
                    chunk_index: index,
                    bytes,
                });
                true
            }
            Err(e) => {
                error!("failed to persist chunk {}: {}", index, e);
                let _ = events.send(RecorderEvent::Error(format!(
                    "failed to persist chunk {}: {}",
                    index, e
                )));
                false
            }
        }
    };

    let mut stopping = false;
    'capture: while !stopping {
        // Apply queued commands before pulling the next buffer
        loop {
            match commands.try_recv() {
                Ok(Command::Pause) => {
                    set_state(RecorderState::Paused);
                    // Parked until resume or stop
                    loop {
                        match commands.recv() {
                            Ok(Command::Resume) => {
                                set_state(RecorderState::Recording);
                                break;
                            }
                            Ok(Command::Stop) | Err(_) => {
                                stopping = true;
                                break;
                            }
                            Ok(Command::Pause) => {}
                        }
                    }
                }
                Ok(Command::Resume) => {}
                Ok(Command::Stop) => stopping = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stopping = true;
                    break;
                }
            }
            if stopping {
                break;
            }
        }
        if stopping {
            break 'capture;
        }

        match stream.next_chunk() {
            Ok(Some(data)) => {
                if !data.is_empty() && persist(index, data) {
                    index += 1;
                }
            }
            Ok(None) => break 'capture, // source exhausted
            Err(e) => {
                // Device errors do not stop an active recording
                warn!("capture stream error: {}", e);
                let _ = events.send(RecorderEvent::Error(e.to_string()));
                thread::sleep(Duration::from_millis(200));
            }
        }
    }

    // Flush buffered audio before acknowledging the stop
    match stream.finish() {
        Ok(data) => {
            if !data.is_empty() && persist(index, data) {
                index += 1;
            }
        }
        Err(e) => {
            warn!("failed to flush final capture buffer: {}", e);
            let _ = events.send(RecorderEvent::Error(e.to_string()));
        }
    }

    store
        .update_session(
            &session_id,
            &SessionUpdate {
                ended_at_ms: Some(now_ms()),
                status: Some(SessionStatus::Uploading),
                ..Default::default()
            },
        )
        .map_err(|e| format!("failed to finalize session: {}", e))?;

    set_state(RecorderState::Inactive);
    debug!("capture loop ended with {} chunks", index);
    Ok(())
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Capture device that Opus-encodes a PCM source and containers the output
/// as a continuous chunked WebM stream: the first chunk carries the EBML
/// header and track setup, later chunks carry clusters only, so the chunks
/// binary-concatenate back into one valid stream.
pub struct WebmOpusDevice {
    source: Option<Box<dyn PcmSource>>,
    bitrate_bps: i32,
}

impl WebmOpusDevice {
    pub fn new(source: Box<dyn PcmSource>) -> Self {
        Self {
            source: Some(source),
            bitrate_bps: DEFAULT_BITRATE_BPS,
        }
    }

    pub fn with_bitrate(mut self, bits_per_second: i32) -> Self {
        self.bitrate_bps = bits_per_second;
        self
    }
}

impl CaptureDevice for WebmOpusDevice {
    fn open(&mut self, chunk_interval: Duration) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let source = self
            .source
            .take()
            .ok_or_else(|| DeviceError::NotFound("capture source already in use".to_string()))?;

        let mut encoder = OpusEncoder::new(OPUS_SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| DeviceError::Stream(format!("failed to create Opus encoder: {}", e)))?;
        encoder
            .set_bitrate(OpusBitrate::Bits(self.bitrate_bps))
            .map_err(|e| DeviceError::Stream(format!("failed to set bitrate: {}", e)))?;

        let src_rate = source.sample_rate();
        Ok(Box::new(WebmOpusStream {
            source,
            src_rate,
            encoder,
            interval_src_samples: (chunk_interval.as_millis() as u64 * src_rate as u64 / 1000)
                as usize,
            pending: Vec::new(),
            frames_emitted: 0,
            sent_header: false,
            eof: false,
        }))
    }
}

struct WebmOpusStream {
    source: Box<dyn PcmSource>,
    src_rate: u32,
    encoder: OpusEncoder,
    interval_src_samples: usize,
    /// 48 kHz mono samples not yet encoded
    pending: Vec<i16>,
    frames_emitted: u64,
    sent_header: bool,
    eof: bool,
}

impl WebmOpusStream {
    fn encode_pending(&mut self) -> Result<Vec<(u16, Vec<u8>)>, DeviceError> {
        let mut blocks = Vec::new();
        let chunk_start_frame = self.frames_emitted;
        let mut encode_output = vec![0u8; 4096];
        while self.pending.len() >= OPUS_FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..OPUS_FRAME_SAMPLES).collect();
            let len = self
                .encoder
                .encode(&frame, &mut encode_output)
                .map_err(|e| DeviceError::Stream(format!("Opus encode error: {}", e)))?;
            let relative_ms = (self.frames_emitted - chunk_start_frame) * OPUS_FRAME_MS;
            blocks.push((relative_ms as u16, encode_output[..len].to_vec()));
            self.frames_emitted += 1;
        }
        Ok(blocks)
    }

    fn package(&mut self, blocks: Vec<(u16, Vec<u8>)>, chunk_start_frame: u64) -> Vec<u8> {
        if blocks.is_empty() {
            return Vec::new();
        }
        let cluster = webm::cluster(chunk_start_frame * OPUS_FRAME_MS, &blocks);
        if self.sent_header {
            cluster
        } else {
            self.sent_header = true;
            let mut out = webm::stream_header(
                &create_opus_id_header(1, OPUS_SAMPLE_RATE),
                OPUS_SAMPLE_RATE as f64,
                1,
            );
            out.extend(cluster);
            out
        }
    }
}

impl CaptureStream for WebmOpusStream {
    fn media_type(&self) -> &str {
        "audio/webm;codecs=opus"
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = vec![0i16; self.interval_src_samples];
        let mut got = 0;
        while got < buf.len() {
            let n = self.source.read_samples(&mut buf[got..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            got += n;
        }

        if got > 0 {
            let resampled = resample(&buf[..got], self.src_rate, OPUS_SAMPLE_RATE);
            self.pending.extend_from_slice(&resampled);
        }

        let chunk_start_frame = self.frames_emitted;
        let blocks = self.encode_pending()?;
        if blocks.is_empty() {
            return if self.eof { Ok(None) } else { Ok(Some(Vec::new())) };
        }
        Ok(Some(self.package(blocks, chunk_start_frame)))
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>, DeviceError> {
        if !self.pending.is_empty() {
            // Pad the final partial frame with silence
            self.pending.resize(OPUS_FRAME_SAMPLES, 0);
        }
        let chunk_start_frame = self.frames_emitted;
        let blocks = self.encode_pending()?;
        Ok(self.package(blocks, chunk_start_frame))
    }
}

/// Mono s16le PCM pulled from any reader (file, stdin, pipe)
pub struct RawPcmSource {
    reader: Box<dyn Read + Send>,
    sample_rate: u32,
}

impl RawPcmSource {
    pub fn new(reader: Box<dyn Read + Send>, sample_rate: u32) -> Self {
        Self {
            reader,
            sample_rate,
        }
    }
}

impl PcmSource for RawPcmSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let mut bytes = vec![0u8; buf.len() * 2];
        let mut filled = 0;
        while filled < bytes.len() {
            let n = self
                .reader
                .read(&mut bytes[filled..])
                .map_err(|e| DeviceError::Stream(format!("PCM read error: {}", e)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let samples = filled / 2;
        for i in 0..samples {
            buf[i] = i16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        }
        Ok(samples)
    }
}

/// Deterministic tone source, bounded by duration
pub struct SinePcmSource {
    sample_rate: u32,
    freq_hz: f64,
    position: u64,
    limit: Option<u64>,
}

impl SinePcmSource {
    pub fn new(sample_rate: u32, freq_hz: f64) -> Self {
        Self {
            sample_rate,
            freq_hz,
            position: 0,
            limit: None,
        }
    }

    pub fn with_duration_secs(mut self, secs: f64) -> Self {
        self.limit = Some((secs * self.sample_rate as f64) as u64);
        self
    }
}

impl PcmSource for SinePcmSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let available = match self.limit {
            Some(limit) => (limit.saturating_sub(self.position) as usize).min(buf.len()),
            None => buf.len(),
        };
        for item in buf.iter_mut().take(available) {
            let t = self.position as f64 / self.sample_rate as f64;
            *item = ((t * self.freq_hz * 2.0 * std::f64::consts::PI).sin() * 8000.0) as i16;
            self.position += 1;
        }
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_choice_prefers_webm_opus() {
        assert_eq!(
            choose_media_type(&["audio/mp4", "audio/webm;codecs=opus"]),
            "audio/webm;codecs=opus"
        );
        assert_eq!(
            choose_media_type(&["audio/ogg;codecs=opus", "audio/mp4"]),
            "audio/ogg;codecs=opus"
        );
        assert_eq!(choose_media_type(&["audio/flac"]), "audio/webm");
        assert_eq!(choose_media_type(&[]), "audio/webm");
    }

    #[test]
    fn recorder_state_transitions() {
        use RecorderState::*;
        assert!(Inactive.allows(Recording));
        assert!(Recording.allows(Paused));
        assert!(Paused.allows(Recording));
        assert!(Recording.allows(Inactive));
        assert!(Paused.allows(Inactive));
        assert!(!Inactive.allows(Paused));
        assert!(!Paused.allows(Paused));
    }

    #[test]
    fn sine_source_respects_duration_limit() {
        let mut source = SinePcmSource::new(16000, 440.0).with_duration_secs(0.5);
        let mut buf = vec![0i16; 16000];
        let n = source.read_samples(&mut buf).unwrap();
        assert_eq!(n, 8000);
        assert_eq!(source.read_samples(&mut buf).unwrap(), 0);
    }

    #[test]
    fn first_chunk_has_header_continuations_do_not() {
        let source = SinePcmSource::new(48000, 440.0).with_duration_secs(3.0);
        let mut device = WebmOpusDevice::new(Box::new(source));
        let mut stream = device.open(Duration::from_millis(1000)).unwrap();

        let first = stream.next_chunk().unwrap().unwrap();
        let second = stream.next_chunk().unwrap().unwrap();

        // EBML magic on the first chunk only
        assert_eq!(&first[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert_ne!(&second[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        // Continuation chunks start with a Cluster element
        assert_eq!(&second[..4], &[0x1F, 0x43, 0xB6, 0x75]);
    }
}
