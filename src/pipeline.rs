use dashmap::DashSet;
use log::{error, info, warn};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::sync::Arc;

use crate::lecture::{LectureStatus, LectureStore, LectureUpdate};
use crate::merge::{self, MergedAudio};
use crate::notes;
use crate::openai::{ChatModel, SpeechToText};
use crate::remote::{session_prefix, ObjectStore};
use crate::store::now_ms;

/// The transcription service rejects uploads beyond ~25 MB; stay under it
pub const TRANSCRIBE_LIMIT_BYTES: usize = 24 * 1024 * 1024;

/// Segment length when the normalized audio exceeds the upload limit
pub const TRANSCRIBE_SEGMENT_SECS: u32 = 600;

/// Per-chunk duration estimate for streams that could not be decoded
const FALLBACK_CHUNK_SECS: f64 = 5.0;

#[derive(Debug)]
pub enum PipelineError {
    /// The session has no objects in remote storage
    NoChunksFound,
    /// A pipeline run for this session is already in flight
    AlreadyProcessing(String),
    /// Any other stage failure
    Stage(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NoChunksFound => write!(f, "No chunks found for session"),
            PipelineError::AlreadyProcessing(session_id) => {
                write!(f, "session {} is already being processed", session_id)
            }
            PipelineError::Stage(msg) => write!(f, "{}", msg),
        }
    }
}

impl StdError for PipelineError {}

impl From<crate::remote::RemoteError> for PipelineError {
    fn from(e: crate::remote::RemoteError) -> Self {
        PipelineError::Stage(e.to_string())
    }
}

impl From<crate::openai::ApiError> for PipelineError {
    fn from(e: crate::openai::ApiError) -> Self {
        PipelineError::Stage(e.to_string())
    }
}

impl From<Box<dyn StdError + Send + Sync>> for PipelineError {
    fn from(e: Box<dyn StdError + Send + Sync>) -> Self {
        PipelineError::Stage(e.to_string())
    }
}

/// Output of one successful pipeline run, merge-written into the lecture
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub session_id: String,
    pub transcript_raw: String,
    pub transcript_clean: String,
    pub notes: String,
    pub total_chunks: u32,
    pub duration_secs: f64,
}

/// Server-side processing: download and reassemble a session's chunks,
/// transcribe, clean, and turn the transcript into structured notes.
/// One sequential job per trigger; concurrent triggers for the same session
/// are rejected.
pub struct Pipeline {
    objects: Arc<dyn ObjectStore>,
    stt: Arc<dyn SpeechToText>,
    chat: Arc<dyn ChatModel>,
    lectures: Arc<dyn LectureStore>,
    active: DashSet<String>,
    transcribe_limit: usize,
    segment_secs: u32,
}

impl Pipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        stt: Arc<dyn SpeechToText>,
        chat: Arc<dyn ChatModel>,
        lectures: Arc<dyn LectureStore>,
    ) -> Self {
        Self {
            objects,
            stt,
            chat,
            lectures,
            active: DashSet::new(),
            transcribe_limit: TRANSCRIBE_LIMIT_BYTES,
            segment_secs: TRANSCRIBE_SEGMENT_SECS,
        }
    }

    /// Override the transcription upload limit (tests)
    pub fn with_transcribe_limit(mut self, bytes: usize) -> Self {
        self.transcribe_limit = bytes;
        self
    }

    /// Override the segment duration used when splitting (tests)
    pub fn with_segment_secs(mut self, secs: u32) -> Self {
        self.segment_secs = secs;
        self
    }

    pub fn process(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<ProcessingResult, PipelineError> {
        if !self.active.insert(session_id.to_string()) {
            warn!("rejecting concurrent trigger for session {}", session_id);
            return Err(PipelineError::AlreadyProcessing(session_id.to_string()));
        }

        let result = self.run(session_id, user_id);
        self.active.remove(session_id);

        if let Err(e) = &result {
            error!("processing failed for session {}: {}", session_id, e);
            let failed = self.lectures.merge_update(
                user_id,
                session_id,
                &LectureUpdate {
                    status: Some(LectureStatus::Failed),
                    error: Some(e.to_string()),
                    failed_at_ms: Some(now_ms()),
                    ..Default::default()
                },
            );
            if let Err(merge_err) = failed {
                error!("failed to record failure status: {}", merge_err);
            }
        }
        result
    }

    fn run(&self, session_id: &str, user_id: &str) -> Result<ProcessingResult, PipelineError> {
        info!("processing session {} for user {}", session_id, user_id);

        // Scratch files are removed when this guard drops, on every path
        let scratch = tempfile::tempdir().map_err(|e| {
            PipelineError::Stage(format!("failed to create scratch directory: {}", e))
        })?;

        self.lectures.merge_update(
            user_id,
            session_id,
            &LectureUpdate {
                session_id: Some(session_id.to_string()),
                started_at_ms: Some(now_ms()),
                ..Default::default()
            },
        )?;

        // Enumerate: names embed the zero-padded index, so a name sort is a
        // correct total order
        let prefix = session_prefix(user_id, session_id);
        let mut names = self.objects.list_objects(&prefix)?;
        names.sort();
        if names.is_empty() {
            return Err(PipelineError::NoChunksFound);
        }
        let total_chunks = names.len() as u32;
        info!("found {} chunks", total_chunks);

        self.lectures.merge_update(
            user_id,
            session_id,
            &LectureUpdate {
                total_chunks: Some(total_chunks),
                ..Default::default()
            },
        )?;

        // Download to scratch
        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let data = self.objects.get_object(name)?;
            let local = scratch.path().join(format!("chunk_{:06}", i));
            fs::write(&local, &data)
                .map_err(|e| PipelineError::Stage(format!("failed to write scratch file: {}", e)))?;
            info!("downloaded {}/{}: {} ({} bytes)", i + 1, names.len(), name, data.len());
            chunks.push(data);
        }

        // Reassemble
        let sequential = names[0].contains("chunk_");
        if names.len() == 1 && !sequential {
            info!("single whole-file upload detected");
        }
        let merged = merge::merge_session_chunks(&chunks, "audio/webm");

        // Transcribe
        self.lectures.merge_update(
            user_id,
            session_id,
            &LectureUpdate {
                status: Some(LectureStatus::Transcribing),
                ..Default::default()
            },
        )?;
        let transcript_raw = self.transcribe_merged(&merged)?;
        info!("raw transcript: {} chars", transcript_raw.len());

        // Clean
        self.lectures.merge_update(
            user_id,
            session_id,
            &LectureUpdate {
                status: Some(LectureStatus::Cleaning),
                transcript_raw: Some(transcript_raw.clone()),
                ..Default::default()
            },
        )?;

        let topic_analysis = notes::detect_topic(self.chat.as_ref(), &transcript_raw)?;
        info!("topic analysis: {}", topic_analysis.replace('\n', " | "));

        let transcript_clean =
            notes::clean_transcript(self.chat.as_ref(), &transcript_raw, &topic_analysis)?;
        info!("clean transcript: {} chars", transcript_clean.len());

        // Notes
        let generated =
            notes::generate_notes(self.chat.as_ref(), &transcript_clean, &topic_analysis)?;
        info!("notes: {} chars", generated.len());

        let duration_secs = match &merged {
            MergedAudio::Normalized(audio) => audio.duration_secs(),
            // Could not decode, estimate from the chunk count
            MergedAudio::Raw { .. } => total_chunks as f64 * FALLBACK_CHUNK_SECS,
        };

        let result = ProcessingResult {
            session_id: session_id.to_string(),
            transcript_raw,
            transcript_clean,
            notes: generated,
            total_chunks,
            duration_secs,
        };

        self.lectures.merge_update(
            user_id,
            session_id,
            &LectureUpdate {
                status: Some(LectureStatus::Completed),
                transcript_raw: Some(result.transcript_raw.clone()),
                transcript_clean: Some(result.transcript_clean.clone()),
                notes: Some(result.notes.clone()),
                topic_analysis: Some(topic_analysis),
                total_chunks: Some(result.total_chunks),
                duration_secs: Some(result.duration_secs),
                completed_at_ms: Some(now_ms()),
                ..Default::default()
            },
        )?;

        info!("processing complete for session {}", session_id);
        Ok(result)
    }

    /// Size-bounded transcription: over the limit, the audio is split into
    /// fixed-duration segments transcribed independently; a failed segment
    /// is skipped rather than aborting the job.
    fn transcribe_merged(&self, merged: &MergedAudio) -> Result<String, PipelineError> {
        match merged {
            MergedAudio::Normalized(audio) => {
                let encoded = merge::encode_ogg_opus(audio)?;
                if encoded.len() <= self.transcribe_limit {
                    return Ok(self.stt.transcribe(&encoded, "merged.ogg", "audio/ogg")?);
                }

                info!(
                    "audio too large ({} bytes), splitting for transcription",
                    encoded.len()
                );
                let segments = merge::split_segments(audio, self.segment_secs);
                info!("split into {} segments", segments.len());

                let mut parts = Vec::with_capacity(segments.len());
                for (i, segment) in segments.iter().enumerate() {
                    let bytes = merge::encode_ogg_opus(segment)?;
                    let name = format!("segment_{:03}.ogg", i);
                    match self.stt.transcribe(&bytes, &name, "audio/ogg") {
                        Ok(text) => parts.push(text),
                        Err(e) => {
                            warn!("segment {} failed to transcribe, skipping: {}", i, e)
                        }
                    }
                }
                Ok(parts.join(" "))
            }
            MergedAudio::Raw { data, media_type } => {
                Ok(self.stt.transcribe(data, "merged.webm", media_type)?)
            }
        }
    }
}
