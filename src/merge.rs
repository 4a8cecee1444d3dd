use log::{debug, warn};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Bitrate as OpusBitrate, Channels, Decoder as OpusDecoder,
    Encoder as OpusEncoder};
use std::error::Error as StdError;

use crate::audio::{create_opus_comment_header, create_opus_id_header, resample};
use crate::webm;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Normalized target: mono 16 kHz, suitable for transcription
pub const NORMALIZED_SAMPLE_RATE: u32 = 16_000;

const DECODE_SAMPLE_RATE: u32 = 48_000;
const ENCODE_FRAME_SAMPLES: usize = 320; // 20 ms at 16 kHz
const ENCODE_BITRATE_BPS: i32 = 16_000;
/// Ogg/Opus granule positions always count 48 kHz samples
const GRANULE_PER_FRAME: u64 = 960;

/// Decoded, resampled audio ready for encoding or segmentation
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl NormalizedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Result of reassembling a session's chunks
pub enum MergedAudio {
    /// Decoded and resampled to the normalized format
    Normalized(NormalizedAudio),
    /// Container repair failed outright; the raw concatenation is used as-is
    Raw { data: Vec<u8>, media_type: String },
}

/// Binary-concatenate capture chunks in order. Valid because the first chunk
/// carries the stream header and the rest carry continuation clusters only.
pub fn concat_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out
}

/// Repair a (possibly concatenated) WebM/Opus stream and decode it down to
/// normalized mono 16 kHz PCM. Individual undecodable packets are skipped;
/// a stream that yields no audio at all is an error.
pub fn normalize_webm_opus(data: &[u8]) -> Result<NormalizedAudio, BoxError> {
    let packets = webm::extract_opus_packets(data)?;
    debug!("extracted {} opus packets", packets.len());

    let mut decoder = OpusDecoder::new(DECODE_SAMPLE_RATE, Channels::Mono)
        .map_err(|e| format!("failed to create Opus decoder: {}", e))?;

    // 120 ms at 48 kHz, the longest legal opus frame
    let mut frame = vec![0i16; 5760];
    let mut pcm = Vec::new();
    let mut skipped = 0usize;
    for packet in &packets {
        match decoder.decode(packet, &mut frame, false) {
            Ok(n) => pcm.extend_from_slice(&frame[..n]),
            Err(e) => {
                skipped += 1;
                debug!("skipping undecodable packet: {}", e);
            }
        }
    }
    if skipped > 0 {
        warn!("skipped {} of {} packets while decoding", skipped, packets.len());
    }
    if pcm.is_empty() {
        return Err("no packets decoded from stream".into());
    }

    let samples = resample(&pcm, DECODE_SAMPLE_RATE, NORMALIZED_SAMPLE_RATE);
    Ok(NormalizedAudio {
        samples,
        sample_rate: NORMALIZED_SAMPLE_RATE,
    })
}

/// Reassemble a session's downloaded chunks. Concatenation plus container
/// repair is attempted first; if that fails outright the raw concatenation
/// is passed through rather than aborting the job.
pub fn merge_session_chunks(chunks: &[Vec<u8>], media_type: &str) -> MergedAudio {
    let data = concat_chunks(chunks);
    match normalize_webm_opus(&data) {
        Ok(normalized) => {
            debug!(
                "merged {} chunks into {:.1}s of audio",
                chunks.len(),
                normalized.duration_secs()
            );
            MergedAudio::Normalized(normalized)
        }
        Err(e) => {
            warn!("container repair failed, using raw concatenation: {}", e);
            MergedAudio::Raw {
                data,
                media_type: media_type.to_string(),
            }
        }
    }
}

/// Encode normalized PCM as Opus-in-Ogg, the compressed upload format for
/// the transcription service.
pub fn encode_ogg_opus(audio: &NormalizedAudio) -> Result<Vec<u8>, BoxError> {
    let samples = if audio.sample_rate == NORMALIZED_SAMPLE_RATE {
        audio.samples.clone()
    } else {
        resample(&audio.samples, audio.sample_rate, NORMALIZED_SAMPLE_RATE)
    };

    let mut encoder = OpusEncoder::new(NORMALIZED_SAMPLE_RATE, Channels::Mono, Application::Voip)
        .map_err(|e| format!("failed to create Opus encoder: {}", e))?;
    encoder
        .set_bitrate(OpusBitrate::Bits(ENCODE_BITRATE_BPS))
        .map_err(|e| format!("failed to set bitrate: {}", e))?;

    let mut out = Vec::new();
    {
        let mut writer = PacketWriter::new(&mut out);
        let serial = 1;
        writer.write_packet(
            create_opus_id_header(1, NORMALIZED_SAMPLE_RATE),
            serial,
            PacketWriteEndInfo::EndPage,
            0,
        )?;
        writer.write_packet(
            create_opus_comment_header(),
            serial,
            PacketWriteEndInfo::EndPage,
            0,
        )?;

        let mut encode_output = vec![0u8; 4096];
        let mut granule = 0u64;
        let frames: Vec<&[i16]> = samples.chunks(ENCODE_FRAME_SAMPLES).collect();
        let last = frames.len().saturating_sub(1);
        for (i, chunk) in frames.iter().enumerate() {
            let mut frame = chunk.to_vec();
            // Pad the final partial frame with silence
            frame.resize(ENCODE_FRAME_SAMPLES, 0);
            let len = encoder
                .encode(&frame, &mut encode_output)
                .map_err(|e| format!("Opus encode error: {}", e))?;
            granule += GRANULE_PER_FRAME;
            let end_info = if i == last {
                PacketWriteEndInfo::EndStream
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            writer.write_packet(encode_output[..len].to_vec(), serial, end_info, granule)?;
        }
    }
    Ok(out)
}

/// Split normalized audio into fixed-duration segments for size-bounded
/// transcription. The final segment may be shorter.
pub fn split_segments(audio: &NormalizedAudio, segment_secs: u32) -> Vec<NormalizedAudio> {
    let samples_per_segment = (segment_secs as usize) * (audio.sample_rate as usize);
    if samples_per_segment == 0 {
        return vec![audio.clone()];
    }
    audio
        .samples
        .chunks(samples_per_segment)
        .map(|chunk| NormalizedAudio {
            samples: chunk.to_vec(),
            sample_rate: audio.sample_rate,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_preserves_order() {
        let chunks = vec![vec![1u8, 2], vec![3], vec![4, 5]];
        assert_eq!(concat_chunks(&chunks), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn split_segments_bounds_each_piece() {
        let audio = NormalizedAudio {
            samples: vec![0i16; 16_000 * 25],
            sample_rate: 16_000,
        };
        let segments = split_segments(&audio, 10);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].samples.len(), 16_000 * 10);
        assert_eq!(segments[2].samples.len(), 16_000 * 5);
        let total: usize = segments.iter().map(|s| s.samples.len()).sum();
        assert_eq!(total, audio.samples.len());
    }

    #[test]
    fn raw_fallback_when_stream_is_not_webm() {
        let chunks = vec![b"not a webm stream at all".to_vec()];
        match merge_session_chunks(&chunks, "audio/webm") {
            MergedAudio::Raw { data, media_type } => {
                assert_eq!(data, chunks[0]);
                assert_eq!(media_type, "audio/webm");
            }
            MergedAudio::Normalized(_) => panic!("expected raw fallback"),
        }
    }

    #[test]
    fn duration_reflects_sample_count() {
        let audio = NormalizedAudio {
            samples: vec![0i16; 48_000],
            sample_rate: 16_000,
        };
        assert!((audio.duration_secs() - 3.0).abs() < f64::EPSILON);
    }
}
