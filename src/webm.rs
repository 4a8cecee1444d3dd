// EBML/WebM container helpers: writing of chunked Opus streams and a
// tolerant reader used to repair concatenated capture chunks.

use log::warn;
use std::error::Error as StdError;
use std::fmt;

// Element IDs (IDs carry their own length marker bits)
pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const EBML_VERSION: u32 = 0x4286;
pub const EBML_READ_VERSION: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const DOC_TYPE: u32 = 0x4282;
pub const DOC_TYPE_VERSION: u32 = 0x4287;
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;
pub const SEGMENT: u32 = 0x1853_8067;
pub const INFO: u32 = 0x1549_A966;
pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
pub const MUXING_APP: u32 = 0x4D80;
pub const WRITING_APP: u32 = 0x5741;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
pub const TRACK_TYPE: u32 = 0x83;
pub const CODEC_ID: u32 = 0x86;
pub const CODEC_PRIVATE: u32 = 0x63A2;
pub const AUDIO: u32 = 0xE1;
pub const SAMPLING_FREQUENCY: u32 = 0xB5;
pub const CHANNELS: u32 = 0x9F;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const TIMESTAMP: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;
pub const VOID: u32 = 0xEC;

#[derive(Debug)]
pub enum WebmError {
    /// The byte stream is not a parseable EBML/WebM stream
    Malformed(String),
    /// The stream parsed but carries a codec other than Opus
    UnsupportedCodec(String),
}

impl fmt::Display for WebmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebmError::Malformed(msg) => write!(f, "malformed WebM stream: {}", msg),
            WebmError::UnsupportedCodec(codec) => {
                write!(f, "unsupported codec in WebM stream: {}", codec)
            }
        }
    }
}

impl StdError for WebmError {}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub fn write_ebml_id(buf: &mut Vec<u8>, id: u32) {
    // EBML IDs already include their size marker bits, just write raw bytes
    if id <= 0xFF {
        buf.push(id as u8);
    } else if id <= 0xFFFF {
        buf.push((id >> 8) as u8);
        buf.push(id as u8);
    } else if id <= 0xFFFFFF {
        buf.push((id >> 16) as u8);
        buf.push((id >> 8) as u8);
        buf.push(id as u8);
    } else {
        buf.push((id >> 24) as u8);
        buf.push((id >> 16) as u8);
        buf.push((id >> 8) as u8);
        buf.push(id as u8);
    }
}

pub fn write_ebml_size(buf: &mut Vec<u8>, size: u64) {
    if size <= 0x7E {
        buf.push((size | 0x80) as u8);
    } else if size <= 0x3FFE {
        buf.push(((size >> 8) | 0x40) as u8);
        buf.push(size as u8);
    } else if size <= 0x1FFFFE {
        buf.push(((size >> 16) | 0x20) as u8);
        buf.push((size >> 8) as u8);
        buf.push(size as u8);
    } else if size <= 0x0FFFFFFE {
        buf.push(((size >> 24) | 0x10) as u8);
        buf.push((size >> 16) as u8);
        buf.push((size >> 8) as u8);
        buf.push(size as u8);
    } else {
        // 8-byte size for unknown/streaming
        buf.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}

/// Unknown-size marker, used for the live-streamed Segment element
pub fn write_ebml_unknown_size(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
}

pub fn write_ebml_uint(buf: &mut Vec<u8>, id: u32, value: u64) {
    write_ebml_id(buf, id);
    let bytes = if value == 0 {
        1
    } else {
        ((64 - value.leading_zeros()) + 7) / 8
    } as usize;
    write_ebml_size(buf, bytes as u64);
    for i in (0..bytes).rev() {
        buf.push((value >> (i * 8)) as u8);
    }
}

pub fn write_ebml_string(buf: &mut Vec<u8>, id: u32, value: &str) {
    write_ebml_id(buf, id);
    write_ebml_size(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

pub fn write_ebml_binary(buf: &mut Vec<u8>, id: u32, data: &[u8]) {
    write_ebml_id(buf, id);
    write_ebml_size(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn write_ebml_float(buf: &mut Vec<u8>, id: u32, value: f64) {
    write_ebml_id(buf, id);
    write_ebml_size(buf, 8);
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_ebml_master(buf: &mut Vec<u8>, id: u32, body: &[u8]) {
    write_ebml_id(buf, id);
    write_ebml_size(buf, body.len() as u64);
    buf.extend_from_slice(body);
}

/// Header for a chunked WebM/Opus stream: EBML header, unsized Segment,
/// Info and Tracks. Clusters are appended after this, so concatenating the
/// first chunk with continuation chunks reconstructs one valid stream.
pub fn stream_header(codec_private: &[u8], sample_rate_hz: f64, channels: u64) -> Vec<u8> {
    let mut ebml = Vec::new();
    write_ebml_uint(&mut ebml, EBML_VERSION, 1);
    write_ebml_uint(&mut ebml, EBML_READ_VERSION, 1);
    write_ebml_uint(&mut ebml, EBML_MAX_ID_LENGTH, 4);
    write_ebml_uint(&mut ebml, EBML_MAX_SIZE_LENGTH, 8);
    write_ebml_string(&mut ebml, DOC_TYPE, "webm");
    write_ebml_uint(&mut ebml, DOC_TYPE_VERSION, 4);
    write_ebml_uint(&mut ebml, DOC_TYPE_READ_VERSION, 2);

    let mut out = Vec::new();
    write_ebml_master(&mut out, EBML_HEADER, &ebml);

    write_ebml_id(&mut out, SEGMENT);
    write_ebml_unknown_size(&mut out);

    let mut info = Vec::new();
    write_ebml_uint(&mut info, TIMESTAMP_SCALE, 1_000_000); // ms ticks
    write_ebml_string(&mut info, MUXING_APP, "lectern");
    write_ebml_string(&mut info, WRITING_APP, "lectern");
    write_ebml_master(&mut out, INFO, &info);

    let mut audio = Vec::new();
    write_ebml_float(&mut audio, SAMPLING_FREQUENCY, sample_rate_hz);
    write_ebml_uint(&mut audio, CHANNELS, channels);

    let mut entry = Vec::new();
    write_ebml_uint(&mut entry, TRACK_NUMBER, 1);
    write_ebml_uint(&mut entry, TRACK_UID, 1);
    write_ebml_uint(&mut entry, TRACK_TYPE, 2); // audio
    write_ebml_string(&mut entry, CODEC_ID, "A_OPUS");
    write_ebml_binary(&mut entry, CODEC_PRIVATE, codec_private);
    write_ebml_master(&mut entry, AUDIO, &audio);

    let mut tracks = Vec::new();
    write_ebml_master(&mut tracks, TRACK_ENTRY, &entry);
    write_ebml_master(&mut out, TRACKS, &tracks);

    out
}

/// One SimpleBlock body: track number vint, relative timestamp, flags, frame
pub fn simple_block(track: u8, relative_ms: i16, frame: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(frame.len() + 4);
    block.push(0x80 | track); // 1-byte vint track number
    block.extend_from_slice(&relative_ms.to_be_bytes());
    block.push(0x80); // keyframe, no lacing
    block.extend_from_slice(frame);
    block
}

/// A Cluster holding one timestamp and a run of SimpleBlocks.
/// `blocks` are (relative-ms, opus packet) pairs.
pub fn cluster(timestamp_ms: u64, blocks: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    write_ebml_uint(&mut body, TIMESTAMP, timestamp_ms);
    for (relative_ms, frame) in blocks {
        let block = simple_block(1, *relative_ms as i16, frame);
        write_ebml_binary(&mut body, SIMPLE_BLOCK, &block);
    }
    let mut out = Vec::new();
    write_ebml_master(&mut out, CLUSTER, &body);
    out
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn byte(&mut self) -> Result<u8, WebmError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| WebmError::Malformed("unexpected end of stream".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WebmError> {
        if self.remaining() < n {
            return Err(WebmError::Malformed("element overruns stream".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: u64) -> Result<(), WebmError> {
        self.take(n as usize)?;
        Ok(())
    }

    /// Read an element ID, keeping the marker bits (as the writer does)
    fn read_id(&mut self) -> Result<u32, WebmError> {
        let first = self.byte()?;
        let len = if first & 0x80 != 0 {
            1
        } else if first & 0x40 != 0 {
            2
        } else if first & 0x20 != 0 {
            3
        } else if first & 0x10 != 0 {
            4
        } else {
            return Err(WebmError::Malformed(format!("invalid ID byte {:#04x}", first)));
        };
        let mut id = first as u32;
        for _ in 1..len {
            id = (id << 8) | self.byte()? as u32;
        }
        Ok(id)
    }

    /// Read an element size; None means unknown (streaming) size
    fn read_size(&mut self) -> Result<Option<u64>, WebmError> {
        let first = self.byte()?;
        let len = first.leading_zeros() as usize + 1;
        if len > 8 {
            return Err(WebmError::Malformed("invalid size byte".into()));
        }
        let mask: u8 = if len >= 8 { 0 } else { 0xFF >> len };
        let mut value = (first & mask) as u64;
        let mut all_ones = value == mask as u64;
        for _ in 1..len {
            let b = self.byte()?;
            all_ones = all_ones && b == 0xFF;
            value = (value << 8) | b as u64;
        }
        if all_ones {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }
}

/// Parse a SimpleBlock body and return the contained frame.
/// Laced blocks are skipped (the capture path never laces).
fn parse_simple_block(body: &[u8]) -> Option<Vec<u8>> {
    let mut cur = Cursor::new(body);
    // Track number vint
    let first = cur.byte().ok()?;
    let len = first.leading_zeros() as usize + 1;
    for _ in 1..len {
        cur.byte().ok()?;
    }
    cur.take(2).ok()?; // relative timestamp
    let flags = cur.byte().ok()?;
    if flags & 0x06 != 0 {
        warn!("skipping laced SimpleBlock");
        return None;
    }
    let rest = cur.remaining();
    cur.take(rest).ok().map(|f| f.to_vec())
}

/// Scan a Tracks element for the codec ID, best effort.
fn tracks_codec_id(body: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(body);
    while cur.remaining() > 0 {
        let id = cur.read_id().ok()?;
        let size = cur.read_size().ok()??;
        match id {
            TRACK_ENTRY => continue, // descend
            CODEC_ID => {
                let raw = cur.take(size as usize).ok()?;
                return Some(String::from_utf8_lossy(raw).into_owned());
            }
            _ => cur.skip(size).ok()?,
        }
    }
    None
}

/// Extract the Opus packets from a (possibly concatenated) WebM stream.
///
/// This is the repair step for reassembled capture chunks: clusters are
/// walked in byte order and block timestamps are ignored, so the minor
/// timestamp irregularities introduced by concatenation do not matter.
/// Trailing garbage after at least one parsed cluster is tolerated.
pub fn extract_opus_packets(data: &[u8]) -> Result<Vec<Vec<u8>>, WebmError> {
    let mut cur = Cursor::new(data);

    let id = cur.read_id()?;
    if id != EBML_HEADER {
        return Err(WebmError::Malformed("not an EBML stream".into()));
    }
    let size = cur
        .read_size()?
        .ok_or_else(|| WebmError::Malformed("unsized EBML header".into()))?;
    cur.skip(size)?;

    let id = cur.read_id()?;
    if id != SEGMENT {
        return Err(WebmError::Malformed("missing Segment element".into()));
    }
    let _ = cur.read_size()?; // usually unknown for streamed captures

    let mut packets: Vec<Vec<u8>> = Vec::new();
    let mut saw_cluster = false;

    while cur.remaining() > 0 {
        let header: Result<(u32, Option<u64>), WebmError> = (|| {
            let id = cur.read_id()?;
            let size = cur.read_size()?;
            Ok((id, size))
        })();
        let (id, size) = match header {
            Ok(pair) => pair,
            Err(e) => {
                if saw_cluster {
                    warn!("tolerating trailing data after clusters: {}", e);
                    break;
                }
                return Err(e);
            }
        };

        match id {
            // Clusters (sized or unknown-size) are transparent: their
            // children follow contiguously and are handled right here.
            CLUSTER => {
                saw_cluster = true;
            }
            TIMESTAMP => {
                let size =
                    size.ok_or_else(|| WebmError::Malformed("unsized timestamp".into()))?;
                cur.skip(size)?;
            }
            SIMPLE_BLOCK => {
                let size = size.ok_or_else(|| WebmError::Malformed("unsized block".into()))?;
                let body = cur.take(size as usize)?;
                if let Some(frame) = parse_simple_block(body) {
                    packets.push(frame);
                }
            }
            TRACKS => {
                let size = size.ok_or_else(|| WebmError::Malformed("unsized Tracks".into()))?;
                let body = cur.take(size as usize)?;
                if let Some(codec) = tracks_codec_id(body) {
                    if codec != "A_OPUS" {
                        return Err(WebmError::UnsupportedCodec(codec));
                    }
                }
            }
            _ => match size {
                Some(n) => cur.skip(n)?,
                None => {
                    if saw_cluster {
                        warn!("stopping at unsized element {:#x} after clusters", id);
                        break;
                    }
                    return Err(WebmError::Malformed(format!(
                        "unsized element {:#x} before any cluster",
                        id
                    )));
                }
            },
        }
    }

    if packets.is_empty() {
        return Err(WebmError::Malformed("no audio blocks found".into()));
    }
    Ok(packets)
}
