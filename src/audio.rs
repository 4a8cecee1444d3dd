/// Create Opus identification header
pub fn create_opus_id_header(channels: u8, sample_rate: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(19);
    header.extend_from_slice(b"OpusHead");
    header.push(1); // Version
    header.push(channels); // Channel count
    header.extend_from_slice(&0u16.to_le_bytes()); // Pre-skip
    header.extend_from_slice(&sample_rate.to_le_bytes()); // Input sample rate
    header.extend_from_slice(&0i16.to_le_bytes()); // Output gain
    header.push(0); // Channel mapping family
    header
}

/// Create Opus comment header
pub fn create_opus_comment_header() -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(b"OpusTags");

    let vendor = b"lectern";
    header.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    header.extend_from_slice(vendor);
    header.extend_from_slice(&0u32.to_le_bytes());

    header
}

/// Resample audio from source sample rate to target rate
pub fn resample(samples: &[i16], src_rate: u32, target_rate: u32) -> Vec<i16> {
    if src_rate == target_rate {
        return samples.to_vec();
    }

    let ratio = target_rate as f64 / src_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut resampled = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < samples.len() {
            let s1 = samples[src_idx] as f64;
            let s2 = samples[src_idx + 1] as f64;
            (s1 + frac * (s2 - s1)) as i16
        } else if src_idx < samples.len() {
            samples[src_idx]
        } else {
            0
        };

        resampled.push(sample);
    }

    resampled
}

/// Average interleaved channels down to mono
pub fn downmix_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            (sum / chunk.len() as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_id_header_layout() {
        let header = create_opus_id_header(1, 48000);
        assert_eq!(&header[..8], b"OpusHead");
        assert_eq!(header.len(), 19);
        assert_eq!(header[9], 1); // channels
        assert_eq!(u32::from_le_bytes(header[12..16].try_into().unwrap()), 48000);
    }

    #[test]
    fn resample_halves_length() {
        let samples: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        let out = resample(&samples, 48000, 24000);
        assert_eq!(out.len(), 500);
    }

    #[test]
    fn resample_same_rate_is_copy() {
        let samples = vec![1i16, 2, 3];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn downmix_averages_pairs() {
        let samples = vec![10i16, 20, 30, 50];
        assert_eq!(downmix_mono(&samples, 2), vec![15, 40]);
    }
}
