//! Audio framing helpers.
//!
//! Every API boundary in this crate speaks mono PCM 16-bit signed
//! little-endian at 16kHz. The stream transport frames that audio as base64
//! inside JSON events; the peer transport carries G.711 u-law at 8kHz on its
//! media track, so it needs the resampling and companding helpers below.

use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;

/// Sample rate used at every API boundary.
pub const SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the G.711 media track on the peer transport.
pub const PEER_SAMPLE_RATE: u32 = 8_000;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Wire name of the audio format in session configuration.
pub const PCM16_FORMAT: &str = "pcm16";

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Convert little-endian PCM16 bytes into samples. A trailing odd byte is dropped.
pub fn pcm16_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert samples into little-endian PCM16 bytes.
pub fn samples_to_pcm16(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

/// Base64-frame raw audio for `input_audio_buffer.append`.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decode a base64 audio delta.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(data)
}

/// Playback duration of `len` bytes of PCM16 at `sample_rate`.
pub fn pcm16_duration(len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = (len / BYTES_PER_SAMPLE) as u64;
    Duration::from_micros(samples * 1_000_000 / sample_rate as u64)
}

/// Halve the sample rate by averaging adjacent pairs (16kHz -> 8kHz).
pub fn downsample_by_two(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => ((*a as i32 + *b as i32) / 2) as i16,
            [a] => *a,
            _ => 0,
        })
        .collect()
}

/// Double the sample rate with linear interpolation (8kHz -> 16kHz).
pub fn upsample_by_two(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for (i, sample) in samples.iter().enumerate() {
        out.push(*sample);
        let next = samples.get(i + 1).copied().unwrap_or(*sample);
        out.push(((*sample as i32 + next as i32) / 2) as i16);
    }
    out
}

/// Compand one linear sample to G.711 u-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent: i32 = 7;
    let mut mask: i32 = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expand one G.711 u-law byte to a linear sample.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode 16kHz PCM16 bytes into an 8kHz u-law payload for the media track.
pub fn encode_peer_payload(pcm: &[u8]) -> Bytes {
    let samples = downsample_by_two(&pcm16_to_samples(pcm));
    Bytes::from(samples.into_iter().map(linear_to_ulaw).collect::<Vec<u8>>())
}

/// Decode an 8kHz u-law RTP payload into 16kHz PCM16 bytes.
pub fn decode_peer_payload(payload: &[u8]) -> Bytes {
    let samples: Vec<i16> = payload.iter().copied().map(ulaw_to_linear).collect();
    samples_to_pcm16(&upsample_by_two(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_conversion_drops_odd_byte() {
        let samples = pcm16_to_samples(&[0x01, 0x00, 0xFF, 0xFF, 0x7F]);
        assert_eq!(samples, vec![1, -1]);
        assert_eq!(samples_to_pcm16(&samples).as_ref(), &[0x01, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_ulaw_silence_and_extremes() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert!(ulaw_to_linear(0x80) > 32000);
        assert!(ulaw_to_linear(0x00) < -32000);
    }

    #[test]
    fn test_ulaw_error_is_bounded() {
        // u-law quantization error grows with magnitude; stay within ~3%
        for sample in [-20000i16, -1000, -100, 100, 1000, 20000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            assert!(
                error <= (sample as i32).abs() / 32 + 8,
                "sample {} decoded to {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_resampling_lengths() {
        let input: Vec<i16> = (0..320).map(|i| i as i16).collect();
        let down = downsample_by_two(&input);
        assert_eq!(down.len(), 160);
        assert_eq!(upsample_by_two(&down).len(), 320);
        assert_eq!(downsample_by_two(&[5, 7, 9]), vec![6, 9]);
    }

    #[test]
    fn test_peer_payload_sizes() {
        // 20ms of 16kHz PCM16 = 640 bytes -> 160 u-law bytes at 8kHz
        let pcm = vec![0u8; 640];
        let payload = encode_peer_payload(&pcm);
        assert_eq!(payload.len(), 160);
        assert_eq!(decode_peer_payload(&payload).len(), 640);
    }

    #[test]
    fn test_pcm16_duration() {
        assert_eq!(pcm16_duration(32_000, SAMPLE_RATE), Duration::from_secs(1));
        assert_eq!(pcm16_duration(640, SAMPLE_RATE), Duration::from_millis(20));
        assert_eq!(pcm16_duration(640, 0), Duration::ZERO);
    }

    #[test]
    fn test_base64_framing() {
        let data = vec![0u8, 1, 2, 3];
        let encoded = encode_base64(&data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);
        assert!(decode_base64("not base64!").is_err());
    }
}
