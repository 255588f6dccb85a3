//! Telephony audio transcoding: G.711 mu-law codec and sample-rate decimation.
//!
//! The telephony leg carries 8 kHz mu-law; recognition consumes that stream
//! directly, while synthesis produces linear PCM at a higher rate that must
//! be decimated and re-encoded before it can go back out on the wire. All
//! functions here are pure and stateless.

/// Sample rate of the telephony media stream, in Hz.
pub const TELEPHONY_RATE: u32 = 8_000;

/// Mu-law bias added to the magnitude before exponent extraction.
const BIAS: i32 = 0x84;
/// Largest magnitude representable after biasing.
const CLIP: i32 = 32_635;

/// Decode one mu-law byte to a 16-bit linear sample.
///
/// Inverts the stored one's complement, then expands the packed
/// sign/exponent/mantissa. Output is clamped to the `i16` range.
pub fn decode_mulaw(byte: u8) -> i16 {
    let word = !byte;
    let sign = word & 0x80;
    let exponent = (word >> 4) & 0x07;
    let mantissa = word & 0x0F;

    let mut magnitude = ((i32::from(mantissa) << 3) + BIAS) << exponent;
    magnitude -= BIAS;

    let value = if sign != 0 { -magnitude } else { magnitude };
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Encode a 16-bit linear sample as one mu-law byte.
///
/// Magnitudes are clipped, biased, and reduced to a 3-bit exponent taken
/// from the highest set bit plus a 4-bit mantissa. The result is stored
/// complemented per the mu-law wire convention.
pub fn encode_mulaw(sample: i16) -> u8 {
    // Widen before negating: -i16::MIN does not fit in i16.
    let mut magnitude = i32::from(sample);
    let sign: u8 = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode a mu-law byte buffer to linear samples.
pub fn decode_mulaw_buf(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_mulaw(b)).collect()
}

/// Encode linear samples as a mu-law byte buffer.
pub fn encode_mulaw_buf(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_mulaw(s)).collect()
}

/// Naive decimation: keep every `factor`-th sample.
///
/// Sufficient for speech because the synthesis rate is an integer multiple
/// of the telephony rate and speech energy above 4 kHz is sparse. A factor
/// of zero or one returns the input unchanged.
pub fn downsample(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples.iter().copied().step_by(factor).collect()
}

/// Interpret little-endian bytes as 16-bit linear samples.
///
/// An odd trailing byte is a truncated partial sample and is dropped.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize 16-bit linear samples as little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
