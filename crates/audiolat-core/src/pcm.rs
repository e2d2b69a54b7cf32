//! 16-bit PCM helpers
//!
//! Conversions between raw PCM bytes and normalized floats, and decibel gain.
//! Samples are normalized by `2^15 - 1`, so `i16::MIN` maps slightly below -1.0.

/// Full-scale value used for normalization (`2^15 - 1`)
pub const FULL_SCALE: f32 = i16::MAX as f32;

/// Gains above this value are refused by [`apply_gain_db`]
pub const MAX_GAIN_DB: f32 = 6.0;

/// Floor returned by [`linear_to_db`] for non-positive input
pub const SILENCE_DB: f64 = -100.0;

/// Byte order of a PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Convert decibels to a linear amplitude factor
///
/// # Example
/// ```
/// use audiolat_core::pcm::db_to_linear;
///
/// assert!((db_to_linear(-6.0) - 0.501).abs() < 0.001);
/// ```
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Convert a linear amplitude factor to decibels (`-100` for `x <= 0`)
pub fn linear_to_db(x: f64) -> f64 {
    if x <= 0.0 {
        return SILENCE_DB;
    }
    20.0 * x.log10()
}

fn read_sample(pair: &[u8], endian: Endian) -> i16 {
    let bytes = [pair[0], pair[1]];
    match endian {
        Endian::Little => i16::from_le_bytes(bytes),
        Endian::Big => i16::from_be_bytes(bytes),
    }
}

fn write_sample(sample: i16, endian: Endian) -> [u8; 2] {
    match endian {
        Endian::Little => sample.to_le_bytes(),
        Endian::Big => sample.to_be_bytes(),
    }
}

fn to_wide(s: f32) -> i32 {
    (s as f64 * FULL_SCALE as f64).round() as i32
}

/// Decode PCM bytes into normalized floats
///
/// A trailing odd byte is ignored.
pub fn samples_to_float(bytes: &[u8], endian: Endian) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| read_sample(pair, endian) as f32 / FULL_SCALE)
        .collect()
}

/// Encode normalized floats into PCM bytes
///
/// Values are rounded to the nearest integer and then narrowed to 16 bits
/// with wrap-around, e.g. `1.5` becomes a negative sample. Use
/// [`float_to_samples_clamped`] for saturating behavior.
pub fn float_to_samples(samples: &[f32], endian: Endian) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        // f64 -> i32 saturates, i32 -> i16 wraps
        let wide = to_wide(s);
        out.extend_from_slice(&write_sample(wide as i16, endian));
    }
    out
}

/// Encode normalized floats into PCM bytes, saturating at the 16-bit limits
pub fn float_to_samples_clamped(samples: &[f32], endian: Endian) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let wide = to_wide(s);
        let clamped = wide.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&write_sample(clamped, endian));
    }
    out
}

/// Multiply every sample of a little-endian buffer by `factor` in place
pub fn scale_in_place(bytes: &mut [u8], factor: f64) {
    let mut floats = samples_to_float(bytes, Endian::Little);
    for f in floats.iter_mut() {
        *f = (*f as f64 * factor) as f32;
    }
    let encoded = float_to_samples(&floats, Endian::Little);
    bytes[..encoded.len()].copy_from_slice(&encoded);
}

/// Apply a gain in dB to a little-endian 16-bit buffer in place
///
/// Refuses (leaves the buffer untouched) any gain above [`MAX_GAIN_DB`].
/// Returns whether the gain was applied.
///
/// # Example
/// ```
/// use audiolat_core::pcm::apply_gain_db;
///
/// let mut buf = 1000i16.to_le_bytes().to_vec();
/// assert!(!apply_gain_db(&mut buf, 7.0));
/// assert_eq!(buf, 1000i16.to_le_bytes());
/// ```
pub fn apply_gain_db(bytes: &mut [u8], gain_db: f32) -> bool {
    if gain_db > MAX_GAIN_DB {
        tracing::warn!(gain_db, max = MAX_GAIN_DB, "Refusing gain above limit");
        return false;
    }
    scale_in_place(bytes, db_to_linear(gain_db as f64));
    true
}

/// Convert i16 samples to little-endian bytes
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert little-endian bytes to i16 samples (trailing odd byte ignored)
pub fn le_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_db_conversions() {
        assert_relative_eq!(db_to_linear(0.0), 1.0);
        assert_relative_eq!(db_to_linear(20.0), 10.0, epsilon = 1e-12);
        assert_relative_eq!(linear_to_db(1.0), 0.0);
        assert_relative_eq!(linear_to_db(0.1), -20.0, epsilon = 1e-12);
        assert_eq!(linear_to_db(0.0), -100.0);
        assert_eq!(linear_to_db(-3.0), -100.0);
    }

    #[test]
    fn test_samples_to_float_endianness() {
        let le = [0xFF, 0x7F, 0x00, 0x80];
        let be = [0x7F, 0xFF, 0x80, 0x00];
        let a = samples_to_float(&le, Endian::Little);
        let b = samples_to_float(&be, Endian::Big);
        assert_eq!(a, b);
        assert_relative_eq!(a[0], 1.0);
        assert!(a[1] < -1.0);
    }

    #[test]
    fn test_float_to_samples_inverse() {
        let original = i16_to_le_bytes(&[0, 1, -1, 12345, -32767, 32767]);
        let floats = samples_to_float(&original, Endian::Little);
        let encoded = float_to_samples(&floats, Endian::Little);
        assert_eq!(encoded, original);
    }

    #[test]
    fn test_float_to_samples_wraps_on_overflow() {
        let wrapped = le_bytes_to_i16(&float_to_samples(&[1.5], Endian::Little));
        assert!(wrapped[0] < 0, "overflow should wrap, got {}", wrapped[0]);

        let clamped = le_bytes_to_i16(&float_to_samples_clamped(&[1.5, -2.0], Endian::Little));
        assert_eq!(clamped, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_gain_guard_above_limit() {
        let original = i16_to_le_bytes(&[100, -200, 3000]);
        let mut buf = original.clone();
        assert!(!apply_gain_db(&mut buf, 7.0));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_unity_gain() {
        let original = i16_to_le_bytes(&[100, -200, 3000, i16::MAX, -i16::MAX]);
        let mut buf = original.clone();
        assert!(apply_gain_db(&mut buf, 0.0));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_minus_six_db() {
        let input = [10000i16, -10000, 20000, 0, 1];
        let mut buf = i16_to_le_bytes(&input);
        assert!(apply_gain_db(&mut buf, -6.0));
        let factor = db_to_linear(-6.0);
        for (out, inp) in le_bytes_to_i16(&buf).iter().zip(input.iter()) {
            let expected = *inp as f64 * factor;
            assert!(
                (*out as f64 - expected).abs() <= 1.0,
                "expected ~{}, got {}",
                expected,
                out
            );
        }
    }

    #[test]
    fn test_odd_trailing_byte_untouched() {
        let mut buf = vec![0x10, 0x27, 0xAB];
        scale_in_place(&mut buf, 0.5);
        assert_eq!(buf[2], 0xAB);
        assert_eq!(le_bytes_to_i16(&buf)[0], 5000);
    }
}
