//! On-disk element formats.
//!
//! Receive buffers are always interleaved I/Q `f32`. On disk we either keep
//! them as is (complex64 pairs) or scale them into 16-bit integer pairs, the
//! way the radio itself ships them over the wire.

use std::{fmt, str::FromStr};

use byte_slice_cast::AsByteSlice;

/// Full-scale value when converting floats in [-1, 1] to `i16`
pub const I16_SCALE: f32 = i16::MAX as f32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex `f32` pairs, 8 bytes per sample
    Cf32,
    /// Complex `i16` pairs scaled by [`I16_SCALE`], 4 bytes per sample
    Ci16,
}

impl SampleFormat {
    /// Bytes per complex sample
    pub const fn element_size(self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Ci16 => 4,
        }
    }

    /// File name suffix that tells readers how to interpret a headerless file
    pub const fn file_suffix(self) -> &'static str {
        match self {
            SampleFormat::Cf32 => "c64",
            SampleFormat::Ci16 => "i16",
        }
    }

    /// Encode interleaved I/Q floats into `dst`.
    ///
    /// `dst` must be exactly `iq.len() / 2 * element_size()` bytes. `scratch` is
    /// only touched for the integer format and is reused across calls.
    pub fn encode(self, iq: &[f32], dst: &mut [u8], scratch: &mut Vec<i16>) {
        match self {
            SampleFormat::Cf32 => dst.copy_from_slice(iq.as_byte_slice()),
            SampleFormat::Ci16 => {
                scratch.clear();
                scratch.extend(iq.iter().map(|&x| scale_to_i16(x)));
                dst.copy_from_slice(scratch.as_byte_slice());
            }
        }
    }
}

/// Scale and saturate a float sample into the 16-bit range
pub fn scale_to_i16(x: f32) -> i16 {
    (x * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::Cf32 => write!(f, "cf32"),
            SampleFormat::Ci16 => write!(f, "ci16"),
        }
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cf32" | "c64" => Ok(SampleFormat::Cf32),
            "ci16" | "sc16" | "i16" => Ok(SampleFormat::Ci16),
            other => Err(format!("unknown sample format `{other}` (use cf32 or ci16)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cf32_is_native_floats() {
        let iq = [1.0f32, -0.5];
        let mut dst = [0u8; 8];
        SampleFormat::Cf32.encode(&iq, &mut dst, &mut Vec::new());
        assert_eq!(&dst[..4], &1.0f32.to_ne_bytes());
        assert_eq!(&dst[4..], &(-0.5f32).to_ne_bytes());
    }

    #[test]
    fn test_ci16_scales_and_saturates() {
        assert_eq!(scale_to_i16(1.0), i16::MAX);
        assert_eq!(scale_to_i16(-2.0), i16::MIN);
        assert_eq!(scale_to_i16(0.5), 16383);
        let iq = [0.0f32, 1.0];
        let mut dst = [0u8; 4];
        let mut scratch = Vec::new();
        SampleFormat::Ci16.encode(&iq, &mut dst, &mut scratch);
        assert_eq!(&dst[..2], &0i16.to_ne_bytes());
        assert_eq!(&dst[2..], &i16::MAX.to_ne_bytes());
    }

    #[test]
    fn test_parse() {
        assert_eq!("sc16".parse::<SampleFormat>(), Ok(SampleFormat::Ci16));
        assert!("cu8".parse::<SampleFormat>().is_err());
        assert_eq!(SampleFormat::Cf32.to_string(), "cf32");
    }
}
