//! PCM sample formats and format negotiation types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A single PCM sample encoding.
///
/// The discriminant doubles as the bit position of the format inside a
/// [`FormatMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SampleFormat {
    Alaw = 0,
    Ulaw = 1,
    S8 = 2,
    S16Le = 3,
    S16Be = 4,
    S24Le = 5,
    S24Be = 6,
    S24In32Le = 7,
    S24In32Be = 8,
    S32Le = 9,
    S32Be = 10,
    U8 = 11,
    U16Le = 12,
    U16Be = 13,
    U24Le = 14,
    U24Be = 15,
    U24In32Le = 16,
    U24In32Be = 17,
    U32Le = 18,
    U32Be = 19,
    F32Le = 20,
    F32Be = 21,
    F64Le = 22,
    F64Be = 23,
}

bitflags! {
    /// Set of acceptable sample formats, one bit per [`SampleFormat`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatMask: u32 {
        const ALAW = 1 << 0;
        const ULAW = 1 << 1;
        const S8 = 1 << 2;
        const S16_LE = 1 << 3;
        const S16_BE = 1 << 4;
        const S24_LE = 1 << 5;
        const S24_BE = 1 << 6;
        const S24_IN_32_LE = 1 << 7;
        const S24_IN_32_BE = 1 << 8;
        const S32_LE = 1 << 9;
        const S32_BE = 1 << 10;
        const U8 = 1 << 11;
        const U16_LE = 1 << 12;
        const U16_BE = 1 << 13;
        const U24_LE = 1 << 14;
        const U24_BE = 1 << 15;
        const U24_IN_32_LE = 1 << 16;
        const U24_IN_32_BE = 1 << 17;
        const U32_LE = 1 << 18;
        const U32_BE = 1 << 19;
        const F32_LE = 1 << 20;
        const F32_BE = 1 << 21;
        const F64_LE = 1 << 22;
        const F64_BE = 1 << 23;
    }
}

impl serde::Serialize for FormatMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> serde::Deserialize<'de> for FormatMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(FormatMask::from_bits_retain(bits))
    }
}

impl SampleFormat {
    /// Width of one sample of this format in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Alaw | SampleFormat::Ulaw | SampleFormat::S8 | SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be | SampleFormat::U16Le | SampleFormat::U16Be => 2,
            SampleFormat::S24Le | SampleFormat::S24Be | SampleFormat::U24Le | SampleFormat::U24Be => 3,
            SampleFormat::S24In32Le
            | SampleFormat::S24In32Be
            | SampleFormat::U24In32Le
            | SampleFormat::U24In32Be
            | SampleFormat::S32Le
            | SampleFormat::S32Be
            | SampleFormat::U32Le
            | SampleFormat::U32Be
            | SampleFormat::F32Le
            | SampleFormat::F32Be => 4,
            SampleFormat::F64Le | SampleFormat::F64Be => 8,
        }
    }

    /// The bit representing this format inside a [`FormatMask`].
    pub const fn mask(self) -> FormatMask {
        FormatMask::from_bits_retain(1 << self as u32)
    }

    /// 32-bit float in the byte order of the host.
    pub const fn native_f32() -> SampleFormat {
        if cfg!(target_endian = "big") {
            SampleFormat::F32Be
        } else {
            SampleFormat::F32Le
        }
    }

    /// Signed 16-bit in the byte order of the host.
    pub const fn native_s16() -> SampleFormat {
        if cfg!(target_endian = "big") {
            SampleFormat::S16Be
        } else {
            SampleFormat::S16Le
        }
    }
}

/// A concrete PCM stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_fmt: SampleFormat,
    pub sample_rate: u32,
    pub channels: u32,
}

impl AudioFormat {
    /// Bytes of one interleaved frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.sample_fmt.bytes_per_sample() * self.channels as usize
    }

    /// Bytes of one second of audio in this format.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.sample_rate as usize
    }
}

/// The formats an output endpoint is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormatRange {
    pub sample_fmts: FormatMask,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub min_channels: u32,
    pub max_channels: u32,
}

impl AudioFormatRange {
    pub fn includes(&self, fmt: &AudioFormat) -> bool {
        self.sample_fmts.contains(fmt.sample_fmt.mask())
            && self.min_sample_rate <= fmt.sample_rate
            && self.max_sample_rate >= fmt.sample_rate
            && self.min_channels <= fmt.channels
            && self.max_channels >= fmt.channels
    }
}
