//! The decoded-PCM stream contract the player consumes.

use thiserror::Error;

use crate::audio::AudioFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoder failure: {0}")]
    Backend(String),
}

/// Result of one [`DecoderStream::read`]: bytes produced and the stream's
/// sample-frame position. Zero bytes signals end of stream.
#[derive(Debug, Clone, Copy)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub pos_samples: u64,
}

/// An opened, seekable stream of PCM bytes with a fixed format.
///
/// Ownership passes to the player when a stream is loaded; dropping the
/// stream closes it. The player treats a read failure as end of stream and
/// moves on to the next track.
pub trait DecoderStream: Send {
    fn format(&self) -> AudioFormat;

    /// Fill `buf` with decoded bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, DecodeError>;

    /// Seek relative to the current position and return the new position in
    /// sample frames.
    fn seek(&mut self, delta_ms: i64) -> Result<u64, DecodeError>;
}
