//! The output endpoint contract the player drives.

use thiserror::Error;

use crate::audio::{AudioFormat, AudioFormatRange};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is not connected")]
    NotConnected,
    #[error("format not accepted by sink: {0:?}")]
    UnsupportedFormat(AudioFormat),
    #[error("audio backend failure: {0}")]
    Backend(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Authoritative output state, delivered back to the player through
/// `info_changed` after pause/mute requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkInfo {
    pub stopped: bool,
    pub paused: bool,
    pub mute: bool,
    pub vol_left: u8,
    pub vol_right: u8,
}

/// A writable region handed out by [`Sink::provide_buf`].
///
/// An empty region means the sink wants nothing right now. The region is
/// returned through [`Sink::commit_buf`] with the number of bytes written;
/// zero cancels it.
pub struct SinkBuf {
    data: Vec<u8>,
}

impl SinkBuf {
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Operations the player invokes on an output.
///
/// The player performs no sample conversion; a pushed format must lie within
/// the range the sink declares. Implementations deliver their upcalls
/// (input requests, state changes, connection failures) through the
/// `SinkController` obtained from the player, from any thread.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Formats this sink accepts, communicated to decoders for negotiation.
    fn format_range(&self) -> AudioFormatRange;

    /// Connect to the output backend.
    fn enable(&mut self) -> SinkResult<()>;

    /// Tear the connection down.
    fn disable(&mut self) -> SinkResult<()>;

    /// Begin a new stream of the given format; the sink must be ready to
    /// hand out buffers afterwards.
    fn set_format(&mut self, fmt: &AudioFormat) -> SinkResult<()>;

    /// Request a pause state change. The actual state arrives back through
    /// `info_changed`.
    fn pause(&mut self, paused: bool) -> SinkResult<()>;

    /// Request a mute state change; same handshake as [`Sink::pause`].
    fn mute(&mut self, mute: bool) -> SinkResult<()>;

    /// Ask for a writable region; empty means nothing is wanted right now.
    fn provide_buf(&mut self) -> SinkResult<SinkBuf>;

    /// Hand a region back with `written` bytes filled in.
    fn commit_buf(&mut self, buf: SinkBuf, written: usize) -> SinkResult<()>;

    /// Discard buffered audio and prepare to accept `fmt`, keeping the
    /// connection alive.
    fn flush(&mut self, fmt: &AudioFormat) -> SinkResult<()>;

    /// Milliseconds of audio committed but not yet heard.
    fn latency_ms(&self) -> u32;

    /// Stop pulling input; drain behavior is sink-defined.
    fn stop(&mut self) -> SinkResult<()>;
}
