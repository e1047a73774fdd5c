//! Symphonia-backed decoder streams for local files.

use std::fs::File;
use std::path::Path;

use log::warn;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use auris_lib::audio::{AudioFormat, AudioFormatRange, SampleFormat};
use auris_lib::decoder::{DecodeError, DecoderStream, ReadOutcome};

/// Probe a file and return its format reader.
fn open_reader(path: &str) -> Result<Box<dyn FormatReader>, DecodeError> {
    let src = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = Path::new(path).extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|err| DecodeError::Backend(format!("unsupported format: {err}")))?;
    Ok(probed.format)
}

/// A decoded local file, producing interleaved host-endian f32 PCM.
pub struct FileStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    fmt: AudioFormat,
    pending: Vec<u8>,
    pending_offset: usize,
    pos_bytes: u64,
    eof: bool,
}

impl FileStream {
    /// Open `path` and negotiate the output format against `range`.
    pub fn open(path: &str, range: &AudioFormatRange) -> Result<Self, DecodeError> {
        let format = open_reader(path)?;
        let track = format
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::Backend("no audio track".into()))?;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|err| DecodeError::Backend(format!("decoder init failed: {err}")))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| DecodeError::Backend("unknown sample rate".into()))?;
        let channels = track
            .codec_params
            .channels
            .map(|channels| channels.count() as u32)
            .ok_or_else(|| DecodeError::Backend("unknown channel layout".into()))?;

        let fmt = AudioFormat {
            sample_fmt: SampleFormat::native_f32(),
            sample_rate,
            channels,
        };
        if !range.includes(&fmt) {
            return Err(DecodeError::Backend(format!(
                "format {fmt:?} not accepted by the output"
            )));
        }

        Ok(Self {
            format,
            decoder,
            track_id,
            fmt,
            pending: Vec::new(),
            pending_offset: 0,
            pos_bytes: 0,
            eof: false,
        })
    }

    /// Decode packets until a non-empty buffer of samples is pending or the
    /// stream ends.
    fn refill(&mut self) -> Result<(), DecodeError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Ok(());
                }
                Err(Error::ResetRequired) => {
                    self.eof = true;
                    return Ok(());
                }
                Err(err) => return Err(DecodeError::Backend(err.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let mut samples =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                    samples.copy_interleaved_ref(decoded);
                    self.pending.clear();
                    self.pending_offset = 0;
                    self.pending.reserve(samples.len() * 4);
                    for sample in samples.samples() {
                        self.pending.extend_from_slice(&sample.to_ne_bytes());
                    }
                    return Ok(());
                }
                Err(Error::DecodeError(err)) => {
                    warn!("decode error: {err}");
                }
                Err(err) => return Err(DecodeError::Backend(err.to_string())),
            }
        }
    }
}

impl DecoderStream for FileStream {
    fn format(&self) -> AudioFormat {
        self.fmt
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, DecodeError> {
        let mut written = 0;
        while written < buf.len() {
            if self.pending_offset == self.pending.len() {
                if self.eof {
                    break;
                }
                self.refill()?;
                continue;
            }
            let available = self.pending.len() - self.pending_offset;
            let take = available.min(buf.len() - written);
            buf[written..written + take]
                .copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + take]);
            self.pending_offset += take;
            written += take;
        }
        self.pos_bytes += written as u64;
        Ok(ReadOutcome {
            bytes: written,
            pos_samples: self.pos_bytes / self.fmt.frame_bytes() as u64,
        })
    }

    fn seek(&mut self, delta_ms: i64) -> Result<u64, DecodeError> {
        let frame_bytes = self.fmt.frame_bytes() as u64;
        let rate = u64::from(self.fmt.sample_rate);
        let current_ms = (self.pos_bytes / frame_bytes) * 1000 / rate;
        let target_ms = (current_ms as i64 + delta_ms).max(0) as u64;

        let time = Time::new(target_ms / 1000, (target_ms % 1000) as f64 / 1000.0);
        let seeked = self
            .format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|err| DecodeError::Backend(err.to_string()))?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.eof = false;
        self.pos_bytes = seeked.actual_ts * frame_bytes;
        Ok(seeked.actual_ts)
    }
}

/// Duration of a file in seconds, when the container declares it.
pub fn probe_duration(path: &str) -> Option<f64> {
    let format = open_reader(path).ok()?;
    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)?;
    let frames = track.codec_params.n_frames?;
    let rate = track.codec_params.sample_rate?;
    Some(frames as f64 / rate as f64)
}
