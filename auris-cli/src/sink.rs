//! Rodio-backed output sink.
//!
//! The rodio output stream is not `Send`, so a dedicated device thread owns
//! it for the lifetime of the connection. The player-facing trait methods
//! convert committed PCM into f32 sample buffers and hand them to that
//! thread; consumed audio is inferred from the sink queue depth plus a
//! pause-aware clock over the chunk currently playing, which yields the
//! latency estimate the engine's position math needs.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Sink as RodioSink};

use auris_lib::audio::{AudioFormat, AudioFormatRange, FormatMask, SampleFormat};
use auris_lib::player::SinkController;
use auris_lib::sink::{Sink, SinkBuf, SinkError, SinkInfo, SinkResult};

const CHUNK_MS: u32 = 100;
const LOW_WATER_SECS: f64 = 0.25;
const HIGH_WATER_SECS: f64 = 0.5;
const DEVICE_OPEN_ATTEMPTS: usize = 8;
const DEVICE_OPEN_BACKOFF: Duration = Duration::from_millis(50);

enum DeviceCommand {
    Append(SamplesBuffer, f64),
    Pause(bool),
    Mute(bool),
    Flush,
    Drain,
    Shutdown,
}

/// Accumulates playing time of the chunk at the head of the sink queue.
struct ChunkClock {
    accumulated: Duration,
    started: Option<Instant>,
}

impl ChunkClock {
    fn new() -> Self {
        Self {
            accumulated: Duration::ZERO,
            started: None,
        }
    }

    fn restart(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started = None;
    }

    fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.accumulated + started.elapsed(),
            None => self.accumulated,
        }
    }
}

struct DeviceState {
    fmt: Option<AudioFormat>,
    chunk_lengths: Vec<f64>,
    clock: ChunkClock,
    paused: bool,
    mute: bool,
    stopped: bool,
    draining: bool,
    gain: f32,
}

impl DeviceState {
    fn buffered_secs(&self) -> f64 {
        let queued: f64 = self.chunk_lengths.iter().sum();
        (queued - self.clock.elapsed().as_secs_f64()).max(0.0)
    }

    fn info(&self) -> SinkInfo {
        let volume = if self.mute {
            0
        } else {
            (self.gain * 100.0).clamp(0.0, 255.0) as u8
        };
        SinkInfo {
            stopped: self.stopped,
            paused: self.paused,
            mute: self.mute,
            vol_left: volume,
            vol_right: volume,
        }
    }
}

/// System audio output driven through rodio.
pub struct AudioSink {
    ctl: SinkController,
    shared: Arc<Mutex<DeviceState>>,
    commands: Option<Sender<DeviceCommand>>,
    device: Option<JoinHandle<()>>,
}

impl AudioSink {
    pub fn new(ctl: SinkController, gain: f32) -> Self {
        Self {
            ctl,
            shared: Arc::new(Mutex::new(DeviceState {
                fmt: None,
                chunk_lengths: Vec::new(),
                clock: ChunkClock::new(),
                paused: false,
                mute: false,
                stopped: false,
                draining: false,
                gain,
            })),
            commands: None,
            device: None,
        }
    }

    /// Formats the conversion path handles; also what decoders negotiate
    /// against.
    pub fn accepted_range() -> AudioFormatRange {
        AudioFormatRange {
            sample_fmts: SampleFormat::native_f32().mask()
                | FormatMask::S16_LE
                | FormatMask::S16_BE,
            min_sample_rate: 8_000,
            max_sample_rate: 192_000,
            min_channels: 1,
            max_channels: 2,
        }
    }

    fn send(&self, command: DeviceCommand) -> SinkResult<()> {
        match &self.commands {
            Some(commands) => commands
                .send(command)
                .map_err(|_| SinkError::Backend("output thread is gone".into())),
            None => Err(SinkError::NotConnected),
        }
    }
}

impl Sink for AudioSink {
    fn name(&self) -> &str {
        "rodio"
    }

    fn format_range(&self) -> AudioFormatRange {
        Self::accepted_range()
    }

    fn enable(&mut self) -> SinkResult<()> {
        if self.commands.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let shared = self.shared.clone();
        let ctl = self.ctl.clone();
        let device = thread::Builder::new()
            .name("auris-output".into())
            .spawn(move || run_device(shared, ctl, rx))
            .map_err(|err| SinkError::Backend(format!("output thread spawn failed: {err}")))?;
        self.commands = Some(tx);
        self.device = Some(device);
        Ok(())
    }

    fn disable(&mut self) -> SinkResult<()> {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(DeviceCommand::Shutdown);
        }
        if let Some(device) = self.device.take() {
            let _ = device.join();
        }
        let mut state = self.shared.lock().unwrap();
        state.fmt = None;
        state.chunk_lengths.clear();
        state.clock.reset();
        Ok(())
    }

    fn set_format(&mut self, fmt: &AudioFormat) -> SinkResult<()> {
        if !Self::accepted_range().includes(fmt) {
            return Err(SinkError::UnsupportedFormat(*fmt));
        }
        self.shared.lock().unwrap().fmt = Some(*fmt);
        self.send(DeviceCommand::Flush)
    }

    fn pause(&mut self, paused: bool) -> SinkResult<()> {
        self.send(DeviceCommand::Pause(paused))
    }

    fn mute(&mut self, mute: bool) -> SinkResult<()> {
        self.send(DeviceCommand::Mute(mute))
    }

    fn provide_buf(&mut self) -> SinkResult<SinkBuf> {
        let state = self.shared.lock().unwrap();
        let fmt = state.fmt.ok_or(SinkError::NotConnected)?;
        if state.buffered_secs() >= HIGH_WATER_SECS {
            return Ok(SinkBuf::empty());
        }
        let frames = (fmt.sample_rate * CHUNK_MS / 1000) as usize;
        Ok(SinkBuf::with_len(frames * fmt.frame_bytes()))
    }

    fn commit_buf(&mut self, buf: SinkBuf, written: usize) -> SinkResult<()> {
        if written == 0 {
            return Ok(());
        }
        let fmt = self
            .shared
            .lock()
            .unwrap()
            .fmt
            .ok_or(SinkError::NotConnected)?;
        let samples = convert_samples(&fmt, &buf.bytes()[..written])?;
        let frames = samples.len() / fmt.channels as usize;
        let secs = frames as f64 / fmt.sample_rate as f64;
        let buffer = SamplesBuffer::new(fmt.channels as u16, fmt.sample_rate, samples);
        self.send(DeviceCommand::Append(buffer, secs))
    }

    fn flush(&mut self, fmt: &AudioFormat) -> SinkResult<()> {
        if !Self::accepted_range().includes(fmt) {
            return Err(SinkError::UnsupportedFormat(*fmt));
        }
        self.shared.lock().unwrap().fmt = Some(*fmt);
        self.send(DeviceCommand::Flush)
    }

    fn latency_ms(&self) -> u32 {
        let state = self.shared.lock().unwrap();
        (state.buffered_secs() * 1000.0) as u32
    }

    fn stop(&mut self) -> SinkResult<()> {
        self.send(DeviceCommand::Drain)
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}

/// Interpret committed bytes as the negotiated format.
fn convert_samples(fmt: &AudioFormat, bytes: &[u8]) -> SinkResult<Vec<f32>> {
    let samples = match fmt.sample_fmt {
        f if f == SampleFormat::native_f32() => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes(chunk.try_into().unwrap()))
            .collect(),
        SampleFormat::S16Le => bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes(chunk.try_into().unwrap()) as f32 / 32_768.0)
            .collect(),
        SampleFormat::S16Be => bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_be_bytes(chunk.try_into().unwrap()) as f32 / 32_768.0)
            .collect(),
        _ => return Err(SinkError::UnsupportedFormat(*fmt)),
    };
    Ok(samples)
}

/// Move finished chunks from the queue into played time.
fn account_consumed(sink: &RodioSink, state: &mut DeviceState) {
    let queued = sink.len();
    let played = state.chunk_lengths.len().saturating_sub(queued);
    for _ in 0..played {
        state.clock.restart();
        state.chunk_lengths.remove(0);
    }
    if sink.is_paused() || state.chunk_lengths.is_empty() {
        state.clock.pause();
    } else {
        state.clock.resume();
    }
}

fn run_device(
    shared: Arc<Mutex<DeviceState>>,
    ctl: SinkController,
    commands: Receiver<DeviceCommand>,
) {
    // The device can lag behind a previous connection's teardown, so the
    // open gets a few tries with a growing delay before the connection is
    // reported dead.
    let mut stream = None;
    for attempt in 0..DEVICE_OPEN_ATTEMPTS {
        match OutputStreamBuilder::open_default_stream() {
            Ok(opened) => {
                stream = Some(opened);
                break;
            }
            Err(err) => {
                warn!("audio device not ready ({err}), attempt {}", attempt + 1);
                if attempt + 1 < DEVICE_OPEN_ATTEMPTS {
                    thread::sleep(DEVICE_OPEN_BACKOFF * (attempt as u32 + 1));
                }
            }
        }
    }
    let Some(stream) = stream else {
        error!("no usable audio device, dropping the output connection");
        ctl.failed(true);
        return;
    };
    let mixer = stream.mixer().clone();
    let sink = RodioSink::connect_new(&mixer);
    {
        let state = shared.lock().unwrap();
        sink.set_volume(if state.mute { 0.0 } else { state.gain });
        if state.paused {
            sink.pause();
        }
    }

    let mut wanted: Option<bool> = None;
    loop {
        match commands.recv_timeout(Duration::from_millis(20)) {
            Ok(DeviceCommand::Append(buffer, secs)) => {
                sink.append(buffer);
                let mut state = shared.lock().unwrap();
                state.chunk_lengths.push(secs);
                if !state.paused {
                    state.clock.resume();
                }
            }
            Ok(DeviceCommand::Pause(paused)) => {
                let info = {
                    let mut state = shared.lock().unwrap();
                    account_consumed(&sink, &mut state);
                    if paused {
                        sink.pause();
                        state.clock.pause();
                    } else {
                        sink.play();
                        state.clock.resume();
                    }
                    state.paused = paused;
                    state.info()
                };
                ctl.info_changed(info);
            }
            Ok(DeviceCommand::Mute(mute)) => {
                let info = {
                    let mut state = shared.lock().unwrap();
                    sink.set_volume(if mute { 0.0 } else { state.gain });
                    state.mute = mute;
                    state.info()
                };
                ctl.info_changed(info);
            }
            Ok(DeviceCommand::Flush) => {
                sink.clear();
                let mut state = shared.lock().unwrap();
                state.chunk_lengths.clear();
                state.clock.reset();
                state.draining = false;
                state.stopped = false;
                if !state.paused {
                    // rodio's clear() leaves the sink paused.
                    sink.play();
                }
            }
            Ok(DeviceCommand::Drain) => {
                shared.lock().unwrap().draining = true;
            }
            Ok(DeviceCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let (hungry, sated, drained_info) = {
            let mut state = shared.lock().unwrap();
            account_consumed(&sink, &mut state);
            let buffered = state.buffered_secs();
            let hungry = state.fmt.is_some()
                && !state.paused
                && !state.draining
                && buffered < LOW_WATER_SECS;
            let sated = buffered >= HIGH_WATER_SECS;
            let drained_info = if state.draining && !state.stopped && sink.empty() {
                state.stopped = true;
                Some(state.info())
            } else {
                None
            };
            (hungry, sated, drained_info)
        };
        if let Some(info) = drained_info {
            ctl.info_changed(info);
        }
        if hungry && wanted != Some(true) {
            wanted = Some(true);
            ctl.request_input(true);
        } else if sated && wanted != Some(false) {
            wanted = Some(false);
            ctl.request_input(false);
        }
    }
}
