//! End-to-end playback scenarios against a scripted sink and synthetic
//! decoder streams.
//!
//! The sink models a real output: committed audio drains in wall-clock
//! time, a driver thread requests input at a low watermark, and the
//! buffered amount is reported as latency. Track durations are short so
//! each scenario finishes in a few seconds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use auris_lib::audio::{AudioFormat, AudioFormatRange, FormatMask, SampleFormat};
use auris_lib::decoder::{DecodeError, DecoderStream, ReadOutcome};
use auris_lib::player::{Cookie, Player, PlayerEvents, SinkController};
use auris_lib::sink::{Sink, SinkBuf, SinkError, SinkInfo, SinkResult};

fn stereo_s16() -> AudioFormat {
    AudioFormat {
        sample_fmt: SampleFormat::S16Le,
        sample_rate: 44_100,
        channels: 2,
    }
}

/// Silent PCM stream of a fixed length.
struct ToneStream {
    fmt: AudioFormat,
    total_frames: u64,
    pos_frames: u64,
}

impl ToneStream {
    fn seconds(fmt: AudioFormat, seconds: f64) -> Self {
        let total_frames = (seconds * fmt.sample_rate as f64) as u64;
        Self {
            fmt,
            total_frames,
            pos_frames: 0,
        }
    }
}

impl DecoderStream for ToneStream {
    fn format(&self) -> AudioFormat {
        self.fmt
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, DecodeError> {
        let frame_bytes = self.fmt.frame_bytes() as u64;
        let remaining = (self.total_frames - self.pos_frames) * frame_bytes;
        let mut len = (buf.len() as u64).min(remaining);
        len -= len % frame_bytes;
        for byte in &mut buf[..len as usize] {
            *byte = 0;
        }
        self.pos_frames += len / frame_bytes;
        Ok(ReadOutcome {
            bytes: len as usize,
            pos_samples: self.pos_frames,
        })
    }

    fn seek(&mut self, delta_ms: i64) -> Result<u64, DecodeError> {
        let delta_frames = delta_ms * self.fmt.sample_rate as i64 / 1000;
        let pos = self.pos_frames as i64 + delta_frames;
        self.pos_frames = pos.clamp(0, self.total_frames as i64) as u64;
        Ok(self.pos_frames)
    }
}

#[derive(Clone, Copy)]
struct SinkConfig {
    capacity_ms: f64,
    low_ms: f64,
    chunk_ms: f64,
}

impl SinkConfig {
    fn tight() -> Self {
        Self {
            capacity_ms: 300.0,
            low_ms: 250.0,
            chunk_ms: 50.0,
        }
    }
}

struct SinkModel {
    fmt: Option<AudioFormat>,
    buffered_ms: f64,
    updated: Instant,
    paused: bool,
    mute: bool,
    stopped: bool,
}

impl SinkModel {
    fn drain(&mut self) {
        let now = Instant::now();
        if !self.paused {
            let elapsed = now.duration_since(self.updated).as_secs_f64() * 1000.0;
            self.buffered_ms = (self.buffered_ms - elapsed).max(0.0);
        }
        self.updated = now;
    }

    fn info(&self) -> SinkInfo {
        SinkInfo {
            stopped: self.stopped,
            paused: self.paused,
            mute: self.mute,
            vol_left: 100,
            vol_right: 100,
        }
    }
}

/// Wall-clock draining sink with a watermark-driven request thread.
struct ScriptedSink {
    config: SinkConfig,
    ctl: SinkController,
    model: Arc<Mutex<SinkModel>>,
    driver: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ScriptedSink {
    fn new(ctl: SinkController, config: SinkConfig) -> Self {
        Self {
            config,
            ctl,
            model: Arc::new(Mutex::new(SinkModel {
                fmt: None,
                buffered_ms: 0.0,
                updated: Instant::now(),
                paused: false,
                mute: false,
                stopped: false,
            })),
            driver: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    fn format_range(&self) -> AudioFormatRange {
        AudioFormatRange {
            sample_fmts: FormatMask::all(),
            min_sample_rate: 1,
            max_sample_rate: 192_000,
            min_channels: 1,
            max_channels: 8,
        }
    }

    fn enable(&mut self) -> SinkResult<()> {
        self.shutdown.store(false, Ordering::Relaxed);
        let model = self.model.clone();
        let ctl = self.ctl.clone();
        let shutdown = self.shutdown.clone();
        let config = self.config;
        self.driver = Some(thread::spawn(move || {
            let mut wanted = false;
            while !shutdown.load(Ordering::Relaxed) {
                {
                    let mut model = model.lock().unwrap();
                    model.drain();
                    let hungry = model.fmt.is_some()
                        && !model.paused
                        && !model.stopped
                        && model.buffered_ms < config.low_ms;
                    let sated = model.buffered_ms >= config.capacity_ms;
                    drop(model);
                    if hungry && !wanted {
                        wanted = true;
                        ctl.request_input(true);
                    } else if sated && wanted {
                        wanted = false;
                        ctl.request_input(false);
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
        }));
        Ok(())
    }

    fn disable(&mut self) -> SinkResult<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        Ok(())
    }

    fn set_format(&mut self, fmt: &AudioFormat) -> SinkResult<()> {
        let mut model = self.model.lock().unwrap();
        model.fmt = Some(*fmt);
        model.buffered_ms = 0.0;
        model.updated = Instant::now();
        model.stopped = false;
        Ok(())
    }

    fn pause(&mut self, paused: bool) -> SinkResult<()> {
        let info = {
            let mut model = self.model.lock().unwrap();
            model.drain();
            model.paused = paused;
            model.info()
        };
        self.ctl.info_changed(info);
        Ok(())
    }

    fn mute(&mut self, mute: bool) -> SinkResult<()> {
        let info = {
            let mut model = self.model.lock().unwrap();
            model.drain();
            model.mute = mute;
            model.info()
        };
        self.ctl.info_changed(info);
        Ok(())
    }

    fn provide_buf(&mut self) -> SinkResult<SinkBuf> {
        let mut model = self.model.lock().unwrap();
        model.drain();
        let fmt = model.fmt.ok_or(SinkError::NotConnected)?;
        if model.buffered_ms >= self.config.capacity_ms {
            return Ok(SinkBuf::empty());
        }
        let frames = (self.config.chunk_ms * fmt.sample_rate as f64 / 1000.0) as usize;
        Ok(SinkBuf::with_len(frames * fmt.frame_bytes()))
    }

    fn commit_buf(&mut self, buf: SinkBuf, written: usize) -> SinkResult<()> {
        drop(buf);
        if written == 0 {
            return Ok(());
        }
        let mut model = self.model.lock().unwrap();
        model.drain();
        let fmt = model.fmt.ok_or(SinkError::NotConnected)?;
        model.buffered_ms += written as f64 * 1000.0 / fmt.bytes_per_second() as f64;
        Ok(())
    }

    fn flush(&mut self, fmt: &AudioFormat) -> SinkResult<()> {
        let mut model = self.model.lock().unwrap();
        model.fmt = Some(*fmt);
        model.buffered_ms = 0.0;
        model.updated = Instant::now();
        Ok(())
    }

    fn latency_ms(&self) -> u32 {
        let mut model = self.model.lock().unwrap();
        model.drain();
        model.buffered_ms.max(0.0) as u32
    }

    fn stop(&mut self) -> SinkResult<()> {
        self.model.lock().unwrap().stopped = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum HostEvent {
    Position(u32),
    Track(Option<u64>),
    Info { paused: bool },
    NextTrack,
}

struct ScriptedHost {
    events: Mutex<Vec<HostEvent>>,
    playlist: Mutex<VecDeque<(Box<dyn DecoderStream>, Cookie)>>,
}

impl ScriptedHost {
    fn new(playlist: Vec<(Box<dyn DecoderStream>, Cookie)>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            playlist: Mutex::new(playlist.into()),
        }
    }

    fn record(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    fn wait_for(&self, timeout: Duration, pred: impl Fn(&[HostEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.snapshot()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl PlayerEvents for ScriptedHost {
    fn position_changed(&self, seconds: u32) {
        self.record(HostEvent::Position(seconds));
    }

    fn track_changed(&self, cookie: Option<Cookie>) {
        self.record(HostEvent::Track(cookie.map(|cookie| cookie.0)));
    }

    fn sink_info_changed(&self, info: SinkInfo) {
        self.record(HostEvent::Info {
            paused: info.paused,
        });
    }

    fn next_track(&self) -> Option<(Box<dyn DecoderStream>, Cookie)> {
        self.record(HostEvent::NextTrack);
        self.playlist.lock().unwrap().pop_front()
    }
}

fn positions(events: &[HostEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            HostEvent::Position(sec) => Some(*sec),
            _ => None,
        })
        .collect()
}

fn tracks(events: &[HostEvent]) -> Vec<Option<u64>> {
    events
        .iter()
        .filter_map(|event| match event {
            HostEvent::Track(cookie) => Some(*cookie),
            _ => None,
        })
        .collect()
}

fn start_player(
    host: &Arc<ScriptedHost>,
    config: SinkConfig,
    first: ToneStream,
    cookie: Cookie,
) -> Player {
    let player = Player::new(host.clone() as Arc<dyn PlayerEvents>);
    let sink = ScriptedSink::new(player.sink_controller(), config);
    player.set_sink(Box::new(sink));
    player.set_input(Box::new(first), cookie);
    player
}

#[test]
fn single_track_plays_out_and_terminates() {
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(stereo_s16(), 1.5),
        Cookie(1),
    );

    assert!(
        host.wait_for(Duration::from_secs(6), |events| {
            tracks(events) == vec![Some(1), None]
        }),
        "track never drained: {:?}",
        host.snapshot()
    );

    let events = host.snapshot();
    drop(player);

    assert_eq!(tracks(&events), vec![Some(1), None]);
    assert_eq!(positions(&events), vec![0, 1, 0]);

    // The final reset arrives with the terminator, not before.
    let track_end = events
        .iter()
        .position(|event| *event == HostEvent::Track(None))
        .unwrap();
    assert!(positions(&events[..track_end]) == vec![0, 1]);
}

#[test]
fn consecutive_tracks_play_gapless() {
    let fmt = stereo_s16();
    let host = Arc::new(ScriptedHost::new(vec![(
        Box::new(ToneStream::seconds(fmt, 1.2)) as Box<dyn DecoderStream>,
        Cookie(2),
    )]));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(fmt, 1.2),
        Cookie(1),
    );

    assert!(
        host.wait_for(Duration::from_secs(8), |events| {
            tracks(events) == vec![Some(1), Some(2), None]
        }),
        "playlist never finished: {:?}",
        host.snapshot()
    );

    let events = host.snapshot();
    drop(player);

    // The second track is queued the moment the first decoder runs dry.
    let first_change = events
        .iter()
        .position(|event| *event == HostEvent::Track(Some(1)))
        .unwrap();
    let second_change = events
        .iter()
        .position(|event| *event == HostEvent::Track(Some(2)))
        .unwrap();
    let between = positions(&events[first_change..second_change]);
    assert!(
        between.windows(2).all(|pair| pair[0] < pair[1]),
        "position reset between gapless tracks: {between:?}"
    );
    assert_eq!(positions(&events), vec![0, 1, 0, 1, 0]);
}

#[test]
fn seek_compensates_for_sink_latency() {
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(stereo_s16(), 4.5),
        Cookie(1),
    );

    thread::sleep(Duration::from_millis(1_100));
    player.seek(2_000);

    assert!(
        host.wait_for(Duration::from_secs(8), |events| {
            tracks(events) == vec![Some(1), None]
        }),
        "track never drained: {:?}",
        host.snapshot()
    );

    let events = host.snapshot();
    drop(player);

    // Heard position was ~1.1s; a +2s jump lands at second 3 because the
    // buffered latency is folded into the seek distance.
    assert_eq!(positions(&events), vec![0, 1, 3, 4, 0]);
}

#[test]
fn pause_freezes_the_reported_position() {
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(stereo_s16(), 3.5),
        Cookie(1),
    );

    thread::sleep(Duration::from_millis(1_250));
    player.toggle_pause();
    thread::sleep(Duration::from_millis(1_000));
    player.toggle_pause();

    assert!(
        host.wait_for(Duration::from_secs(10), |events| {
            tracks(events) == vec![Some(1), None]
        }),
        "track never drained: {:?}",
        host.snapshot()
    );

    let events = host.snapshot();
    drop(player);

    assert_eq!(positions(&events), vec![0, 1, 1, 2, 3, 0]);

    // No ticks land while paused.
    let paused_at = events
        .iter()
        .position(|event| *event == HostEvent::Info { paused: true })
        .unwrap();
    let resumed_at = events
        .iter()
        .position(|event| *event == HostEvent::Info { paused: false })
        .unwrap();
    assert!(positions(&events[paused_at..resumed_at]).is_empty());
}

#[test]
fn control_delegates_apply_in_post_order() {
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(stereo_s16(), 3.0),
        Cookie(1),
    );

    thread::sleep(Duration::from_millis(550));
    player.seek(1_000);
    player.toggle_pause();

    assert!(
        host.wait_for(Duration::from_secs(4), |events| {
            events.contains(&HostEvent::Info { paused: true })
        }),
        "pause never landed: {:?}",
        host.snapshot()
    );

    let events = host.snapshot();
    drop(player);

    // The seek's position emission must precede the pause taking effect.
    let seek_pos = events
        .iter()
        .position(|event| *event == HostEvent::Position(1))
        .expect("seek position never emitted");
    let paused_at = events
        .iter()
        .position(|event| *event == HostEvent::Info { paused: true })
        .unwrap();
    assert!(seek_pos < paused_at);
}

#[test]
fn clearing_input_stops_the_feed() {
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        SinkConfig::tight(),
        ToneStream::seconds(stereo_s16(), 5.0),
        Cookie(1),
    );

    thread::sleep(Duration::from_millis(700));
    player.clear_input();

    assert!(
        host.wait_for(Duration::from_secs(2), |events| {
            tracks(events) == vec![Some(1), None]
        }),
        "flush never reported: {:?}",
        host.snapshot()
    );

    // With the pipeline flushed to a terminator nothing ticks anymore.
    let settled = host.snapshot();
    thread::sleep(Duration::from_millis(1_200));
    assert_eq!(host.snapshot(), settled);
    assert_eq!(positions(&settled), vec![0, 0]);
    drop(player);
}

#[test]
fn hungry_sink_is_fed_without_blocking() {
    // A sink that never fills up lets the decoder run far ahead of real
    // time; the forced iterations keep the feed loop from sleeping between
    // buffers.
    let config = SinkConfig {
        capacity_ms: 60_000.0,
        low_ms: 59_000.0,
        chunk_ms: 500.0,
    };
    let host = Arc::new(ScriptedHost::new(Vec::new()));
    let player = start_player(
        &host,
        config,
        ToneStream::seconds(stereo_s16(), 5.0),
        Cookie(1),
    );

    assert!(
        host.wait_for(Duration::from_millis(1_500), |events| {
            events.contains(&HostEvent::NextTrack)
        }),
        "five seconds of audio not decoded promptly: {:?}",
        host.snapshot()
    );
    drop(player);
}
