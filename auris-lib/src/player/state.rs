//! Player state machine: the input pipeline and sink coordination.
//!
//! All state here is owned by the player thread. Inputs form a FIFO: the
//! head is the track currently reaching the speakers, the tail is the track
//! being fed into the sink. Head and tail differ only while a finished
//! track drains out of the sink ahead of its successor.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{error, warn};

use crate::audio::AudioFormat;
use crate::decoder::DecoderStream;
use crate::event_loop::{Deferred, LoopHandle, Timer};
use crate::sink::Sink;

use super::{Cookie, PlayerEvents};

pub(super) struct PlayerInput {
    pub(super) stream: Option<Box<dyn DecoderStream>>,
    pub(super) cookie: Option<Cookie>,
    pub(super) pos_samples: u64,
    pub(super) eof: bool,
    pub(super) remaining_ms: i64,
}

/// Engine state, mutated only on the player thread.
pub struct PlayerCore {
    pub(super) handle: LoopHandle<PlayerCore>,
    pub(super) events: Arc<dyn PlayerEvents>,
    pub(super) sink: Option<Box<dyn Sink>>,
    pub(super) inputs: VecDeque<PlayerInput>,
    pub(super) paused: bool,
    pub(super) mute: bool,
    pub(super) provide_task: Deferred,
    pub(super) pos_timer: Timer,
    pub(super) track_change_timer: Timer,
    pub(super) pos_update_time: u64,
    pub(super) pos_msec: u32,
    pub(super) pos_sec: Option<u32>,
    pub(super) track_change_update_time: u64,
}

impl PlayerCore {
    pub(super) fn new(handle: LoopHandle<PlayerCore>, events: Arc<dyn PlayerEvents>) -> Self {
        let provide_task = handle.add_defer(|core: &mut PlayerCore| core.provide_input());
        provide_task.set_enabled(false);
        let pos_timer = handle.add_timer(|core: &mut PlayerCore| core.pos_tick());
        let track_change_timer = handle.add_timer(|core: &mut PlayerCore| core.track_change_tick());
        Self {
            handle,
            events,
            sink: None,
            inputs: VecDeque::new(),
            paused: false,
            mute: false,
            provide_task,
            pos_timer,
            track_change_timer,
            pos_update_time: 0,
            pos_msec: 0,
            pos_sec: None,
            track_change_update_time: 0,
        }
    }

    /// Append a track to the pipeline, optionally flushing everything that
    /// came before it. A `None` stream is the end-of-playlist terminator.
    pub(super) fn input_load(
        &mut self,
        stream: Option<Box<dyn DecoderStream>>,
        cookie: Option<Cookie>,
        flush: bool,
    ) {
        let was_playing = !self.inputs.is_empty();
        let is_playing = stream.is_some();

        if flush {
            self.inputs.clear();
        }
        if self.inputs.is_empty() {
            self.events.track_changed(cookie);
        }

        let fmt = stream.as_ref().map(|stream| stream.format());
        self.inputs.push_back(PlayerInput {
            stream,
            cookie,
            pos_samples: 0,
            eof: false,
            remaining_ms: 0,
        });

        if self.sink.is_some() {
            if was_playing && flush && is_playing {
                let fmt = fmt.unwrap();
                self.assert_sink_accepts(&fmt);
                if let Err(err) = self.sink.as_mut().unwrap().flush(&fmt) {
                    error!("sink flush failed: {err}");
                }
            } else if is_playing && !was_playing {
                let fmt = fmt.unwrap();
                self.assert_sink_accepts(&fmt);
                if let Err(err) = self.sink.as_mut().unwrap().set_format(&fmt) {
                    error!("sink format change failed: {err}");
                }
            } else if was_playing && !is_playing {
                self.sink_stop();
            }
        }

        self.timing_update(true);
    }

    /// Replace the sink binding. The outgoing sink is stopped and disabled;
    /// the incoming one is enabled and, when a track is already loaded,
    /// immediately given its format.
    pub(super) fn sink_load(&mut self, sink: Option<Box<dyn Sink>>) {
        if let Some(old) = self.sink.as_mut() {
            self.provide_task.set_enabled(false);
            if let Err(err) = old.stop() {
                warn!("sink stop failed: {err}");
            }
            if let Err(err) = old.disable() {
                warn!("sink disable failed: {err}");
            }
        }
        self.sink = sink;
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.enable() {
                error!("sink enable failed: {err}");
            }
        }
        if self.sink.is_some() {
            let fmt = self
                .inputs
                .back()
                .and_then(|input| input.stream.as_ref())
                .map(|stream| stream.format());
            if let Some(fmt) = fmt {
                self.assert_sink_accepts(&fmt);
                if let Err(err) = self.sink.as_mut().unwrap().set_format(&fmt) {
                    error!("sink format change failed: {err}");
                }
            }
        }
    }

    /// Stop pulling input and tell the sink to stop.
    pub(super) fn sink_stop(&mut self) {
        self.provide_task.set_enabled(false);
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.stop() {
                warn!("sink stop failed: {err}");
            }
        }
    }

    /// The deferred feed task: pull one buffer from the sink, fill it from
    /// the tail stream, commit it, and keep the loop spinning while the sink
    /// stays hungry.
    pub(super) fn provide_input(&mut self) {
        let sink = self.sink.as_mut().expect("provide_input without a sink");
        let mut buf = match sink.provide_buf() {
            Ok(buf) => buf,
            Err(err) => {
                error!("sink refused to provide a buffer: {err}");
                self.provide_task.set_enabled(false);
                return;
            }
        };

        if buf.is_empty() {
            if let Err(err) = sink.commit_buf(buf, 0) {
                error!("sink buffer cancel failed: {err}");
            }
            self.provide_task.set_enabled(false);
            return;
        }

        let input = self
            .inputs
            .back_mut()
            .expect("provide_input without an input");
        let stream = input
            .stream
            .as_mut()
            .expect("provide_input on a terminator input");
        let written = match stream.read(buf.bytes_mut()) {
            Ok(outcome) => {
                input.pos_samples = outcome.pos_samples;
                outcome.bytes
            }
            Err(err) => {
                warn!("decoder read failed, treating as end of stream: {err}");
                0
            }
        };

        let sink = self.sink.as_mut().unwrap();
        if let Err(err) = sink.commit_buf(buf, written) {
            error!("sink commit failed: {err}");
            self.provide_task.set_enabled(false);
            return;
        }

        if written > 0 {
            self.timing_update(false);
        } else {
            self.input_eof();
        }
        self.handle.force_iteration();
    }

    /// The tail stream ran dry: start draining it out of the sink and queue
    /// the host's next track right behind it.
    fn input_eof(&mut self) {
        let latency = self.sink.as_ref().map_or(0, |sink| sink.latency_ms());
        {
            let input = self.inputs.back_mut().expect("end of stream without an input");
            input.remaining_ms = i64::from(latency);
            input.eof = true;
        }
        self.start_track_change_timer();
        self.timing_update(false);

        self.goto_next_with(false);
    }

    fn goto_next_with(&mut self, flush: bool) {
        match self.events.next_track() {
            Some((stream, cookie)) => self.input_load(Some(stream), Some(cookie), flush),
            None => self.input_load(None, None, flush),
        }
    }

    /// User-initiated skip: like end-of-stream handling, but discards what
    /// is still buffered.
    pub(super) fn goto_next(&mut self) {
        self.goto_next_with(true);
    }

    /// Jump by `delta_ms` relative to what the listener hears. The decoded
    /// position leads the audible position by the sink latency, so the
    /// latency is folded into the seek distance.
    pub(super) fn seek_by(&mut self, delta_ms: i64) {
        let Some(head) = self.inputs.front() else {
            return;
        };
        let Some(fmt) = head.stream.as_ref().map(|stream| stream.format()) else {
            return;
        };

        let mut latency = 0i64;
        if let Some(sink) = self.sink.as_mut() {
            latency = i64::from(sink.latency_ms());
            if let Err(err) = sink.flush(&fmt) {
                error!("sink flush failed: {err}");
            }
        }

        self.inputs.truncate(1);
        self.inputs.front_mut().unwrap().eof = false;
        self.pause_track_change_timer();

        let head = self.inputs.front_mut().unwrap();
        match head.stream.as_mut().unwrap().seek(delta_ms - latency) {
            Ok(pos) => head.pos_samples = pos,
            Err(err) => warn!("seek failed: {err}"),
        }
        self.timing_update(true);
    }

    /// Request the opposite pause state; the change lands when the sink
    /// reports back through `info_changed`.
    pub(super) fn toggle_pause(&mut self) {
        let paused = self.paused;
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.pause(!paused) {
                warn!("sink pause request failed: {err}");
            }
        }
    }

    pub(super) fn toggle_mute(&mut self) {
        let mute = self.mute;
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.mute(!mute) {
                warn!("sink mute request failed: {err}");
            }
        }
    }

    pub(super) fn handle_request_input(&mut self, enable: bool) {
        if self.sink.is_none() {
            warn!("input request with no sink bound");
            return;
        }
        let feedable = self
            .inputs
            .back()
            .is_some_and(|input| input.stream.is_some());
        let enable = enable && feedable;
        self.provide_task.set_enabled(enable);
        if enable {
            self.handle.force_iteration();
        }
    }

    pub(super) fn handle_sink_info(&mut self, info: crate::sink::SinkInfo) {
        if self.sink.is_none() {
            warn!("sink info with no sink bound");
            return;
        }
        self.paused = info.paused;
        self.mute = info.mute;
        if self.paused {
            self.pause_track_change_timer();
        } else {
            self.start_track_change_timer();
        }
        self.timing_update(false);
        self.events.sink_info_changed(info);
    }

    pub(super) fn handle_sink_failed(&mut self, retry: bool) {
        error!("sink connection failed (retry possible: {retry})");
        self.provide_task.set_enabled(false);
        self.sink = None;
        self.timing_update(false);
    }

    pub(super) fn request_stop(&mut self) {
        self.handle.stop(0);
    }

    /// Post-loop cleanup on the player thread: unbind the sink and park the
    /// pipeline on a terminator.
    pub(super) fn finish(&mut self) {
        self.sink_load(None);
        self.input_load(None, None, false);
    }

    fn assert_sink_accepts(&self, fmt: &AudioFormat) {
        let range = self.sink.as_ref().unwrap().format_range();
        assert!(
            range.includes(fmt),
            "audio format {fmt:?} outside sink range {range:?}"
        );
    }
}
