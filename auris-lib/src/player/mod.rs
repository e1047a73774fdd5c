//! The playback engine: a dedicated thread running an event loop, driven
//! exclusively through posted delegates.
//!
//! [`Player`] is the cross-thread controller; every method posts a delegate
//! that mutates [`PlayerCore`] on the player thread. Sink implementations
//! deliver their upcalls through [`SinkController`] the same way, so all
//! engine state stays single-threaded.

mod state;
mod timing;

pub use state::PlayerCore;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;

use crate::decoder::DecoderStream;
use crate::delegate::Delegator;
use crate::event_loop::EventLoop;
use crate::sink::{Sink, SinkInfo};

/// Opaque token the host attaches to a track; handed back verbatim in
/// [`PlayerEvents::track_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u64);

/// Upcalls into the embedding application.
///
/// All of these run on the player thread. `next_track` blocks the player
/// until it returns; the implementation must not call back into the player
/// while servicing it.
pub trait PlayerEvents: Send + Sync {
    /// Whole-second playback position of the audible track.
    fn position_changed(&self, seconds: u32);

    /// The audible track changed; `None` means end of playlist.
    fn track_changed(&self, cookie: Option<Cookie>);

    /// Forwarded verbatim from the sink.
    fn sink_info_changed(&self, info: SinkInfo);

    /// Provide the track to feed after the current one, or `None` when the
    /// playlist is exhausted.
    fn next_track(&self) -> Option<(Box<dyn DecoderStream>, Cookie)>;
}

/// Cross-thread playback controller.
///
/// Dropping the player shuts the engine thread down.
pub struct Player {
    delegator: Arc<Delegator<PlayerCore>>,
    thread: Option<JoinHandle<()>>,
}

impl Player {
    /// Spawn the player thread and its event loop.
    pub fn new(events: Arc<dyn PlayerEvents>) -> Self {
        let delegator = Arc::new(Delegator::new());
        let thread = {
            let delegator = delegator.clone();
            thread::Builder::new()
                .name("auris-player".into())
                .spawn(move || {
                    let event_loop = EventLoop::with_delegator(delegator);
                    let mut core = PlayerCore::new(event_loop.handle(), events);
                    event_loop.run(&mut core);
                    core.finish();
                })
                .expect("failed to spawn player thread")
        };
        Self {
            delegator,
            thread: Some(thread),
        }
    }

    /// Bind an output. Any previous sink is stopped and disabled first.
    pub fn set_sink(&self, sink: Box<dyn Sink>) {
        self.delegator.post(move |core| core.sink_load(Some(sink)));
    }

    /// Drop the current output binding.
    pub fn clear_sink(&self) {
        self.delegator.post(|core| core.sink_load(None));
    }

    /// Replace the playback pipeline with a single new track.
    ///
    /// # Arguments
    ///
    /// * `stream` - Opened decoder stream; the player takes ownership and
    ///   closes it when the track leaves the pipeline.
    /// * `cookie` - Token handed back in `track_changed` callbacks.
    pub fn set_input(&self, stream: Box<dyn DecoderStream>, cookie: Cookie) {
        self.delegator
            .post(move |core| core.input_load(Some(stream), Some(cookie), true));
    }

    /// Flush the pipeline without loading a new track.
    pub fn clear_input(&self) {
        self.delegator.post(|core| core.input_load(None, None, true));
    }

    pub fn toggle_pause(&self) {
        self.delegator.post(|core| core.toggle_pause());
    }

    pub fn toggle_mute(&self) {
        self.delegator.post(|core| core.toggle_mute());
    }

    /// Jump relative to what the listener currently hears.
    ///
    /// # Arguments
    ///
    /// * `delta_ms` - Signed distance in milliseconds; negative seeks
    ///   backwards. Clamping at track boundaries is decoder-defined.
    pub fn seek(&self, delta_ms: i64) {
        self.delegator.post(move |core| core.seek_by(delta_ms));
    }

    /// Skip to the track the host returns from `next_track`.
    pub fn goto_next(&self) {
        self.delegator.post(|core| core.goto_next());
    }

    /// Stop feeding the sink.
    pub fn stop(&self) {
        self.delegator.post(|core| core.sink_stop());
    }

    /// Upcall handle for sink implementations.
    pub fn sink_controller(&self) -> SinkController {
        SinkController {
            delegator: self.delegator.clone(),
        }
    }

    /// Stop the engine thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.delegator.post(|core| core.request_stop());
            if thread.join().is_err() {
                warn!("player thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Trampoline for sink upcalls onto the player thread.
///
/// Clonable and usable from any thread, including sink callback threads.
#[derive(Clone)]
pub struct SinkController {
    delegator: Arc<Delegator<PlayerCore>>,
}

impl SinkController {
    /// The sink wants more data (`true`) or is full (`false`).
    pub fn request_input(&self, enable: bool) {
        self.delegator
            .post(move |core| core.handle_request_input(enable));
    }

    /// Deliver the authoritative sink state.
    pub fn info_changed(&self, info: SinkInfo) {
        self.delegator.post(move |core| core.handle_sink_info(info));
    }

    /// The connection dropped; `retry` hints that rebinding may succeed.
    pub fn failed(&self, retry: bool) {
        self.delegator
            .post(move |core| core.handle_sink_failed(retry));
    }
}
