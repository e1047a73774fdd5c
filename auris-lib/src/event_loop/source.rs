//! Loop source handles: descriptor watches, timers, and deferred tasks.

use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::poll::PollFlags;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{Expiration, TimerFd, TimerSetTimeFlags};

pub(super) struct WatchState {
    pub(super) fd: Cell<RawFd>,
    pub(super) interest: Cell<PollFlags>,
    pub(super) armed: Cell<bool>,
    pub(super) freed: Cell<bool>,
}

/// Handle for a descriptor watch registered on an event loop.
///
/// Not thread-safe; only the loop's own thread may touch it.
pub struct Watch {
    state: Rc<WatchState>,
}

impl Watch {
    pub(super) fn new(state: Rc<WatchState>) -> Self {
        Self { state }
    }

    /// Bind the watch to `fd` with the given interest mask.
    pub fn set(&self, fd: RawFd, interest: PollFlags) {
        self.state.fd.set(fd);
        self.state.interest.set(interest);
        self.state.armed.set(true);
    }

    /// Stop dispatching without forgetting the binding.
    pub fn disable(&self) {
        self.state.armed.set(false);
    }

    /// Release the watch. Collection happens after the current loop
    /// iteration, so freeing from the watch's own callback is safe.
    pub fn free(self) {
        self.state.armed.set(false);
        self.state.freed.set(true);
    }
}

pub(super) struct TimerState {
    pub(super) timer: TimerFd,
    pub(super) freed: Cell<bool>,
}

impl TimerState {
    pub(super) fn fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    /// Read the kernel expiration count, zero when none are pending.
    pub(super) fn read_expirations(&self) -> u64 {
        let mut buf = [0u8; 8];
        loop {
            let rc = unsafe { libc::read(self.fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if rc == buf.len() as isize {
                return u64::from_ne_bytes(buf);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return 0,
                _ => panic!("timerfd read failed: {err}"),
            }
        }
    }
}

/// Arming parameters for a [`Timer`]: first expiration plus repeat interval.
/// A zero interval makes the timer one-shot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSpec {
    pub initial: Duration,
    pub interval: Duration,
}

impl TimerSpec {
    pub fn one_shot(initial: Duration) -> Self {
        Self {
            initial,
            interval: Duration::ZERO,
        }
    }

    pub fn repeating(initial: Duration, interval: Duration) -> Self {
        Self { initial, interval }
    }
}

/// Handle for an OS timer registered on an event loop.
///
/// The callback runs once per kernel-reported expiration, so a slow
/// iteration catches up instead of silently dropping ticks.
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    pub(super) fn new(state: Rc<TimerState>) -> Self {
        Self { state }
    }

    /// Arm the timer. A zero initial expiration disarms it.
    pub fn set(&self, spec: TimerSpec, absolute: bool) {
        if spec.initial.is_zero() {
            self.disable();
            return;
        }
        let flags = if absolute {
            TimerSetTimeFlags::TFD_TIMER_ABSTIME
        } else {
            TimerSetTimeFlags::empty()
        };
        let expiration = if spec.interval.is_zero() {
            Expiration::OneShot(TimeSpec::from_duration(spec.initial))
        } else {
            Expiration::IntervalDelayed(
                TimeSpec::from_duration(spec.initial),
                TimeSpec::from_duration(spec.interval),
            )
        };
        self.state
            .timer
            .set(expiration, flags)
            .expect("timerfd arm failed");
    }

    pub fn disable(&self) {
        self.state.timer.unset().expect("timerfd disarm failed");
    }

    /// Release the timer; collected after the current iteration.
    pub fn free(self) {
        self.disable();
        self.state.freed.set(true);
    }
}

pub(super) struct DeferState {
    pub(super) enabled: Cell<bool>,
    pub(super) freed: Cell<bool>,
}

/// Handle for a deferred task: runs at the top of every loop iteration while
/// enabled.
pub struct Deferred {
    state: Rc<DeferState>,
}

impl Deferred {
    pub(super) fn new(state: Rc<DeferState>) -> Self {
        Self { state }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.get()
    }

    /// Release the task; collected after the current iteration.
    pub fn free(self) {
        self.state.enabled.set(false);
        self.state.freed.set(true);
    }
}
