//! Single-threaded reactor over `poll(2)`, timer descriptors, and deferred
//! tasks.
//!
//! One [`EventLoop`] is owned by one thread and drives borrowed user data:
//! every callback receives `&mut T`, which keeps all loop-side state
//! single-threaded by construction. The only thread-safe entry point is the
//! built-in [`Delegator`] whose descriptor the loop watches.
//!
//! Iteration order: enabled deferred tasks in insertion order, collection of
//! freed sources, the descriptor wait (zero timeout after
//! [`LoopHandle::force_iteration`], otherwise indefinite), then one callback
//! per ready descriptor.

mod source;

use std::cell::{Cell, RefCell};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollTimeout};
use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};

pub use nix::poll::PollFlags;
pub use source::{Deferred, Timer, TimerSpec, Watch};

use crate::delegate::Delegator;
use source::{DeferState, TimerState, WatchState};

type WatchCallback<T> = Box<dyn FnMut(&mut T, RawFd, PollFlags)>;
type TimerCallback<T> = Box<dyn FnMut(&mut T)>;
type DeferCallback<T> = Box<dyn FnMut(&mut T)>;

struct Sources<T> {
    watches: Vec<(Rc<WatchState>, Rc<RefCell<WatchCallback<T>>>)>,
    timers: Vec<(Rc<TimerState>, Rc<RefCell<TimerCallback<T>>>)>,
    defers: Vec<(Rc<DeferState>, Rc<RefCell<DeferCallback<T>>>)>,
}

struct Control {
    force_iteration: Cell<bool>,
    running: Cell<bool>,
    ret: Cell<i32>,
}

/// Registration and control handle for an [`EventLoop`].
///
/// Clonable and freely usable from loop callbacks, but confined to the
/// loop's thread.
pub struct LoopHandle<T> {
    sources: Rc<RefCell<Sources<T>>>,
    control: Rc<Control>,
    delegator: Arc<Delegator<T>>,
}

impl<T> Clone for LoopHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
            control: self.control.clone(),
            delegator: self.delegator.clone(),
        }
    }
}

impl<T> LoopHandle<T> {
    /// Register a descriptor watch. The returned handle starts unbound; call
    /// [`Watch::set`] to arm it.
    pub fn add_watch(&self, callback: impl FnMut(&mut T, RawFd, PollFlags) + 'static) -> Watch {
        let state = Rc::new(WatchState {
            fd: Cell::new(-1),
            interest: Cell::new(PollFlags::empty()),
            armed: Cell::new(false),
            freed: Cell::new(false),
        });
        let callback: WatchCallback<T> = Box::new(callback);
        self.sources
            .borrow_mut()
            .watches
            .push((state.clone(), Rc::new(RefCell::new(callback))));
        Watch::new(state)
    }

    /// Register a monotonic timer. Descriptor allocation failure is fatal.
    pub fn add_timer(&self, callback: impl FnMut(&mut T) + 'static) -> Timer {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .expect("timerfd allocation failed");
        let state = Rc::new(TimerState {
            timer,
            freed: Cell::new(false),
        });
        let callback: TimerCallback<T> = Box::new(callback);
        self.sources
            .borrow_mut()
            .timers
            .push((state.clone(), Rc::new(RefCell::new(callback))));
        Timer::new(state)
    }

    /// Register a deferred task, initially enabled.
    pub fn add_defer(&self, callback: impl FnMut(&mut T) + 'static) -> Deferred {
        let state = Rc::new(DeferState {
            enabled: Cell::new(true),
            freed: Cell::new(false),
        });
        let callback: DeferCallback<T> = Box::new(callback);
        self.sources
            .borrow_mut()
            .defers
            .push((state.clone(), Rc::new(RefCell::new(callback))));
        Deferred::new(state)
    }

    /// Make the next descriptor wait use a zero timeout.
    pub fn force_iteration(&self) {
        self.control.force_iteration.set(true);
    }

    /// Exit the loop after the current iteration; `ret` is returned by
    /// [`EventLoop::run`].
    pub fn stop(&self, ret: i32) {
        self.control.ret.set(ret);
        self.control.running.set(false);
    }

    /// The loop's cross-thread delegate inbox.
    pub fn delegator(&self) -> &Arc<Delegator<T>> {
        &self.delegator
    }

    /// Post a delegate to this loop from any context.
    pub fn post(&self, delegate: impl FnOnce(&mut T) + Send + 'static) {
        self.delegator.post(delegate);
    }
}

enum PollSource<T> {
    Watch(Rc<WatchState>, Rc<RefCell<WatchCallback<T>>>),
    Timer(Rc<TimerState>, Rc<RefCell<TimerCallback<T>>>),
}

pub struct EventLoop<T> {
    handle: LoopHandle<T>,
    _delegate_watch: Watch,
}

impl<T: 'static> EventLoop<T> {
    pub fn new() -> Self {
        Self::with_delegator(Arc::new(Delegator::new()))
    }

    /// Build a loop around an existing delegator, so other threads can hold
    /// the inbox before the loop's thread starts.
    pub fn with_delegator(delegator: Arc<Delegator<T>>) -> Self {
        let handle = LoopHandle {
            sources: Rc::new(RefCell::new(Sources {
                watches: Vec::new(),
                timers: Vec::new(),
                defers: Vec::new(),
            })),
            control: Rc::new(Control {
                force_iteration: Cell::new(false),
                running: Cell::new(true),
                ret: Cell::new(0),
            }),
            delegator,
        };
        let pending = handle.delegator.clone();
        let delegate_watch = handle.add_watch(move |data, _fd, _events| pending.run_pending(data));
        delegate_watch.set(handle.delegator.fd(), PollFlags::POLLIN);
        Self {
            handle,
            _delegate_watch: delegate_watch,
        }
    }

    pub fn handle(&self) -> LoopHandle<T> {
        self.handle.clone()
    }

    /// Run until [`LoopHandle::stop`] is called, returning its argument.
    pub fn run(&self, data: &mut T) -> i32 {
        let control = &self.handle.control;
        while control.running.get() {
            self.run_deferred(data);
            self.collect_freed();

            let (entries, mut pollfds) = self.snapshot_pollable();
            let timeout = if control.force_iteration.replace(false) {
                PollTimeout::ZERO
            } else {
                PollTimeout::NONE
            };
            match poll(&mut pollfds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => panic!("poll failed: {err}"),
            }
            let ready: Vec<PollFlags> = pollfds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect();
            drop(pollfds);

            for (entry, events) in entries.into_iter().zip(ready) {
                if events.is_empty() {
                    continue;
                }
                match entry {
                    PollSource::Watch(state, callback) => {
                        if state.freed.get() || !state.armed.get() {
                            continue;
                        }
                        (callback.borrow_mut())(data, state.fd.get(), events);
                    }
                    PollSource::Timer(state, callback) => {
                        let expirations = state.read_expirations();
                        for _ in 0..expirations {
                            if state.freed.get() {
                                break;
                            }
                            (callback.borrow_mut())(data);
                        }
                    }
                }
            }
        }
        control.ret.get()
    }

    fn run_deferred(&self, data: &mut T) {
        // Snapshot so callbacks may register new sources mid-iteration.
        let snapshot: Vec<_> = self.handle.sources.borrow().defers.to_vec();
        for (state, callback) in snapshot {
            if state.freed.get() || !state.enabled.get() {
                continue;
            }
            (callback.borrow_mut())(data);
        }
    }

    fn collect_freed(&self) {
        let mut sources = self.handle.sources.borrow_mut();
        sources.watches.retain(|(state, _)| !state.freed.get());
        sources.timers.retain(|(state, _)| !state.freed.get());
        sources.defers.retain(|(state, _)| !state.freed.get());
    }

    #[allow(clippy::type_complexity)]
    fn snapshot_pollable(&self) -> (Vec<PollSource<T>>, Vec<PollFd<'static>>) {
        let mut entries = Vec::new();
        let mut pollfds = Vec::new();
        let sources = self.handle.sources.borrow();
        for (state, callback) in &sources.watches {
            if state.freed.get() || !state.armed.get() || state.fd.get() < 0 {
                continue;
            }
            // The snapshot keeps the source state alive across the wait; fds
            // registered on a watch must outlive the watch itself.
            let fd = unsafe { BorrowedFd::borrow_raw(state.fd.get()) };
            pollfds.push(PollFd::new(fd, state.interest.get()));
            entries.push(PollSource::Watch(state.clone(), callback.clone()));
        }
        for (state, callback) in &sources.timers {
            if state.freed.get() {
                continue;
            }
            let fd = unsafe { BorrowedFd::borrow_raw(state.fd()) };
            pollfds.push(PollFd::new(fd, PollFlags::POLLIN));
            entries.push(PollSource::Timer(state.clone(), callback.clone()));
        }
        (entries, pollfds)
    }
}

impl<T: 'static> Default for EventLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}
