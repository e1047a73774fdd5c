//! Thread-safe FIFO with an optional pollable readiness descriptor.
//!
//! Channels are the only mutable state shared between threads in this
//! library. A signalable channel additionally owns an eventfd counter that
//! becomes readable whenever items have been pushed since the last
//! [`Channel::clear_fd`], which lets an event loop sleep on the channel.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Condvar, Mutex};

use nix::sys::eventfd::{EfdFlags, EventFd};

pub struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
    event: Option<EventFd>,
}

impl<T> Channel<T> {
    /// Create a channel. A signalable channel allocates the readiness
    /// descriptor; allocation failure is fatal.
    pub fn new(signalable: bool) -> Self {
        let event = if signalable {
            Some(
                EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                    .expect("eventfd allocation failed"),
            )
        } else {
            None
        };
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            event,
        }
    }

    /// Append an item. Never blocks.
    ///
    /// The descriptor is bumped and the condition variable signaled while the
    /// queue lock is held, so a woken reader always finds the item.
    pub fn push(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(item);
        if let Some(event) = &self.event {
            event.arm().expect("eventfd signal failed");
        }
        self.ready.notify_one();
        drop(queue);
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Block until an item is available, then pop it.
    pub fn pop_wait(&self) -> T {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            queue = self.ready.wait(queue).unwrap();
        }
    }

    /// Remove every queued item matching `pred`. Safe while other threads are
    /// blocked in [`Channel::pop_wait`].
    pub fn remove_if(&self, mut pred: impl FnMut(&T) -> bool) {
        let mut queue = self.queue.lock().unwrap();
        queue.retain(|item| !pred(item));
    }

    /// The readiness descriptor. Panics on a non-signalable channel.
    pub fn fd(&self) -> RawFd {
        self.signal_event().as_fd().as_raw_fd()
    }

    /// Drain the readiness descriptor. The caller is expected to pop until
    /// empty afterwards; future pushes re-arm the descriptor.
    pub fn clear_fd(&self) {
        drain_counter(self.signal_event().as_fd().as_raw_fd());
    }

    fn signal_event(&self) -> &EventFd {
        self.event
            .as_ref()
            .expect("channel has no readiness descriptor")
    }
}

/// Read an eventfd counter down to zero, tolerating an already-empty counter.
fn drain_counter(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc == buf.len() as isize {
            return;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return,
            _ => panic!("eventfd read failed: {err}"),
        }
    }
}
