//! Cross-thread work delivery for event loops.
//!
//! A delegate is a closure posted from any thread and executed on the thread
//! that drains the delegator, with exclusive access to that thread's state.

use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};

use crate::channel::Channel;

/// A unit of work executed on the owning loop's thread.
pub type Delegate<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

/// FIFO of delegates backed by a signalable [`Channel`].
///
/// Delegates posted by a single thread run in post order. There is no
/// ordering guarantee across posting threads.
pub struct Delegator<T> {
    channel: Channel<Delegate<T>>,
}

impl<T> Delegator<T> {
    pub fn new() -> Self {
        Self {
            channel: Channel::new(true),
        }
    }

    /// Descriptor that becomes readable when delegates are pending.
    pub fn fd(&self) -> RawFd {
        self.channel.fd()
    }

    /// Enqueue a delegate and wake the loop watching the descriptor.
    pub fn post(&self, delegate: impl FnOnce(&mut T) + Send + 'static) {
        self.channel.push(Box::new(delegate));
    }

    /// Enqueue a delegate and block until it has run, returning its result.
    ///
    /// Must not be called from the thread that drains this delegator.
    pub fn post_sync<R: Send + 'static>(
        &self,
        delegate: impl FnOnce(&mut T) -> R + Send + 'static,
    ) -> R {
        struct Completion<R> {
            slot: Mutex<Option<R>>,
            done: Condvar,
        }

        let completion = Arc::new(Completion {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        let signal = completion.clone();
        self.post(move |data| {
            let result = delegate(data);
            *signal.slot.lock().unwrap() = Some(result);
            signal.done.notify_one();
        });

        let mut slot = completion.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = completion.done.wait(slot).unwrap();
        }
    }

    /// Drain the descriptor, then run every pending delegate in order.
    pub fn run_pending(&self, data: &mut T) {
        self.channel.clear_fd();
        while let Some(delegate) = self.channel.try_pop() {
            delegate(data);
        }
    }
}

impl<T> Default for Delegator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn delegates_run_in_post_order() {
        let delegator: Delegator<Vec<u32>> = Delegator::new();
        for i in 0..10u32 {
            delegator.post(move |seen| seen.push(i));
        }
        let mut seen = Vec::new();
        delegator.run_pending(&mut seen);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn post_sync_returns_the_delegate_result() {
        let delegator: Arc<Delegator<u32>> = Arc::new(Delegator::new());
        let drainer = delegator.clone();
        let handle = thread::spawn(move || {
            let mut value = 5u32;
            // Spin until the sync delegate lands; a real loop would sleep on
            // the descriptor instead.
            loop {
                drainer.run_pending(&mut value);
                if value != 5 {
                    break;
                }
                thread::yield_now();
            }
        });

        let result = delegator.post_sync(|value| {
            *value *= 2;
            *value
        });
        assert_eq!(result, 10);
        handle.join().unwrap();
    }

    #[test]
    fn run_pending_interleaves_with_posts() {
        let delegator: Delegator<Vec<&'static str>> = Delegator::new();
        delegator.post(|seen| seen.push("first"));
        let mut seen = Vec::new();
        delegator.run_pending(&mut seen);
        delegator.post(|seen| seen.push("second"));
        delegator.run_pending(&mut seen);
        assert_eq!(seen, vec!["first", "second"]);
    }
}
