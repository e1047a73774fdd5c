//! Background job thread with cancellation and a pollable result queue.
//!
//! Jobs carry a kind bitmask so whole classes of queued work can be
//! cancelled at once; the running job is flagged and expected to check
//! [`JobContext::cancelled`] at convenient points. Results flow through a
//! signalable channel, so an event loop can watch [`Worker::result_fd`].

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::warn;

use crate::channel::Channel;

/// Kind mask matching every job.
pub const JOB_ANY: u32 = u32::MAX;

type JobFn<R> = Box<dyn FnOnce(&JobContext<R>) + Send>;

enum Message<R> {
    Job(Job<R>),
    Exit,
}

struct Job<R> {
    kind: u32,
    run: JobFn<R>,
}

/// Handed to each job while it runs.
pub struct JobContext<R> {
    results: Arc<Channel<R>>,
    cancel: Arc<AtomicBool>,
}

impl<R> JobContext<R> {
    /// True once the job has been cancelled; long jobs should poll this.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn push_result(&self, result: R) {
        self.results.push(result);
    }
}

pub struct Worker<R: Send + 'static> {
    jobs: Arc<Channel<Message<R>>>,
    results: Arc<Channel<R>>,
    current: Arc<Mutex<Option<u32>>>,
    cancel_current: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> Worker<R> {
    pub fn new() -> Self {
        let jobs: Arc<Channel<Message<R>>> = Arc::new(Channel::new(false));
        let results: Arc<Channel<R>> = Arc::new(Channel::new(true));
        let current: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let cancel_current = Arc::new(AtomicBool::new(false));

        let thread = {
            let jobs = jobs.clone();
            let results = results.clone();
            let current = current.clone();
            let cancel_current = cancel_current.clone();
            thread::Builder::new()
                .name("auris-worker".into())
                .spawn(move || loop {
                    match jobs.pop_wait() {
                        Message::Exit => break,
                        Message::Job(job) => {
                            {
                                let mut slot = current.lock().unwrap();
                                *slot = Some(job.kind);
                                cancel_current.store(false, Ordering::Relaxed);
                            }
                            let context = JobContext {
                                results: results.clone(),
                                cancel: cancel_current.clone(),
                            };
                            (job.run)(&context);
                            *current.lock().unwrap() = None;
                        }
                    }
                })
                .expect("failed to spawn worker thread")
        };

        Self {
            jobs,
            results,
            current,
            cancel_current,
            thread: Some(thread),
        }
    }

    /// Queue a job tagged with `kind`.
    pub fn submit(&self, kind: u32, job: impl FnOnce(&JobContext<R>) + Send + 'static) {
        self.jobs.push(Message::Job(Job {
            kind,
            run: Box::new(job),
        }));
    }

    /// Drop queued jobs whose kind intersects `mask` and flag the running
    /// job when it matches.
    pub fn cancel_matching(&self, mask: u32) {
        self.jobs
            .remove_if(|message| matches!(message, Message::Job(job) if job.kind & mask != 0));
        let current = self.current.lock().unwrap();
        if let Some(kind) = *current {
            if kind & mask != 0 {
                self.cancel_current.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Descriptor that becomes readable when results are pending.
    pub fn result_fd(&self) -> RawFd {
        self.results.fd()
    }

    /// Drain the result descriptor; pair with [`Worker::try_result`].
    pub fn clear_result_fd(&self) {
        self.results.clear_fd();
    }

    pub fn try_result(&self) -> Option<R> {
        self.results.try_pop()
    }
}

impl<R: Send + 'static> Default for Worker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> Drop for Worker<R> {
    fn drop(&mut self) {
        self.cancel_matching(JOB_ANY);
        self.jobs.push(Message::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::BorrowedFd;
    use std::sync::mpsc;
    use std::time::Duration;

    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    use super::*;

    #[test]
    fn results_arrive_through_the_signalable_channel() {
        let worker: Worker<u32> = Worker::new();
        worker.submit(1, |ctx| ctx.push_result(41));

        let fd = unsafe { BorrowedFd::borrow_raw(worker.result_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(2_000u16)).unwrap();
        assert_eq!(ready, 1);

        worker.clear_result_fd();
        assert_eq!(worker.try_result(), Some(41));
        assert_eq!(worker.try_result(), None);
    }

    #[test]
    fn queued_jobs_matching_the_mask_are_dropped() {
        let worker: Worker<&'static str> = Worker::new();
        let (block_tx, block_rx) = mpsc::channel::<()>();

        // Keep the worker busy so the later submissions stay queued.
        worker.submit(1, move |ctx| {
            block_rx.recv().unwrap();
            ctx.push_result("first");
        });
        worker.submit(2, |ctx| ctx.push_result("second"));
        worker.submit(4, |ctx| ctx.push_result("third"));

        worker.cancel_matching(2);
        block_tx.send(()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let fd = unsafe { BorrowedFd::borrow_raw(worker.result_fd()) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(2_000u16)).unwrap();
            worker.clear_result_fd();
            while let Some(result) = worker.try_result() {
                seen.push(result);
            }
            if seen.len() >= 2 {
                break;
            }
        }
        assert_eq!(seen, vec!["first", "third"]);
    }

    #[test]
    fn running_job_observes_cancellation() {
        let worker: Worker<bool> = Worker::new();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        worker.submit(8, move |ctx| {
            started_tx.send(()).unwrap();
            for _ in 0..200 {
                if ctx.cancelled() {
                    ctx.push_result(true);
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            ctx.push_result(false);
        });

        started_rx.recv().unwrap();
        worker.cancel_matching(8);

        let fd = unsafe { BorrowedFd::borrow_raw(worker.result_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(5_000u16)).unwrap();
        worker.clear_result_fd();
        assert_eq!(worker.try_result(), Some(true));
    }
}
