//! The dispatcher: a fixed-size pool of worker threads, each running one operation at a time and
//! posting exactly one completion packet for it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, io, thread};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::buffer::IoBuffer;
use crate::queue::{CompletionSink, Payload};
use crate::status::{Error, Result};

/// What an operation produced, to be turned into its completion packet.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) bytes: usize,
    pub(crate) error: Option<Error>,
    pub(crate) payload: Option<Payload>,
}

impl Outcome {
    pub(crate) fn new(bytes: usize, error: Option<Error>, payload: Option<Payload>) -> Self {
        Self {
            bytes,
            error,
            payload,
        }
    }
}

/// One accepted request.
pub(crate) struct Job {
    sink: CompletionSink,
    // handed to `work` when it runs, or back to the caller if the job is rejected.
    buffers: Vec<IoBuffer>,
    work: Box<dyn FnOnce(Vec<IoBuffer>) -> Outcome + Send>,

    // released only once the packet has been posted.
    _in_flight: InFlight,
}

impl Job {
    pub(crate) fn new<F>(sink: CompletionSink, in_flight: InFlight, work: F) -> Self
    where
        F: FnOnce() -> Outcome + Send + 'static,
    {
        Self::with_buffers(sink, in_flight, Vec::new(), move |_| work())
    }

    /// A job that transfers `buffers`.
    pub(crate) fn with_buffers<F>(
        sink: CompletionSink,
        in_flight: InFlight,
        buffers: Vec<IoBuffer>,
        work: F,
    ) -> Self
    where
        F: FnOnce(Vec<IoBuffer>) -> Outcome + Send + 'static,
    {
        Self {
            sink,
            buffers,
            work: Box::new(work),
            _in_flight: in_flight,
        }
    }

    fn run(self) {
        let Job {
            sink,
            buffers,
            work,
            _in_flight,
        } = self;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(move || work(buffers))) {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!("An operation panicked on a dispatcher worker, failing its request");
                let error = io::Error::new(io::ErrorKind::Other, "operation panicked");
                Outcome::new(0, Some(error.into()), None)
            }
        };
        sink.complete_partial(outcome.bytes, outcome.error, outcome.payload);
        drop(_in_flight);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("sink", &self.sink)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

struct Shared {
    jobs: ArrayQueue<Job>,
    shutdown: AtomicBool,

    // guards the sleep/wakeup handshake of idle workers.
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// A bounded worker pool.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start `worker_threads` workers, accepting up to `capacity` queued-but-not-running jobs.
    pub fn new(worker_threads: usize, capacity: usize) -> Result<Self> {
        if worker_threads == 0 || capacity == 0 {
            return Err(Error::InvalidParameter(
                "dispatcher needs at least one worker and one queue slot",
            ));
        }
        let shared = Arc::new(Shared {
            jobs: ArrayQueue::new(capacity),
            shutdown: AtomicBool::new(false),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("kxio-worker-{}", index))
                .spawn(move || worker_loop(&worker));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    log::warn!("Failed to spawn dispatcher worker {}: {}", index, error);
                    let dispatcher = Self {
                        shared,
                        workers: Mutex::new(workers),
                    };
                    dispatcher.shutdown();
                    return Err(Error::InsufficientResources("cannot spawn worker threads"));
                }
            }
        }
        log::debug!(
            "Started dispatcher with {} worker(s) and a queue of {}",
            worker_threads,
            capacity
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue `job` without blocking. Fails with [`Error::QueueFull`], carrying the job's
    /// buffers, when the submission queue is full; nothing is posted for a rejected job.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        // workers decide to exit under this lock, so a job pushed while holding it is always
        // seen by one of them.
        let _guard = self.shared.lock.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::InvalidHandle);
        }
        if let Err(job) = self.shared.jobs.push(job) {
            log::debug!("Dispatcher queue is full, rejecting request");
            return Err(Error::QueueFull {
                buffers: job.buffers,
            });
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// The number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.jobs.len()
    }
    pub fn worker_threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting jobs, let the workers drain the queue, and join them.
    pub fn shutdown(&self) {
        {
            let _guard = self.shared.lock.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.wakeup.notify_all();
        }

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() == current {
                // shut down from inside a job; this worker exits on its own once drained.
                continue;
            }
            if worker.join().is_err() {
                log::warn!("A dispatcher worker terminated abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.shared.jobs.len())
            .field("capacity", &self.shared.jobs.capacity())
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        if let Some(job) = shared.jobs.pop() {
            job.run();
            continue;
        }

        let mut guard = shared.lock.lock();
        if !shared.jobs.is_empty() {
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        shared.wakeup.wait(&mut guard);
    }
}

struct TrackerState {
    count: usize,
    closing: bool,
}

/// Counts the operations in flight against one descriptor, so that closing it can wait for
/// them.
pub(crate) struct InFlightTracker {
    state: Mutex<TrackerState>,
    idle: Condvar,
}

impl InFlightTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                count: 0,
                closing: false,
            }),
            idle: Condvar::new(),
        })
    }

    /// Account for a new operation. Fails with `InvalidHandle` once closing has begun.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<InFlight> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Error::InvalidHandle);
        }
        state.count += 1;
        Ok(InFlight {
            tracker: Arc::clone(self),
        })
    }

    /// Refuse new operations, then block until the in-flight ones have completed.
    pub(crate) fn close_and_wait(&self) {
        let mut state = self.state.lock();
        state.closing = true;
        while state.count > 0 {
            self.idle.wait(&mut state);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().count
    }
}

/// A counted reference to an in-flight operation.
pub(crate) struct InFlight {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock();
        state.count -= 1;
        if state.count == 0 {
            self.tracker.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CompletionQueue;
    use std::time::Duration;

    #[test]
    fn every_job_posts_one_packet() {
        let dispatcher = Dispatcher::new(4, 64).unwrap();
        let queue = CompletionQueue::new(0);
        let binding = queue.bind(1);
        let tracker = InFlightTracker::new();

        for token in 0..32 {
            let job = Job::new(binding.sink(token), tracker.begin().unwrap(), move || {
                Outcome::new(token as usize, None, None)
            });
            dispatcher.submit(job).unwrap();
        }
        tracker.close_and_wait();
        assert_eq!(tracker.in_flight(), 0);

        let mut waiter = queue.register_waiter().unwrap();
        let mut tokens = (0..32)
            .map(|_| waiter.wait(Some(Duration::from_secs(5))).unwrap().token())
            .collect::<Vec<_>>();
        tokens.sort_unstable();
        assert_eq!(tokens, (0..32).collect::<Vec<_>>());
        assert!(matches!(
            waiter.wait(Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn panicking_job_still_completes() {
        let dispatcher = Dispatcher::new(1, 4).unwrap();
        let queue = CompletionQueue::new(0);
        let binding = queue.bind(0);
        let tracker = InFlightTracker::new();

        let job = Job::new(binding.sink(5), tracker.begin().unwrap(), || {
            panic!("simulated failure")
        });
        dispatcher.submit(job).unwrap();

        let mut waiter = queue.register_waiter().unwrap();
        let packet = waiter.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(packet.token(), 5);
        assert!(matches!(packet.error(), Some(Error::Io { .. })));
    }

    #[test]
    fn full_queue_rejects_synchronously() {
        let dispatcher = Dispatcher::new(1, 1).unwrap();
        let queue = CompletionQueue::new(0);
        let binding = queue.bind(0);
        let tracker = InFlightTracker::new();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);

        // occupy the only worker until released.
        let blocker = Job::new(binding.sink(0), tracker.begin().unwrap(), move || {
            let _ = gate.lock().recv();
            Outcome::new(0, None, None)
        });
        dispatcher.submit(blocker).unwrap();
        while dispatcher.queued() > 0 {
            thread::yield_now();
        }

        dispatcher
            .submit(Job::new(binding.sink(1), tracker.begin().unwrap(), || {
                Outcome::new(0, None, None)
            }))
            .unwrap();
        let rejected = dispatcher.submit(Job::new(binding.sink(2), tracker.begin().unwrap(), || {
            Outcome::new(0, None, None)
        }));
        assert!(matches!(rejected, Err(Error::QueueFull { .. })));

        release.send(()).unwrap();
        tracker.close_and_wait();

        let mut waiter = queue.register_waiter().unwrap();
        let mut tokens = vec![
            waiter.wait(Some(Duration::from_secs(5))).unwrap().token(),
            waiter.wait(Some(Duration::from_secs(5))).unwrap().token(),
        ];
        tokens.sort_unstable();
        assert_eq!(tokens, vec![0, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn closing_tracker_refuses_new_work() {
        let tracker = InFlightTracker::new();
        let in_flight = tracker.begin().unwrap();
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.close_and_wait())
        };
        while !tracker.state.lock().closing {
            thread::yield_now();
        }
        assert!(matches!(tracker.begin(), Err(Error::InvalidHandle)));
        drop(in_flight);
        waiter.join().unwrap();
    }

    #[test]
    fn shutdown_drains_queue() {
        let dispatcher = Dispatcher::new(2, 128).unwrap();
        let queue = CompletionQueue::new(0);
        let binding = queue.bind(0);
        let tracker = InFlightTracker::new();
        for token in 0..100 {
            dispatcher
                .submit(Job::new(binding.sink(token), tracker.begin().unwrap(), || {
                    Outcome::new(0, None, None)
                }))
                .unwrap();
        }
        dispatcher.shutdown();
        assert_eq!(queue.len(), 100);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn every_accepted_job_runs_despite_a_concurrent_shutdown() {
        for _ in 0..50 {
            let dispatcher = Arc::new(Dispatcher::new(2, 1024).unwrap());
            let queue = CompletionQueue::new(0);
            let binding = Arc::new(queue.bind(0));
            let tracker = InFlightTracker::new();

            let submitters = (0..4)
                .map(|_| {
                    let (dispatcher, binding, tracker) =
                        (Arc::clone(&dispatcher), Arc::clone(&binding), Arc::clone(&tracker));
                    thread::spawn(move || {
                        let mut accepted = 0usize;
                        for token in 0..64 {
                            let job = Job::new(binding.sink(token), tracker.begin().unwrap(), || {
                                Outcome::new(0, None, None)
                            });
                            match dispatcher.submit(job) {
                                Ok(()) => accepted += 1,
                                Err(error) => assert!(matches!(error, Error::InvalidHandle)),
                            }
                        }
                        accepted
                    })
                })
                .collect::<Vec<_>>();
            dispatcher.shutdown();

            let accepted: usize = submitters.into_iter().map(|s| s.join().unwrap()).sum();
            // anything accepted after the workers were joined would hang here.
            tracker.close_and_wait();
            assert_eq!(queue.len(), accepted);
        }
    }
}
