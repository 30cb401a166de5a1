//! The completion queue: a multi-producer, multi-consumer queue of completion packets, with
//! admission control over the threads that consume it.
//!
//! Consumers first register a [`Waiter`], and then repeatedly call [`Waiter::wait`]. A waiter
//! that returned with a packet counts as *active* (dispatched) until it calls `wait` again, or
//! is dropped. No more than `max_concurrency` waiters are ever active at the same time; a waiter
//! that is otherwise ready to receive a packet stays parked, in FIFO order among the parked
//! waiters, until a slot frees up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::IoBuffer;
use crate::status::{Error, Result, Status};

/// The completion key, associated with a queue binding and copied into every packet posted
/// through that binding.
pub type CompletionKey = u64;

/// An opaque caller value, supplied at request time and returned unchanged in the packet.
pub type Token = u64;

/// Data handed back to the caller together with a completion.
#[derive(Debug)]
pub enum Payload {
    /// The buffer of a single-extent read or write.
    Buffer(IoBuffer),
    /// The buffers of a scatter/gather request, in submission order.
    Buffers(Vec<IoBuffer>),
    /// The value received by an event channel read.
    Value(u64),
}

/// The result of one asynchronous operation.
#[derive(Debug)]
pub struct CompletionPacket {
    error: Option<Error>,
    bytes_transferred: usize,
    key: CompletionKey,
    token: Token,
    payload: Option<Payload>,
}

impl CompletionPacket {
    /// A successful packet, as used by [`CompletionQueue::post_completion`].
    pub fn new(bytes_transferred: usize, key: CompletionKey, token: Token) -> Self {
        Self {
            error: None,
            bytes_transferred,
            key,
            token,
            payload: None,
        }
    }
    pub(crate) fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
    pub(crate) fn with_payload(mut self, payload: Option<Payload>) -> Self {
        self.payload = payload;
        self
    }

    pub fn status(&self) -> Status {
        self.error.as_ref().map_or(Status::Success, Error::status)
    }
    /// The error the operation failed with, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }
    pub fn key(&self) -> CompletionKey {
        self.key
    }
    pub fn token(&self) -> Token {
        self.token
    }
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }
    /// Take the payload out of the packet, leaving everything else intact.
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }
    /// Convert the packet into a result; the payload is returned on success and on failure
    /// alike, so that buffers are never lost.
    pub fn into_result(self) -> (Result<usize>, Option<Payload>) {
        let result = match self.error {
            Some(error) => Err(error),
            None => Ok(self.bytes_transferred),
        };
        (result, self.payload)
    }
    /// Convenience for single-buffer requests.
    pub fn into_buffer(self) -> Option<IoBuffer> {
        match self.payload {
            Some(Payload::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }
    /// Convenience for scatter/gather requests.
    pub fn into_buffers(self) -> Option<Vec<IoBuffer>> {
        match self.payload {
            Some(Payload::Buffers(buffers)) => Some(buffers),
            _ => None,
        }
    }
    /// Convenience for event reads.
    pub fn value(&self) -> Option<u64> {
        match self.payload {
            Some(Payload::Value(value)) => Some(value),
            _ => None,
        }
    }
}

struct QueueState {
    packets: VecDeque<CompletionPacket>,

    // tickets of the waiters currently inside `wait`, in arrival order. only the front ticket
    // may take a packet.
    parked: VecDeque<u64>,
    next_ticket: u64,

    registered: usize,
    active: usize,
    closed: bool,
}

/// A completion queue. See the [module documentation](self).
pub struct CompletionQueue {
    max_concurrency: usize,
    state: Mutex<QueueState>,
    ready: Condvar,

    // number of live descriptor bindings that target this queue.
    bindings: AtomicUsize,
}

impl CompletionQueue {
    /// Create a queue. A `max_concurrency` of zero means that any number of waiters may be
    /// active at once.
    pub fn new(max_concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrency,
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                parked: VecDeque::new(),
                next_ticket: 0,
                registered: 0,
                active: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            bindings: AtomicUsize::new(0),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn admits(&self, active: usize) -> bool {
        self.max_concurrency == 0 || active < self.max_concurrency
    }

    /// Enqueue a packet. Never blocks; fails with `InvalidHandle` once the queue is closed.
    pub fn post(&self, packet: CompletionPacket) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidHandle);
        }
        log::trace!(
            "Posting packet (key {}, token {:#x}, status {:?})",
            packet.key,
            packet.token,
            packet.status()
        );
        state.packets.push_back(packet);
        drop(state);

        self.ready.notify_all();
        Ok(())
    }
    /// Post a successful packet carrying only `(bytes, key, token)`.
    pub fn post_completion(&self, bytes: usize, key: CompletionKey, token: Token) -> Result<()> {
        self.post(CompletionPacket::new(bytes, key, token))
    }

    /// Register the calling worker with the admission control. The returned waiter unregisters
    /// itself when dropped.
    pub fn register_waiter(self: &Arc<Self>) -> Result<Waiter> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidHandle);
        }
        state.registered += 1;
        Ok(Waiter {
            queue: Arc::clone(self),
            active: false,
        })
    }

    /// Close the queue, waking every blocked waiter with `Abandoned`. Queued packets that have not
    /// been received are discarded.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidHandle);
        }
        state.closed = true;
        let discarded = state.packets.len();
        state.packets.clear();
        let parked = state.parked.len();
        drop(state);

        let bindings = self.bindings();
        if bindings > 0 {
            log::warn!(
                "Closing a completion queue that still has {} descriptor binding(s)",
                bindings
            );
        }
        log::debug!(
            "Closed completion queue, waking {} waiter(s) and discarding {} packet(s)",
            parked,
            discarded
        );
        self.ready.notify_all();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
    /// The number of packets waiting to be received.
    pub fn len(&self) -> usize {
        self.state.lock().packets.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn registered_waiters(&self) -> usize {
        self.state.lock().registered
    }
    /// The number of waiters currently blocked inside `wait`.
    pub fn blocked_waiters(&self) -> usize {
        self.state.lock().parked.len()
    }
    /// The number of waiters currently dispatched (returned from `wait`, not yet back).
    pub fn active_waiters(&self) -> usize {
        self.state.lock().active
    }
    /// The number of live descriptor bindings targeting this queue.
    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::Acquire)
    }

    pub(crate) fn bind(self: &Arc<Self>, key: CompletionKey) -> Binding {
        self.bindings.fetch_add(1, Ordering::AcqRel);
        Binding {
            queue: Arc::clone(self),
            key,
        }
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionQueue")
            .field("max_concurrency", &self.max_concurrency)
            .field("packets", &state.packets.len())
            .field("registered", &state.registered)
            .field("active", &state.active)
            .field("closed", &state.closed)
            .finish()
    }
}

/// A registered consumer of a [`CompletionQueue`].
#[derive(Debug)]
pub struct Waiter {
    queue: Arc<CompletionQueue>,
    active: bool,
}

impl Waiter {
    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }
    /// Whether this waiter currently holds one of the queue's active slots.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Block until a packet can be delivered to this waiter, the timeout elapses (`Timeout`),
    /// or the queue is closed (`Abandoned`). A `None` timeout waits forever. Calling `wait`
    /// releases the active slot acquired by the previous call.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<CompletionPacket> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let queue = &*self.queue;
        let mut state = queue.state.lock();

        if self.active {
            state.active -= 1;
            self.active = false;
            queue.ready.notify_all();
        }
        if state.closed {
            return Err(Error::InvalidHandle);
        }

        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.parked.push_back(ticket);

        loop {
            if state.closed {
                remove_ticket(&mut state.parked, ticket);
                return Err(Error::Abandoned);
            }
            if state.parked.front() == Some(&ticket) && queue.admits(state.active) {
                if let Some(packet) = state.packets.pop_front() {
                    state.parked.pop_front();
                    state.active += 1;
                    self.active = true;
                    drop(state);

                    // the next parked waiter may be able to take a remaining packet.
                    queue.ready.notify_all();
                    return Ok(packet);
                }
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        remove_ticket(&mut state.parked, ticket);
                        drop(state);
                        queue.ready.notify_all();
                        return Err(Error::Timeout);
                    }
                    let _ = queue.ready.wait_until(&mut state, deadline);
                }
                None => queue.ready.wait(&mut state),
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.registered -= 1;
        if self.active {
            state.active -= 1;
            self.active = false;
        }
        drop(state);
        self.queue.ready.notify_all();
    }
}

fn remove_ticket(parked: &mut VecDeque<u64>, ticket: u64) {
    if let Some(index) = parked.iter().position(|&t| t == ticket) {
        parked.remove(index);
    }
}

/// The association of a descriptor with a queue and key. Completions of operations on the
/// descriptor are posted through it.
pub(crate) struct Binding {
    queue: Arc<CompletionQueue>,
    key: CompletionKey,
}

impl Binding {
    pub(crate) fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }
    pub(crate) fn key(&self) -> CompletionKey {
        self.key
    }
    pub(crate) fn sink(&self, token: Token) -> CompletionSink {
        CompletionSink {
            queue: Arc::clone(&self.queue),
            key: self.key,
            token,
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.queue.bindings.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("key", &self.key).finish()
    }
}

/// Where the completion of one accepted request goes. Consumed by posting, so that a request
/// can only ever produce one packet.
#[derive(Debug)]
pub(crate) struct CompletionSink {
    queue: Arc<CompletionQueue>,
    key: CompletionKey,
    token: Token,
}

impl CompletionSink {
    pub(crate) fn complete(self, result: Result<usize>, payload: Option<Payload>) {
        let packet = match result {
            Ok(bytes) => CompletionPacket::new(bytes, self.key, self.token),
            Err(error) => CompletionPacket::new(0, self.key, self.token).with_error(error),
        }
        .with_payload(payload);

        if self.queue.post(packet).is_err() {
            log::debug!(
                "Dropping completion for token {:#x}: its queue has been closed",
                self.token
            );
        }
    }
    /// Complete with partial progress, reporting both the error and the bytes that moved.
    pub(crate) fn complete_partial(self, bytes: usize, error: Option<Error>, payload: Option<Payload>) {
        let mut packet = CompletionPacket::new(bytes, self.key, self.token).with_payload(payload);
        if let Some(error) = error {
            packet = packet.with_error(error);
        }
        if self.queue.post(packet).is_err() {
            log::debug!(
                "Dropping completion for token {:#x}: its queue has been closed",
                self.token
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn post_then_wait_round_trips() {
        let queue = CompletionQueue::new(0);
        let mut waiter = queue.register_waiter().unwrap();

        queue.post_completion(512, 7, 0).unwrap();
        let packet = waiter.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(packet.status(), Status::Success);
        assert_eq!(packet.bytes_transferred(), 512);
        assert_eq!(packet.key(), 7);
        assert_eq!(packet.token(), 0);
        assert!(waiter.is_active());
    }

    #[test]
    fn wait_times_out() {
        let queue = CompletionQueue::new(1);
        let mut waiter = queue.register_waiter().unwrap();
        let started = Instant::now();
        assert!(matches!(
            waiter.wait(Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!waiter.is_active());
    }

    #[test]
    fn packets_are_fifo() {
        let queue = CompletionQueue::new(0);
        let mut waiter = queue.register_waiter().unwrap();
        for token in 1..=5 {
            queue.post_completion(0, 0, token).unwrap();
        }
        for token in 1..=5 {
            assert_eq!(waiter.wait(None).unwrap().token(), token);
        }
    }

    #[test]
    fn concurrency_bound_parks_second_waiter() {
        let queue = CompletionQueue::new(1);
        let mut first = queue.register_waiter().unwrap();
        let mut second = queue.register_waiter().unwrap();

        queue.post_completion(0, 0, 1).unwrap();
        queue.post_completion(0, 0, 2).unwrap();

        let packet = first.wait(None).unwrap();
        assert_eq!(packet.token(), 1);
        assert_eq!(queue.active_waiters(), 1);

        // the only slot is held by `first`.
        assert!(matches!(
            second.wait(Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));

        drop(first);
        assert_eq!(second.wait(Some(Duration::from_secs(1))).unwrap().token(), 2);
    }

    #[test]
    fn close_abandons_blocked_waiters() {
        let queue = CompletionQueue::new(0);
        let handles = (0..4)
            .map(|_| {
                let mut waiter = queue.register_waiter().unwrap();
                thread::spawn(move || waiter.wait(None))
            })
            .collect::<Vec<_>>();

        while queue.blocked_waiters() < 4 {
            thread::yield_now();
        }
        queue.close().unwrap();

        for handle in handles {
            assert!(matches!(handle.join().unwrap(), Err(Error::Abandoned)));
        }
        assert!(matches!(queue.post_completion(0, 0, 0), Err(Error::InvalidHandle)));
        assert!(matches!(queue.register_waiter(), Err(Error::InvalidHandle)));
        assert!(matches!(queue.close(), Err(Error::InvalidHandle)));
    }

    #[test]
    fn waiter_drop_unregisters() {
        let queue = CompletionQueue::new(0);
        let waiter = queue.register_waiter().unwrap();
        assert_eq!(queue.registered_waiters(), 1);
        drop(waiter);
        assert_eq!(queue.registered_waiters(), 0);
    }

    #[test]
    fn bindings_are_counted() {
        let queue = CompletionQueue::new(0);
        let binding = queue.bind(3);
        assert_eq!(queue.bindings(), 1);
        binding.sink(9).complete(Ok(4), Some(Payload::Value(11)));
        drop(binding);
        assert_eq!(queue.bindings(), 0);

        let mut waiter = queue.register_waiter().unwrap();
        let packet = waiter.wait(None).unwrap();
        assert_eq!((packet.key(), packet.token(), packet.value()), (3, 9, Some(11)));
    }
}
