//! Named single-slot event channels.
//!
//! A channel connects one producer with at most one consumer, rendezvousing by name through a
//! process-wide table. The producer writes 64-bit values into a single slot, and the consumer
//! reads them out again; each read and each write is an asynchronous request that completes
//! through the endpoint's completion queue binding. A write is complete as soon as the value is
//! in the slot, but the slot must drain before the next write is accepted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::queue::{Binding, CompletionKey, CompletionQueue, CompletionSink, Payload, Token};
use crate::status::{Error, Result};

/// The size of an event value, reported as the byte count of reads and writes.
pub const EVENT_SIZE: usize = std::mem::size_of::<u64>();

static CHANNELS: Lazy<Mutex<HashMap<String, Weak<Channel>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The side of a channel an endpoint is bound to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventRole {
    Producer,
    Consumer,
}

/// Options for [`EventEndpoint::bind`].
#[derive(Clone, Debug)]
pub struct EventOptions {
    role: EventRole,
    peer_filter: Option<u32>,
    process_id: u32,
}

impl EventOptions {
    pub fn new(role: EventRole) -> Self {
        Self {
            role,
            peer_filter: None,
            process_id: std::process::id(),
        }
    }
    pub fn producer() -> Self {
        Self::new(EventRole::Producer)
    }
    pub fn consumer() -> Self {
        Self::new(EventRole::Consumer)
    }
    /// Only accept a producer running in process `pid`. Only meaningful for consumers.
    pub fn peer_filter(mut self, pid: u32) -> Self {
        self.peer_filter = Some(pid);
        self
    }
    /// The process id the endpoint identifies itself with; the current process by default.
    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }
    pub fn role(&self) -> EventRole {
        self.role
    }
}

#[derive(Default)]
struct ChannelState {
    // process id of the bound producer.
    producer: Option<u32>,
    // the bound consumer, with its peer filter.
    consumer: Option<Option<u32>>,
    producer_closed: bool,

    slot: Option<u64>,
    pending_read: Option<CompletionSink>,
}

impl ChannelState {
    fn is_unused(&self) -> bool {
        self.producer.is_none() && self.consumer.is_none()
    }
}

struct Channel {
    name: String,
    state: Mutex<ChannelState>,
}

/// One end of a named event channel.
pub struct EventEndpoint {
    channel: Arc<Channel>,
    role: EventRole,
    process_id: u32,
    binding: OnceCell<Binding>,
    closed: AtomicBool,
}

impl EventEndpoint {
    /// Bind to the channel called `name`, creating it if it does not exist yet.
    ///
    /// Fails with `DuplicateName` if the channel already has an endpoint of this role, and with
    /// `InvalidParameter` if a consumer's peer filter does not match the producer's process.
    pub fn bind(name: &str, options: &EventOptions) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(Error::InvalidParameter("event channel name is empty"));
        }
        let mut channels = CHANNELS.lock();

        let channel = match channels.get(name).and_then(Weak::upgrade) {
            Some(channel) => channel,
            None => {
                let channel = Arc::new(Channel {
                    name: name.to_owned(),
                    state: Mutex::new(ChannelState::default()),
                });
                channels.insert(name.to_owned(), Arc::downgrade(&channel));
                channel
            }
        };

        {
            let mut state = channel.state.lock();
            match options.role {
                EventRole::Producer => {
                    if state.producer.is_some() {
                        return Err(Error::DuplicateName);
                    }
                    if let Some(Some(filter)) = state.consumer {
                        if filter != options.process_id {
                            return Err(Error::InvalidParameter(
                                "producer process does not match the consumer's filter",
                            ));
                        }
                    }
                    state.producer = Some(options.process_id);
                }
                EventRole::Consumer => {
                    if state.consumer.is_some() {
                        return Err(Error::DuplicateName);
                    }
                    if let (Some(filter), Some(producer)) = (options.peer_filter, state.producer) {
                        if filter != producer {
                            return Err(Error::InvalidParameter(
                                "producer process does not match the consumer's filter",
                            ));
                        }
                    }
                    state.consumer = Some(options.peer_filter);
                }
            }
        }
        log::debug!("Bound {:?} to event channel {:?}", options.role, name);

        Ok(Arc::new(Self {
            channel,
            role: options.role,
            process_id: options.process_id,
            binding: OnceCell::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.channel.name
    }
    pub fn role(&self) -> EventRole {
        self.role
    }
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Associate the endpoint with a completion queue. This can only be done once.
    pub fn bind_queue(&self, queue: &Arc<CompletionQueue>, key: CompletionKey) -> Result<()> {
        if queue.is_closed() {
            return Err(Error::InvalidHandle);
        }
        if self.binding.get().is_some() {
            return Err(Error::AlreadyBound);
        }
        self.binding
            .set(queue.bind(key))
            .map_err(|_| Error::AlreadyBound)
    }
    pub fn binding(&self) -> Option<(Arc<CompletionQueue>, CompletionKey)> {
        self.binding
            .get()
            .map(|binding| (Arc::clone(binding.queue()), binding.key()))
    }

    fn sink(&self, token: Token) -> Result<CompletionSink> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidHandle);
        }
        self.binding
            .get()
            .map(|binding| binding.sink(token))
            .ok_or(Error::InvalidDeviceRequest)
    }

    /// Put `value` into the slot. Completes immediately, or hands the value straight to a
    /// pending read. Fails with `WriteInProgress` while the previous value is still unread.
    pub fn write_async(&self, value: u64, token: Token) -> Result<()> {
        if self.role != EventRole::Producer {
            return Err(Error::InvalidParameter("only the producer can write"));
        }
        let sink = self.sink(token)?;

        let mut state = self.channel.state.lock();
        if state.slot.is_some() {
            return Err(Error::WriteInProgress);
        }
        match state.pending_read.take() {
            Some(read) => read.complete(Ok(EVENT_SIZE), Some(Payload::Value(value))),
            None => state.slot = Some(value),
        }
        sink.complete(Ok(EVENT_SIZE), None);
        Ok(())
    }

    /// Take the next value out of the slot, completing as soon as one is there. Fails with
    /// `ResourceInUse` if a read is already pending, and with `Abandoned` once the producer has
    /// gone away.
    pub fn read_async(&self, token: Token) -> Result<()> {
        if self.role != EventRole::Consumer {
            return Err(Error::InvalidParameter("only the consumer can read"));
        }
        let sink = self.sink(token)?;

        let mut state = self.channel.state.lock();
        if state.producer_closed {
            return Err(Error::Abandoned);
        }
        if state.pending_read.is_some() {
            return Err(Error::ResourceInUse);
        }
        match state.slot.take() {
            Some(value) => sink.complete(Ok(EVENT_SIZE), Some(Payload::Value(value))),
            None => state.pending_read = Some(sink),
        }
        Ok(())
    }

    /// Whether a value is waiting in the slot.
    pub fn is_full(&self) -> bool {
        self.channel.state.lock().slot.is_some()
    }
    pub fn has_pending_read(&self) -> bool {
        self.channel.state.lock().pending_read.is_some()
    }

    /// Detach from the channel. A pending read is completed with `Abandoned`.
    ///
    /// Closing the producer closes the channel for good. A value it wrote that no read has
    /// consumed yet is discarded with it, so the consumer's next read fails with `Abandoned`
    /// rather than returning that value. Closing the consumer only discards an unread value.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidHandle);
        }
        let mut channels = CHANNELS.lock();
        let mut state = self.channel.state.lock();

        let abandoned = state.pending_read.take();
        match self.role {
            EventRole::Producer => {
                state.producer = None;
                state.producer_closed = true;
                state.slot = None;
            }
            EventRole::Consumer => {
                state.consumer = None;
                state.slot = None;
            }
        }
        if let Some(read) = abandoned {
            read.complete(Err(Error::Abandoned), None);
        }

        // a closed channel is no longer found by name, so a new producer starts afresh.
        if self.role == EventRole::Producer || state.is_unused() {
            let registered = channels
                .get(&self.channel.name)
                .map_or(false, |weak| weak.as_ptr() == Arc::as_ptr(&self.channel));
            if registered {
                channels.remove(&self.channel.name);
            }
        }
        drop(state);
        drop(channels);

        log::debug!(
            "Closed {:?} of event channel {:?}",
            self.role,
            self.channel.name
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for EventEndpoint {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for EventEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEndpoint")
            .field("name", &self.channel.name)
            .field("role", &self.role)
            .field("process_id", &self.process_id)
            .field("binding", &self.binding.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use std::time::Duration;

    struct Pair {
        producer: Arc<EventEndpoint>,
        consumer: Arc<EventEndpoint>,
        queue: Arc<CompletionQueue>,
        waiter: crate::queue::Waiter,
    }

    fn pair(name: &str) -> Pair {
        let queue = CompletionQueue::new(0);
        let producer = EventEndpoint::bind(name, &EventOptions::producer()).unwrap();
        let consumer = EventEndpoint::bind(name, &EventOptions::consumer()).unwrap();
        producer.bind_queue(&queue, 1).unwrap();
        consumer.bind_queue(&queue, 2).unwrap();
        let waiter = queue.register_waiter().unwrap();
        Pair {
            producer,
            consumer,
            queue,
            waiter,
        }
    }

    fn next(waiter: &mut crate::queue::Waiter) -> crate::queue::CompletionPacket {
        waiter.wait(Some(Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn write_then_read() {
        let mut pair = pair("event-unit-write-then-read");
        pair.producer.write_async(0xDEAD, 10).unwrap();
        let write = next(&mut pair.waiter);
        assert_eq!((write.key(), write.token()), (1, 10));
        assert_eq!(write.bytes_transferred(), EVENT_SIZE);

        assert!(matches!(
            pair.producer.write_async(1, 11),
            Err(Error::WriteInProgress)
        ));

        pair.consumer.read_async(20).unwrap();
        let read = next(&mut pair.waiter);
        assert_eq!((read.key(), read.token(), read.value()), (2, 20, Some(0xDEAD)));

        // drained, so the next write is accepted.
        pair.producer.write_async(2, 12).unwrap();
    }

    #[test]
    fn pending_read_receives_the_next_write() {
        let mut pair = pair("event-unit-pending-read");
        pair.consumer.read_async(1).unwrap();
        assert!(pair.consumer.has_pending_read());
        assert!(matches!(
            pair.consumer.read_async(2),
            Err(Error::ResourceInUse)
        ));
        assert!(pair.queue.is_empty());

        pair.producer.write_async(77, 3).unwrap();
        // both completions are posted by the write.
        assert_eq!(pair.queue.len(), 2);
        let read = next(&mut pair.waiter);
        assert_eq!((read.token(), read.value()), (1, Some(77)));
        assert_eq!(next(&mut pair.waiter).token(), 3);
        assert!(!pair.producer.is_full());
    }

    #[test]
    fn producer_close_abandons_the_reader() {
        let mut pair = pair("event-unit-producer-close");
        pair.consumer.read_async(5).unwrap();
        pair.producer.close().unwrap();

        let packet = next(&mut pair.waiter);
        assert_eq!(packet.status(), Status::Abandoned);
        assert_eq!(packet.token(), 5);
        assert!(matches!(pair.consumer.read_async(6), Err(Error::Abandoned)));
        assert!(pair.queue.is_empty());
        assert!(matches!(pair.producer.close(), Err(Error::InvalidHandle)));

        // the name is free for a new channel.
        let fresh = EventEndpoint::bind("event-unit-producer-close", &EventOptions::producer());
        assert!(fresh.is_ok());
    }

    #[test]
    fn producer_close_discards_an_unread_value() {
        let mut pair = pair("event-unit-producer-close-unread");
        pair.producer.write_async(11, 0).unwrap();
        next(&mut pair.waiter);
        pair.producer.close().unwrap();

        assert!(matches!(pair.consumer.read_async(1), Err(Error::Abandoned)));
        assert!(pair.queue.is_empty());
    }

    #[test]
    fn consumer_close_discards_the_slot() {
        let mut pair = pair("event-unit-consumer-close");
        pair.producer.write_async(1, 0).unwrap();
        next(&mut pair.waiter);
        pair.consumer.close().unwrap();
        assert!(pair.queue.is_empty());

        // the unread value was dropped with the consumer.
        pair.producer.write_async(2, 0).unwrap();

        let consumer = EventEndpoint::bind("event-unit-consumer-close", &EventOptions::consumer()).unwrap();
        consumer.bind_queue(&pair.queue, 3).unwrap();
        consumer.read_async(9).unwrap();
        next(&mut pair.waiter);
        let read = next(&mut pair.waiter);
        assert_eq!((read.key(), read.value()), (3, Some(2)));
    }

    #[test]
    fn duplicate_roles_and_filters() {
        let name = "event-unit-duplicates";
        let producer = EventEndpoint::bind(name, &EventOptions::producer().process_id(100)).unwrap();
        assert!(matches!(
            EventEndpoint::bind(name, &EventOptions::producer()),
            Err(Error::DuplicateName)
        ));
        assert!(matches!(
            EventEndpoint::bind(name, &EventOptions::consumer().peer_filter(200)),
            Err(Error::InvalidParameter(_))
        ));
        let consumer = EventEndpoint::bind(name, &EventOptions::consumer().peer_filter(100)).unwrap();
        assert!(matches!(
            EventEndpoint::bind(name, &EventOptions::consumer()),
            Err(Error::DuplicateName)
        ));
        assert_eq!(consumer.name(), name);
        drop(producer);
        drop(consumer);

        // the consumer may come first; the mismatch is then caught at the producer.
        let name = "event-unit-filter-first";
        let _consumer = EventEndpoint::bind(name, &EventOptions::consumer().peer_filter(1)).unwrap();
        assert!(matches!(
            EventEndpoint::bind(name, &EventOptions::producer().process_id(2)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(EventEndpoint::bind(name, &EventOptions::producer().process_id(1)).is_ok());
    }

    #[test]
    fn requests_need_a_binding_and_the_right_role() {
        let name = "event-unit-unbound";
        let producer = EventEndpoint::bind(name, &EventOptions::producer()).unwrap();
        let consumer = EventEndpoint::bind(name, &EventOptions::consumer()).unwrap();
        assert!(matches!(
            producer.write_async(1, 0),
            Err(Error::InvalidDeviceRequest)
        ));
        assert!(matches!(consumer.read_async(0), Err(Error::InvalidDeviceRequest)));
        assert!(matches!(
            producer.read_async(0),
            Err(Error::InvalidParameter(_))
        ));

        let queue = CompletionQueue::new(0);
        producer.bind_queue(&queue, 0).unwrap();
        assert!(matches!(producer.bind_queue(&queue, 1), Err(Error::AlreadyBound)));
    }

    #[test]
    fn unused_channels_leave_the_table() {
        let name = "event-unit-cleanup";
        let consumer = EventEndpoint::bind(name, &EventOptions::consumer()).unwrap();
        assert!(CHANNELS.lock().contains_key(name));
        consumer.close().unwrap();
        assert!(!CHANNELS.lock().contains_key(name));
    }
}
