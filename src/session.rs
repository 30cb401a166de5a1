//! Sessions, which own every completion queue, block file and event endpoint created through
//! them, along with the dispatcher that runs their requests.
//!
//! All objects are addressed through [`Handle`]s. Requests resolve the handle to a counted
//! reference for their duration, so closing a handle never frees an object that is still
//! being used; closing the session closes every handle it still owns.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::{fmt, thread};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::block::{
    Access, AccessPolicy, BlockFile, BlockOpenOptions, Disposition, FileSource, OpenReport,
    TransferLimits, WritePolicy,
};
use crate::buffer::IoBuffer;
use crate::dispatch::Dispatcher;
use crate::event::{EventEndpoint, EventOptions};
use crate::handle::{Entry, Handle, HandleTable};
use crate::linux;
use crate::queue::{CompletionKey, CompletionPacket, CompletionQueue, Token, Waiter};
use crate::status::{Error, Result};

static LAST_SESSION_ID: AtomicUsize = AtomicUsize::new(0);

static SHARED_SESSION: Lazy<Mutex<Weak<Session>>> = Lazy::new(|| Mutex::new(Weak::new()));

thread_local! {
    // the implicit waiters of `get_completion`, per session and queue.
    static WAITERS: RefCell<HashMap<(usize, Handle), Waiter>> = RefCell::new(HashMap::new());
}

/// A `timeout_ms` that waits forever.
pub const INFINITE: u32 = u32::MAX;

bitflags::bitflags! {
    /// Flags passed to, and returned from, [`Session::create_file`].
    pub struct CreateFlags: u32 {
        /// On input, do not attempt direct hardware access. On output, set whenever the file
        /// ended up going through the filesystem.
        const USE_FILESYSTEM_ONLY = 0x0000_0001;
        /// Output only: direct hardware access was requested but could not be set up.
        const FELL_BACK = 0x0000_0002;
    }
}

bitflags::bitflags! {
    /// Caching behavior requested for a block file.
    pub struct CacheHints: u32 {
        /// Writes are durable once completed.
        const WRITE_THROUGH = 0x0000_0001;
        /// Filesystem transfers bypass the page cache, and must be page aligned.
        const NO_BUFFERING = 0x0000_0002;
    }
}

/// What [`Session::create_file`] should create.
#[derive(Debug)]
pub enum CreateFile {
    Block {
        source: FileSource,
        access: Access,
        disposition: Disposition,
        hints: CacheHints,
    },
    Event {
        name: String,
        options: EventOptions,
    },
}

pub(crate) enum Object {
    Queue(Arc<CompletionQueue>),
    Block(Arc<BlockFile>),
    Event(Arc<EventEndpoint>),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Queue(_) => "completion queue",
            Object::Block(_) => "block file",
            Object::Event(_) => "event endpoint",
        }
    }
}

/// A builder for [`Session`]s.
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    worker_threads: Option<usize>,
    submission_capacity: usize,
    max_fragments: usize,
}

impl SessionBuilder {
    /// Create a builder with the default settings: one worker per CPU, room for 4096 queued
    /// requests, and up to 256 fragments per scatter/gather request.
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            submission_capacity: 4096,
            max_fragments: 256,
        }
    }
    /// Set the number of dispatcher worker threads.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = Some(worker_threads);
        self
    }
    /// Set how many accepted requests may wait for a worker before submissions fail with
    /// [`Error::QueueFull`].
    pub fn with_submission_capacity(mut self, capacity: usize) -> Self {
        self.submission_capacity = capacity;
        self
    }
    /// Set the maximum number of buffers per scatter/gather request, which also bounds the
    /// physical fragments of a direct hardware request.
    ///
    /// # Panics
    ///
    /// This will panic if `max_fragments` is zero.
    pub fn with_max_fragments(mut self, max_fragments: usize) -> Self {
        assert_ne!(max_fragments, 0, "a request needs at least one fragment");
        self.max_fragments = max_fragments;
        self
    }

    /// Start the dispatcher and open the session.
    pub fn open(self) -> Result<Arc<Session>> {
        let worker_threads = self.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4)
        });
        let limits = TransferLimits {
            page_size: linux::page_size(),
            max_fragments: self.max_fragments,
        };
        let dispatcher = Dispatcher::new(worker_threads, self.submission_capacity)?;
        let id = LAST_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Opened session {} (page size {}, {} worker(s))",
            id,
            limits.page_size,
            worker_threads
        );
        Ok(Arc::new(Session {
            id,
            limits,
            table: HandleTable::new(),
            dispatcher,
            closed: AtomicBool::new(false),
        }))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Return the process-wide shared session, opening it if there is none (or it was closed).
pub fn open_session() -> Result<Arc<Session>> {
    let mut shared = SHARED_SESSION.lock();
    if let Some(session) = shared.upgrade().filter(|session| !session.is_closed()) {
        return Ok(session);
    }
    let session = SessionBuilder::new().open()?;
    *shared = Arc::downgrade(&session);
    Ok(session)
}

/// The owner of every handle.
pub struct Session {
    id: usize,
    limits: TransferLimits,
    table: HandleTable<Object>,
    dispatcher: Dispatcher,
    closed: AtomicBool,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> usize {
        self.id
    }
    /// The page size used to validate unbuffered transfers, computed once per session.
    pub fn page_size(&self) -> usize {
        self.limits.page_size
    }
    pub fn limits(&self) -> TransferLimits {
        self.limits
    }
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
    /// The number of open handles.
    pub fn outstanding_handles(&self) -> usize {
        self.table.len()
    }
    /// The number of handle slots allocated so far.
    pub fn slot_capacity(&self) -> usize {
        self.table.slot_capacity()
    }
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocate a page-aligned buffer suitable for any transfer of this session.
    pub fn allocate_buffer(&self, len: usize) -> Result<IoBuffer> {
        IoBuffer::new(len, self.limits.page_size)
    }

    fn resolve(&self, handle: Handle) -> Result<Arc<Entry<Object>>> {
        self.table.resolve(handle)
    }
    /// The completion queue behind `handle`.
    pub fn completion_queue(&self, handle: Handle) -> Result<Arc<CompletionQueue>> {
        match self.resolve(handle)?.object() {
            Object::Queue(queue) => Ok(Arc::clone(queue)),
            _ => Err(Error::InvalidHandle),
        }
    }
    /// The block file behind `handle`.
    pub fn block_file(&self, handle: Handle) -> Result<Arc<BlockFile>> {
        match self.resolve(handle)?.object() {
            Object::Block(file) => Ok(Arc::clone(file)),
            _ => Err(Error::InvalidHandle),
        }
    }
    /// The event endpoint behind `handle`.
    pub fn event_endpoint(&self, handle: Handle) -> Result<Arc<EventEndpoint>> {
        match self.resolve(handle)?.object() {
            Object::Event(endpoint) => Ok(Arc::clone(endpoint)),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Create a completion queue, or reuse `existing`, and optionally bind `file` to it with
    /// `key`. If binding fails, a newly created queue is closed again.
    pub fn create_completion_queue(
        &self,
        existing: Option<Handle>,
        file: Option<Handle>,
        key: CompletionKey,
        max_concurrency: usize,
    ) -> Result<Handle> {
        let (handle, queue, created) = match existing {
            Some(handle) => (handle, self.completion_queue(handle)?, false),
            None => {
                let queue = CompletionQueue::new(max_concurrency);
                let handle = self.table.insert(Object::Queue(Arc::clone(&queue)))?;
                (handle, queue, true)
            }
        };

        if let Some(file) = file {
            if let Err(error) = self.bind(file, &queue, key) {
                if created {
                    let _ = self.close_handle(handle);
                }
                return Err(error);
            }
        }
        Ok(handle)
    }

    fn bind(&self, file: Handle, queue: &Arc<CompletionQueue>, key: CompletionKey) -> Result<()> {
        match self.resolve(file)?.object() {
            Object::Block(file) => file.bind(queue, key),
            Object::Event(endpoint) => endpoint.bind_queue(queue, key),
            Object::Queue(_) => Err(Error::InvalidParameter(
                "a completion queue cannot be bound to another queue",
            )),
        }
    }

    pub fn post_completion(
        &self,
        queue: Handle,
        bytes: usize,
        key: CompletionKey,
        token: Token,
    ) -> Result<()> {
        self.completion_queue(queue)?.post_completion(bytes, key, token)
    }

    /// Wait for a packet on `queue` as the calling thread, registering it as a waiter on first
    /// use. A `timeout_ms` of [`INFINITE`] never times out.
    pub fn get_completion(&self, queue: Handle, timeout_ms: u32) -> Result<CompletionPacket> {
        let timeout = if timeout_ms == INFINITE {
            None
        } else {
            Some(Duration::from_millis(u64::from(timeout_ms)))
        };
        let key = (self.id, queue);
        prune_waiters(|_, waiter| waiter.queue().is_closed());

        let registered = WAITERS.with(|waiters| waiters.borrow_mut().remove(&key));
        let mut waiter = match registered {
            Some(waiter) => waiter,
            None => self.completion_queue(queue)?.register_waiter()?,
        };

        let result = waiter.wait(timeout);
        match result {
            // the queue is gone; so is the registration.
            Err(Error::Abandoned) | Err(Error::InvalidHandle) => drop(waiter),
            _ => WAITERS.with(|waiters| {
                waiters.borrow_mut().insert(key, waiter);
            }),
        }
        result
    }

    /// Register the calling thread as a waiter of `queue` ahead of its first
    /// [`get_completion`](Self::get_completion). Registering twice is harmless.
    pub fn register_waiter_thread(&self, queue: Handle) -> Result<()> {
        let key = (self.id, queue);
        prune_waiters(|_, waiter| waiter.queue().is_closed());
        if WAITERS.with(|waiters| waiters.borrow().contains_key(&key)) {
            return Ok(());
        }
        let waiter = self.completion_queue(queue)?.register_waiter()?;
        WAITERS.with(|waiters| {
            waiters.borrow_mut().insert(key, waiter);
        });
        Ok(())
    }
    /// Remove the calling thread's registration with `queue`, releasing its active slot.
    pub fn unregister_waiter_thread(&self, queue: Handle) -> Result<()> {
        let key = (self.id, queue);
        match WAITERS.with(|waiters| waiters.borrow_mut().remove(&key)) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidParameter("thread is not registered with the queue")),
        }
    }

    /// Open a block file or bind an event endpoint. For block files, `flags` selects the
    /// filesystem-only policy on input, and reports the policy in effect on output.
    pub fn create_file(&self, request: CreateFile, flags: &mut CreateFlags) -> Result<Handle> {
        match request {
            CreateFile::Block {
                source,
                access,
                disposition,
                hints,
            } => {
                let access_policy = if flags.contains(CreateFlags::USE_FILESYSTEM_ONLY) {
                    AccessPolicy::FilesystemOnly
                } else {
                    AccessPolicy::DirectHardware
                };
                let write_policy = if hints.contains(CacheHints::WRITE_THROUGH) {
                    WritePolicy::Flush
                } else {
                    WritePolicy::NoFlush
                };
                let options = BlockOpenOptions::new()
                    .access(access)
                    .disposition(disposition)
                    .write_policy(write_policy)
                    .access_policy(access_policy)
                    .unbuffered(hints.contains(CacheHints::NO_BUFFERING));

                let (handle, report) = self.open_block_file(source, &options)?;
                flags.set(
                    CreateFlags::USE_FILESYSTEM_ONLY,
                    report.access_policy == AccessPolicy::FilesystemOnly,
                );
                flags.set(CreateFlags::FELL_BACK, report.fell_back);
                Ok(handle)
            }
            CreateFile::Event { name, options } => self.open_event(&name, &options),
        }
    }

    /// Open a block file with explicit options.
    pub fn open_block_file(
        &self,
        source: FileSource,
        options: &BlockOpenOptions,
    ) -> Result<(Handle, OpenReport)> {
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        let (file, report) = BlockFile::open(source, options, self.limits)?;
        match self.table.insert(Object::Block(Arc::clone(&file))) {
            Ok(handle) => Ok((handle, report)),
            Err(error) => {
                file.close();
                Err(error)
            }
        }
    }

    /// Bind an event endpoint.
    pub fn open_event(&self, name: &str, options: &EventOptions) -> Result<Handle> {
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        let endpoint = EventEndpoint::bind(name, options)?;
        match self.table.insert(Object::Event(Arc::clone(&endpoint))) {
            Ok(handle) => Ok(handle),
            Err(error) => {
                let _ = endpoint.close();
                Err(error)
            }
        }
    }

    pub fn read_async(&self, file: Handle, buffer: IoBuffer, offset: u64, token: Token) -> Result<()> {
        self.block_file(file)?
            .read_async(&self.dispatcher, buffer, offset, token)
    }
    pub fn write_async(&self, file: Handle, buffer: IoBuffer, offset: u64, token: Token) -> Result<()> {
        self.block_file(file)?
            .write_async(&self.dispatcher, buffer, offset, token)
    }
    pub fn read_scatter_async(
        &self,
        file: Handle,
        buffers: Vec<IoBuffer>,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.block_file(file)?
            .read_scatter_async(&self.dispatcher, buffers, offset, token)
    }
    pub fn write_gather_async(
        &self,
        file: Handle,
        buffers: Vec<IoBuffer>,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.block_file(file)?
            .write_gather_async(&self.dispatcher, buffers, offset, token)
    }
    pub fn flush_async(&self, file: Handle, token: Token) -> Result<()> {
        self.block_file(file)?.flush_async(&self.dispatcher, token)
    }

    pub fn refresh_extents(&self, file: Handle) -> Result<()> {
        self.block_file(file)?.refresh_extents()
    }
    pub fn set_valid_data_length(&self, file: Handle, len: u64) -> Result<()> {
        self.block_file(file)?.set_valid_data_length(len)
    }
    pub fn set_access_policy(&self, file: Handle, policy: AccessPolicy) -> Result<OpenReport> {
        self.block_file(file)?.set_access_policy(policy)
    }

    pub fn event_write_async(&self, endpoint: Handle, value: u64, token: Token) -> Result<()> {
        self.event_endpoint(endpoint)?.write_async(value, token)
    }
    pub fn event_read_async(&self, endpoint: Handle, token: Token) -> Result<()> {
        self.event_endpoint(endpoint)?.read_async(token)
    }

    /// Close a block file or event endpoint. For block files this waits for in-flight requests.
    pub fn close_file(&self, file: Handle) -> Result<()> {
        if let Object::Queue(_) = self.resolve(file)?.object() {
            return Err(Error::InvalidParameter("handle is a completion queue"));
        }
        self.close_handle(file)
    }

    /// Close any handle. Closing a completion queue wakes its blocked waiters with `Abandoned`.
    pub fn close_handle(&self, handle: Handle) -> Result<()> {
        let entry = self.table.close(handle)?;
        log::trace!("Closing {} {:?}", entry.object().kind(), handle);
        teardown(entry.object());
        entry.mark_closed();
        prune_waiters(|&(session, registered), _| session == self.id && registered == handle);
        Ok(())
    }

    /// Close the session: every handle is closed, files and endpoints before queues, and the
    /// dispatcher is drained and stopped. Closing twice fails with `InvalidHandle`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidHandle);
        }
        let (queues, others): (Vec<_>, Vec<_>) = self
            .table
            .close_all()
            .into_iter()
            .partition(|entry| matches!(entry.object(), Object::Queue(_)));
        log::debug!(
            "Closing session {} with {} handle(s) still open",
            self.id,
            queues.len() + others.len()
        );

        for entry in others.iter().chain(queues.iter()) {
            teardown(entry.object());
            entry.mark_closed();
        }
        self.dispatcher.shutdown();
        let id = self.id;
        prune_waiters(|&(session, _), _| session == id);
        Ok(())
    }
}

// Drop the calling thread's implicit waiters matching `stale`. Other threads prune their own on
// their next `get_completion` or `register_waiter_thread`.
fn prune_waiters<F>(mut stale: F)
where
    F: FnMut(&(usize, Handle), &Waiter) -> bool,
{
    // the thread-local is gone already when a session is dropped during thread exit.
    let _ = WAITERS.try_with(|waiters| {
        waiters
            .borrow_mut()
            .retain(|key, waiter| !stale(key, waiter));
    });
}

fn teardown(object: &Object) {
    match object {
        Object::Queue(queue) => {
            if queue.close().is_err() {
                log::debug!("Completion queue was already closed");
            }
        }
        Object::Block(file) => file.close(),
        Object::Event(endpoint) => {
            let _ = endpoint.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("limits", &self.limits)
            .field("handles", &self.table)
            .field("dispatcher", &self.dispatcher)
            .field("closed", &self.is_closed())
            .finish()
    }
}
