//! Asynchronous positional I/O on block files.
//!
//! A [`BlockFile`] wraps a regular file or a block device. With the [`AccessPolicy::DirectHardware`]
//! policy, transfers bypass the filesystem entirely: every request is translated through the
//! file's [`ExtentMap`] into physical offsets, which are then read or written on the backing
//! block device, opened with `O_DIRECT`. If the direct path cannot be set up (no extent map, no
//! access to the device node, or a platform without FIEMAP), the file falls back to
//! [`AccessPolicy::FilesystemOnly`], and the [`OpenReport`] says so.
//!
//! Transfers are always submitted without blocking. Validation and address translation happen
//! at submission time; the transfer itself runs on a dispatcher worker, which posts exactly one
//! completion packet through the file's completion queue binding.

pub mod extent;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, io};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::buffer::{is_aligned, IoBuffer};
use crate::dispatch::{Dispatcher, InFlightTracker, Job, Outcome};
use crate::linux;
use crate::queue::{Binding, CompletionKey, CompletionQueue, CompletionSink, Payload, Token};
use crate::status::{Error, Result};

use self::extent::{ExtentMap, Fragment};

/// The number of bytes zero-filled per write when growing a file.
const ZERO_FILL_CHUNK: usize = 1 << 20;

/// How transfers reach the storage.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AccessPolicy {
    /// Translate file offsets into device offsets, and transfer on the block device.
    DirectHardware,
    /// Transfer through the filesystem, with positional reads and writes on the file.
    FilesystemOnly,
}

/// Whether writes are synchronized to stable storage before completing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WritePolicy {
    /// Write-through: every write is durable once completed (`O_DSYNC`), so flushing is a no-op.
    Flush,
    /// Writes may linger in caches until flushed.
    NoFlush,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// What to do depending on whether the file exists.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Disposition {
    /// Open an existing file; fail with `NotFound` otherwise.
    Open,
    /// Create a new file; fail if it exists.
    Create,
    /// Open the file, creating it if necessary.
    OpenIf,
    /// Open an existing file and truncate it.
    Overwrite,
    /// Replace the file with a new, empty one.
    Supersede,
}

impl Disposition {
    fn modifies(self) -> bool {
        !matches!(self, Disposition::Open)
    }
}

/// Options for opening a [`BlockFile`].
#[derive(Clone, Debug)]
pub struct BlockOpenOptions {
    access: Access,
    disposition: Disposition,
    write_policy: WritePolicy,
    access_policy: AccessPolicy,
    unbuffered: bool,
}

impl BlockOpenOptions {
    /// Read-write, open-or-create, no write-through, direct hardware access requested.
    pub fn new() -> Self {
        Self {
            access: Access::ReadWrite,
            disposition: Disposition::OpenIf,
            write_policy: WritePolicy::NoFlush,
            access_policy: AccessPolicy::DirectHardware,
            unbuffered: false,
        }
    }
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }
    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }
    pub fn write_policy(mut self, write_policy: WritePolicy) -> Self {
        self.write_policy = write_policy;
        self
    }
    pub fn access_policy(mut self, access_policy: AccessPolicy) -> Self {
        self.access_policy = access_policy;
        self
    }
    /// Bypass the page cache for filesystem transfers too (`O_DIRECT` on the file itself). This
    /// imposes the page alignment rules of direct hardware access on every request.
    pub fn unbuffered(mut self, unbuffered: bool) -> Self {
        self.unbuffered = unbuffered;
        self
    }

    pub fn get_access(&self) -> Access {
        self.access
    }
    pub fn get_write_policy(&self) -> WritePolicy {
        self.write_policy
    }
    pub fn get_access_policy(&self) -> AccessPolicy {
        self.access_policy
    }

    fn open_path(&self, path: &Path) -> Result<File> {
        if self.disposition.modifies() && !self.access.writable() {
            return Err(Error::InvalidParameter(
                "creating or truncating a file requires write access",
            ));
        }
        if self.disposition == Disposition::Supersede {
            match fs::remove_file(path) {
                Ok(()) => (),
                Err(error) if error.kind() == io::ErrorKind::NotFound => (),
                Err(error) => return Err(Error::from_io_with_path(error, path)),
            }
        }

        let mut options = OpenOptions::new();
        options
            .read(self.access.readable())
            .write(self.access.writable());
        match self.disposition {
            Disposition::Open => (),
            Disposition::Create | Disposition::Supersede => {
                options.create_new(true);
            }
            Disposition::OpenIf => {
                options.create(true);
            }
            Disposition::Overwrite => {
                options.truncate(true);
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;

            let mut flags = 0;
            if self.write_policy == WritePolicy::Flush {
                flags |= libc::O_DSYNC;
            }
            #[cfg(target_os = "linux")]
            {
                if self.unbuffered {
                    flags |= libc::O_DIRECT;
                }
            }
            options.mode(0o700).custom_flags(flags);
        }

        options
            .open(path)
            .map_err(|error| Error::from_io_with_path(error, path))
    }
}

impl Default for BlockOpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a [`BlockFile`] comes from.
#[derive(Debug)]
pub enum FileSource {
    /// Open the file at this path according to the [`BlockOpenOptions`].
    Path(PathBuf),
    /// Adopt an already open file. Without a path, a block device cannot be reopened for
    /// unbuffered access, and files opened unbuffered cannot be grown.
    File { file: File, path: Option<PathBuf> },
}

impl From<PathBuf> for FileSource {
    fn from(path: PathBuf) -> Self {
        FileSource::Path(path)
    }
}
impl From<&Path> for FileSource {
    fn from(path: &Path) -> Self {
        FileSource::Path(path.to_owned())
    }
}
impl From<File> for FileSource {
    fn from(file: File) -> Self {
        FileSource::File { file, path: None }
    }
}

/// The policy a file ended up with, after an open or a policy change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenReport {
    pub access_policy: AccessPolicy,
    /// Direct hardware access was requested, but could not be set up.
    pub fell_back: bool,
    pub reason: Option<String>,
}

impl OpenReport {
    fn new(access_policy: AccessPolicy) -> Self {
        Self {
            access_policy,
            fell_back: false,
            reason: None,
        }
    }
    fn fall_back(&mut self, error: &Error) {
        self.access_policy = AccessPolicy::FilesystemOnly;
        self.fell_back = true;
        self.reason = Some(error.to_string());
    }
}

/// Limits applied to every request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferLimits {
    /// Alignment of offsets, lengths and buffers for unbuffered transfers.
    pub page_size: usize,
    /// The maximum number of buffers per scatter/gather request, and of physical fragments per
    /// direct hardware request.
    pub max_fragments: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            page_size: linux::page_size(),
            max_fragments: 256,
        }
    }
}

enum Backend {
    Filesystem,
    Direct {
        device: Arc<File>,
        extents: ExtentMap,

        // the file is the device itself, mapped one to one.
        identity: bool,
    },
}

impl Backend {
    fn policy(&self) -> AccessPolicy {
        match self {
            Backend::Filesystem => AccessPolicy::FilesystemOnly,
            Backend::Direct { .. } => AccessPolicy::DirectHardware,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Filesystem => f.write_str("Filesystem"),
            Backend::Direct {
                extents, identity, ..
            } => f
                .debug_struct("Direct")
                .field("extents", extents)
                .field("identity", identity)
                .finish(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    Read,
    Write,
}

struct Run {
    buffer: usize,
    fragment: Fragment,
}

// a validated, translated request, ready to run on a worker.
enum Plan {
    Filesystem { file: Arc<File>, offset: u64 },
    Direct { device: Arc<File>, runs: Vec<Run> },
}

/// A file or block device open for asynchronous transfers.
pub struct BlockFile {
    path: Option<PathBuf>,
    file: Arc<File>,
    options: BlockOpenOptions,
    limits: TransferLimits,

    // swapped as a whole on refresh or policy change; requests keep the version they were
    // planned with.
    backend: RwLock<Arc<Backend>>,

    binding: OnceCell<Binding>,
    in_flight: Arc<InFlightTracker>,
}

impl BlockFile {
    /// Open a file, setting up direct hardware access if requested and possible.
    pub fn open(
        source: FileSource,
        options: &BlockOpenOptions,
        limits: TransferLimits,
    ) -> Result<(Arc<Self>, OpenReport)> {
        let (file, path) = match source {
            FileSource::Path(path) => (options.open_path(&path)?, Some(path)),
            FileSource::File { file, path } => (file, path),
        };

        let mut report = OpenReport::new(options.access_policy);
        let backend = match options.access_policy {
            AccessPolicy::FilesystemOnly => Backend::Filesystem,
            AccessPolicy::DirectHardware => {
                match direct_backend(&file, path.as_deref(), options) {
                    Ok(backend) => backend,
                    Err(error) => {
                        log::info!(
                            "Direct hardware access unavailable for {}, falling back to the filesystem: {}",
                            display_path(path.as_deref()),
                            error
                        );
                        report.fall_back(&error);
                        Backend::Filesystem
                    }
                }
            }
        };
        log::debug!(
            "Opened block file {} with {:?}",
            display_path(path.as_deref()),
            backend
        );

        let file = Self::from_parts(path, file, options.clone(), limits, backend);
        Ok((file, report))
    }

    fn from_parts(
        path: Option<PathBuf>,
        file: File,
        options: BlockOpenOptions,
        limits: TransferLimits,
        backend: Backend,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            file: Arc::new(file),
            options,
            limits,
            backend: RwLock::new(Arc::new(backend)),
            binding: OnceCell::new(),
            in_flight: InFlightTracker::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    pub fn access_policy(&self) -> AccessPolicy {
        self.backend.read().policy()
    }
    pub fn write_policy(&self) -> WritePolicy {
        self.options.write_policy
    }
    pub fn limits(&self) -> TransferLimits {
        self.limits
    }
    /// A snapshot of the current extent map, if the file is in direct hardware mode.
    pub fn extent_map(&self) -> Option<ExtentMap> {
        match &**self.backend.read() {
            Backend::Direct { extents, .. } => Some(extents.clone()),
            Backend::Filesystem => None,
        }
    }
    /// The number of requests accepted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }

    /// Associate the file with a completion queue. This can only be done once.
    pub fn bind(&self, queue: &Arc<CompletionQueue>, key: CompletionKey) -> Result<()> {
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
    /// The queue and key completions are posted with, if bound.
    pub fn binding(&self) -> Option<(Arc<CompletionQueue>, CompletionKey)> {
        self.binding
            .get()
            .map(|binding| (Arc::clone(binding.queue()), binding.key()))
    }

    fn sink(&self, token: Token) -> Result<CompletionSink> {
        self.binding
            .get()
            .map(|binding| binding.sink(token))
            .ok_or(Error::InvalidDeviceRequest)
    }

    /// Read `buffer.len()` bytes at `offset`. The buffer is returned in the packet's payload.
    pub fn read_async(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        buffer: IoBuffer,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.submit(dispatcher, Direction::Read, vec![buffer], false, offset, token)
    }
    /// Write all of `buffer` at `offset`. The buffer is returned in the packet's payload.
    pub fn write_async(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        buffer: IoBuffer,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.submit(dispatcher, Direction::Write, vec![buffer], false, offset, token)
    }
    /// Read into each buffer in turn, starting at `offset`, as one request.
    pub fn read_scatter_async(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        buffers: Vec<IoBuffer>,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.submit(dispatcher, Direction::Read, buffers, true, offset, token)
    }
    /// Write each buffer in turn, starting at `offset`, as one request.
    pub fn write_gather_async(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        buffers: Vec<IoBuffer>,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        self.submit(dispatcher, Direction::Write, buffers, true, offset, token)
    }

    fn submit(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        direction: Direction,
        buffers: Vec<IoBuffer>,
        scattered: bool,
        offset: u64,
        token: Token,
    ) -> Result<()> {
        let sink = self.sink(token)?;
        let plan = self.plan(&buffers, offset)?;
        let in_flight = self.in_flight.begin()?;

        log::trace!(
            "Submitting {:?} of {} buffer(s) at offset {} (token {:#x})",
            direction,
            buffers.len(),
            offset,
            token
        );
        dispatcher.submit(Job::with_buffers(sink, in_flight, buffers, move |buffers| {
            execute(direction, plan, buffers, scattered)
        }))
    }

    fn plan(&self, buffers: &[IoBuffer], offset: u64) -> Result<Plan> {
        let limits = self.limits;
        if buffers.is_empty() || buffers.len() > limits.max_fragments {
            return Err(Error::InvalidParameter("unsupported number of buffers"));
        }
        let total = buffers
            .iter()
            .try_fold(0u64, |total, buffer| {
                if buffer.is_empty() {
                    None
                } else {
                    total.checked_add(buffer.len() as u64)
                }
            })
            .ok_or(Error::InvalidParameter("empty buffer in request"))?;
        offset
            .checked_add(total)
            .ok_or(Error::InvalidParameter("request extends past the largest offset"))?;

        let backend = Arc::clone(&*self.backend.read());
        if self.options.unbuffered || backend.policy() == AccessPolicy::DirectHardware {
            let page_size = limits.page_size;
            if !is_aligned(offset, page_size) {
                return Err(Error::InvalidParameter("offset is not page aligned"));
            }
            for buffer in buffers {
                if !is_aligned(buffer.len() as u64, page_size)
                    || !is_aligned(buffer.as_ptr() as u64, page_size)
                {
                    return Err(Error::InvalidParameter("buffer is not page aligned"));
                }
            }
        }

        match &*backend {
            Backend::Filesystem => Ok(Plan::Filesystem {
                file: Arc::clone(&self.file),
                offset,
            }),
            Backend::Direct {
                device, extents, ..
            } => {
                let mut runs = Vec::new();
                let mut logical = offset;
                for (index, buffer) in buffers.iter().enumerate() {
                    for fragment in extents.split(logical, buffer.len())? {
                        runs.push(Run {
                            buffer: index,
                            fragment,
                        });
                    }
                    if runs.len() > limits.max_fragments {
                        return Err(Error::InvalidParameter(
                            "request maps to too many physical fragments",
                        ));
                    }
                    logical += buffer.len() as u64;
                }
                Ok(Plan::Direct {
                    device: Arc::clone(device),
                    runs,
                })
            }
        }
    }

    /// Make previous writes durable. Under write-through this completes immediately.
    pub fn flush_async(self: &Arc<Self>, dispatcher: &Dispatcher, token: Token) -> Result<()> {
        let sink = self.sink(token)?;
        let in_flight = self.in_flight.begin()?;

        if self.options.write_policy == WritePolicy::Flush {
            sink.complete(Ok(0), None);
            drop(in_flight);
            return Ok(());
        }

        let backend = Arc::clone(&*self.backend.read());
        let file = Arc::clone(&self.file);
        dispatcher.submit(Job::new(sink, in_flight, move || {
            let result = match &*backend {
                Backend::Direct { device, .. } => device.sync_data(),
                Backend::Filesystem => file.sync_data(),
            };
            match result {
                Ok(()) => Outcome::new(0, None, None),
                Err(error) => Outcome::new(0, Some(error.into()), None),
            }
        }))
    }

    /// Re-derive the extent map, after the file has been grown or rewritten through other
    /// means. Does nothing outside direct hardware mode.
    pub fn refresh_extents(&self) -> Result<()> {
        let current = Arc::clone(&*self.backend.read());
        let refreshed = match &*current {
            Backend::Filesystem => return Ok(()),
            Backend::Direct {
                device, identity, ..
            } => {
                let extents = if *identity {
                    ExtentMap::identity(linux::device_len(device)?)
                } else {
                    derive_extents(&self.file)?
                };
                Backend::Direct {
                    device: Arc::clone(device),
                    extents,
                    identity: *identity,
                }
            }
        };
        log::debug!(
            "Refreshed extents of {}: {:?}",
            display_path(self.path()),
            refreshed
        );
        *self.backend.write() = Arc::new(refreshed);
        Ok(())
    }

    /// Grow the file to `len` bytes, zero-filling the new region through the filesystem so that
    /// it is allocated and reads back as zeros on the device, and then refresh the extents.
    /// Shrinking is not supported; a smaller `len` leaves the file as it is.
    pub fn set_valid_data_length(&self, len: u64) -> Result<()> {
        if !self.options.access.writable() {
            return Err(Error::InvalidParameter("file is not open for writing"));
        }
        let current = self.file.metadata()?.len();

        if len > current {
            let filler = self.zero_fill_handle()?;
            let zeros = vec![0u8; ZERO_FILL_CHUNK];
            let mut offset = current;
            while offset < len {
                let chunk = (len - offset).min(ZERO_FILL_CHUNK as u64) as usize;
                linux::write_full_at(&filler, &zeros[..chunk], offset)?;
                offset += chunk as u64;
            }
            filler.sync_all()?;
            log::debug!(
                "Extended {} from {} to {} bytes",
                display_path(self.path()),
                current,
                len
            );
        }
        self.refresh_extents()
    }

    fn zero_fill_handle(&self) -> Result<Arc<File>> {
        if !self.options.unbuffered {
            return Ok(Arc::clone(&self.file));
        }
        // the file itself only accepts aligned transfers.
        let path = self.path.as_deref().ok_or(Error::NotSupported(
            "growing an unbuffered file requires its path",
        ))?;
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|error| Error::from_io_with_path(error, path))?;
        Ok(Arc::new(file))
    }

    /// Switch to another access policy, keeping the completion binding. Switching to direct
    /// hardware access may fall back, as when opening.
    pub fn set_access_policy(&self, policy: AccessPolicy) -> Result<OpenReport> {
        let mut report = OpenReport::new(policy);
        let backend = match policy {
            AccessPolicy::FilesystemOnly => Backend::Filesystem,
            AccessPolicy::DirectHardware => {
                match direct_backend(&self.file, self.path(), &self.options) {
                    Ok(backend) => backend,
                    Err(error) => {
                        log::info!(
                            "Direct hardware access unavailable for {}: {}",
                            display_path(self.path()),
                            error
                        );
                        report.fall_back(&error);
                        Backend::Filesystem
                    }
                }
            }
        };
        *self.backend.write() = Arc::new(backend);
        Ok(report)
    }

    /// Refuse further requests and block until the in-flight ones have completed. The binding
    /// stays in place until the file is dropped.
    pub fn close(&self) {
        self.in_flight.close_and_wait();
        log::debug!("Closed block file {}", display_path(self.path()));
    }
}

impl fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("backend", &*self.backend.read())
            .field("write_policy", &self.options.write_policy)
            .field("binding", &self.binding.get())
            .field("in_flight", &self.in_flight.in_flight())
            .finish()
    }
}

fn display_path(path: Option<&Path>) -> std::path::Display<'_> {
    path.unwrap_or_else(|| Path::new("<descriptor>")).display()
}

fn derive_extents(file: &File) -> Result<ExtentMap> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(ExtentMap::empty());
    }
    #[cfg(target_os = "linux")]
    {
        ExtentMap::from_reported(linux::extents(file, len)?)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::NotSupported("extent maps require FIEMAP"))
    }
}

#[cfg(target_os = "linux")]
fn direct_backend(file: &File, path: Option<&Path>, options: &BlockOpenOptions) -> Result<Backend> {
    let writable = options.access.writable();
    let write_through = options.write_policy == WritePolicy::Flush;

    if linux::is_block_device(file)? {
        let device = match path {
            Some(path) => linux::open_device(path, writable, write_through)
                .map_err(|error| Error::from_io_with_path(error, path))?,
            None => file.try_clone()?,
        };
        let extents = ExtentMap::identity(linux::device_len(&device)?);
        return Ok(Backend::Direct {
            device: Arc::new(device),
            extents,
            identity: true,
        });
    }

    let extents = derive_extents(file)?;
    let device_path = linux::backing_device(file)?;
    let device = linux::open_device(&device_path, writable, write_through)
        .map_err(|error| Error::from_io_with_path(error, &device_path))?;
    log::debug!(
        "Mapped {} onto {} with {} extent(s)",
        display_path(path),
        device_path.display(),
        extents.len()
    );
    Ok(Backend::Direct {
        device: Arc::new(device),
        extents,
        identity: false,
    })
}
#[cfg(not(target_os = "linux"))]
fn direct_backend(_: &File, _: Option<&Path>, _: &BlockOpenOptions) -> Result<Backend> {
    Err(Error::NotSupported("direct hardware access requires Linux"))
}

fn execute(direction: Direction, plan: Plan, mut buffers: Vec<IoBuffer>, scattered: bool) -> Outcome {
    let (bytes, error) = match plan {
        Plan::Filesystem { file, offset } => {
            match transfer_filesystem(&file, direction, &mut buffers, offset) {
                Ok(bytes) => (bytes, None),
                Err(error) => (0, Some(Error::from(error))),
            }
        }
        Plan::Direct { device, runs } => {
            // fragments are independent; report the first failure and everything that moved.
            let mut bytes = 0;
            let mut first_error = None;
            for Run { buffer, fragment } in runs {
                let range = fragment.offset..fragment.offset + fragment.len;
                let result = match direction {
                    Direction::Read => {
                        linux::read_full_at(&device, &mut buffers[buffer][range], fragment.physical)
                    }
                    Direction::Write => {
                        linux::write_full_at(&device, &buffers[buffer][range], fragment.physical)
                    }
                };
                match result {
                    Ok(n) => bytes += n,
                    Err(error) => {
                        log::debug!(
                            "Fragment at device offset {} failed: {}",
                            fragment.physical,
                            error
                        );
                        if first_error.is_none() {
                            first_error = Some(Error::from(error));
                        }
                    }
                }
            }
            (bytes, first_error)
        }
    };

    let payload = if scattered {
        Some(Payload::Buffers(buffers))
    } else {
        buffers.pop().map(Payload::Buffer)
    };
    Outcome::new(bytes, error, payload)
}

fn transfer_filesystem(
    file: &File,
    direction: Direction,
    buffers: &mut [IoBuffer],
    offset: u64,
) -> io::Result<usize> {
    match (direction, buffers) {
        (Direction::Read, [buffer]) => linux::read_full_at(file, buffer, offset),
        (Direction::Write, [buffer]) => linux::write_full_at(file, buffer, offset),
        (Direction::Read, buffers) => {
            let mut slices = buffers
                .iter_mut()
                .map(|buffer| buffer.as_mut_slice())
                .collect::<Vec<_>>();
            linux::read_vectored_full_at(file, &mut slices, offset)
        }
        (Direction::Write, buffers) => {
            let slices = buffers
                .iter()
                .map(|buffer| buffer.as_slice())
                .collect::<Vec<_>>();
            linux::write_vectored_full_at(file, &slices, offset)
        }
    }
}
