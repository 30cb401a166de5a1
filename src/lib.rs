//! # kxio
//!
//! An asynchronous I/O completion subsystem. Reads and writes against block files, as well as
//! single-slot notifications between event endpoints, are submitted without blocking, and their
//! results are all collected through [`CompletionQueue`]s, which bound how many consumer threads
//! may be processing completions at the same time.
//!
//! Block files can bypass the filesystem altogether: with [`AccessPolicy::DirectHardware`], file
//! offsets are translated through the physical extents of the file, and the transfers are done
//! directly on the underlying block device.
//!
//! Everything is owned by a [`Session`], and addressed through [`Handle`]s:
//!
//! ```no_run
//! # fn main() -> kxio::Result<()> {
//! use kxio::{CacheHints, CreateFile, CreateFlags, Disposition, FileSource, Access};
//!
//! let session = kxio::open_session()?;
//! let mut flags = CreateFlags::empty();
//! let file = session.create_file(
//!     CreateFile::Block {
//!         source: FileSource::Path("/var/tmp/data".into()),
//!         access: Access::ReadWrite,
//!         disposition: Disposition::OpenIf,
//!         hints: CacheHints::empty(),
//!     },
//!     &mut flags,
//! )?;
//! let queue = session.create_completion_queue(None, Some(file), 1, 0)?;
//!
//! let buffer = session.allocate_buffer(session.page_size())?;
//! session.read_async(file, buffer, 0, 42)?;
//! let packet = session.get_completion(queue, kxio::INFINITE)?;
//! assert_eq!(packet.token(), 42);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod buffer;
pub mod dispatch;
pub mod event;
pub mod handle;
pub mod linux;
pub mod queue;
pub mod session;
pub mod status;

pub use block::extent::{Extent, ExtentFlags, ExtentMap};
pub use block::{
    Access, AccessPolicy, BlockFile, BlockOpenOptions, Disposition, FileSource, OpenReport,
    TransferLimits, WritePolicy,
};
pub use buffer::IoBuffer;
pub use dispatch::Dispatcher;
pub use event::{EventEndpoint, EventOptions, EventRole, EVENT_SIZE};
pub use handle::{Handle, HandleState, HandleTable};
pub use queue::{CompletionKey, CompletionPacket, CompletionQueue, Payload, Token, Waiter};
pub use session::{
    open_session, CacheHints, CreateFile, CreateFlags, Session, SessionBuilder, INFINITE,
};
pub use status::{Error, ErrorClass, Result, Status};
