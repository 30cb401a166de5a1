//! Page-aligned transfer buffers.
//!
//! Direct hardware transfers go straight to the block device with `O_DIRECT`, which requires the
//! memory side to be aligned as well. An [`IoBuffer`] is always allocated at a page boundary, and
//! its capacity is rounded up to whole pages, so the same buffer can be used with either access
//! policy.
//!
//! Buffers are moved into a request when it is submitted, and handed back through the
//! completion packet's payload once the request has completed.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::{fmt, ops, slice};

use crate::status::{Error, Result};

/// An owned, zero-initialized, page-aligned byte buffer.
pub struct IoBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation, like a `Box<[u8]>`.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// Allocate a buffer of `len` bytes, aligned to `page_size`.
    ///
    /// Fails with `InsufficientResources` if the allocation fails, and with `InvalidParameter`
    /// if `page_size` is not a power of two.
    pub fn new(len: usize, page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidParameter("page size must be a power of two"));
        }
        let capacity = round_up(len.max(1), page_size)
            .ok_or(Error::InsufficientResources("buffer size overflows"))?;
        let layout = Layout::from_size_align(capacity, page_size)
            .map_err(|_| Error::InvalidParameter("invalid buffer layout"))?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::InsufficientResources("buffer allocation"))?;

        Ok(Self { ptr, len, layout })
    }
    /// Allocate a buffer spanning exactly `pages` pages.
    pub fn with_pages(pages: usize, page_size: usize) -> Result<Self> {
        let len = pages
            .checked_mul(page_size)
            .ok_or(Error::InsufficientResources("buffer size overflows"))?;
        Self::new(len, page_size)
    }
    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8], page_size: usize) -> Result<Self> {
        let mut buffer = Self::new(bytes.len(), page_size)?;
        buffer.copy_from_slice(bytes);
        Ok(buffer)
    }

    /// The number of usable bytes.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// The number of bytes that were actually allocated (a multiple of the alignment).
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }
    /// The alignment of the allocation, which is the page size it was created with.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
    /// Change the usable length, within the allocated capacity. The bytes that become visible
    /// keep their previous contents (zero if never written).
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(Error::InvalidParameter("length exceeds buffer capacity"));
        }
        self.len = len;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl ops::Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}
impl ops::DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

pub(crate) fn round_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

pub(crate) fn is_aligned(value: u64, alignment: usize) -> bool {
    value & (alignment as u64 - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned() {
        let buffer = IoBuffer::new(100, 4096).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 4096);
        assert_eq!(buffer.as_ptr() as usize % 4096, 0);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn with_pages() {
        let buffer = IoBuffer::with_pages(3, 4096).unwrap();
        assert_eq!(buffer.len(), 3 * 4096);
        assert_eq!(buffer.capacity(), 3 * 4096);
    }

    #[test]
    fn set_len_is_bounded_by_capacity() {
        let mut buffer = IoBuffer::from_slice(b"abc", 4096).unwrap();
        assert_eq!(&buffer[..], b"abc");
        buffer.set_len(4096).unwrap();
        assert_eq!(&buffer[..3], b"abc");
        assert!(buffer.set_len(4097).is_err());
    }

    #[test]
    fn rejects_bad_page_size() {
        assert!(matches!(
            IoBuffer::new(10, 3000),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(usize::MAX, 4096), None);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8191, 4096));
    }
}
