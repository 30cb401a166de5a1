//! Platform support: the page size, positional transfer loops, and on Linux, extent discovery
//! through `FS_IOC_FIEMAP` and the lookup of the block device backing a file.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::block::extent::{Extent, ExtentFlags};

/// The size of a memory page, as reported by `sysconf(_SC_PAGESIZE)`.
#[cfg(unix)]
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        log::warn!("sysconf(_SC_PAGESIZE) failed, assuming 4096 byte pages");
        4096
    } else {
        size as usize
    }
}
#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Read into `buf` at `offset` until it is full, retrying on `EINTR`. Stops early at end of
/// file, returning the number of bytes that were read.
#[cfg(unix)]
pub fn read_full_at(file: &File, mut buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while !buf.is_empty() {
        match file.read_at(buf, offset + done as u64) {
            Ok(0) => break,
            Ok(n) => {
                done += n;
                buf = &mut buf[n..];
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}

/// Write all of `buf` at `offset`, retrying on `EINTR`. A write that makes no progress fails
/// with `WriteZero`.
#[cfg(unix)]
pub fn write_full_at(file: &File, mut buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while !buf.is_empty() {
        match file.write_at(buf, offset + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positional write made no progress",
                ))
            }
            Ok(n) => {
                done += n;
                buf = &buf[n..];
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}

/// Scatter-read into `bufs` starting at `offset`, with the same retry and end-of-file rules as
/// [`read_full_at`].
#[cfg(target_os = "linux")]
pub fn read_vectored_full_at(file: &File, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let total: usize = bufs.iter().map(|buf| buf.len()).sum();
    let mut done = 0;
    while done < total {
        let iovecs = remaining_iovecs(bufs.iter().map(|buf| (buf.as_ptr(), buf.len())), done);
        let ret = unsafe {
            libc::preadv(
                file.as_raw_fd(),
                iovecs.as_ptr(),
                iovecs.len() as libc::c_int,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(error);
        }
        if ret == 0 {
            break;
        }
        done += ret as usize;
    }
    Ok(done)
}

/// Gather-write `bufs` starting at `offset`, with the same rules as [`write_full_at`].
#[cfg(target_os = "linux")]
pub fn write_vectored_full_at(file: &File, bufs: &[&[u8]], offset: u64) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let total: usize = bufs.iter().map(|buf| buf.len()).sum();
    let mut done = 0;
    while done < total {
        let iovecs = remaining_iovecs(bufs.iter().map(|buf| (buf.as_ptr(), buf.len())), done);
        let ret = unsafe {
            libc::pwritev(
                file.as_raw_fd(),
                iovecs.as_ptr(),
                iovecs.len() as libc::c_int,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(error);
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "vectored write made no progress",
            ));
        }
        done += ret as usize;
    }
    Ok(done)
}

// the iovec list describing everything after the first `skip` bytes.
#[cfg(target_os = "linux")]
fn remaining_iovecs(
    bufs: impl Iterator<Item = (*const u8, usize)>,
    mut skip: usize,
) -> Vec<libc::iovec> {
    let mut iovecs = Vec::new();
    for (ptr, len) in bufs {
        if skip >= len {
            skip -= len;
            continue;
        }
        iovecs.push(libc::iovec {
            iov_base: unsafe { ptr.add(skip) } as *mut libc::c_void,
            iov_len: len - skip,
        });
        skip = 0;
    }
    iovecs
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn read_vectored_full_at(file: &File, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    for buf in bufs.iter_mut() {
        let len = buf.len();
        let n = read_full_at(file, buf, offset + done as u64)?;
        done += n;
        if n < len {
            break;
        }
    }
    Ok(done)
}
#[cfg(all(unix, not(target_os = "linux")))]
pub fn write_vectored_full_at(file: &File, bufs: &[&[u8]], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    for buf in bufs {
        done += write_full_at(file, buf, offset + done as u64)?;
    }
    Ok(done)
}

#[cfg(target_os = "linux")]
mod fiemap {
    use super::*;

    use std::os::unix::io::AsRawFd;
    use std::{mem, slice};

    // _IOWR('f', 11, struct fiemap)
    pub(super) const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;
    pub(super) const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default)]
    pub(super) struct RawFiemap {
        pub fm_start: u64,
        pub fm_length: u64,
        pub fm_flags: u32,
        pub fm_mapped_extents: u32,
        pub fm_extent_count: u32,
        pub fm_reserved: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default)]
    pub(super) struct RawFiemapExtent {
        pub fe_logical: u64,
        pub fe_physical: u64,
        pub fe_length: u64,
        pub fe_reserved64: [u64; 2],
        pub fe_flags: u32,
        pub fe_reserved: [u32; 3],
    }

    fn query(file: &File, len: u64, capacity: usize) -> io::Result<Vec<RawFiemapExtent>> {
        let header = mem::size_of::<RawFiemap>();
        let size = header + capacity * mem::size_of::<RawFiemapExtent>();
        // u64 words keep both structs suitably aligned.
        let mut words = vec![0u64; (size + 7) / 8];
        let request = words.as_mut_ptr() as *mut RawFiemap;

        unsafe {
            request.write(RawFiemap {
                fm_start: 0,
                fm_length: len,
                fm_flags: FIEMAP_FLAG_SYNC,
                fm_mapped_extents: 0,
                fm_extent_count: capacity as u32,
                fm_reserved: 0,
            });
        }
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FIEMAP as _, request) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mapped = unsafe { (*request).fm_mapped_extents } as usize;
        if capacity == 0 {
            return Ok(vec![RawFiemapExtent::default(); mapped]);
        }
        let extents = unsafe {
            let first = (request as *const u8).add(header) as *const RawFiemapExtent;
            slice::from_raw_parts(first, mapped.min(capacity))
        };
        Ok(extents.to_vec())
    }

    /// Query the physical extents of the first `len` bytes of `file`, forcing delayed
    /// allocations to be flushed first.
    pub fn extents(file: &File, len: u64) -> io::Result<Vec<(Extent, ExtentFlags)>> {
        // the first call only counts; the extents may change in between, which the second call
        // simply truncates to what fits.
        let count = query(file, len, 0)?.len();
        let raw = query(file, len, count.max(1))?;

        Ok(raw
            .into_iter()
            .map(|extent| {
                (
                    Extent {
                        logical: extent.fe_logical,
                        physical: extent.fe_physical,
                        length: extent.fe_length,
                    },
                    ExtentFlags::from_bits_truncate(extent.fe_flags),
                )
            })
            .collect())
    }
}

#[cfg(target_os = "linux")]
pub use fiemap::extents;

/// Split a `st_dev` number into its major and minor parts, the way glibc's `gnu_dev_major`
/// and `gnu_dev_minor` do.
pub fn device_numbers(dev: u64) -> (u64, u64) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major, minor)
}

/// The device node of the block device holding `file`'s data.
#[cfg(target_os = "linux")]
pub fn backing_device(file: &File) -> io::Result<std::path::PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let (major, minor) = device_numbers(file.metadata()?.dev());
    Ok(std::path::PathBuf::from(format!(
        "/dev/block/{}:{}",
        major, minor
    )))
}

/// Open a block device for unbuffered access. With `write_through`, every write is also
/// synchronized (`O_DSYNC`).
#[cfg(target_os = "linux")]
pub fn open_device(
    path: &std::path::Path,
    writable: bool,
    write_through: bool,
) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut flags = libc::O_DIRECT;
    if write_through {
        flags |= libc::O_DSYNC;
    }
    std::fs::OpenOptions::new()
        .read(true)
        .write(writable)
        .custom_flags(flags)
        .open(path)
}

/// Whether `file` is itself a block device.
#[cfg(unix)]
pub fn is_block_device(file: &File) -> io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;

    Ok(file.metadata()?.file_type().is_block_device())
}

/// The size of a file or block device, as seen by seeking to its end.
pub fn device_len(file: &File) -> io::Result<u64> {
    use std::io::{Seek, SeekFrom};

    // seeking a shared `&File` still moves its cursor; positional transfers never rely on it.
    let mut file = file;
    file.seek(SeekFrom::End(0))
}
