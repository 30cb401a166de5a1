//! Translation from logical file offsets to physical device offsets.

use std::fmt;

use crate::status::{Error, Result};

bitflags::bitflags! {
    /// Per-extent flags reported by `FS_IOC_FIEMAP` (`FIEMAP_EXTENT_*`).
    pub struct ExtentFlags: u32 {
        /// The last extent of the file.
        const LAST = 0x0000_0001;
        /// The physical location is not known yet.
        const UNKNOWN = 0x0000_0002;
        /// Delayed allocation; the extent has no blocks yet. Implies `UNKNOWN`.
        const DELALLOC = 0x0000_0004;
        /// The data is encoded (compressed, for example).
        const ENCODED = 0x0000_0008;
        /// The data is encrypted by the filesystem.
        const DATA_ENCRYPTED = 0x0000_0080;
        /// The extent offsets may not be block aligned.
        const NOT_ALIGNED = 0x0000_0100;
        /// The data is stored inline in the metadata. Implies `NOT_ALIGNED`.
        const DATA_INLINE = 0x0000_0200;
        /// Several files are packed into one block. Implies `NOT_ALIGNED`.
        const DATA_TAIL = 0x0000_0400;
        /// Allocated but never written; the device contents are not zeroed.
        const UNWRITTEN = 0x0000_0800;
        /// The filesystem merged this extent from smaller ones.
        const MERGED = 0x0000_1000;
        /// The blocks are shared with other files.
        const SHARED = 0x0000_2000;
    }
}

impl ExtentFlags {
    // such an extent cannot be read or written on the device directly: its offsets are not
    // final, its bytes are not stored as is, its device contents are stale, or the blocks
    // belong to other files as well.
    fn unusable() -> Self {
        Self::UNKNOWN
            | Self::DELALLOC
            | Self::NOT_ALIGNED
            | Self::ENCODED
            | Self::DATA_ENCRYPTED
            | Self::UNWRITTEN
            | Self::SHARED
    }
}

/// A contiguous run of file bytes that lives at a contiguous device location.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

impl Extent {
    pub fn logical_end(&self) -> u64 {
        self.logical + self.length
    }
    pub fn physical_end(&self) -> u64 {
        self.physical + self.length
    }
}

/// The physical location of one piece of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fragment {
    /// Offset of the piece relative to the start of the request.
    pub offset: usize,
    /// Device offset to transfer at.
    pub physical: u64,
    pub len: usize,
}

/// A sorted, non-overlapping list of extents.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct ExtentMap {
    extents: Vec<Extent>,
}

impl ExtentMap {
    /// The map of a file without any data.
    pub fn empty() -> Self {
        Self::default()
    }
    /// The map of a block device, on which logical and physical offsets coincide.
    pub fn identity(len: u64) -> Self {
        let extents = if len == 0 {
            Vec::new()
        } else {
            vec![Extent {
                logical: 0,
                physical: 0,
                length: len,
            }]
        };
        Self { extents }
    }

    /// Build a map from the extents reported for a file.
    ///
    /// Fails with `NotSupported` if any extent lacks a usable physical address, or if extents
    /// overlap. Neighbours that are contiguous both in the file and on the device are merged.
    pub fn from_reported<I>(reported: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Extent, ExtentFlags)>,
    {
        let mut extents = Vec::new();
        for (extent, flags) in reported {
            if flags.intersects(ExtentFlags::unusable()) {
                log::debug!("Extent {:?} has unusable flags {:?}", extent, flags);
                return Err(Error::NotSupported(
                    "file has extents without a stable physical location",
                ));
            }
            if extent.length > 0 {
                extents.push(extent);
            }
        }
        extents.sort_unstable_by_key(|extent| extent.logical);

        let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
        for extent in extents {
            if let Some(last) = merged.last_mut() {
                if extent.logical < last.logical_end() {
                    return Err(Error::NotSupported("file has overlapping extents"));
                }
                if extent.logical == last.logical_end() && extent.physical == last.physical_end() {
                    last.length += extent.length;
                    continue;
                }
            }
            merged.push(extent);
        }

        Ok(Self { extents: merged })
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }
    pub fn len(&self) -> usize {
        self.extents.len()
    }
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
    /// The end of the last mapped byte, in file offsets.
    pub fn mapped_end(&self) -> u64 {
        self.extents.last().map_or(0, Extent::logical_end)
    }

    /// Translate `logical`, returning its physical offset and the number of bytes (at most
    /// `len`) that stay physically contiguous from there.
    pub fn map(&self, logical: u64, len: u64) -> Result<(u64, u64)> {
        let index = self
            .extents
            .partition_point(|extent| extent.logical_end() <= logical);
        let extent = self
            .extents
            .get(index)
            .filter(|extent| extent.logical <= logical)
            .ok_or(Error::InvalidParameter("range is not mapped to the device"))?;

        let skip = logical - extent.logical;
        Ok((extent.physical + skip, len.min(extent.length - skip)))
    }

    /// Split `len` bytes at `logical` into physically contiguous fragments.
    pub fn split(&self, logical: u64, len: usize) -> Result<Vec<Fragment>> {
        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < len {
            let (physical, run) = self.map(logical + offset as u64, (len - offset) as u64)?;
            let run = run as usize;
            fragments.push(Fragment {
                offset,
                physical,
                len: run,
            });
            offset += run;
        }
        Ok(fragments)
    }
}

impl fmt::Debug for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentMap")
            .field("extents", &self.extents.len())
            .field("mapped_end", &self.mapped_end())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(logical: u64, physical: u64, length: u64) -> Extent {
        Extent {
            logical,
            physical,
            length,
        }
    }

    #[test]
    fn merges_only_fully_contiguous_neighbours() {
        let map = ExtentMap::from_reported(vec![
            (extent(8192, 20480, 4096), ExtentFlags::LAST),
            (extent(0, 12288, 4096), ExtentFlags::empty()),
            (extent(4096, 16384, 4096), ExtentFlags::MERGED),
        ])
        .unwrap();
        assert_eq!(map.extents(), &[extent(0, 12288, 12288)]);

        // physically adjacent, but with a hole in the file between them.
        let map = ExtentMap::from_reported(vec![
            (extent(0, 0, 4096), ExtentFlags::empty()),
            (extent(8192, 4096, 4096), ExtentFlags::empty()),
        ])
        .unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn rejects_unusable_extents() {
        for flags in &[
            ExtentFlags::UNKNOWN,
            ExtentFlags::DELALLOC | ExtentFlags::UNKNOWN,
            ExtentFlags::NOT_ALIGNED | ExtentFlags::DATA_INLINE,
            ExtentFlags::SHARED,
            ExtentFlags::ENCODED,
            ExtentFlags::DATA_ENCRYPTED,
            ExtentFlags::UNWRITTEN | ExtentFlags::LAST,
        ] {
            let result = ExtentMap::from_reported(vec![(extent(0, 0, 4096), *flags)]);
            assert!(matches!(result, Err(Error::NotSupported(_))));
        }
        let overlapping = ExtentMap::from_reported(vec![
            (extent(0, 0, 8192), ExtentFlags::empty()),
            (extent(4096, 65536, 4096), ExtentFlags::empty()),
        ]);
        assert!(overlapping.is_err());
    }

    #[test]
    fn map_and_split() {
        let map = ExtentMap::from_reported(vec![
            (extent(0, 40960, 4096), ExtentFlags::empty()),
            (extent(4096, 8192, 8192), ExtentFlags::empty()),
        ])
        .unwrap();

        assert_eq!(map.map(0, 100).unwrap(), (40960, 100));
        assert_eq!(map.map(6144, 1 << 20).unwrap(), (10240, 6144));
        assert!(map.map(12288, 1).is_err());

        let fragments = map.split(2048, 8192).unwrap();
        assert_eq!(
            fragments,
            vec![
                Fragment {
                    offset: 0,
                    physical: 43008,
                    len: 2048
                },
                Fragment {
                    offset: 2048,
                    physical: 8192,
                    len: 6144
                },
            ]
        );
        assert!(matches!(
            map.split(8192, 8192),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn identity_map() {
        let map = ExtentMap::identity(1 << 20);
        assert_eq!(map.map(12345, 10).unwrap(), (12345, 10));
        assert_eq!(map.mapped_end(), 1 << 20);
        assert!(ExtentMap::identity(0).is_empty());
    }
}
