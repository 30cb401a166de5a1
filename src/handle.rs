//! The handle table, mapping opaque integer handles to shared descriptor objects.
//!
//! A handle encodes a slot index together with the generation of that slot, so that a handle
//! that has been closed (and whose slot may have been reused since) can never resolve to the
//! new occupant. The table holds one owning reference to every open object; resolving a handle
//! hands out another one, which keeps the object alive for the duration of the calling
//! operation even if the handle is closed concurrently.

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::status::{Error, Result};

/// An opaque handle to an object owned by a session.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        let raw = (u64::from(generation) << 32) | (u64::from(index) + 1);
        // the low half is at least one.
        Handle(NonZeroU64::new(raw).unwrap_or_else(|| unreachable!()))
    }
    fn index(self) -> usize {
        ((self.0.get() & 0xFFFF_FFFF) - 1) as usize
    }
    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
    /// The raw integer value of the handle.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
    /// Reconstruct a handle from a raw value. A value whose low half is zero is never a valid
    /// handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw & 0xFFFF_FFFF == 0 {
            return None;
        }
        NonZeroU64::new(raw).map(Handle)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}@{})", self.index(), self.generation())
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// The lifecycle state of a table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleState {
    Open,
    Closing,
    Closed,
}

/// A shared reference to an object stored in the table.
#[derive(Debug)]
pub struct Entry<T> {
    state: AtomicU8,
    object: T,
}

impl<T> Entry<T> {
    pub fn object(&self) -> &T {
        &self.object
    }
    pub fn state(&self) -> HandleState {
        match self.state.load(Ordering::Acquire) {
            OPEN => HandleState::Open,
            CLOSING => HandleState::Closing,
            _ => HandleState::Closed,
        }
    }
    /// Finish the teardown started by [`HandleTable::close`].
    pub fn mark_closed(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        debug_assert_eq!(previous, CLOSING, "entry closed without going through Closing");
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<Entry<T>>>,
}

struct Table<T> {
    slots: Vec<Slot<T>>,
    // indices of vacant slots, reused before the table grows.
    free: Vec<u32>,
    len: usize,
    closed: bool,
}

/// A registry of reference-counted objects, addressed by generation-tagged handles.
pub struct HandleTable<T> {
    table: RwLock<Table<T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
                closed: false,
            }),
        }
    }

    /// Store `object`, returning its handle.
    pub fn insert(&self, object: T) -> Result<Handle> {
        let entry = Arc::new(Entry {
            state: AtomicU8::new(OPEN),
            object,
        });
        let mut table = self.table.write();
        if table.closed {
            return Err(Error::InvalidHandle);
        }

        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(table.slots.len())
                    .ok()
                    .filter(|&index| index < u32::MAX)
                    .ok_or(Error::InsufficientResources("handle table is full"))?;
                table.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                index
            }
        };
        let slot = &mut table.slots[index as usize];
        slot.entry = Some(entry);
        let handle = Handle::new(index, slot.generation);
        table.len += 1;

        Ok(handle)
    }

    /// Obtain a temporary owning reference to the object behind `handle`.
    pub fn resolve(&self, handle: Handle) -> Result<Arc<Entry<T>>> {
        let table = self.table.read();
        let slot = table
            .slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(Error::InvalidHandle)?;
        let entry = slot.entry.as_ref().ok_or(Error::InvalidHandle)?;

        if entry.state.load(Ordering::Acquire) != OPEN {
            return Err(Error::InvalidHandle);
        }
        Ok(Arc::clone(entry))
    }

    /// Begin closing `handle`: the entry moves from Open to Closing, and the table releases its
    /// reference. The caller tears down the returned object and then calls
    /// [`Entry::mark_closed`]. A second close of the same handle fails with `InvalidHandle`.
    pub fn close(&self, handle: Handle) -> Result<Arc<Entry<T>>> {
        let entry = self.resolve(handle)?;
        entry
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::InvalidHandle)?;

        let mut table = self.table.write();
        let index = handle.index();
        let slot = &mut table.slots[index];
        // a concurrent `close_all` may have emptied the slot already.
        if slot.generation == handle.generation() && slot.entry.is_some() {
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            table.free.push(index as u32);
            table.len -= 1;
        }

        Ok(entry)
    }

    /// Close the table, moving every open entry to Closing and returning them for teardown.
    /// Further inserts fail with `InvalidHandle`.
    pub fn close_all(&self) -> Vec<Arc<Entry<T>>> {
        let mut table = self.table.write();
        table.closed = true;
        table.len = 0;

        let mut entries = Vec::new();
        for slot in table.slots.iter_mut() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                let claimed = entry
                    .state
                    .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                // entries that lost the race are being closed by a concurrent `close`.
                if claimed {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    /// The number of open handles.
    pub fn len(&self) -> usize {
        self.table.read().len
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The number of slots ever allocated, which only grows when no vacant slot can be reused.
    pub fn slot_capacity(&self) -> usize {
        self.table.read().slots.len()
    }
    pub fn is_closed(&self) -> bool {
        self.table.read().closed
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("HandleTable")
            .field("len", &table.len)
            .field("slots", &table.slots.len())
            .field("closed", &table.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_resolve_close() {
        let table = HandleTable::new();
        let handle = table.insert("queue").unwrap();
        assert_eq!(*table.resolve(handle).unwrap().object(), "queue");
        assert_eq!(table.len(), 1);

        let entry = table.close(handle).unwrap();
        assert_eq!(entry.state(), HandleState::Closing);
        entry.mark_closed();
        assert_eq!(entry.state(), HandleState::Closed);

        assert!(matches!(table.resolve(handle), Err(Error::InvalidHandle)));
        assert!(matches!(table.close(handle), Err(Error::InvalidHandle)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn stale_handles_never_alias() {
        let table = HandleTable::new();
        let first = table.insert(1).unwrap();
        table.close(first).unwrap().mark_closed();

        let second = table.insert(2).unwrap();
        assert_ne!(first, second);
        assert_eq!(table.slot_capacity(), 1);
        assert!(table.resolve(first).is_err());
        assert_eq!(*table.resolve(second).unwrap().object(), 2);
    }

    #[test]
    fn resolved_reference_outlives_close() {
        let table = HandleTable::new();
        let handle = table.insert(vec![1, 2, 3]).unwrap();
        let in_flight = table.resolve(handle).unwrap();

        let entry = table.close(handle).unwrap();
        drop(entry);
        assert_eq!(in_flight.object(), &vec![1, 2, 3]);
        assert_eq!(Arc::strong_count(&in_flight), 1);
    }

    #[test]
    fn close_all_invalidates_everything() {
        let table = HandleTable::new();
        let handles = (0..8).map(|i| table.insert(i).unwrap()).collect::<Vec<_>>();
        let entries = table.close_all();
        assert_eq!(entries.len(), 8);
        for handle in handles {
            assert!(table.resolve(handle).is_err());
        }
        assert!(table.insert(9).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn raw_round_trip() {
        let table = HandleTable::new();
        let handle = table.insert(()).unwrap();
        assert_eq!(Handle::from_raw(handle.as_raw()), Some(handle));
        assert_eq!(Handle::from_raw(0), None);
    }

    #[test]
    fn forged_handles_never_resolve() {
        assert!(Handle::from_raw(0).is_none());
        assert!(Handle::from_raw(1 << 32).is_none());
        assert!(Handle::from_raw(u64::MAX << 32).is_none());

        let table = HandleTable::new();
        let handle = table.insert("queue").unwrap();
        let forged = [
            Handle::from_raw(handle.as_raw() + (1 << 32)).unwrap(),
            Handle::from_raw(handle.as_raw() + 1).unwrap(),
            Handle::from_raw(u64::MAX).unwrap(),
        ];
        for forged in &forged {
            assert!(matches!(table.resolve(*forged), Err(Error::InvalidHandle)));
            assert!(matches!(table.close(*forged), Err(Error::InvalidHandle)));
            assert!(!format!("{:?}", forged).is_empty());
        }
        assert_eq!(*table.resolve(handle).unwrap().object(), "queue");
    }
}
