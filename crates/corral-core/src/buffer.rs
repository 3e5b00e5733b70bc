use core::{fmt, num::NonZeroU64, ptr::NonNull};
use std::collections::BTreeMap;

/// Identifier of a buffer pinned across the host/guest boundary. Zero is
/// reserved for "no buffer" and is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(NonZeroU64);

impl BufferId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Raw view of a pinned guest buffer.
///
/// The memory belongs to the engine and stays valid until the id is detached
/// or the isolate is destroyed. Only one side may write during a call; nothing
/// here enforces that.
#[derive(Debug, Clone, Copy)]
pub struct PinnedBuf {
    id: BufferId,
    ptr: NonNull<u8>,
    len: usize,
}

impl PinnedBuf {
    pub(crate) const fn new(id: BufferId, ptr: NonNull<u8>, len: usize) -> Self {
        Self { id, ptr, len }
    }

    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The id must still be attached and no guest code may run while the
    /// returned slice is alive.
    #[must_use]
    pub const unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// Same as [`PinnedBuf::as_slice`], and no other view of the buffer may be
    /// in use on the host side.
    #[must_use]
    pub const unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Owner of every persistent buffer reference handed to the host.
///
/// Ids are issued in strictly increasing order. Dropping an entry releases
/// the reference it holds.
pub(crate) struct BufferTable<T> {
    /// `None` once every id has been issued.
    next: Option<NonZeroU64>,
    entries: BTreeMap<BufferId, T>,
}

impl<T> BufferTable<T> {
    pub(crate) const fn new() -> Self {
        Self {
            next: Some(NonZeroU64::MIN),
            entries: BTreeMap::new(),
        }
    }

    /// Take ownership of `value` under a fresh id. Returns `None`, dropping
    /// `value`, once the id space is exhausted.
    pub(crate) fn attach(&mut self, value: T) -> Option<BufferId> {
        let id = BufferId(self.next?);
        self.next = id.0.checked_add(1);
        self.entries.insert(id, value);
        Some(id)
    }

    /// Remove and return the reference for `id`. Unknown ids are ignored:
    /// the buffer may already have been released.
    pub(crate) fn detach(&mut self, id: BufferId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release every entry. Ids are not reused afterwards.
    pub(crate) fn clear(&mut self) -> usize {
        let released = self.entries.len();
        self.entries.clear();
        released
    }
}
