use async_lock::RwLockReadGuardArc;
use std::{fmt, ops::Deref};

/// A read-only, zero-copy view over a filled range of a [crate::Buffer].
///
/// A [View] holds the storage lock shared for as long as it is alive. Until it is dropped, the
/// active generation cannot copy its next chunk into the storage and a newly installed generation
/// cannot begin overwriting it, so the referenced bytes never change underneath it.
pub struct View {
    storage: RwLockReadGuardArc<Box<[u8]>>,
    offset: usize,
    length: usize,
}

impl View {
    pub(crate) fn new(storage: RwLockReadGuardArc<Box<[u8]>>, offset: usize, length: usize) -> Self {
        debug_assert!(offset + length <= storage.len());
        Self {
            storage,
            offset,
            length,
        }
    }

    /// Offset of the view within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for View {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.length]
    }
}

impl AsRef<[u8]> for View {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}
