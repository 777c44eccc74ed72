//! Slab allocation for mem series data.
//!
//! Time series writes are many small records. Allocating each encoded
//! record separately fragments the heap badly under sustained load, so a
//! partition carves record bytes out of one large slab instead. The slab
//! hands back [`Bytes`] handles, which lets sealed snapshots share the
//! underlying allocation while the writer keeps appending into the
//! remaining capacity.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// A bump allocator over a single slab.
///
/// Owned by one partition and only touched under its write mutex, so no
/// internal synchronisation. When the slab cannot fit an allocation the
/// allocator reports [`Error::OutOfSpace`], which the caller treats as
/// "the current mem series is full".
pub struct SlabAllocator {
    slab_size: usize,
    slab: BytesMut,
    used: usize,
}

impl SlabAllocator {
    pub fn new(slab_size: usize) -> SlabAllocator {
        SlabAllocator {
            slab_size,
            slab: BytesMut::new(),
            used: 0,
        }
    }

    /// Copies `data` into the slab and returns a handle to the copy.
    pub fn allocate(&mut self, data: &[u8]) -> Result<Bytes> {
        if self.used + data.len() > self.slab_size {
            return Err(Error::OutOfSpace);
        }
        if self.slab.capacity() == 0 {
            // The slab is allocated on first use so idle partitions stay
            // cheap.
            self.slab = BytesMut::with_capacity(self.slab_size);
        }
        self.used += data.len();
        self.slab.extend_from_slice(data);
        Ok(self.slab.split().freeze())
    }

    /// Discards the current slab and starts a fresh one. Called when the
    /// mem series rotates and after a force flush; outstanding handles
    /// keep the old slab's memory alive until their snapshots drop.
    pub fn release(&mut self) {
        self.slab = BytesMut::new();
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.slab_size - self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_read_back() {
        let mut allocator = SlabAllocator::new(64);
        let a = allocator.allocate(b"hello").unwrap();
        let b = allocator.allocate(b"world").unwrap();
        assert_eq!(&a[..], b"hello");
        assert_eq!(&b[..], b"world");
        assert_eq!(allocator.used(), 10);
        assert_eq!(allocator.remaining(), 54);
    }

    #[test]
    fn test_out_of_space() {
        let mut allocator = SlabAllocator::new(8);
        allocator.allocate(b"12345678").unwrap();
        assert_eq!(allocator.allocate(b"x"), Err(Error::OutOfSpace));
    }

    #[test]
    fn test_handles_survive_release() {
        let mut allocator = SlabAllocator::new(16);
        let handle = allocator.allocate(b"sealed").unwrap();
        allocator.release();
        assert_eq!(allocator.used(), 0);
        // The old slab stays alive through the handle.
        assert_eq!(&handle[..], b"sealed");
        let fresh = allocator.allocate(b"again").unwrap();
        assert_eq!(&fresh[..], b"again");
    }
}
