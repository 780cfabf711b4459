//! Reference-counted audio memory passed alongside messages

use basedrop::Shared;

use super::gc::gc_handle;

/// Immutable byte buffer
#[derive(Debug)]
pub struct MemBlock {
    data: Box<[u8]>,
}

/// Shared reference to a block; the last drop defers the free to the GC thread
pub type MemBlockRef = Shared<MemBlock>;

impl MemBlock {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// Allocate a block on the collector
    pub fn new_shared(data: impl Into<Box<[u8]>>) -> MemBlockRef {
        Shared::new(&gc_handle(), Self::new(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// A view of `length` bytes at `index` inside a block
#[derive(Clone)]
pub struct MemChunk {
    block: MemBlockRef,
    index: usize,
    length: usize,
}

impl MemChunk {
    /// Panics if the range is outside the block
    pub fn new(block: MemBlockRef, index: usize, length: usize) -> Self {
        assert!(
            index.checked_add(length).is_some_and(|end| end <= block.len()),
            "memchunk {}+{} outside block of {} bytes",
            index,
            length,
            block.len()
        );
        Self { block, index, length }
    }

    /// Chunk covering a whole block
    pub fn whole(block: MemBlockRef) -> Self {
        let length = block.len();
        Self::new(block, 0, length)
    }

    pub fn block(&self) -> &MemBlockRef {
        &self.block
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.index..self.index + self.length]
    }
}

impl std::fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemChunk")
            .field("block_len", &self.block.len())
            .field("index", &self.index)
            .field("length", &self.length)
            .finish()
    }
}
