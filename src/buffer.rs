//! Memory-accounted chunk buffers.

use std::mem;

use deepsize::DeepSizeOf;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::record::Record;

/// Append-only record buffer that tracks the deep memory footprint of its
/// contents.
#[derive(Default)]
pub struct ChunkBuffer {
    records: Vec<Record>,
    mem_size: u64,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        ChunkBuffer {
            records: Vec::new(),
            mem_size: 0,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.mem_size += record.deep_size_of() as u64;
        self.records.push(record);
    }

    /// Bytes held by the buffered records, accumulated on push.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Moves all buffered records out, leaving the buffer empty and its
    /// size accounting at zero.
    pub fn take_records(&mut self) -> Vec<Record> {
        self.mem_size = 0;
        mem::take(&mut self.records)
    }
}

/// Chunk buffer shared between the appender and the memory monitor.
///
/// Appends hold the write lock per record, the monitor samples the byte
/// figure through the read lock, and a flush keeps the write guard for its
/// whole sort-and-spill so no append can land in a chunk that is being
/// written out.
#[derive(Default)]
pub struct SharedChunkBuffer {
    inner: RwLock<ChunkBuffer>,
}

impl SharedChunkBuffer {
    pub fn new() -> Self {
        SharedChunkBuffer {
            inner: RwLock::new(ChunkBuffer::new()),
        }
    }

    pub fn append(&self, record: Record) {
        self.inner.write().push(record);
    }

    pub fn mem_size(&self) -> u64 {
        self.inner.read().mem_size()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Acquires the buffer exclusively. The caller takes the records out,
    /// implicitly swapping in a fresh empty buffer, and appenders stay
    /// blocked until the returned guard is dropped.
    pub fn lock_for_flush(&self) -> RwLockWriteGuard<'_, ChunkBuffer> {
        self.inner.write()
    }
}
