//! Fixed-capacity data blocks and their cache
//!
//! A `DataBlock` stages unread socket input. The producer (the read task)
//! appends at the write cursor while the consumer (delivery) advances the read
//! cursor over bytes already published to it, so both sides may touch one
//! block at the same time, always on disjoint ranges. The hand-off itself is
//! ordered by the read path's state word, the cursors here only need to be
//! individually atomic.
//!
//! Blocks travel as raw pointers because they live in an intrusive list that
//! two threads walk from opposite ends. Every pointer handed out by
//! `DataBlockCache::get` must come back through `DataBlockCache::put`.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

/// Alignment of "direct" block memory
const DIRECT_ALIGN: usize = 4096;
/// Alignment of plain heap block memory
const HEAP_ALIGN: usize = 16;

pub struct DataBlock {
    mem: NonNull<u8>,
    layout: Layout,
    wr: AtomicUsize,
    rd: AtomicUsize,
    next: AtomicPtr<DataBlock>,
}

// SAFETY: the block owns its memory, concurrent access is confined to
// disjoint byte ranges governed by the cursors.
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

impl DataBlock {
    fn allocate(size: usize, direct: bool) -> Box<DataBlock> {
        let align = if direct { DIRECT_ALIGN } else { HEAP_ALIGN };
        let layout = match Layout::from_size_align(size.max(1), align) {
            Ok(l) => l,
            Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
        };
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc(layout) };
        let mem = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Box::new(DataBlock {
            mem,
            layout,
            wr: AtomicUsize::new(0),
            rd: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    #[cfg(test)]
    fn is_direct(&self) -> bool {
        self.layout.align() == DIRECT_ALIGN
    }

    /// Bytes written so far (producer cursor)
    #[inline]
    pub fn write_pos(&self) -> usize {
        self.wr.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_write_pos(&self, pos: usize) {
        debug_assert!(pos <= self.capacity());
        self.wr.store(pos, Ordering::Release);
    }

    /// Bytes already consumed (consumer cursor)
    #[inline]
    pub fn read_pos(&self) -> usize {
        self.rd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_read_pos(&self, pos: usize) {
        debug_assert!(pos <= self.capacity());
        self.rd.store(pos, Ordering::Release);
    }

    /// Space left past the write cursor
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.write_pos()
    }

    #[inline]
    pub fn next(&self) -> *mut DataBlock {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_next(&self, next: *mut DataBlock) {
        self.next.store(next, Ordering::Release);
    }

    /// Writable region from the write cursor to the end.
    ///
    /// # Safety
    /// Only the producer may call this and it must not hold two of these
    /// slices for one block at a time.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn spare_mut(&self) -> &mut [u8] {
        let wr = self.write_pos();
        std::slice::from_raw_parts_mut(self.mem.as_ptr().add(wr), self.capacity() - wr)
    }

    /// Bytes in `[from, to)`.
    ///
    /// # Safety
    /// The range must already be published by the producer and stay below
    /// the write cursor while the slice is alive.
    #[inline]
    pub unsafe fn slice(&self, from: usize, to: usize) -> &[u8] {
        debug_assert!(from <= to && to <= self.capacity());
        std::slice::from_raw_parts(self.mem.as_ptr().add(from), to - from)
    }

    /// Copy `data` in at the write cursor, returns bytes copied.
    #[cfg(test)]
    fn fill(&mut self, data: &[u8]) -> usize {
        let wr = self.write_pos();
        let n = data.len().min(self.capacity() - wr);
        // SAFETY: exclusive access through &mut self, bounds checked above
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.mem.as_ptr().add(wr), n);
        }
        self.set_write_pos(wr + n);
        n
    }

    fn reset(&self) {
        self.wr.store(0, Ordering::Relaxed);
        self.rd.store(0, Ordering::Relaxed);
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this layout
        unsafe { alloc::dealloc(self.mem.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("capacity", &self.capacity())
            .field("rd", &self.read_pos())
            .field("wr", &self.write_pos())
            .finish()
    }
}

/// Lock-free cache of equally sized data blocks
pub struct DataBlockCache {
    block_size: usize,
    direct: bool,
    max_cached: usize,
    free: ArrayQueue<Box<DataBlock>>,
}

impl DataBlockCache {
    pub fn new(block_size: usize, max_cached: usize, direct: bool) -> Self {
        Self {
            block_size,
            direct,
            max_cached,
            free: ArrayQueue::new(max_cached.max(1)),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently held by the cache
    #[inline]
    pub fn cached(&self) -> usize {
        self.free.len()
    }

    /// Chain of `count` reset blocks linked through `next`, head returned.
    ///
    /// Returns null when `count` is 0.
    pub fn get(&self, count: usize) -> *mut DataBlock {
        let mut head: *mut DataBlock = ptr::null_mut();
        for _ in 0..count {
            let block = self
                .free
                .pop()
                .unwrap_or_else(|| DataBlock::allocate(self.block_size, self.direct));
            block.set_next(head);
            head = Box::into_raw(block);
        }
        head
    }

    /// Return one block, its `next` link is discarded.
    ///
    /// # Safety
    /// `block` must come from `get` on this cache and must not be used
    /// afterwards.
    pub unsafe fn put(&self, block: *mut DataBlock) {
        if block.is_null() {
            return;
        }
        let block = Box::from_raw(block);
        block.reset();
        if self.cached() >= self.max_cached {
            return;
        }
        // Full queue drops the block
        let _ = self.free.push(block);
    }

    /// Return a whole chain following `next` links.
    ///
    /// # Safety
    /// Same as `put` for every block of the chain.
    #[cfg(test)]
    unsafe fn put_chain(&self, mut block: *mut DataBlock) {
        while !block.is_null() {
            let next = (*block).next();
            self.put(block);
            block = next;
        }
    }
}

impl std::fmt::Debug for DataBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlockCache")
            .field("block_size", &self.block_size)
            .field("direct", &self.direct)
            .field("cached", &self.cached())
            .finish()
    }
}
