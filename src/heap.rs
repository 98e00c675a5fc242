// Copyright 2026 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Segregated-Fit Heap
//!
//! This is a malloc-style allocator over a single contiguous region that
//! only ever grows. It uses:
//! - Boundary tags (mirrored header/footer words) on every block
//! - 16 segregated free lists with first-fit search from the matching class
//! - Eager coalescing of neighbours on free
//! - Chunked region growth through a [`MemorySource`]
//!
//! ## Key Concepts
//!
//! **Region**: the byte range owned by the source. The allocator lays a
//! padding word, an allocated prologue block, and an epilogue header over
//! it so every real block has valid neighbours on both sides.
//!
//! **Block**: a header word, a payload, and a footer word mirroring the
//! header. Free blocks keep their free-list links in the first two payload
//! words.
//!
//! **Placement**: a chosen free block is split when the tail left over is
//! at least [`MIN_BLOCK_SIZE`]; otherwise the whole block is handed out and
//! the slack is internal fragmentation.
//!
//! **Growth**: when no listed block fits, the source is grown by at least
//! [`CHUNK_SIZE`], the epilogue is rewritten at the new end, and the fresh
//! block is coalesced with a trailing free neighbour before placement.

pub mod bucket;
pub mod checker;
pub mod tag;

use core::fmt;

use crate::align::{is_aligned, round_up};
use crate::source::MemorySource;
use bucket::FreeLists;
use checker::CheckError;
use tag::{TagFlags, ALIGNMENT, DWORD_SIZE, MIN_BLOCK_SIZE, NULL_LINK, OVERHEAD};

/// Default region growth granularity in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Largest single request honoured; bigger ones cannot be represented in
/// the 32-bit tag word once overhead is added.
pub const MAX_ALLOC_BYTES: usize = (1 << 31) - OVERHEAD;

/// Region ceiling; free-list links are 32-bit offsets.
pub const MAX_REGION_BYTES: usize = tag::SIZE_MASK as usize;

/// A stable handle to an allocated block: the byte offset of its payload
/// within the region. Always a multiple of 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPtr(u32);

impl UserPtr {
    #[inline]
    pub(crate) fn new(bp: usize) -> Self {
        debug_assert!(is_aligned(bp, ALIGNMENT));
        UserPtr(bp as u32)
    }

    /// The payload's byte offset within the region.
    #[inline]
    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Heap setup errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The source could not supply the initial region.
    NoMemory,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::NoMemory => write!(f, "memory source exhausted"),
        }
    }
}

/// A point-in-time summary of heap occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Bytes currently obtained from the source.
    pub region_bytes: usize,
    /// Bytes sitting in free blocks.
    pub free_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free_block: usize,
}

/// The allocator: exclusively owns its memory source and the free-list
/// registry. All operations take `&mut self`; callers needing to share one
/// heap behind a shared reference can wrap it in
/// [`LockedHeap`](crate::LockedHeap).
pub struct Heap<S: MemorySource> {
    source: S,
    lists: FreeLists,
    /// Payload offset of the prologue block.
    base: usize,
}

impl<S: MemorySource> Heap<S> {
    /// Initialize a heap on `source`.
    ///
    /// Writes the padding word, the prologue block, and the epilogue
    /// header, then performs the first [`CHUNK_SIZE`] extension so the heap
    /// starts with one large free block. The source's break must be
    /// 8-aligned (a fresh source reports 0).
    ///
    /// # Returns
    ///
    /// The ready heap, or [`HeapError::NoMemory`] when the source cannot
    /// supply the initial region.
    pub fn new(mut source: S) -> Result<Self, HeapError> {
        let start = source.grow(2 * DWORD_SIZE).ok_or(HeapError::NoMemory)?;
        debug_assert!(is_aligned(start, ALIGNMENT));

        let base = start + DWORD_SIZE;
        {
            let region = source.region_mut();
            // Padding word, prologue header/footer, epilogue header.
            tag::write_word(region, start, 0);
            tag::write_tags(region, base, DWORD_SIZE, TagFlags::ALLOCATED);
            tag::write_header(region, base + DWORD_SIZE, 0, TagFlags::ALLOCATED);
        }

        let mut heap = Heap {
            source,
            lists: FreeLists::new(),
            base,
        };
        heap.extend(CHUNK_SIZE).ok_or(HeapError::NoMemory)?;

        log::debug!(
            "heap initialized: base {:#x}, {} bytes from source",
            heap.base,
            heap.source.current_break()
        );
        Ok(heap)
    }

    /// Allocate a block with at least `size` payload bytes.
    ///
    /// # Returns
    ///
    /// A stable handle to an 8-aligned payload, or `None` when `size` is
    /// zero, exceeds [`MAX_ALLOC_BYTES`], or the source refuses to grow.
    pub fn allocate(&mut self, size: usize) -> Option<UserPtr> {
        if size == 0 {
            return None;
        }
        if size > MAX_ALLOC_BYTES {
            log::debug!("allocation too large: {} bytes", size);
            return None;
        }

        let asize = adjusted_size(size);
        let bp = match self.lists.find_fit(self.source.region(), asize) {
            Some(bp) => bp,
            None => {
                self.extend(asize.max(CHUNK_SIZE))?;
                self.lists.find_fit(self.source.region(), asize)?
            }
        };
        Some(UserPtr::new(self.place(bp, asize)))
    }

    /// Release the block behind `ptr` back to the free lists, fusing it
    /// with free neighbours. `free(None)` is a no-op.
    pub fn free(&mut self, ptr: Option<UserPtr>) {
        let bp = match ptr {
            Some(p) => p.offset(),
            None => return,
        };

        let region = self.source.region_mut();
        let size = tag::block_size(region, bp);
        tag::write_tags(region, bp, size, TagFlags::empty());
        tag::write_pred(region, bp, NULL_LINK);
        tag::write_succ(region, bp, NULL_LINK);
        self.coalesce(bp);
    }

    /// Resize the block behind `ptr` to at least `new_size` payload bytes.
    ///
    /// Stays in place when the current block already fits or can absorb a
    /// free successor; otherwise migrates to a fresh allocation, copying
    /// the surviving payload. `resize(None, n)` allocates; `resize(p, 0)`
    /// frees and returns `None`.
    ///
    /// # Returns
    ///
    /// The handle of the resized block (possibly moved), or `None` on
    /// failure with the original block left intact.
    pub fn resize(&mut self, ptr: Option<UserPtr>, new_size: usize) -> Option<UserPtr> {
        let bp = match ptr {
            Some(p) => p.offset(),
            None => return self.allocate(new_size),
        };
        if new_size == 0 {
            self.free(ptr);
            return None;
        }
        if new_size > MAX_ALLOC_BYTES {
            return None;
        }

        let asize = adjusted_size(new_size);
        let csize = tag::block_size(self.source.region(), bp);

        // Already big enough, with too little slack to split off.
        if asize <= csize && csize < asize + MIN_BLOCK_SIZE {
            return ptr;
        }

        // Shrink in place; the tail becomes a free block, fused with a free
        // successor before it is filed.
        if csize >= asize + MIN_BLOCK_SIZE {
            self.shrink_in_place(bp, asize, csize);
            return ptr;
        }

        // The block must grow. A fresh extension right behind us turns the
        // epilogue into an absorbable free neighbour.
        let next = bp + csize;
        if tag::is_epilogue(self.source.region(), next) {
            let _ = self.extend(CHUNK_SIZE);
        }

        let next_free = !tag::is_allocated(self.source.region(), next);
        if next_free {
            let combined = csize + tag::block_size(self.source.region(), next);
            if combined >= asize {
                self.absorb_next(bp, next, asize, combined);
                return ptr;
            }
        }

        // Migrate: allocate, copy the surviving payload, release the old
        // block. On failure the old block is untouched.
        let new_ptr = self.allocate(new_size)?;
        let copy = core::cmp::min(csize - OVERHEAD, new_size);
        let dst = new_ptr.offset();
        self.source.region_mut().copy_within(bp..bp + copy, dst);
        self.free(ptr);
        Some(new_ptr)
    }

    /// Verify the heap against its structural invariants.
    ///
    /// Walks every block and every free list; the first violation is
    /// returned and logged. See [`CheckError`] for the cases.
    pub fn check(&self) -> Result<(), CheckError> {
        let result = checker::check(self.source.region(), &self.lists, self.base);
        if let Err(err) = result {
            log::error!("heap consistency check failed: {}", err);
        }
        result
    }

    /// Payload bytes of the block behind `ptr`.
    pub fn payload(&self, ptr: UserPtr) -> &[u8] {
        let bp = ptr.offset();
        let region = self.source.region();
        let size = tag::block_size(region, bp);
        &region[bp..bp + size - OVERHEAD]
    }

    /// Mutable payload bytes of the block behind `ptr`.
    pub fn payload_mut(&mut self, ptr: UserPtr) -> &mut [u8] {
        let bp = ptr.offset();
        let region = self.source.region_mut();
        let size = tag::block_size(region, bp);
        &mut region[bp..bp + size - OVERHEAD]
    }

    /// Usable payload bytes of the block behind `ptr`. At least the size
    /// it was allocated or resized with.
    pub fn payload_size(&self, ptr: UserPtr) -> usize {
        tag::block_size(self.source.region(), ptr.offset()) - OVERHEAD
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> HeapStats {
        let region = self.source.region();
        let mut largest = 0;
        for index in 0..bucket::BUCKET_COUNT {
            let mut node = self.lists.head(index);
            while node != NULL_LINK {
                let bp = node as usize;
                largest = largest.max(tag::block_size(region, bp));
                node = tag::read_succ(region, bp);
            }
        }
        HeapStats {
            region_bytes: self.source.current_break(),
            free_bytes: self.lists.free_bytes(),
            free_blocks: self.lists.free_blocks(),
            largest_free_block: largest,
        }
    }

    /// Log the heap occupancy and per-bucket population at debug level.
    pub fn dump(&self) {
        let stats = self.stats();
        log::debug!(
            "heap: {} region bytes, {} free bytes in {} blocks (largest {})",
            stats.region_bytes,
            stats.free_bytes,
            stats.free_blocks,
            stats.largest_free_block
        );
        let region = self.source.region();
        for index in 0..bucket::BUCKET_COUNT {
            let mut count = 0;
            let mut node = self.lists.head(index);
            while node != NULL_LINK {
                count += 1;
                node = tag::read_succ(region, node as usize);
            }
            if count > 0 {
                log::debug!("  bucket {}: {} blocks", index, count);
            }
        }
    }

    /// The underlying memory source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Grow the region by at least `bytes` and file the resulting free
    /// block.
    ///
    /// The old epilogue word becomes the new block's header, a fresh
    /// epilogue is written at the new end, and the block is coalesced with
    /// a free predecessor. Returns the payload offset of the filed block,
    /// or `None` when the source refuses with the heap unchanged.
    fn extend(&mut self, bytes: usize) -> Option<usize> {
        let delta = round_up(bytes, DWORD_SIZE);
        if self.source.current_break().checked_add(delta)? > MAX_REGION_BYTES {
            return None;
        }
        let old_break = self.source.grow(delta)?;

        let bp = old_break;
        {
            let region = self.source.region_mut();
            tag::write_tags(region, bp, delta, TagFlags::empty());
            tag::write_pred(region, bp, NULL_LINK);
            tag::write_succ(region, bp, NULL_LINK);
            tag::write_header(region, bp + delta, 0, TagFlags::ALLOCATED);
        }
        log::trace!("extended region by {} bytes to {}", delta, old_break + delta);
        Some(self.coalesce(bp))
    }

    /// Fuse the free block at `bp` with free neighbours and file the
    /// result. The single insertion path after a free.
    ///
    /// # Returns
    ///
    /// The payload offset of the filed block, which moves down when the
    /// predecessor was free.
    fn coalesce(&mut self, mut bp: usize) -> usize {
        let (prev, next, prev_alloc, next_alloc) = {
            let region = self.source.region();
            let prev = tag::prev_block(region, bp);
            let next = tag::next_block(region, bp);
            (
                prev,
                next,
                tag::is_allocated(region, prev),
                tag::is_allocated(region, next),
            )
        };

        if prev_alloc && next_alloc {
            // Nothing to fuse.
        } else if prev_alloc && !next_alloc {
            self.lists.remove(self.source.region_mut(), next);
            let region = self.source.region_mut();
            let size = tag::block_size(region, bp) + tag::block_size(region, next);
            tag::write_tags(region, bp, size, TagFlags::empty());
        } else if !prev_alloc && next_alloc {
            self.lists.remove(self.source.region_mut(), prev);
            let region = self.source.region_mut();
            let size = tag::block_size(region, prev) + tag::block_size(region, bp);
            tag::write_tags(region, prev, size, TagFlags::empty());
            bp = prev;
        } else {
            self.lists.remove(self.source.region_mut(), prev);
            self.lists.remove(self.source.region_mut(), next);
            let region = self.source.region_mut();
            let size = tag::block_size(region, prev)
                + tag::block_size(region, bp)
                + tag::block_size(region, next);
            tag::write_tags(region, prev, size, TagFlags::empty());
            bp = prev;
        }

        self.lists.insert(self.source.region_mut(), bp);
        bp
    }

    /// Mark the free block at `bp` allocated for `asize` bytes, splitting
    /// off the tail when it can stand as a block of its own.
    ///
    /// # Returns
    ///
    /// The payload offset of the allocated portion.
    fn place(&mut self, bp: usize, asize: usize) -> usize {
        self.lists.remove(self.source.region_mut(), bp);
        let csize = tag::block_size(self.source.region(), bp);

        if csize - asize >= MIN_BLOCK_SIZE {
            let region = self.source.region_mut();
            tag::write_tags(region, bp, asize, TagFlags::ALLOCATED);
            let rest = bp + asize;
            tag::write_tags(region, rest, csize - asize, TagFlags::empty());
            tag::write_pred(region, rest, NULL_LINK);
            tag::write_succ(region, rest, NULL_LINK);
            self.lists.insert(self.source.region_mut(), rest);
        } else {
            let region = self.source.region_mut();
            tag::write_tags(region, bp, csize, TagFlags::ALLOCATED);
        }
        bp
    }

    /// Shrink the allocated block at `bp` from `csize` to `asize` bytes in
    /// place, filing the tail as a free block fused with a free successor.
    fn shrink_in_place(&mut self, bp: usize, asize: usize, csize: usize) {
        {
            let region = self.source.region_mut();
            tag::write_tags(region, bp, asize, TagFlags::ALLOCATED);
        }

        let tail = bp + asize;
        let next = bp + csize;
        let mut tail_size = csize - asize;
        if !tag::is_allocated(self.source.region(), next) {
            tail_size += tag::block_size(self.source.region(), next);
            self.lists.remove(self.source.region_mut(), next);
        }

        let region = self.source.region_mut();
        tag::write_tags(region, tail, tail_size, TagFlags::empty());
        tag::write_pred(region, tail, NULL_LINK);
        tag::write_succ(region, tail, NULL_LINK);
        self.lists.insert(self.source.region_mut(), tail);
    }

    /// Grow the allocated block at `bp` into its free successor `next`.
    /// `combined` covers both blocks; the surplus beyond `asize` is split
    /// back off when it can stand as a block of its own.
    fn absorb_next(&mut self, bp: usize, next: usize, asize: usize, combined: usize) {
        self.lists.remove(self.source.region_mut(), next);
        let surplus = combined - asize;

        if surplus >= MIN_BLOCK_SIZE {
            {
                let region = self.source.region_mut();
                tag::write_tags(region, bp, asize, TagFlags::ALLOCATED);
                let tail = bp + asize;
                tag::write_tags(region, tail, surplus, TagFlags::empty());
                tag::write_pred(region, tail, NULL_LINK);
                tag::write_succ(region, tail, NULL_LINK);
            }
            self.lists.insert(self.source.region_mut(), bp + asize);
        } else {
            let region = self.source.region_mut();
            tag::write_tags(region, bp, combined, TagFlags::ALLOCATED);
        }
    }
}

/// Round a payload request up to a legal block size: overhead added,
/// 8-aligned, and never below the minimum block.
#[inline]
fn adjusted_size(size: usize) -> usize {
    let asize = round_up(size + OVERHEAD, ALIGNMENT);
    if asize < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        asize
    }
}
