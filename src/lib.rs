// Copyright 2026 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! segmalloc - Segregated-Fit Heap Allocator
//!
//! A malloc-style allocator over a single contiguous memory region that
//! grows through an sbrk-like [`MemorySource`]. Blocks carry mirrored
//! boundary tags, free blocks live in 16 size-class buckets searched
//! first-fit, neighbours coalesce eagerly on free, and resize works in
//! place whenever the block can shrink or absorb its free successor.
//!
//! All block addressing is byte-offset arithmetic on the owned region, so
//! the allocator is plain safe Rust; handles stay stable even when the
//! backing buffer of a [`VecSource`] relocates.
//!
//! # Usage
//!
//! ```
//! use segmalloc::{Heap, VecSource};
//!
//! let mut heap = Heap::new(VecSource::unbounded()).unwrap();
//! let p = heap.allocate(64).unwrap();
//! heap.payload_mut(p)[..4].copy_from_slice(b"data");
//! assert_eq!(&heap.payload(p)[..4], b"data");
//!
//! let p = heap.resize(Some(p), 256).unwrap();
//! assert_eq!(&heap.payload(p)[..4], b"data");
//!
//! heap.free(Some(p));
//! assert!(heap.check().is_ok());
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod align;
pub mod heap;
pub mod source;

pub use heap::bucket::BUCKET_COUNT;
pub use heap::checker::CheckError;
pub use heap::tag::{ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD, WORD_SIZE};
pub use heap::{Heap, HeapError, HeapStats, UserPtr, CHUNK_SIZE, MAX_ALLOC_BYTES};
pub use source::{ArraySource, MemorySource, VecSource};


/// A heap behind a spinlock, for callers that need to reach one allocator
/// from behind a shared reference. Locking discipline is the caller's; the
/// heap itself stays single-threaded under the lock.
pub struct LockedHeap<S: MemorySource> {
    inner: spin::Mutex<Heap<S>>,
}

impl<S: MemorySource> LockedHeap<S> {
    pub fn new(heap: Heap<S>) -> Self {
        Self {
            inner: spin::Mutex::new(heap),
        }
    }

    /// Acquire the heap. Callers must not hold the guard across another
    /// `lock` on the same wrapper.
    pub fn lock(&self) -> spin::MutexGuard<'_, Heap<S>> {
        self.inner.lock()
    }
}
