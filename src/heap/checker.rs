// Copyright 2026 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Heap Consistency Checker
//!
//! Walks the block chain and every free list and reports the first
//! structural invariant that does not hold. The checker never mutates the
//! region; it is meant to run after every operation in stress tests and on
//! demand in production diagnostics.

use core::fmt;

use super::bucket::{bucket_of, FreeLists, BUCKET_COUNT};
use super::tag::{self, TagFlags, ALIGNMENT, DWORD_SIZE, MIN_BLOCK_SIZE, NULL_LINK, WORD_SIZE};
use crate::align::is_aligned;

/// A structural invariant violation, naming the offending offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue block is missing or malformed.
    BadPrologue { block: usize },
    /// A block's header and footer words disagree.
    TagMismatch { block: usize },
    /// A block's size is zero, misaligned, below the minimum, or runs past
    /// the break.
    BadSize { block: usize },
    /// The block walk ended on an epilogue word away from the break.
    BadEpilogue { block: usize },
    /// Two neighbouring blocks are both free.
    AdjacentFree { block: usize },
    /// A listed node is marked allocated.
    AllocatedInList { block: usize, bucket: usize },
    /// A listed node sits in a bucket that does not cover its size.
    WrongBucket { block: usize, bucket: usize },
    /// A bucket head has a non-null predecessor link.
    BadHead { bucket: usize },
    /// A node's predecessor link does not point back along the list, or a
    /// link leads out of the region or into a cycle.
    BrokenLink { block: usize },
    /// The non-empty bitmask disagrees with a bucket head.
    BadMask { bucket: usize },
    /// Free blocks seen in the block walk versus nodes in the buckets.
    CountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CheckError::BadPrologue { block } => {
                write!(f, "malformed prologue at {:#x}", block)
            }
            CheckError::TagMismatch { block } => {
                write!(f, "header/footer mismatch at block {:#x}", block)
            }
            CheckError::BadSize { block } => {
                write!(f, "illegal block size at {:#x}", block)
            }
            CheckError::BadEpilogue { block } => {
                write!(f, "epilogue at {:#x} away from the break", block)
            }
            CheckError::AdjacentFree { block } => {
                write!(f, "uncoalesced free neighbours at {:#x}", block)
            }
            CheckError::AllocatedInList { block, bucket } => {
                write!(f, "allocated block {:#x} listed in bucket {}", block, bucket)
            }
            CheckError::WrongBucket { block, bucket } => {
                write!(f, "block {:#x} filed in wrong bucket {}", block, bucket)
            }
            CheckError::BadHead { bucket } => {
                write!(f, "head of bucket {} has a predecessor", bucket)
            }
            CheckError::BrokenLink { block } => {
                write!(f, "broken free-list link at {:#x}", block)
            }
            CheckError::BadMask { bucket } => {
                write!(f, "bucket bitmask disagrees with bucket {}", bucket)
            }
            CheckError::CountMismatch { walked, listed } => {
                write!(f, "{} free blocks in heap but {} listed", walked, listed)
            }
        }
    }
}

/// Verify the region rooted at the prologue payload `base` against the
/// registry `lists`.
///
/// Runs one pass over the block chain and one over every bucket:
/// - every header mirrors its footer and every size is legal
/// - blocks tile the region exactly up to the epilogue at the break
/// - no two free blocks touch
/// - every listed node is free, filed in the class covering its size, and
///   doubly linked consistently with a null-predecessor head
/// - the free-block population matches between the two passes
pub fn check(region: &[u8], lists: &FreeLists, base: usize) -> Result<(), CheckError> {
    let break_off = region.len();

    // Prologue: an allocated minimum sentinel right at the base.
    if base < WORD_SIZE
        || base + DWORD_SIZE > break_off
        || tag::block_size(region, base) != DWORD_SIZE
        || !tag::is_allocated(region, base)
    {
        return Err(CheckError::BadPrologue { block: base });
    }

    // Pass one: the block chain.
    let mut bp = base + DWORD_SIZE;
    let mut walked = 0usize;
    let mut prev_free = false;
    loop {
        if bp < WORD_SIZE || bp > break_off {
            return Err(CheckError::BadSize { block: bp });
        }
        let (size, flags) = tag::unpack(tag::read_word(region, tag::header_off(bp)));
        if size == 0 {
            if !flags.contains(TagFlags::ALLOCATED) {
                return Err(CheckError::BadSize { block: bp });
            }
            if bp != break_off {
                return Err(CheckError::BadEpilogue { block: bp });
            }
            break;
        }
        if !is_aligned(size, ALIGNMENT) || size < MIN_BLOCK_SIZE || bp + size > break_off {
            return Err(CheckError::BadSize { block: bp });
        }
        if tag::read_word(region, tag::header_off(bp))
            != tag::read_word(region, tag::footer_off(bp, size))
        {
            return Err(CheckError::TagMismatch { block: bp });
        }

        let free = !flags.contains(TagFlags::ALLOCATED);
        if free && prev_free {
            return Err(CheckError::AdjacentFree { block: bp });
        }
        if free {
            walked += 1;
        }
        prev_free = free;
        bp += size;
    }

    // Pass two: the free lists.
    let max_nodes = break_off / MIN_BLOCK_SIZE + 1;
    let mut listed = 0usize;
    for bucket in 0..BUCKET_COUNT {
        let head = lists.head(bucket);
        let mask_set = lists.nonempty_mask() & (1 << bucket) != 0;
        if mask_set != (head != NULL_LINK) {
            return Err(CheckError::BadMask { bucket });
        }

        let mut node = head;
        let mut prev = NULL_LINK;
        let mut hops = 0usize;
        while node != NULL_LINK {
            let off = node as usize;
            hops += 1;
            if hops > max_nodes
                || off < DWORD_SIZE
                || off + DWORD_SIZE > break_off
                || !is_aligned(off, ALIGNMENT)
            {
                return Err(CheckError::BrokenLink { block: off });
            }

            let (size, flags) = tag::unpack(tag::read_word(region, tag::header_off(off)));
            if flags.contains(TagFlags::ALLOCATED) {
                return Err(CheckError::AllocatedInList { block: off, bucket });
            }
            if bucket_of(size) != bucket {
                return Err(CheckError::WrongBucket { block: off, bucket });
            }

            let pred = tag::read_pred(region, off);
            if prev == NULL_LINK {
                if pred != NULL_LINK {
                    return Err(CheckError::BadHead { bucket });
                }
            } else if pred != prev {
                return Err(CheckError::BrokenLink { block: off });
            }

            listed += 1;
            prev = node;
            node = tag::read_succ(region, off);
        }
    }

    if walked != listed {
        return Err(CheckError::CountMismatch { walked, listed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = DWORD_SIZE;

    /// Hand-build a 4 KiB region: padding, prologue, a free block, an
    /// allocated block, a second free block, the rest allocated, epilogue.
    fn build_region() -> (Vec<u8>, FreeLists) {
        let len = 4096;
        let mut region = vec![0u8; len];
        let mut lists = FreeLists::new();

        tag::write_word(&mut region, 0, 0);
        tag::write_tags(&mut region, BASE, DWORD_SIZE, TagFlags::ALLOCATED);

        // Blocks at payloads 16, 80, 144, and 208.
        tag::write_tags(&mut region, 16, 64, TagFlags::empty());
        tag::write_tags(&mut region, 80, 64, TagFlags::ALLOCATED);
        tag::write_tags(&mut region, 144, 64, TagFlags::empty());
        tag::write_tags(&mut region, 208, len - 208, TagFlags::ALLOCATED);
        tag::write_header(&mut region, len, 0, TagFlags::ALLOCATED);

        lists.insert(&mut region, 16);
        lists.insert(&mut region, 144);
        (region, lists)
    }

    #[test]
    fn test_clean_region_passes() {
        let (region, lists) = build_region();
        assert_eq!(check(&region, &lists, BASE), Ok(()));
    }

    #[test]
    fn test_bad_prologue() {
        let (mut region, lists) = build_region();
        tag::write_tags(&mut region, BASE, DWORD_SIZE, TagFlags::empty());
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BadPrologue { block: BASE })
        );
    }

    #[test]
    fn test_footer_corruption() {
        let (mut region, lists) = build_region();
        // Smash the footer of the allocated block at 80.
        tag::write_word(&mut region, tag::footer_off(80, 64), tag::pack(128, TagFlags::ALLOCATED));
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::TagMismatch { block: 80 })
        );
    }

    #[test]
    fn test_undersized_block() {
        let (mut region, lists) = build_region();
        tag::write_word(&mut region, tag::header_off(80), tag::pack(8, TagFlags::ALLOCATED));
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BadSize { block: 80 })
        );
    }

    #[test]
    fn test_adjacent_free_blocks() {
        let (mut region, mut lists) = build_region();
        // Freeing the block between the two free ones without coalescing
        // leaves three free neighbours in a row.
        tag::write_tags(&mut region, 80, 64, TagFlags::empty());
        lists.insert(&mut region, 80);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::AdjacentFree { block: 80 })
        );
    }

    #[test]
    fn test_early_epilogue() {
        let (mut region, mut lists) = build_region();
        // Replace the free block at 144 with an epilogue-looking word.
        lists.remove(&mut region, 144);
        tag::write_header(&mut region, 144, 0, TagFlags::ALLOCATED);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BadEpilogue { block: 144 })
        );
    }

    #[test]
    fn test_allocated_node_in_list() {
        let (mut region, lists) = build_region();
        // Flip the block at 16 to allocated in both tags; the walk stays
        // clean so the list scan trips over it.
        tag::write_tags(&mut region, 16, 64, TagFlags::ALLOCATED);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::AllocatedInList { block: 16, bucket: 1 })
        );
    }

    #[test]
    fn test_wrong_bucket() {
        let (mut region, mut lists) = build_region();
        // File the block at 16 under the wrong class by hand.
        lists.remove(&mut region, 16);
        lists.heads[3] = 16;
        lists.nonempty |= 1 << 3;
        tag::write_pred(&mut region, 16, NULL_LINK);
        tag::write_succ(&mut region, 16, NULL_LINK);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::WrongBucket { block: 16, bucket: 3 })
        );
    }

    #[test]
    fn test_head_with_predecessor() {
        let (mut region, lists) = build_region();
        let head = lists.head(1) as usize;
        tag::write_pred(&mut region, head, 16);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BadHead { bucket: 1 })
        );
    }

    #[test]
    fn test_broken_back_link() {
        let (mut region, lists) = build_region();
        // Both free blocks share bucket 1; corrupt the second node's
        // predecessor link.
        let head = lists.head(1) as usize;
        let second = tag::read_succ(&region, head) as usize;
        tag::write_pred(&mut region, second, 208);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BrokenLink { block: second })
        );
    }

    #[test]
    fn test_mask_out_of_sync() {
        let (region, mut lists) = build_region();
        lists.nonempty &= !(1 << 1);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::BadMask { bucket: 1 })
        );
    }

    #[test]
    fn test_unlisted_free_block() {
        let (mut region, mut lists) = build_region();
        // Drop one free block from its bucket but leave its tags free.
        lists.remove(&mut region, 144);
        assert_eq!(
            check(&region, &lists, BASE),
            Err(CheckError::CountMismatch { walked: 2, listed: 1 })
        );
    }
}
