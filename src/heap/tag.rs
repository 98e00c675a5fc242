// Copyright 2026 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Boundary Tag Codec
//!
//! Every block in the region carries a one-word header and an identical
//! one-word footer packing `{size, flags}`. Block sizes are multiples of
//! [`ALIGNMENT`], so the low three bits of the tag word are free to carry
//! the flag bits. A free block additionally stores its free-list links in
//! the first two words of its payload: the predecessor offset at +0 and
//! the successor offset at +4.
//!
//! All addressing here is byte offsets into a single region slice. A block
//! is named by its payload offset `bp` (one word past its header), which
//! keeps payloads 8-aligned and makes the neighbour arithmetic symmetric:
//!
//! ```text
//!  bp - 4        bp          bp + size - 8   bp + size - 4    bp + size
//!  +-----------+------------------------+----------------+-----------
//!  | header    | payload                | footer         | next header
//!  +-----------+------------------------+----------------+-----------
//! ```
//!
//! Offset 0 of the region holds the padding word and is never a payload,
//! so 0 doubles as the null link.

use crate::align::is_aligned;

/// Header/footer word width in bytes.
pub const WORD_SIZE: usize = 4;

/// Double word size; block sizes are multiples of this.
pub const DWORD_SIZE: usize = 2 * WORD_SIZE;

/// Payload alignment guaranteed to callers.
pub const ALIGNMENT: usize = 8;

/// Per-block overhead: one header word plus one footer word.
pub const OVERHEAD: usize = DWORD_SIZE;

/// Smallest legal block: header, footer, and the two link words a free
/// block needs.
pub const MIN_BLOCK_SIZE: usize = 2 * DWORD_SIZE;

/// The null free-list link.
pub const NULL_LINK: u32 = 0;

/// Mask selecting the size field of a tag word.
pub const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0, "minimum block must stay aligned");
const _: () = assert!(OVERHEAD == 2 * WORD_SIZE, "tag overhead is one header and one footer");

bitflags::bitflags! {
    /// Flag bits carried in the low bits of a tag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u32 {
        /// The block is allocated; clear means free.
        const ALLOCATED = 0b001;
    }
}

/// Read the word at byte offset `off`.
#[inline]
pub fn read_word(region: &[u8], off: usize) -> u32 {
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(&region[off..off + WORD_SIZE]);
    u32::from_le_bytes(word)
}

/// Write the word at byte offset `off`.
#[inline]
pub fn write_word(region: &mut [u8], off: usize, word: u32) {
    region[off..off + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
}

/// Pack a block size and its flags into a tag word.
#[inline]
pub fn pack(size: usize, flags: TagFlags) -> u32 {
    debug_assert!(is_aligned(size, ALIGNMENT));
    size as u32 | flags.bits()
}

/// Split a tag word back into `(size, flags)`.
#[inline]
pub fn unpack(tag: u32) -> (usize, TagFlags) {
    (
        (tag & SIZE_MASK) as usize,
        TagFlags::from_bits_truncate(tag & !SIZE_MASK),
    )
}

/// Byte offset of the header word of the block at payload offset `bp`.
#[inline]
pub fn header_off(bp: usize) -> usize {
    bp - WORD_SIZE
}

/// Byte offset of the footer word of a block at payload offset `bp` whose
/// total size is `size`.
#[inline]
pub fn footer_off(bp: usize, size: usize) -> usize {
    bp + size - DWORD_SIZE
}

/// Total size in bytes of the block at payload offset `bp`.
#[inline]
pub fn block_size(region: &[u8], bp: usize) -> usize {
    unpack(read_word(region, header_off(bp))).0
}

/// Whether the block at payload offset `bp` is allocated.
#[inline]
pub fn is_allocated(region: &[u8], bp: usize) -> bool {
    unpack(read_word(region, header_off(bp))).1.contains(TagFlags::ALLOCATED)
}

/// Whether `bp` names the epilogue sentinel: a zero-size allocated header.
#[inline]
pub fn is_epilogue(region: &[u8], bp: usize) -> bool {
    let (size, flags) = unpack(read_word(region, header_off(bp)));
    size == 0 && flags.contains(TagFlags::ALLOCATED)
}

/// Write only the header word of the block at payload offset `bp`.
///
/// Used for the epilogue sentinel, which has no footer.
#[inline]
pub fn write_header(region: &mut [u8], bp: usize, size: usize, flags: TagFlags) {
    write_word(region, header_off(bp), pack(size, flags));
}

/// Write matching header and footer words for the block at payload offset
/// `bp`, keeping the boundary-tag mirror intact.
#[inline]
pub fn write_tags(region: &mut [u8], bp: usize, size: usize, flags: TagFlags) {
    let tag = pack(size, flags);
    write_word(region, header_off(bp), tag);
    write_word(region, footer_off(bp, size), tag);
}

/// Payload offset of the block following `bp` in address order.
#[inline]
pub fn next_block(region: &[u8], bp: usize) -> usize {
    bp + block_size(region, bp)
}

/// Payload offset of the block preceding `bp` in address order.
///
/// Reads the preceding block's footer, which sits directly below our
/// header. Valid for every block above the prologue.
#[inline]
pub fn prev_block(region: &[u8], bp: usize) -> usize {
    bp - unpack(read_word(region, bp - DWORD_SIZE)).0
}

/// Read the predecessor link of the free block at payload offset `bp`.
#[inline]
pub fn read_pred(region: &[u8], bp: usize) -> u32 {
    read_word(region, bp)
}

/// Read the successor link of the free block at payload offset `bp`.
#[inline]
pub fn read_succ(region: &[u8], bp: usize) -> u32 {
    read_word(region, bp + WORD_SIZE)
}

/// Write the predecessor link of the free block at payload offset `bp`.
#[inline]
pub fn write_pred(region: &mut [u8], bp: usize, pred: u32) {
    write_word(region, bp, pred);
}

/// Write the successor link of the free block at payload offset `bp`.
#[inline]
pub fn write_succ(region: &mut [u8], bp: usize, succ: u32) {
    write_word(region, bp + WORD_SIZE, succ);
}
