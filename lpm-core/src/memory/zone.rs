//! A single bounded memory zone with an overflow redzone
//!
//! Zones are word-addressed. Index `base` is the first usable word, every
//! index in `[redzone_limit, limit)` belongs to the redzone. Touching the
//! redzone is reported as [`RuntimeError::ZoneOverflow`] through an explicit
//! bounds check on every access.

use nix::unistd::{sysconf, SysconfVar};
use std::ops::Range;
use std::sync::OnceLock;
use tracing::debug;

use super::{Word, ZoneKind, WORD_BYTES};
use crate::error::{Result, RuntimeError};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Platform page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    })
}

fn round_up(bytes: usize, align: usize) -> Option<usize> {
    let rem = bytes % align;
    if rem == 0 {
        Some(bytes)
    } else {
        bytes.checked_add(align - rem)
    }
}

/// Allocate a zone of `size_kb` usable kilobytes followed by a
/// `redzone_kb` kilobyte guard margin. Both are rounded up to whole pages.
pub fn allocate_zone(kind: ZoneKind, size_kb: usize, redzone_kb: usize) -> Result<Zone> {
    Zone::allocate(kind, size_kb, redzone_kb, 0)
}

/// A contiguous region used as a stack or heap.
pub struct Zone {
    kind: ZoneKind,
    words: Box<[Word]>,
    base: usize,
    redzone_limit: usize,
    top: usize,
    high_water: usize,
}

impl Zone {
    /// Allocate a zone whose base is shifted by `offset_bytes` into the
    /// allocation (used for cache-slice staggering).
    pub(crate) fn allocate(
        kind: ZoneKind,
        size_kb: usize,
        redzone_kb: usize,
        offset_bytes: usize,
    ) -> Result<Self> {
        let page = page_size();
        let too_large = || RuntimeError::Resource {
            zone: kind,
            requested: usize::MAX,
        };
        let size = size_kb
            .checked_mul(1024)
            .and_then(|b| round_up(b, page))
            .ok_or_else(too_large)?;
        let redzone = redzone_kb
            .checked_mul(1024)
            .and_then(|b| round_up(b, page))
            .ok_or_else(too_large)?;
        let offset = round_up(offset_bytes, WORD_BYTES).ok_or_else(too_large)?;
        let total_bytes = offset
            .checked_add(size)
            .and_then(|b| b.checked_add(redzone))
            .ok_or_else(too_large)?;

        let total_words = total_bytes / WORD_BYTES;
        let mut words: Vec<Word> = Vec::new();
        words
            .try_reserve_exact(total_words)
            .map_err(|_| RuntimeError::Resource {
                zone: kind,
                requested: total_bytes,
            })?;
        words.resize(total_words, 0);

        let base = offset / WORD_BYTES;
        let redzone_limit = total_words - redzone / WORD_BYTES;
        debug!(
            zone = %kind,
            size_bytes = size,
            redzone_bytes = redzone,
            offset_bytes = offset,
            "Zone allocated"
        );

        Ok(Self {
            kind,
            words: words.into_boxed_slice(),
            base,
            redzone_limit,
            top: base,
            high_water: base,
        })
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// First usable word index.
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last word of the allocation (redzone included).
    pub fn limit(&self) -> usize {
        self.words.len()
    }

    /// First word index of the redzone.
    pub fn redzone_limit(&self) -> usize {
        self.redzone_limit
    }

    /// Redzone size in words.
    pub fn redzone_words(&self) -> usize {
        self.limit() - self.redzone_limit
    }

    /// Usable size in words.
    pub fn capacity(&self) -> usize {
        self.redzone_limit - self.base
    }

    /// Index of the next free word.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Highest `top` observed since allocation or the last reset.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn reset_high_water(&mut self) {
        self.high_water = self.top;
    }

    /// Host byte addresses spanned by the allocation, redzone included.
    pub fn address_range(&self) -> Range<usize> {
        let start = self.words.as_ptr() as usize;
        start..start + self.words.len() * WORD_BYTES
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.base {
            return Err(RuntimeError::ZoneUnderflow {
                zone: self.kind,
                index,
            });
        }
        if index >= self.redzone_limit {
            return Err(RuntimeError::ZoneOverflow {
                zone: self.kind,
                index,
            });
        }
        Ok(())
    }

    pub fn read(&self, index: usize) -> Result<Word> {
        self.check(index)?;
        Ok(self.words[index])
    }

    pub fn write(&mut self, index: usize, value: Word) -> Result<()> {
        self.check(index)?;
        self.words[index] = value;
        Ok(())
    }

    /// Move the top pointer. A top equal to `redzone_limit` means full.
    pub fn set_top(&mut self, top: usize) -> Result<()> {
        if top < self.base {
            return Err(RuntimeError::ZoneUnderflow {
                zone: self.kind,
                index: top,
            });
        }
        if top > self.redzone_limit {
            return Err(RuntimeError::ZoneOverflow {
                zone: self.kind,
                index: top - 1,
            });
        }
        self.top = top;
        self.high_water = self.high_water.max(top);
        Ok(())
    }

    /// Reserve `count` words at the top, returning the first index.
    pub fn alloc(&mut self, count: usize) -> Result<usize> {
        let start = self.top;
        let end = start.checked_add(count).ok_or(RuntimeError::ZoneOverflow {
            zone: self.kind,
            index: usize::MAX,
        })?;
        self.set_top(end)?;
        Ok(start)
    }

    pub fn push(&mut self, value: Word) -> Result<usize> {
        let index = self.top;
        self.write(index, value)?;
        self.set_top(index + 1)?;
        Ok(index)
    }

    pub fn pop(&mut self) -> Result<Word> {
        if self.top <= self.base {
            return Err(RuntimeError::ZoneUnderflow {
                zone: self.kind,
                index: self.top,
            });
        }
        self.top -= 1;
        self.read(self.top)
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("top", &self.top)
            .field("redzone_limit", &self.redzone_limit)
            .field("limit", &self.limit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_below_redzone_succeeds() {
        let mut zone = allocate_zone(ZoneKind::Heap, 64, 16).unwrap();
        let last = zone.limit() - zone.redzone_words() - 1;
        assert!(zone.write(last, 0xdead).is_ok());
        assert_eq!(zone.read(last).unwrap(), 0xdead);
    }

    #[test]
    fn test_write_into_redzone_is_overflow() {
        let mut zone = allocate_zone(ZoneKind::DetStack, 64, 16).unwrap();
        let first_guarded = zone.limit() - zone.redzone_words();
        match zone.write(first_guarded, 1) {
            Err(RuntimeError::ZoneOverflow { zone: kind, index }) => {
                assert_eq!(kind, ZoneKind::DetStack);
                assert_eq!(index, first_guarded);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_top_starts_at_base() {
        let zone = allocate_zone(ZoneKind::Trail, 8, 4).unwrap();
        assert_eq!(zone.top(), zone.base());
        assert_eq!(zone.base(), 0);
    }

    #[test]
    fn test_sizes_rounded_to_pages() {
        let page = page_size();
        let zone = allocate_zone(ZoneKind::SolutionsHeap, 1, 1).unwrap();
        assert_eq!((zone.capacity() * WORD_BYTES) % page, 0);
        assert_eq!((zone.redzone_words() * WORD_BYTES) % page, 0);
        assert!(zone.capacity() * WORD_BYTES >= 1024);
    }

    #[test]
    fn test_push_pop_and_underflow() {
        let mut zone = allocate_zone(ZoneKind::DetStack, 4, 4).unwrap();
        zone.push(1).unwrap();
        zone.push(2).unwrap();
        assert_eq!(zone.pop().unwrap(), 2);
        assert_eq!(zone.pop().unwrap(), 1);
        assert!(matches!(
            zone.pop(),
            Err(RuntimeError::ZoneUnderflow { .. })
        ));
        assert_eq!(zone.high_water(), 2);
    }

    #[test]
    fn test_alloc_past_capacity_overflows() {
        let mut zone = allocate_zone(ZoneKind::GlobalHeap, 4, 4).unwrap();
        let cap = zone.capacity();
        assert_eq!(zone.alloc(cap).unwrap(), 0);
        assert!(matches!(
            zone.alloc(1),
            Err(RuntimeError::ZoneOverflow { .. })
        ));
    }

    #[test]
    fn test_offset_shifts_base() {
        let zone = Zone::allocate(ZoneKind::Heap, 4, 4, 1024).unwrap();
        assert_eq!(zone.base(), 1024 / WORD_BYTES);
        assert_eq!(zone.top(), zone.base());
        let mut zone = zone;
        let below = zone.base() - 1;
        assert!(matches!(
            zone.write(below, 0),
            Err(RuntimeError::ZoneUnderflow { .. })
        ));
    }

    #[test]
    fn test_absurd_size_is_resource_error() {
        let err = allocate_zone(ZoneKind::Heap, usize::MAX / 512, 16).unwrap_err();
        assert!(matches!(err, RuntimeError::Resource { zone: ZoneKind::Heap, .. }));
    }
}
