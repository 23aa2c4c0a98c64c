//! Memory Zone Manager
//!
//! Every engine owns six independently sized zones: the main heap, the
//! deterministic stack, the non-deterministic (choice-point) stack, the
//! solutions heap, the global heap and the trail. Zones are allocated when
//! the engine starts and freed when it is torn down.
//!
//! Zone bases are staggered by rotating multiples of [`CACHE_SLICE_BYTES`]
//! modulo the primary cache size hint, so the hot ends of different zones do
//! not map onto the same cache sets.

pub mod zone;

pub use zone::{allocate_zone, page_size, Zone};

use std::fmt;
use std::ops::Range;
use tracing::debug;

use crate::config::ZoneLayout;
use crate::error::Result;

/// A machine word. Registers, stack slots and heap cells are all words.
pub type Word = usize;

/// Bytes per [`Word`].
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Granularity of the cache staggering applied to zone bases.
pub const CACHE_SLICE_BYTES: usize = 512;

/// Identifies one of the six zones of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Heap,
    DetStack,
    NondetStack,
    SolutionsHeap,
    GlobalHeap,
    Trail,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; 6] = [
        ZoneKind::Heap,
        ZoneKind::DetStack,
        ZoneKind::NondetStack,
        ZoneKind::SolutionsHeap,
        ZoneKind::GlobalHeap,
        ZoneKind::Trail,
    ];

    fn index(self) -> usize {
        match self {
            Self::Heap => 0,
            Self::DetStack => 1,
            Self::NondetStack => 2,
            Self::SolutionsHeap => 3,
            Self::GlobalHeap => 4,
            Self::Trail => 5,
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => write!(f, "heap"),
            Self::DetStack => write!(f, "detstack"),
            Self::NondetStack => write!(f, "nondetstack"),
            Self::SolutionsHeap => write!(f, "solutions_heap"),
            Self::GlobalHeap => write!(f, "global_heap"),
            Self::Trail => write!(f, "trail"),
        }
    }
}

/// Hands out staggered base offsets for successive zone allocations.
#[derive(Debug, Clone)]
pub struct CacheSlicer {
    cache_bytes: usize,
    next: usize,
}

impl CacheSlicer {
    /// A slicer for the engine in pool slot `engine`, starting where the
    /// previous engine's six zones left off.
    pub fn for_engine(cache_kb: usize, engine: usize) -> Self {
        let cache_bytes = cache_kb.saturating_mul(1024);
        let next = if cache_bytes < CACHE_SLICE_BYTES {
            0
        } else {
            let slices = cache_bytes / CACHE_SLICE_BYTES;
            (engine.wrapping_mul(ZoneKind::ALL.len()) % slices) * CACHE_SLICE_BYTES
        };
        Self { cache_bytes, next }
    }

    pub fn next_offset(&mut self) -> usize {
        let offset = self.next;
        self.next += CACHE_SLICE_BYTES;
        if self.next >= self.cache_bytes {
            self.next = 0;
        }
        offset
    }
}

/// Per-zone description used in reports and pool summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSummary {
    pub kind: ZoneKind,
    /// Host addresses of the whole allocation.
    pub addresses: Range<usize>,
    pub capacity_words: usize,
    pub redzone_words: usize,
    /// Words used at the high-water mark.
    pub max_used_words: usize,
}

/// The six zones owned by one engine.
pub struct ZoneSet {
    zones: Vec<Zone>,
}

impl ZoneSet {
    /// Allocate all six zones according to `layout`.
    pub fn allocate(layout: &ZoneLayout, slicer: &mut CacheSlicer) -> Result<Self> {
        let mut zones = Vec::with_capacity(ZoneKind::ALL.len());
        for kind in ZoneKind::ALL {
            let size = layout.get(kind);
            zones.push(Zone::allocate(
                kind,
                size.size_kb,
                size.redzone_kb,
                slicer.next_offset(),
            )?);
        }
        debug!(zones = zones.len(), "Zone set allocated");
        Ok(Self { zones })
    }

    pub fn get(&self, kind: ZoneKind) -> &Zone {
        &self.zones[kind.index()]
    }

    pub fn get_mut(&mut self, kind: ZoneKind) -> &mut Zone {
        &mut self.zones[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    /// Forget earlier high-water marks (start of a measured run).
    pub fn reset_high_water(&mut self) {
        for zone in &mut self.zones {
            zone.reset_high_water();
        }
    }

    pub fn summary(&self) -> Vec<ZoneSummary> {
        self.zones
            .iter()
            .map(|zone| ZoneSummary {
                kind: zone.kind(),
                addresses: zone.address_range(),
                capacity_words: zone.capacity(),
                redzone_words: zone.redzone_words(),
                max_used_words: zone.high_water() - zone.base(),
            })
            .collect()
    }
}

impl fmt::Debug for ZoneSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.zones.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneSize;

    fn small_layout() -> ZoneLayout {
        let mut layout = ZoneLayout::default();
        for kind in ZoneKind::ALL {
            *layout.get_mut(kind) = ZoneSize {
                size_kb: 8,
                redzone_kb: 4,
            };
        }
        layout
    }

    #[test]
    fn test_zone_set_has_all_kinds() {
        let mut slicer = CacheSlicer::for_engine(8192, 0);
        let set = ZoneSet::allocate(&small_layout(), &mut slicer).unwrap();
        let kinds: Vec<_> = set.iter().map(|z| z.kind()).collect();
        assert_eq!(kinds, ZoneKind::ALL.to_vec());
        for kind in ZoneKind::ALL {
            assert_eq!(set.get(kind).kind(), kind);
        }
    }

    #[test]
    fn test_independent_sizes() {
        let mut layout = small_layout();
        layout.get_mut(ZoneKind::Heap).size_kb = 64;
        let mut slicer = CacheSlicer::for_engine(8192, 0);
        let set = ZoneSet::allocate(&layout, &mut slicer).unwrap();
        assert!(set.get(ZoneKind::Heap).capacity() > set.get(ZoneKind::Trail).capacity());
    }

    #[test]
    fn test_slicer_staggers_and_wraps() {
        let mut slicer = CacheSlicer::for_engine(1, 0);
        assert_eq!(slicer.next_offset(), 0);
        assert_eq!(slicer.next_offset(), 512);
        assert_eq!(slicer.next_offset(), 0);
    }

    #[test]
    fn test_slicer_engine_start_differs() {
        let mut first = CacheSlicer::for_engine(8192, 0);
        let mut second = CacheSlicer::for_engine(8192, 1);
        assert_ne!(first.next_offset(), second.next_offset());
    }

    #[test]
    fn test_zero_cache_hint_means_no_offset() {
        let mut slicer = CacheSlicer::for_engine(0, 3);
        assert_eq!(slicer.next_offset(), 0);
        assert_eq!(slicer.next_offset(), 0);
    }

    #[test]
    fn test_summary_reports_usage() {
        let mut slicer = CacheSlicer::for_engine(8192, 0);
        let mut set = ZoneSet::allocate(&small_layout(), &mut slicer).unwrap();
        set.get_mut(ZoneKind::DetStack).push(7).unwrap();
        let summary = set.summary();
        let det = summary
            .iter()
            .find(|s| s.kind == ZoneKind::DetStack)
            .unwrap();
        assert_eq!(det.max_used_words, 1);
    }
}
