//! Per-region bookkeeping for sliding compaction.
//!
//! Marking records how many live words each region holds. The serial summary
//! then streams the live data of one or more source spaces into a destination
//! space, assigning each source region the address its first live word moves
//! to. Destinations never lie above their sources, so a region can be filled
//! as soon as every region it must send data to has itself been filled.
//!
//! The start of old is left alone when it is densely live: regions up to the
//! dense prefix end keep their objects where they are, their dead gaps are
//! overwritten with filler objects, and sliding begins at the prefix end.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::heap::address::Address;
use crate::heap::space::SpaceId;
use crate::heap::Heap;

const NO_SOURCE: usize = usize::MAX;

/// Where live data ends up during a full collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionPlan {
    /// Old and all young spaces slide into old, leaving the young generation empty.
    IntoOld,
    /// Old compacts in place; eden and both survivors slide into eden.
    YoungIntoEden,
    /// Every space compacts in place, except that the survivors are merged
    /// into survivor 0 when their data fits there.
    InPlace {
        /// Survivor 1's data moved into survivor 0.
        survivors_merged: bool,
    },
}

/// How a region that needs filling gets its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// Not picked up by any worker yet.
    Unused = 0,
    /// A worker is filling a shadow region in its place.
    Shadow = 1,
    /// Its data is complete in a shadow region and awaits copying back.
    Filled = 2,
    /// Its shadow data has been copied back.
    Copied = 3,
    /// Filled directly.
    Normal = 4,
}

impl RegionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Shadow,
            2 => Self::Filled,
            3 => Self::Copied,
            4 => Self::Normal,
            _ => Self::Unused,
        }
    }
}

/// Bookkeeping for one region.
#[derive(Debug)]
pub struct RegionData {
    live_words: AtomicUsize,
    partial_obj_size: AtomicUsize,
    destination: AtomicUsize,
    destination_count: AtomicUsize,
    first_source: AtomicUsize,
    source_skip: AtomicUsize,
    fill_words: AtomicUsize,
    needs_fill: AtomicBool,
    claimed: AtomicBool,
    state: AtomicU8,
    shadow_region: AtomicUsize,
}

impl RegionData {
    fn new() -> Self {
        Self {
            live_words: AtomicUsize::new(0),
            partial_obj_size: AtomicUsize::new(0),
            destination: AtomicUsize::new(0),
            destination_count: AtomicUsize::new(0),
            first_source: AtomicUsize::new(NO_SOURCE),
            source_skip: AtomicUsize::new(0),
            fill_words: AtomicUsize::new(0),
            needs_fill: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            state: AtomicU8::new(RegionState::Unused as u8),
            shadow_region: AtomicUsize::new(0),
        }
    }

    fn clear(&self) {
        self.live_words.store(0, Ordering::Relaxed);
        self.partial_obj_size.store(0, Ordering::Relaxed);
        self.destination.store(0, Ordering::Relaxed);
        self.destination_count.store(0, Ordering::Relaxed);
        self.first_source.store(NO_SOURCE, Ordering::Relaxed);
        self.source_skip.store(0, Ordering::Relaxed);
        self.fill_words.store(0, Ordering::Relaxed);
        self.needs_fill.store(false, Ordering::Relaxed);
        self.claimed.store(false, Ordering::Relaxed);
        self.state.store(RegionState::Unused as u8, Ordering::Relaxed);
        self.shadow_region.store(0, Ordering::Relaxed);
    }

    /// Live words in the region, including the tail of an object that began
    /// in an earlier region.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.live_words.load(Ordering::Relaxed)
    }

    /// Words at the start of the region belonging to an object that began earlier.
    #[must_use]
    pub fn partial_obj_size(&self) -> usize {
        self.partial_obj_size.load(Ordering::Relaxed)
    }

    /// New address of the region's first live word.
    #[must_use]
    pub fn destination(&self) -> Address {
        Address::from_usize(self.destination.load(Ordering::Relaxed))
    }

    /// Number of other regions this region's data is copied into and which
    /// have not been filled yet.
    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.destination_count.load(Ordering::Acquire)
    }

    /// First source region filling this region, and how many of its live
    /// words go to earlier destinations.
    #[must_use]
    pub fn first_source(&self) -> Option<(usize, usize)> {
        let region = self.first_source.load(Ordering::Relaxed);
        (region != NO_SOURCE).then(|| (region, self.source_skip.load(Ordering::Relaxed)))
    }

    /// Words of the region written by its fill.
    #[must_use]
    pub fn fill_words(&self) -> usize {
        self.fill_words.load(Ordering::Relaxed)
    }

    /// Whether the region lies below a new top and must be filled.
    #[must_use]
    pub fn needs_fill(&self) -> bool {
        self.needs_fill.load(Ordering::Relaxed)
    }

    /// Drop one pending destination. True if this made the region available.
    pub(crate) fn decrement_destination_count(&self) -> bool {
        let prev = self.destination_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "destination count underflow");
        prev == 1
    }

    /// Take the right to finish this region. Succeeds for exactly one caller,
    /// and only once no other region still waits for data from it.
    pub(crate) fn claim(&self) -> bool {
        self.destination_count() == 0
            && self
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Whether some worker has claimed the region.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Current fill state.
    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: RegionState, to: RegionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Commit to filling the region directly.
    pub(crate) fn mark_normal(&self) -> bool {
        self.transition(RegionState::Unused, RegionState::Normal)
    }

    /// Commit to filling the region through a shadow.
    pub(crate) fn mark_shadow(&self) -> bool {
        self.transition(RegionState::Unused, RegionState::Shadow)
    }

    /// Publish the finished shadow. Its index must already be recorded.
    pub(crate) fn mark_filled(&self) {
        let published = self.transition(RegionState::Shadow, RegionState::Filled);
        debug_assert!(published, "region was not being shadowed");
    }

    /// Take the right to copy the shadow back. Succeeds for exactly one caller,
    /// and only after the shadow has been filled.
    pub(crate) fn mark_copied(&self) -> bool {
        self.transition(RegionState::Filled, RegionState::Copied)
    }

    /// Fall back to a direct fill after no shadow could be had.
    pub(crate) fn shadow_to_normal(&self) {
        let reverted = self.transition(RegionState::Shadow, RegionState::Normal);
        debug_assert!(reverted, "region was not being shadowed");
    }

    /// Shadow region holding this region's data.
    #[must_use]
    pub fn shadow_region(&self) -> usize {
        self.shadow_region.load(Ordering::Relaxed)
    }

    pub(crate) fn set_shadow_region(&self, shadow: usize) {
        self.shadow_region.store(shadow, Ordering::Relaxed);
    }
}

/// Result of the serial summary phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// The chosen plan.
    pub plan: CompactionPlan,
    /// New top of each space, in address order (old, eden, survivor 0, survivor 1).
    pub new_tops: [Address; 4],
    /// Regions that can be filled immediately.
    pub available: Vec<usize>,
    /// Objects of old below this address do not move.
    pub dense_prefix_end: Address,
}

impl Summary {
    /// New top of `id`.
    #[must_use]
    pub const fn new_top(&self, id: SpaceId) -> Address {
        self.new_tops[space_index(id)]
    }
}

const fn space_index(id: SpaceId) -> usize {
    match id {
        SpaceId::Old => 0,
        SpaceId::Eden => 1,
        SpaceId::Survivor0 => 2,
        SpaceId::Survivor1 => 3,
    }
}

/// Region table for the whole heap.
#[derive(Debug)]
pub struct ParallelCompactData {
    base: Address,
    region_words: usize,
    regions: Box<[RegionData]>,
    dense_prefix_end: AtomicUsize,
}

impl ParallelCompactData {
    /// Cleared data for every region of `heap`.
    #[must_use]
    pub fn new(heap: &Heap) -> Self {
        Self {
            base: heap.base(),
            region_words: heap.region_words(),
            regions: (0..heap.num_regions()).map(|_| RegionData::new()).collect(),
            dense_prefix_end: AtomicUsize::new(heap.base().as_usize()),
        }
    }

    /// Number of regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Words per region.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.region_words
    }

    /// Data for region `index`.
    #[must_use]
    pub fn region(&self, index: usize) -> &RegionData {
        &self.regions[index]
    }

    /// Region containing `addr`.
    #[must_use]
    pub fn addr_to_region(&self, addr: Address) -> usize {
        addr.words_from(self.base) / self.region_words
    }

    /// First word of region `index`.
    #[must_use]
    pub fn region_to_addr(&self, index: usize) -> Address {
        self.base.add_words(index * self.region_words)
    }

    /// End of the dense prefix chosen by the last summary.
    #[must_use]
    pub fn dense_prefix_end(&self) -> Address {
        Address::from_usize(self.dense_prefix_end.load(Ordering::Relaxed))
    }

    /// Whether region `index` lies in the dense prefix.
    #[must_use]
    pub fn in_dense_prefix(&self, index: usize) -> bool {
        self.region_to_addr(index) < self.dense_prefix_end()
    }

    /// Record a marked object of `words` words at `addr`.
    ///
    /// Each region it overlaps is credited with the overlapping words; every
    /// region after the first also learns the size of the object's tail at
    /// its start.
    pub fn add_obj(&self, addr: Address, words: usize) {
        let end = addr.add_words(words);
        let first = self.addr_to_region(addr);
        let last = self.addr_to_region(end.sub_words(1));
        if first == last {
            self.regions[first]
                .live_words
                .fetch_add(words, Ordering::Relaxed);
            return;
        }
        let first_end = self.region_to_addr(first + 1);
        self.regions[first]
            .live_words
            .fetch_add(first_end.words_from(addr), Ordering::Relaxed);
        for region in first + 1..=last {
            let beg = self.region_to_addr(region);
            let overlap = end.min(beg.add_words(self.region_words)).words_from(beg);
            let data = &self.regions[region];
            data.live_words.fetch_add(overlap, Ordering::Relaxed);
            data.partial_obj_size.store(overlap, Ordering::Relaxed);
        }
    }

    fn space_live_words(&self, heap: &Heap, id: SpaceId) -> usize {
        self.regions_in(heap, id)
            .map(|r| self.regions[r].data_size())
            .sum()
    }

    /// Regions covering the used part of a space.
    fn regions_in(&self, heap: &Heap, id: SpaceId) -> std::ops::Range<usize> {
        let space = heap.space(id);
        let first = self.addr_to_region(space.bottom());
        if space.is_empty() {
            return first..first;
        }
        first..self.addr_to_region(space.top().sub_words(1)) + 1
    }

    /// Pick a plan and compute destinations, destination counts and first
    /// sources for every region. Must run after marking and before forwarding.
    ///
    /// Up to `dead_ratio` percent of old's capacity may be left dead inside
    /// the dense prefix; those gaps become filler objects.
    pub fn summarize(&self, heap: &Heap, dead_ratio: u8) -> Summary {
        let live = |id| self.space_live_words(heap, id);
        let young_live = live(SpaceId::Eden) + live(SpaceId::Survivor0) + live(SpaceId::Survivor1);
        let survivors_live = live(SpaceId::Survivor0) + live(SpaceId::Survivor1);

        let old_bottom = heap.old().bottom();
        let prefix_end = self.dense_prefix(heap, dead_ratio);
        let prefix_live: usize = (self.addr_to_region(old_bottom)..self.addr_to_region(prefix_end))
            .map(|r| self.regions[r].data_size())
            .sum();
        let prefix_waste = prefix_end.words_from(old_bottom) - prefix_live;

        let young = [SpaceId::Eden, SpaceId::Survivor0, SpaceId::Survivor1];
        let (plan, groups): (CompactionPlan, Vec<(SpaceId, Vec<SpaceId>)>) =
            if live(SpaceId::Old) + prefix_waste + young_live <= heap.old().capacity_words() {
                let mut all = vec![SpaceId::Old];
                all.extend(young);
                (CompactionPlan::IntoOld, vec![(SpaceId::Old, all)])
            } else if young_live <= heap.eden().capacity_words() {
                (
                    CompactionPlan::YoungIntoEden,
                    vec![(SpaceId::Old, vec![SpaceId::Old]), (SpaceId::Eden, young.to_vec())],
                )
            } else {
                let merged =
                    survivors_live <= heap.space(SpaceId::Survivor0).capacity_words();
                let mut groups = vec![
                    (SpaceId::Old, vec![SpaceId::Old]),
                    (SpaceId::Eden, vec![SpaceId::Eden]),
                ];
                if merged {
                    groups.push((
                        SpaceId::Survivor0,
                        vec![SpaceId::Survivor0, SpaceId::Survivor1],
                    ));
                } else {
                    groups.push((SpaceId::Survivor0, vec![SpaceId::Survivor0]));
                    groups.push((SpaceId::Survivor1, vec![SpaceId::Survivor1]));
                }
                (
                    CompactionPlan::InPlace {
                        survivors_merged: merged,
                    },
                    groups,
                )
            };

        let mut new_tops = [Address::NULL; 4];
        for space in heap.spaces() {
            new_tops[space_index(space.id())] = space.bottom();
        }
        self.fill_dense_prefix_gaps(heap, prefix_end);
        for region in self.addr_to_region(old_bottom)..self.addr_to_region(prefix_end) {
            self.regions[region]
                .destination
                .store(self.region_to_addr(region).as_usize(), Ordering::Relaxed);
        }
        self.dense_prefix_end
            .store(prefix_end.as_usize(), Ordering::Relaxed);
        for (dest, sources) in &groups {
            let start = if *dest == SpaceId::Old {
                prefix_end
            } else {
                heap.space(*dest).bottom()
            };
            let new_top = self.summarize_group(heap, *dest, start, sources);
            new_tops[space_index(*dest)] = new_top;
        }

        let available = (0..self.regions.len())
            .filter(|&r| {
                let data = &self.regions[r];
                data.needs_fill() && data.destination_count() == 0
            })
            .collect();
        Summary {
            plan,
            new_tops,
            available,
            dense_prefix_end: prefix_end,
        }
    }

    /// End of the longest run of old regions, starting at its bottom, whose
    /// dead words together stay within `dead_ratio` percent of old. The region
    /// holding old's top never joins the prefix.
    fn dense_prefix(&self, heap: &Heap, dead_ratio: u8) -> Address {
        let old = heap.old();
        let mut allowed = old.capacity_words() * usize::from(dead_ratio) / 100;
        let first = self.addr_to_region(old.bottom());
        let mut end = first;
        for region in first..self.addr_to_region(old.top()) {
            let dead = self.region_words - self.regions[region].data_size();
            if dead > allowed {
                break;
            }
            allowed -= dead;
            end = region + 1;
        }
        self.region_to_addr(end)
    }

    /// Overwrite every dead range in `[old bottom, end)` with a filler so the
    /// prefix stays parsable without moving anything.
    fn fill_dense_prefix_gaps(&self, heap: &Heap, end: Address) {
        let bitmap = heap.mark_bitmap();
        let heap_end = heap.end();
        let mut cur = heap.old().bottom();
        while cur < end {
            let obj = bitmap.find_obj_beg(cur, end);
            if obj > cur {
                heap.fill_with_object(cur, obj.words_from(cur));
            }
            if obj >= end {
                break;
            }
            cur = bitmap.find_obj_end(obj, heap_end).add_words(1);
        }
    }

    /// Stream the regions of `sources` from `start` on into `dest`, beginning
    /// at `start`; returns the new top of `dest`.
    fn summarize_group(
        &self,
        heap: &Heap,
        dest: SpaceId,
        start: Address,
        sources: &[SpaceId],
    ) -> Address {
        let first_region = self.addr_to_region(start);
        let mut cursor = start;
        for &source in sources {
            debug_assert!(heap.space(source).bottom() >= heap.space(dest).bottom());
            let regions = self.regions_in(heap, source);
            for region in regions.start.max(first_region)..regions.end {
                let data = &self.regions[region];
                let size = data.data_size();
                data.destination
                    .store(cursor.as_usize(), Ordering::Relaxed);
                if size == 0 {
                    continue;
                }
                let first_dest = self.addr_to_region(cursor);
                let last_dest = self.addr_to_region(cursor.add_words(size - 1));
                debug_assert!(last_dest <= region, "destination above source");
                let mut count = 0;
                for d in first_dest..=last_dest {
                    let target = &self.regions[d];
                    if target.first_source.load(Ordering::Relaxed) == NO_SOURCE {
                        let beg = self.region_to_addr(d);
                        let skip = if beg > cursor { beg.words_from(cursor) } else { 0 };
                        target.first_source.store(region, Ordering::Relaxed);
                        target.source_skip.store(skip, Ordering::Relaxed);
                    }
                    if d != region {
                        count += 1;
                    }
                }
                data.destination_count.store(count, Ordering::Relaxed);
                cursor = cursor.add_words(size);
            }
        }
        debug_assert!(cursor <= heap.space(dest).end());

        let mut region_beg = start;
        while region_beg < cursor {
            let region = self.addr_to_region(region_beg);
            let region_end = region_beg.add_words(self.region_words);
            let data = &self.regions[region];
            data.fill_words
                .store(region_end.min(cursor).words_from(region_beg), Ordering::Relaxed);
            data.needs_fill.store(true, Ordering::Relaxed);
            region_beg = region_end;
        }
        cursor
    }

    /// Forget everything for the next collection.
    pub fn clear(&self) {
        for region in &*self.regions {
            region.clear();
        }
    }
}
