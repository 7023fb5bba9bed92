//! # The PFN Database
//!
//! One [`MmPfn`] record per physical page between the lowest and highest
//! page the scan observed. Records on a list are threaded through their own
//! link fields using frame numbers (not pointers), with `u64::MAX` as the
//! list terminator.
//!
//! Six canonical lists carry every represented page: zeroed, free, standby,
//! modified, modified-read-only, bad. Free pages are additionally threaded
//! onto one of the per-color secondary lists — the page's low frame bits
//! pick the color — so consecutive allocations spread across cache sets.

use crate::SECONDARY_COLORS;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PageFrameNumber;

/// List terminator sentinel.
pub const PFN_LIST_END: u64 = u64::MAX;

/// The canonical PFN lists.
#[repr(usize)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PfnListId {
    Zeroed = 0,
    Free,
    Standby,
    Modified,
    ModifiedReadOnly,
    Bad,
}

/// Packed per-frame flag word.
///
/// `pte_frame` holds the frame of the page table that maps this page; the
/// remaining bits mark special ownership states.
#[bitfield(u64, order = Lsb)]
pub struct PfnFrameWord {
    /// Bits 0–56 — frame of the page table mapping this page.
    #[bits(57)]
    pub pte_frame: u64,

    /// Bit 57 — an in-page I/O error was observed.
    pub in_page_error: bool,

    /// Bit 58 — page charged to the driver verifier.
    pub verifier_allocation: bool,

    /// Bit 59 — page owned by an AWE allocation.
    pub awe_allocation: bool,

    /// Bit 60 — page charged against a lock quota.
    pub lock_charged: bool,

    /// Bit 61 — page backs a kernel stack.
    pub kernel_stack: bool,

    /// Bit 62 — page must stay cacheable.
    pub must_be_cached: bool,

    /// Bit 63 — unused.
    pub reserved: bool,
}

/// Location/state tag of a PFN record.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PfnState {
    /// Not on any list; not yet represented.
    Unused = 0,
    /// On one of the canonical lists.
    Listed,
    /// Actively mapped; `u2` is the share count.
    Active,
}

/// One physical page's bookkeeping record.
///
/// The first three words are unions in spirit: while the page sits on a
/// list, `u1`/`u2` are the forward/backward frame links; while it is
/// active, `u2` is the share count and `u1` is free for the working-set
/// index, event pointer, read status or next-stack link.
#[repr(C)]
#[derive(Debug)]
pub struct MmPfn {
    /// Forward link / WS index / event pointer / read status / next stack
    /// frame.
    pub u1: u64,
    /// Address of the PTE mapping this page.
    pub pte_address: u64,
    /// Backward link / share count.
    pub u2: u64,
    /// State tag and entry flags.
    pub state: PfnState,
    /// Which list the record is on while [`PfnState::Listed`].
    pub list: PfnListId,
    /// Original PTE contents / AWE reference count.
    pub original_pte: u64,
    /// Packed frame word.
    pub frame_word: PfnFrameWord,
}

impl MmPfn {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            u1: PFN_LIST_END,
            pte_address: 0,
            u2: PFN_LIST_END,
            state: PfnState::Unused,
            list: PfnListId::Free,
            original_pte: 0,
            frame_word: PfnFrameWord::new(),
        }
    }
}

impl Default for MmPfn {
    fn default() -> Self {
        Self::new()
    }
}

/// Head/tail/count of one canonical list.
#[derive(Debug)]
struct PfnListHead {
    head: u64,
    tail: u64,
    count: u64,
}

impl PfnListHead {
    const fn new() -> Self {
        Self {
            head: PFN_LIST_END,
            tail: PFN_LIST_END,
            count: 0,
        }
    }
}

/// The PFN database over a caller-provided record array.
///
/// `records[0]` describes `lowest_page`; the array covers every page up to
/// and including `highest_page`.
pub struct PfnDatabase<'a> {
    records: &'a mut [MmPfn],
    lowest_page: u64,
    lists: [PfnListHead; 6],
    color_heads: [u64; SECONDARY_COLORS],
}

impl<'a> PfnDatabase<'a> {
    /// Wraps a zero-initialized record array covering
    /// `[lowest_page, lowest_page + records.len())`.
    #[must_use]
    pub fn new(records: &'a mut [MmPfn], lowest_page: u64) -> Self {
        for record in records.iter_mut() {
            *record = MmPfn::new();
        }
        Self {
            records,
            lowest_page,
            lists: [
                PfnListHead::new(),
                PfnListHead::new(),
                PfnListHead::new(),
                PfnListHead::new(),
                PfnListHead::new(),
                PfnListHead::new(),
            ],
            color_heads: [PFN_LIST_END; SECONDARY_COLORS],
        }
    }

    fn index(&self, pfn: PageFrameNumber) -> usize {
        usize::try_from(pfn.as_u64() - self.lowest_page).expect("frame within database")
    }

    /// The record for `pfn`.
    #[must_use]
    pub fn record(&self, pfn: PageFrameNumber) -> &MmPfn {
        &self.records[self.index(pfn)]
    }

    /// The record for `pfn`, mutably.
    #[must_use]
    pub fn record_mut(&mut self, pfn: PageFrameNumber) -> &mut MmPfn {
        let index = self.index(pfn);
        &mut self.records[index]
    }

    /// Number of pages on `list`.
    #[must_use]
    pub const fn list_count(&self, list: PfnListId) -> u64 {
        self.lists[list as usize].count
    }

    /// The cache color of a frame.
    #[must_use]
    pub const fn color_of(pfn: PageFrameNumber) -> usize {
        (pfn.as_u64() as usize) & (SECONDARY_COLORS - 1)
    }

    /// Appends `pfn` to the tail of `list`.
    ///
    /// Free pages also join their color's secondary list.
    ///
    /// # Panics
    /// If the record is already on a list.
    pub fn insert_page(&mut self, list: PfnListId, pfn: PageFrameNumber) {
        let frame = pfn.as_u64();
        let index = self.index(pfn);
        assert_eq!(
            self.records[index].state,
            PfnState::Unused,
            "page already represented"
        );

        let old_tail = self.lists[list as usize].tail;
        self.records[index].u1 = PFN_LIST_END;
        self.records[index].u2 = old_tail;
        self.records[index].state = PfnState::Listed;
        self.records[index].list = list;

        if old_tail == PFN_LIST_END {
            self.lists[list as usize].head = frame;
        } else {
            let tail_index = self.index(PageFrameNumber(old_tail));
            self.records[tail_index].u1 = frame;
        }
        let head = &mut self.lists[list as usize];
        head.tail = frame;
        head.count += 1;

        if list == PfnListId::Free {
            let color = Self::color_of(pfn);
            // Colored lists are singly linked through the original-PTE word,
            // which a free page has no other use for.
            self.records[index].original_pte = self.color_heads[color];
            self.color_heads[color] = frame;
        }
    }

    /// Unlinks `pfn` from whatever canonical list it is on.
    ///
    /// # Panics
    /// If the record is not on a list.
    pub fn remove_page(&mut self, pfn: PageFrameNumber) {
        let index = self.index(pfn);
        assert_eq!(self.records[index].state, PfnState::Listed, "page not listed");

        let list = self.records[index].list;
        let forward = self.records[index].u1;
        let backward = self.records[index].u2;

        if backward == PFN_LIST_END {
            self.lists[list as usize].head = forward;
        } else {
            let back_index = self.index(PageFrameNumber(backward));
            self.records[back_index].u1 = forward;
        }
        if forward == PFN_LIST_END {
            self.lists[list as usize].tail = backward;
        } else {
            let forward_index = self.index(PageFrameNumber(forward));
            self.records[forward_index].u2 = backward;
        }
        self.lists[list as usize].count -= 1;

        if list == PfnListId::Free {
            self.unlink_colored(pfn);
        }

        self.records[index].u1 = PFN_LIST_END;
        self.records[index].u2 = PFN_LIST_END;
        self.records[index].state = PfnState::Unused;
    }

    fn unlink_colored(&mut self, pfn: PageFrameNumber) {
        let frame = pfn.as_u64();
        let color = Self::color_of(pfn);
        let mut cursor = self.color_heads[color];
        if cursor == frame {
            self.color_heads[color] = self.record(pfn).original_pte;
            return;
        }
        while cursor != PFN_LIST_END {
            let next = self.record(PageFrameNumber(cursor)).original_pte;
            if next == frame {
                let next_next = self.record(pfn).original_pte;
                self.record_mut(PageFrameNumber(cursor)).original_pte = next_next;
                return;
            }
            cursor = next;
        }
    }

    /// Pops the most recent free page of the given color, if any.
    pub fn pop_colored_free_page(&mut self, color: usize) -> Option<PageFrameNumber> {
        let frame = self.color_heads[color % SECONDARY_COLORS];
        if frame == PFN_LIST_END {
            return None;
        }
        let pfn = PageFrameNumber(frame);
        self.remove_page(pfn);
        Some(pfn)
    }

    /// Marks `pfn` actively mapped by the PTE at `pte_address`, with an
    /// initial share count of one.
    ///
    /// # Panics
    /// If the page is still on a list (remove it first).
    pub fn make_active(&mut self, pfn: PageFrameNumber, pte_address: u64) {
        let index = self.index(pfn);
        assert_eq!(self.records[index].state, PfnState::Unused, "page busy");
        self.records[index].state = PfnState::Active;
        self.records[index].pte_address = pte_address;
        self.records[index].u2 = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database(records: &mut Vec<MmPfn>, pages: usize, lowest: u64) -> PfnDatabase<'_> {
        records.resize_with(pages, MmPfn::new);
        PfnDatabase::new(records, lowest)
    }

    #[test]
    fn list_insert_remove_keeps_counts() {
        let mut storage = Vec::new();
        let mut db = database(&mut storage, 256, 0x100);

        db.insert_page(PfnListId::Free, PageFrameNumber(0x100));
        db.insert_page(PfnListId::Free, PageFrameNumber(0x101));
        db.insert_page(PfnListId::Bad, PageFrameNumber(0x102));
        assert_eq!(db.list_count(PfnListId::Free), 2);
        assert_eq!(db.list_count(PfnListId::Bad), 1);

        db.remove_page(PageFrameNumber(0x100));
        assert_eq!(db.list_count(PfnListId::Free), 1);

        // The remaining free page is now the head of its list.
        assert_eq!(db.lists[PfnListId::Free as usize].head, 0x101);
        assert_eq!(db.lists[PfnListId::Free as usize].tail, 0x101);
    }

    #[test]
    fn middle_removal_relinks() {
        let mut storage = Vec::new();
        let mut db = database(&mut storage, 16, 0);
        for frame in [2u64, 3, 4] {
            db.insert_page(PfnListId::Standby, PageFrameNumber(frame));
        }
        db.remove_page(PageFrameNumber(3));
        assert_eq!(db.list_count(PfnListId::Standby), 2);
        assert_eq!(db.record(PageFrameNumber(2)).u1, 4);
        assert_eq!(db.record(PageFrameNumber(4)).u2, 2);
    }

    #[test]
    fn colored_lists_segregate_by_frame_bits() {
        let mut storage = Vec::new();
        let mut db = database(&mut storage, 512, 0);

        // Frames 5 and 5 + 64 share a color; 6 does not.
        db.insert_page(PfnListId::Free, PageFrameNumber(5));
        db.insert_page(PfnListId::Free, PageFrameNumber(5 + 64));
        db.insert_page(PfnListId::Free, PageFrameNumber(6));

        assert_eq!(PfnDatabase::color_of(PageFrameNumber(5)), 5);
        assert_eq!(PfnDatabase::color_of(PageFrameNumber(5 + 64)), 5);

        // LIFO within a color.
        assert_eq!(db.pop_colored_free_page(5), Some(PageFrameNumber(5 + 64)));
        assert_eq!(db.pop_colored_free_page(5), Some(PageFrameNumber(5)));
        assert_eq!(db.pop_colored_free_page(5), None);
        assert_eq!(db.pop_colored_free_page(6), Some(PageFrameNumber(6)));
        assert_eq!(db.list_count(PfnListId::Free), 0);
    }

    #[test]
    fn active_pages_track_their_pte() {
        let mut storage = Vec::new();
        let mut db = database(&mut storage, 16, 0);
        db.insert_page(PfnListId::Free, PageFrameNumber(7));
        db.remove_page(PageFrameNumber(7));
        db.make_active(PageFrameNumber(7), 0xFFFF_F680_0000_0038);
        let record = db.record(PageFrameNumber(7));
        assert_eq!(record.state, PfnState::Active);
        assert_eq!(record.pte_address, 0xFFFF_F680_0000_0038);
        assert_eq!(record.u2, 1, "share count");
    }

    #[test]
    fn frame_word_bits() {
        let word = PfnFrameWord::new()
            .with_pte_frame(0x1234)
            .with_kernel_stack(true)
            .with_must_be_cached(true);
        assert_eq!(word.into_bits(), 0x1234 | (1 << 61) | (1 << 62));
    }
}
