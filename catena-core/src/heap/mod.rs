//! The data heap: one linear memory carved into a nursery, two aging
//! semispaces, and a tenured free-list heap, together with the
//! card/deck remembered-set tables covering all of it.

pub use self::{
    bump::BumpAllocator,
    cards::{CardFlags, CardTable, CARD_MARK_MASK, CARD_SIZE, DECK_SIZE},
    free_list::{AllocatorRoom, FreeListAllocator},
    mark_bits::MarkBits,
    starts::ObjectStartMap,
};

use crate::{
    cell::{align, Cell},
    mem::LinearMemory,
    object::{self, header_at},
};

pub mod bump;
pub mod cards;
pub mod free_list;
pub mod mark_bits;
pub mod starts;

/// An aging semispace: bump allocation plus an object-start map.
pub struct AgingSpace
{
    pub allocator: BumpAllocator,
    pub starts: ObjectStartMap,
}

impl AgingSpace
{
    pub fn new(start: Cell, size: Cell) -> Self
    {
        Self{
            allocator: BumpAllocator::new(start, size),
            starts: ObjectStartMap::new(start, size),
        }
    }

    pub fn allot(&mut self, size: Cell) -> Option<Cell>
    {
        let obj = self.allocator.allot_checked(size)?;
        self.starts.record_object_start_offset(obj);
        Some(obj)
    }

    pub fn contains(&self, addr: Cell) -> bool
    {
        self.allocator.contains(addr)
    }

    pub fn first_object(&self) -> Option<Cell>
    {
        (self.allocator.here != self.allocator.start)
            .then_some(self.allocator.start)
    }

    pub fn next_object_after(&self, mem: &LinearMemory, scan: Cell)
        -> Option<Cell>
    {
        let next = scan + object::object_size(mem, scan);
        (next < self.allocator.here).then_some(next)
    }

    pub fn reset(&mut self, mem: &mut LinearMemory)
    {
        self.allocator.flush(mem);
        self.starts.clear();
    }
}

/// The tenured generation: free-list allocation, mark bits, and an
/// object-start map.
pub struct TenuredSpace
{
    pub allocator: FreeListAllocator,
    pub starts: ObjectStartMap,
}

impl TenuredSpace
{
    pub fn new(mem: &mut LinearMemory, start: Cell, size: Cell) -> Self
    {
        Self{
            allocator: FreeListAllocator::new(mem, start, size),
            starts: ObjectStartMap::new(start, size),
        }
    }

    pub fn allot(&mut self, mem: &mut LinearMemory, size: Cell) -> Option<Cell>
    {
        let obj = self.allocator.allot(mem, size)?;
        self.starts.record_object_start_offset(obj);
        Some(obj)
    }

    pub fn contains(&self, addr: Cell) -> bool
    {
        self.allocator.contains(addr)
    }

    /// Skip free blocks; `None` at the end of the region.
    pub fn next_allocated_object_after(&self, mem: &LinearMemory, mut scan: Cell)
        -> Option<Cell>
    {
        while scan != self.allocator.end && header_at(mem, scan).free_p() {
            scan += header_at(mem, scan).free_block_size();
        }
        (scan != self.allocator.end).then_some(scan)
    }

    pub fn first_object(&self, mem: &LinearMemory) -> Option<Cell>
    {
        self.next_allocated_object_after(mem, self.allocator.start)
    }

    pub fn next_object_after(&self, mem: &LinearMemory, scan: Cell)
        -> Option<Cell>
    {
        self.next_allocated_object_after(
            mem,
            scan + object::object_size(mem, scan),
        )
    }

    /// Sweep to the mark bits, then recompute the object-start map
    /// from the surviving objects.
    pub fn sweep(&mut self, mem: &mut LinearMemory)
    {
        self.allocator.sweep(mem, |_, _| ());
        self.update_starts_for_sweep(mem);
    }

    pub fn update_starts_for_sweep(&mut self, mem: &LinearMemory)
    {
        self.starts.clear();
        let mut scan = self.first_object(mem);
        while let Some(obj) = scan {
            self.starts.record_object_start_offset(obj);
            scan = self.next_object_after(mem, obj);
        }
    }
}

/// Occupancy report for the whole data heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataHeapRoom
{
    pub nursery_occupied: Cell,
    pub nursery_size: Cell,
    pub aging_occupied: Cell,
    pub aging_size: Cell,
    pub tenured: AllocatorRoom,
}

pub struct DataHeap
{
    pub mem: LinearMemory,

    /// Base address covered by the card tables; also the nursery start.
    pub start: Cell,

    pub nursery: BumpAllocator,
    pub aging: AgingSpace,
    pub aging_semispace: AgingSpace,
    pub tenured: TenuredSpace,
    pub cards: CardTable,
}

impl DataHeap
{
    /// Carve one linear memory into the generations. The first deck of
    /// the address space is left unmapped so no object ever has an
    /// address that collides with an immediate cell.
    pub fn new(young_size: Cell, aging_size: Cell, tenured_size: Cell) -> Self
    {
        let young_size = align(young_size, DECK_SIZE);
        let aging_size = align(aging_size, DECK_SIZE);
        let tenured_size = align(tenured_size, DECK_SIZE);

        let base = DECK_SIZE;
        let nursery_start = base;
        let aging_a = nursery_start + young_size;
        let aging_b = aging_a + aging_size;
        let tenured_start = aging_b + aging_size;
        let end = tenured_start + tenured_size;

        let mut mem = LinearMemory::new(end);
        let tenured = TenuredSpace::new(&mut mem, tenured_start, tenured_size);
        Self{
            start: base,
            nursery: BumpAllocator::new(nursery_start, young_size),
            aging: AgingSpace::new(aging_a, aging_size),
            aging_semispace: AgingSpace::new(aging_b, aging_size),
            tenured,
            cards: CardTable::new(base, end - base),
            mem,
        }
    }

    pub fn nursery_contains(&self, addr: Cell) -> bool
    {
        self.nursery.contains(addr)
    }

    pub fn aging_contains(&self, addr: Cell) -> bool
    {
        self.aging.contains(addr)
    }

    pub fn tenured_contains(&self, addr: Cell) -> bool
    {
        self.tenured.contains(addr)
    }

    /// Whether `addr` lies in any live region (the inactive semispace
    /// does not count).
    pub fn contains(&self, addr: Cell) -> bool
    {
        self.nursery_contains(addr)
            || self.aging_contains(addr)
            || self.tenured_contains(addr)
    }

    /// Store a cell into an object slot, with the write barrier.
    pub fn set_slot(&mut self, obj: Cell, offset: Cell, value: Cell)
    {
        let slot = obj + offset;
        self.mem.set_cell(slot, value);
        if !crate::cell::immediate_p(value) {
            self.cards.write_barrier(slot);
        }
    }

    /// Mark every card covering `[obj, obj + size)`. Used when an
    /// object is created directly in tenured: its slots may come to
    /// hold young pointers before any barrier-checked store runs.
    pub fn mark_object_cards(&mut self, obj: Cell, size: Cell)
    {
        let mut addr = obj & !(CARD_SIZE - 1);
        while addr < obj + size {
            self.cards.write_barrier(addr);
            addr += CARD_SIZE;
        }
    }

    /// Free tenured space the collector keeps in hand for promoting
    /// both younger generations at once.
    pub fn high_water_mark(&self) -> Cell
    {
        self.nursery.size + self.aging.allocator.size
    }

    pub fn low_memory_p(&self) -> bool
    {
        self.tenured.allocator.free_space <= self.high_water_mark() * 2
    }

    pub fn high_fragmentation_p(&self) -> bool
    {
        self.tenured.allocator.largest_free_block() <= self.high_water_mark()
    }

    pub fn reset_nursery(&mut self)
    {
        self.nursery.flush(&mut self.mem);
    }

    pub fn reset_aging(&mut self)
    {
        self.aging.reset(&mut self.mem);
        let (start, end) = (self.aging.allocator.start, self.aging.allocator.end);
        self.cards.clear_range(start, end);
    }

    pub fn reset_tenured(&mut self)
    {
        let (start, end) =
            (self.tenured.allocator.start, self.tenured.allocator.end);
        self.cards.clear_range(start, end);
    }

    pub fn swap_aging_semispaces(&mut self)
    {
        std::mem::swap(&mut self.aging, &mut self.aging_semispace);
    }

    /// Grow the tenured generation in place. Tenured is the topmost
    /// region of the linear memory, so extending the memory extends
    /// tenured without moving a single object.
    pub fn grow_tenured(&mut self, additional: Cell)
    {
        let additional = align(additional, DECK_SIZE);
        self.mem.grow(additional);
        let Self{mem, tenured, cards, ..} = self;
        tenured.allocator.grow(mem, additional);
        tenured.starts.grow(additional);
        cards.grow(additional);
    }

    pub fn data_room(&self) -> DataHeapRoom
    {
        DataHeapRoom{
            nursery_occupied: self.nursery.occupied_space(),
            nursery_size: self.nursery.size,
            aging_occupied: self.aging.allocator.occupied_space(),
            aging_size: self.aging.allocator.size,
            tenured: self.tenured.allocator.as_allocator_room(),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn regions_do_not_overlap_and_cover_memory()
    {
        let heap = DataHeap::new(0x10000, 0x10000, 0x40000);
        assert_eq!(heap.nursery.start, DECK_SIZE);
        assert_eq!(heap.nursery.end, heap.aging.allocator.start);
        assert_eq!(heap.aging.allocator.end, heap.aging_semispace.allocator.start);
        assert_eq!(heap.aging_semispace.allocator.end, heap.tenured.allocator.start);
        assert_eq!(heap.tenured.allocator.end, heap.mem.len());
    }

    #[test]
    fn fresh_heap_has_headroom()
    {
        let heap = DataHeap::new(0x10000, 0x10000, 0x80000);
        assert!(!heap.low_memory_p());
        assert!(!heap.high_fragmentation_p());
    }

    #[test]
    fn set_slot_marks_cards_for_pointer_stores_only()
    {
        let mut heap = DataHeap::new(0x10000, 0x10000, 0x40000);
        let obj = heap.tenured.allocator.start;

        heap.set_slot(obj, 8, crate::cell::tag_fixnum(7));
        assert_eq!(heap.cards.cards[heap.cards.card_index(obj + 8)], 0);

        let young = crate::cell::retag(heap.nursery.start, crate::cell::Tag::Array as Cell);
        heap.set_slot(obj, 8, young);
        assert_eq!(
            heap.cards.cards[heap.cards.card_index(obj + 8)],
            CARD_MARK_MASK,
        );
    }
}
