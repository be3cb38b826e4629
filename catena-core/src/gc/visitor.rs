//! The slot visitor: parametric iteration over every pointer slot the
//! mutator can reach.
//!
//! A visitor pairs the data heap with a [`Fixup`] policy saying how to
//! rewrite an untagged object address: identity, evacuate-and-forward,
//! compaction-table lookup, or an image relocation delta. All
//! collectors, the image loader, and `become` are expressed as fixups
//! driven through this one traversal.

use crate::{
    cell::{immediate_p, retag, tag_of, untag, Cell},
    context::Context,
    heap::{
        cards::{CARDS_PER_DECK, CARD_BITS, CARD_SIZE, DECK_SIZE},
        DataHeap,
    },
    interp::WorkItem,
    object::{self, header_at},
    roots::DataRoots,
    special::SpecialObjects,
};

/// How to rewrite a raw (untagged) object address.
pub trait Fixup
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell;

    /// Where the contents of `addr` can currently be read. Identity
    /// except during relocation, when a tuple's layout pointer may
    /// already hold the post-move address.
    fn translate(&self, addr: Cell) -> Cell
    {
        addr
    }
}

/// The identity policy.
pub struct NoFixup;

impl Fixup for NoFixup
{
    fn fixup(&mut self, _heap: &mut DataHeap, addr: Cell) -> Cell
    {
        addr
    }
}

/// Follow forwarding headers to an object's current address.
pub fn follow_forwarding(mem: &crate::mem::LinearMemory, mut addr: Cell) -> Cell
{
    while header_at(mem, addr).forwarding_p() {
        addr = header_at(mem, addr).forwarding_target();
    }
    addr
}

/// The mutator state a collection walks in addition to the heap.
pub struct VmRoots<'a>
{
    pub data_roots: &'a mut DataRoots,
    pub special_objects: &'a mut SpecialObjects,
    pub contexts: &'a mut [Context],
    pub work_queue: &'a mut [WorkItem],
}

/// Which generation a card scan walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanGen
{
    Aging,
    Tenured,
}

pub struct SlotVisitor<'h, F: Fixup>
{
    pub heap: &'h mut DataHeap,
    pub fixup: F,
    pub cards_scanned: u64,
    pub decks_scanned: u64,
}

impl<'h, F: Fixup> SlotVisitor<'h, F>
{
    pub fn new(heap: &'h mut DataHeap, fixup: F) -> Self
    {
        Self{heap, fixup, cards_scanned: 0, decks_scanned: 0}
    }

    /// Untag, apply the fixup, retag.
    pub fn visit_pointer(&mut self, tagged: Cell) -> Cell
    {
        let fixed = self.fixup.fixup(self.heap, untag(tagged));
        retag(fixed, tag_of(tagged))
    }

    /// Rewrite one host-side slot (roots, stacks, special objects).
    pub fn visit_host_slot(&mut self, slot: &mut Cell)
    {
        if !immediate_p(*slot) {
            *slot = self.visit_pointer(*slot);
        }
    }

    pub fn visit_host_slots(&mut self, slots: &mut [Cell])
    {
        for slot in slots {
            self.visit_host_slot(slot);
        }
    }

    /// Rewrite one slot inside the linear memory.
    pub fn visit_mem_slot(&mut self, addr: Cell)
    {
        let value = self.heap.mem.cell_at(addr);
        if !immediate_p(value) {
            let fixed = self.visit_pointer(value);
            self.heap.mem.set_cell(addr, fixed);
        }
    }

    fn visit_mem_range(&mut self, start: Cell, end: Cell)
    {
        let mut addr = start;
        while addr < end {
            self.visit_mem_slot(addr);
            addr += 4;
        }
    }

    /// Visit every traced slot of the object at `obj`.
    ///
    /// Callstack objects hold no traced cells on this target (there
    /// are no native frames), so their slot count is zero and this is
    /// a no-op for them.
    pub fn visit_slots(&mut self, obj: Cell)
    {
        let count = object::slot_count_with(
            &self.heap.mem,
            obj,
            |a| self.fixup.translate(a),
        );
        self.visit_mem_range(obj + 4, obj + 4 + count * 4);
    }

    pub fn visit_object(&mut self, obj: Cell)
    {
        self.visit_slots(obj);
    }

    /// Walk a stack segment from its base to `top` inclusive.
    pub fn visit_stack_elements(&mut self, segment: &mut [Cell], top: isize)
    {
        if top >= 0 {
            self.visit_host_slots(&mut segment[..=top as usize]);
        }
    }

    fn visit_context(&mut self, ctx: &mut Context)
    {
        // The call stack holds raw cells only; the call-frame visitor
        // of the native targets has nothing to do here.
        let top = ctx.data.top;
        self.visit_stack_elements(&mut ctx.data.cells, top);
        let top = ctx.retain.top;
        self.visit_stack_elements(&mut ctx.retain.cells, top);
        self.visit_host_slots(&mut ctx.context_objects);
    }

    /// Work items carry tagged cells; every one is a root.
    pub fn visit_work_items(&mut self, items: &mut [WorkItem])
    {
        for item in items {
            match item {
                WorkItem::CallCallable(cell)
                | WorkItem::ExecuteWord(cell)
                | WorkItem::PushValue(cell)
                | WorkItem::LoopContinue(cell) => self.visit_host_slot(cell),
                WorkItem::QuotationContinue{array, ..} =>
                    self.visit_host_slot(array),
                WorkItem::RestoreValues(values) =>
                    self.visit_host_slots(values),
                WorkItem::WhileContinue{pred, body} => {
                    self.visit_host_slot(pred);
                    self.visit_host_slot(body);
                },
            }
        }
    }

    /// The full root set: the data-root stack, the special-objects
    /// table, the interpreter's work queue, and every active context.
    pub fn visit_all_roots(&mut self, roots: &mut VmRoots)
    {
        self.visit_host_slots(roots.data_roots.slots_mut());
        self.visit_host_slots(&mut roots.special_objects[..]);
        self.visit_work_items(roots.work_queue);
        for ctx in roots.contexts.iter_mut() {
            self.visit_context(ctx);
        }
    }

    /// Drain the mark stack to a fixpoint. Entries with the low bit
    /// set name code blocks; with no code generation on this target
    /// nothing ever pushes one.
    pub fn visit_mark_stack(&mut self, mark_stack: &mut Vec<Cell>)
    {
        while let Some(ptr) = mark_stack.pop() {
            if ptr & 1 != 0 {
                debug_assert!(false, "code block on mark stack with empty code heap");
                continue;
            }
            self.visit_object(ptr);
        }
    }

    /// Classic two-finger Cheney scan over the active aging semispace.
    /// The fixup's evacuations advance `here`; the scan chases it.
    /// Returns the final scan pointer (the allocation point at exit).
    pub fn cheneys_algorithm(&mut self, mut scan: Cell) -> Cell
    {
        while scan < self.heap.aging.allocator.here {
            self.visit_object(scan);
            scan += object::object_size(&self.heap.mem, scan);
        }
        scan
    }

    fn gen_bounds(&self, gen: ScanGen) -> (Cell, Cell)
    {
        match gen {
            ScanGen::Aging => (
                self.heap.aging.allocator.start,
                self.heap.aging.allocator.end,
            ),
            ScanGen::Tenured => (
                self.heap.tenured.allocator.start,
                self.heap.tenured.allocator.end,
            ),
        }
    }

    fn gen_first_object_in_card(&self, gen: ScanGen, card_index: Cell) -> Cell
    {
        let (start, _) = self.gen_bounds(gen);
        let gen_first_card = (start - self.heap.cards.base) >> CARD_BITS;
        let relative = card_index - gen_first_card;
        match gen {
            ScanGen::Aging =>
                self.heap.aging.starts.find_object_containing_card(relative),
            ScanGen::Tenured =>
                self.heap.tenured.starts.find_object_containing_card(relative),
        }
    }

    fn gen_next_object_after(&self, gen: ScanGen, scan: Cell) -> Option<Cell>
    {
        match gen {
            ScanGen::Aging =>
                self.heap.aging.next_object_after(&self.heap.mem, scan),
            ScanGen::Tenured =>
                self.heap.tenured.next_object_after(&self.heap.mem, scan),
        }
    }

    /// Visit only the slots of `obj` that lie inside the card.
    fn visit_partial_objects(&mut self, obj: Cell, card_start: Cell, card_end: Cell)
    {
        let count = object::slot_count_with(
            &self.heap.mem,
            obj,
            |a| self.fixup.translate(a),
        );
        let scan_start = (obj + 4).max(card_start);
        let scan_end = (obj + 4 + count * 4).min(card_end);
        if scan_start < scan_end {
            self.visit_mem_range(scan_start, scan_end);
        }
    }

    /// Visit the objects overlapping one marked card. `last` is the
    /// last object traced by the previous card, reused so consecutive
    /// marked cards need not consult the start map again. Returns the
    /// last object traced, or `None` at the end of the generation.
    fn visit_card(&mut self, gen: ScanGen, card_index: Cell, last: Option<Cell>)
        -> Option<Cell>
    {
        let card_start = self.heap.cards.base + card_index * CARD_SIZE;
        let card_end = card_start + CARD_SIZE;

        let mut obj = match last {
            Some(obj)
                if obj + object::object_size(&self.heap.mem, obj) >= card_start =>
                obj,
            _ => self.gen_first_object_in_card(gen, card_index),
        };

        loop {
            self.visit_partial_objects(obj, card_start, card_end);
            if obj + object::object_size(&self.heap.mem, obj) >= card_end {
                // The object crosses the card boundary; its tail is
                // traced when the next marked card is visited.
                return Some(obj);
            }
            match self.gen_next_object_after(gen, obj) {
                Some(next) if next < card_end => obj = next,
                Some(next) => return Some(next),
                None => return None,
            }
        }
    }

    /// Two-level card scan: decks whose byte matches `mask` are
    /// descended into; cards whose byte matches are visited. Matched
    /// bytes have the `unmask` bits cleared.
    pub fn visit_cards(&mut self, gen: ScanGen, mask: u8, unmask: u8)
    {
        let (gen_start, gen_end) = self.gen_bounds(gen);
        let base = self.heap.cards.base;
        let first_deck = (gen_start - base) / DECK_SIZE;
        let last_deck = (gen_end - base) / DECK_SIZE;

        let mut last = None;
        for di in first_deck..last_deck {
            if self.heap.cards.decks[di as usize] & mask == 0 {
                continue;
            }
            self.heap.cards.decks[di as usize] &= !unmask;
            self.decks_scanned += 1;

            let first_card = di * CARDS_PER_DECK;
            for ci in first_card..first_card + CARDS_PER_DECK {
                if self.heap.cards.cards[ci as usize] & mask == 0 {
                    continue;
                }
                self.heap.cards.cards[ci as usize] &= !unmask;
                self.cards_scanned += 1;

                last = self.visit_card(gen, ci, last);
                if last.is_none() {
                    // End of generation; no further card can match.
                    return;
                }
            }
        }
    }
}
