//! Full collection: mark/sweep over tenured, with compaction and heap
//! growth as follow-ups.
//!
//! Marking promotes every live nursery and aging object into tenured
//! first, so after a full collection the younger generations are
//! empty; sweeping then coalesces every unmarked run into the free
//! list and rebuilds the object-start map.

use {
    super::{
        gc_oom,
        visitor::{follow_forwarding, Fixup, SlotVisitor, VmRoots},
    },
    crate::{
        cell::Cell,
        heap::DataHeap,
        object::{self, set_header, Header},
    },
    log::debug,
};

/// Marks tenured objects, promoting younger ones into tenured as they
/// are discovered. Newly marked objects are pushed as grays.
pub struct FullCopier
{
    pub mark_stack: Vec<Cell>,
}

impl FullCopier
{
    fn mark(&mut self, heap: &mut DataHeap, addr: Cell)
    {
        if !heap.tenured.allocator.marks.marked_p(addr) {
            let size = object::object_size(&heap.mem, addr);
            heap.tenured.allocator.marks.set_marked_p(addr, size);
            self.mark_stack.push(addr);
        }
    }
}

impl Fixup for FullCopier
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell
    {
        if heap.tenured_contains(addr) {
            self.mark(heap, addr);
            return addr;
        }
        let addr = follow_forwarding(&heap.mem, addr);
        if heap.tenured_contains(addr) {
            self.mark(heap, addr);
            return addr;
        }

        let size = object::object_size(&heap.mem, addr);
        let new = heap
            .tenured
            .allot(&mut heap.mem, size)
            .unwrap_or_else(|| gc_oom("full-collection promotion", size));
        heap.mem.copy_within(addr, new, size);
        set_header(&mut heap.mem, addr, Header::forward_to(new));
        heap.tenured.allocator.marks.set_marked_p(new, size);
        self.mark_stack.push(new);
        new
    }
}

/// The mark phase: clear mark bits, trace all roots, drain the mark
/// stack to a fixpoint, then reset the younger generations and their
/// remembered-set bytes.
pub fn collect_mark_impl(heap: &mut DataHeap, roots: &mut VmRoots)
{
    heap.tenured.allocator.marks.clear();

    let mut visitor = SlotVisitor::new(heap, FullCopier{mark_stack: Vec::new()});
    visitor.visit_all_roots(roots);
    loop {
        let mut grays = std::mem::take(&mut visitor.fixup.mark_stack);
        if grays.is_empty() {
            break;
        }
        visitor.visit_mark_stack(&mut grays);
    }

    heap.reset_tenured();
    heap.reset_aging();
    heap.reset_nursery();
}

pub fn collect_sweep_impl(heap: &mut DataHeap)
{
    let DataHeap{mem, tenured, ..} = heap;
    tenured.sweep(mem);
}

/// Compaction: slide every marked tenured block to the bottom of the
/// region, rewriting pointers through the forwarding map computed from
/// the mark bitmap. Mark bits must be valid (a mark phase just ran).
pub struct CompactFixup;

impl Fixup for CompactFixup
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell
    {
        if heap.tenured_contains(addr) {
            heap.tenured.allocator.marks.forward_block(addr)
        } else {
            addr
        }
    }
}

pub fn collect_compact_impl(heap: &mut DataHeap, roots: &mut VmRoots)
{
    heap.tenured.allocator.marks.compute_forwarding();

    // Record every live block's extent before any pointer is
    // rewritten; tuple sizes read layout pointers, which the update
    // pass below replaces with not-yet-moved destinations.
    let mut live: Vec<(Cell, Cell)> = Vec::new();
    {
        let mut scan = heap.tenured.first_object(&heap.mem);
        while let Some(obj) = scan {
            if heap.tenured.allocator.marks.marked_p(obj) {
                live.push((obj, object::object_size(&heap.mem, obj)));
            }
            scan = heap.tenured.next_object_after(&heap.mem, obj);
        }
    }

    // Rewrite all pointers: roots first, then each live object's
    // slots in place.
    let mut visitor = SlotVisitor::new(heap, CompactFixup);
    visitor.visit_all_roots(roots);
    for &(obj, _) in &live {
        visitor.visit_slots(obj);
    }

    // Slide the blocks down. Destinations never pass sources, so the
    // moves can go in address order.
    let mut compacted_to = heap.tenured.allocator.start;
    for &(obj, size) in &live {
        let dst = heap.tenured.allocator.marks.forward_block(obj);
        debug_assert!(dst <= obj);
        if dst != obj {
            heap.mem.copy_within(obj, dst, size);
        }
        compacted_to = dst + size;
    }

    let occupied = compacted_to - heap.tenured.allocator.start;
    let DataHeap{mem, tenured, ..} = heap;
    tenured.allocator.initial_free_list(mem, occupied);
    tenured.allocator.marks.clear();
    tenured.update_starts_for_sweep(mem);

    debug!("compacted tenured to {occupied:#x} occupied bytes");
}

/// Grow the data heap's tenured generation.
///
/// Tenured sits at the top of the linear memory, so growth is an
/// in-place extension: the memory gets longer, the tables covering it
/// get longer, and the fresh space joins the free list as one block.
/// The previously live region is retired implicitly by the sweep that
/// preceded the growth. Doubles the generation, plus room for the
/// allocation that could not be satisfied.
pub fn collect_growing_data_heap(heap: &mut DataHeap, requested_size: Cell)
{
    let additional = heap.tenured.allocator.size + requested_size;
    debug!(
        "growing tenured {:#x} -> {:#x}",
        heap.tenured.allocator.size,
        heap.tenured.allocator.size + additional,
    );
    heap.grow_tenured(additional);
}
