//! Aging collection and direct promotion to tenured.
//!
//! An aging collection runs in two phases. Phase one promotes the
//! subgraph of aging objects referenced from tenured (found via the
//! points-to-aging cards) into tenured. Phase two swaps the aging
//! semispaces and evacuates everything else reachable from the roots
//! into the fresh semispace, dropping unreachable aging objects.

use {
    super::{
        gc_oom,
        visitor::{follow_forwarding, Fixup, ScanGen, SlotVisitor, VmRoots},
        GcEvent,
    },
    crate::{
        cell::Cell,
        heap::{CardFlags, DataHeap},
        object::{self, set_header, Header},
    },
};

/// Copies any non-tenured object into tenured, queueing the copy so
/// its slots get traced. Used by phase one and by COLLECT_TO_TENURED.
pub struct ToTenuredCopier
{
    pub mark_stack: Vec<Cell>,
}

impl Fixup for ToTenuredCopier
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell
    {
        if heap.tenured_contains(addr) {
            return addr;
        }
        let addr = follow_forwarding(&heap.mem, addr);
        if heap.tenured_contains(addr) {
            return addr;
        }

        let size = object::object_size(&heap.mem, addr);
        let new = heap
            .tenured
            .allot(&mut heap.mem, size)
            .unwrap_or_else(|| gc_oom("promotion to tenured", size));
        heap.mem.copy_within(addr, new, size);
        set_header(&mut heap.mem, addr, Header::forward_to(new));
        self.mark_stack.push(new);
        new
    }
}

/// Copies survivors into the active (fresh) aging semispace, spilling
/// to tenured when it fills mid-collection.
pub struct ToAgingCopier
{
    pub promoted: Vec<Cell>,
}

impl Fixup for ToAgingCopier
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell
    {
        if heap.aging_contains(addr) || heap.tenured_contains(addr) {
            return addr;
        }
        let addr = follow_forwarding(&heap.mem, addr);
        if heap.aging_contains(addr) || heap.tenured_contains(addr) {
            return addr;
        }

        let size = object::object_size(&heap.mem, addr);
        let new = match heap.aging.allot(size) {
            Some(new) => new,
            None => {
                let new = heap
                    .tenured
                    .allot(&mut heap.mem, size)
                    .unwrap_or_else(|| gc_oom("aging survivor", size));
                heap.mark_object_cards(new, size);
                self.promoted.push(new);
                new
            },
        };
        heap.mem.copy_within(addr, new, size);
        set_header(&mut heap.mem, addr, Header::forward_to(new));
        new
    }
}

fn drain<F: Fixup>(
    visitor: &mut SlotVisitor<F>,
    take: impl Fn(&mut F) -> Vec<Cell>,
)
{
    loop {
        let mut grays = take(&mut visitor.fixup);
        if grays.is_empty() {
            break;
        }
        visitor.visit_mark_stack(&mut grays);
    }
}

pub fn collect_aging(
    heap: &mut DataHeap,
    roots: &mut VmRoots,
    event: &mut Option<GcEvent>,
)
{
    // Phase one: pull the tenured-referenced aging subgraph up into
    // tenured, so the semispace flip cannot lose it.
    {
        let mut visitor =
            SlotVisitor::new(heap, ToTenuredCopier{mark_stack: Vec::new()});
        visitor.visit_cards(ScanGen::Tenured, CardFlags::POINTS_TO_AGING.bits(), 0xff);
        drain(&mut visitor, |f| std::mem::take(&mut f.mark_stack));

        if let Some(event) = event {
            event.cards_scanned += visitor.cards_scanned;
            event.decks_scanned += visitor.decks_scanned;
        }
    }

    // Phase two: flip, then evacuate the root-reachable remainder.
    {
        heap.swap_aging_semispaces();
        heap.reset_aging();

        let mut scan = heap.aging.allocator.here;
        let mut visitor =
            SlotVisitor::new(heap, ToAgingCopier{promoted: Vec::new()});
        visitor.visit_all_roots(roots);
        loop {
            scan = visitor.cheneys_algorithm(scan);
            let mut grays = std::mem::take(&mut visitor.fixup.promoted);
            if grays.is_empty() {
                break;
            }
            visitor.visit_mark_stack(&mut grays);
        }

        heap.reset_nursery();
    }
}

/// COLLECT_TO_TENURED: aging cannot absorb the survivors, so every
/// live nursery and aging object goes straight to tenured.
pub fn collect_to_tenured(
    heap: &mut DataHeap,
    roots: &mut VmRoots,
    event: &mut Option<GcEvent>,
)
{
    let mut visitor =
        SlotVisitor::new(heap, ToTenuredCopier{mark_stack: Vec::new()});

    visitor.visit_all_roots(roots);
    visitor.visit_cards(
        ScanGen::Tenured,
        CardFlags::POINTS_TO_NURSERY.bits() | CardFlags::POINTS_TO_AGING.bits(),
        0xff,
    );
    drain(&mut visitor, |f| std::mem::take(&mut f.mark_stack));

    if let Some(event) = event {
        event.cards_scanned += visitor.cards_scanned;
        event.decks_scanned += visitor.decks_scanned;
    }

    heap.reset_nursery();
    heap.reset_aging();
}
