//! Nursery collection: evacuate live nursery objects into aging.

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

/// Copies nursery objects to aging, falling back to tenured when the
/// aging semispace cannot take another survivor. Tenured-promoted
/// objects are queued so their slots still get traced.
pub struct NurseryCopier
{
    pub promoted: Vec<Cell>,
}

impl Fixup for NurseryCopier
{
    fn fixup(&mut self, heap: &mut DataHeap, addr: Cell) -> Cell
    {
        if !heap.nursery_contains(addr) {
            return addr;
        }
        let addr = follow_forwarding(&heap.mem, addr);
        if !heap.nursery_contains(addr) {
            return addr;
        }

        let size = object::object_size(&heap.mem, addr);
        let new = match heap.aging.allot(size) {
            Some(new) => new,
            None => {
                let new = heap
                    .tenured
                    .allot(&mut heap.mem, size)
                    .unwrap_or_else(|| gc_oom("nursery survivor", size));
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

pub fn collect_nursery(
    heap: &mut DataHeap,
    roots: &mut VmRoots,
    event: &mut Option<GcEvent>,
)
{
    let mut scan = heap.aging.allocator.here;
    let mut visitor =
        SlotVisitor::new(heap, NurseryCopier{promoted: Vec::new()});

    visitor.visit_all_roots(roots);

    visitor.visit_cards(
        ScanGen::Tenured,
        CardFlags::POINTS_TO_NURSERY.bits(),
        CardFlags::POINTS_TO_NURSERY.bits(),
    );
    visitor.visit_cards(ScanGen::Aging, CardFlags::POINTS_TO_NURSERY.bits(), 0xff);

    loop {
        scan = visitor.cheneys_algorithm(scan);
        let mut grays = std::mem::take(&mut visitor.fixup.promoted);
        if grays.is_empty() {
            break;
        }
        visitor.visit_mark_stack(&mut grays);
    }

    if let Some(event) = event {
        event.cards_scanned += visitor.cards_scanned;
        event.decks_scanned += visitor.decks_scanned;
    }

    heap.reset_nursery();
}
