//! Collection operations and the escalation policy.
//!
//! The closed set of collection ops escalates
//! `NURSERY → AGING → TO_TENURED → FULL`, with `GROWING` and `COMPACT`
//! reachable only from `FULL`. With no unwinding available to restart
//! a collection that ran out of target space, the driver escalates
//! *before* collecting: it checks whether the inputs clearly will not
//! fit and picks the higher op up front, then runs exactly one
//! collection (plus `FULL`'s own follow-ups).

pub use self::{
    aging::{collect_aging, collect_to_tenured, ToAgingCopier, ToTenuredCopier},
    full::{
        collect_compact_impl, collect_growing_data_heap, collect_mark_impl,
        collect_sweep_impl, CompactFixup, FullCopier,
    },
    nursery::{collect_nursery, NurseryCopier},
    visitor::{Fixup, NoFixup, ScanGen, SlotVisitor, VmRoots},
};

use {
    crate::{
        cell::{align, Cell},
        heap::{DataHeap, DataHeapRoom, DECK_SIZE},
    },
    log::{debug, trace},
    std::time::Instant,
};

pub mod aging;
pub mod full;
pub mod nursery;
pub mod visitor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcOp
{
    Nursery,
    Aging,
    ToTenured,
    Full,
    Compact,
    Growing,
}

/// Record of one collection, kept when gc events are enabled.
#[derive(Clone, Debug)]
pub struct GcEvent
{
    pub op: GcOp,
    pub data_before: DataHeapRoom,
    pub data_after: DataHeapRoom,
    pub cards_scanned: u64,
    pub decks_scanned: u64,
    pub total_nanos: u64,
}

/// Out of memory inside a collection. There is no heap to allocate an
/// error object in, so this never reaches the error handler.
pub(crate) fn gc_oom(what: &str, size: Cell) -> !
{
    eprintln!("out of memory during gc ({what}, {size} bytes)");
    std::process::exit(1);
}

/// Run one collection, pre-escalated as needed. Returns the op that
/// actually ran (the highest one) and, when `record_event` is set, the
/// event record.
pub fn collect(
    heap: &mut DataHeap,
    roots: &mut VmRoots,
    requested_op: GcOp,
    requested_size: Cell,
    record_event: bool,
) -> (GcOp, Option<GcEvent>)
{
    let started = Instant::now();
    let mut event = record_event.then(|| GcEvent{
        op: requested_op,
        data_before: heap.data_room(),
        data_after: DataHeapRoom::default(),
        cards_scanned: 0,
        decks_scanned: 0,
        total_nanos: 0,
    });

    let mut op = requested_op;

    // Pre-escalation: aging must be able to absorb every nursery
    // survivor, and a fragmented tenured heap cannot take promotions.
    if op == GcOp::Nursery
        && heap.aging.allocator.free_space() < heap.nursery.occupied_space()
    {
        trace!("gc escalating nursery -> aging");
        op = GcOp::Aging;
    }
    if (op == GcOp::Aging || op == GcOp::ToTenured) && heap.high_fragmentation_p() {
        trace!("gc escalating {op:?} -> full");
        op = GcOp::Full;
    }

    match op {
        GcOp::Nursery => collect_nursery(heap, roots, &mut event),
        GcOp::Aging => collect_aging(heap, roots, &mut event),
        GcOp::ToTenured => collect_to_tenured(heap, roots, &mut event),
        GcOp::Full => op = collect_full(heap, roots, requested_size),
        GcOp::Compact => {
            collect_mark_impl(heap, roots);
            collect_sweep_impl(heap);
            collect_compact_impl(heap, roots);
        },
        GcOp::Growing => collect_growing(heap, roots, requested_size),
    }

    // A younger collection can leave tenured fragmented (fallback
    // promotions). FULL's follow-ups restore the invariant; make sure
    // every path does.
    if heap.high_fragmentation_p()
        && !matches!(op, GcOp::Full | GcOp::Compact | GcOp::Growing)
    {
        debug!("gc follow-up full collection (fragmentation)");
        op = collect_full(heap, roots, requested_size);
    }
    debug_assert!(!heap.high_fragmentation_p());

    if let Some(event) = &mut event {
        event.op = op;
        event.data_after = heap.data_room();
        event.total_nanos = started.elapsed().as_nanos() as u64;
    }
    (op, event)
}

/// Mark, sweep, then grow or compact as the occupancy demands.
/// Returns the op the collection ended as.
pub fn collect_full(heap: &mut DataHeap, roots: &mut VmRoots, requested_size: Cell)
    -> GcOp
{
    collect_mark_impl(heap, roots);
    collect_sweep_impl(heap);

    if heap.low_memory_p() {
        debug!("full gc: still low on memory, growing the data heap");
        collect_growing_data_heap(heap, align(requested_size, DECK_SIZE));
        GcOp::Growing
    } else if heap.high_fragmentation_p() {
        debug!("full gc: high fragmentation, compacting");
        collect_compact_impl(heap, roots);
        GcOp::Compact
    } else {
        // The bits served the sweep; a collection always ends with
        // them clear.
        heap.tenured.allocator.marks.clear();
        GcOp::Full
    }
}

/// Collect, then grow the tenured generation. Neither this nor
/// compaction is allowed to fail.
pub fn collect_growing(heap: &mut DataHeap, roots: &mut VmRoots, requested_size: Cell)
{
    collect_mark_impl(heap, roots);
    collect_sweep_impl(heap);
    collect_growing_data_heap(heap, align(requested_size, DECK_SIZE));
}
