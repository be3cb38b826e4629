//! Collector behavior: survival, reclamation, promotion through the
//! generations, write-barrier correctness, compaction, and growth.

mod common;

use {
    catena_core::{
        cell::{tag_of, untag, untag_fixnum, Cell, Tag, FALSE},
        gc::GcOp,
        object,
        special::OBJ_GLOBAL,
        vm::{Vm, VmParameters},
    },
    common::*,
};

fn array_get(vm: &Vm, array: Cell, index: Cell) -> Cell
{
    object::array_nth(&vm.heap.mem, untag(array), index)
}

fn array_set(vm: &mut Vm, array: Cell, index: Cell, value: Cell)
{
    vm.heap
        .set_slot(untag(array), object::ARRAY_DATA + index * 4, value);
}

#[test]
fn only_the_youngest_allocation_survives()
{
    // One mutable slot repeatedly overwritten with a fresh array; the
    // total live data after a full collection stays bounded by a few
    // arrays' worth of bytes.
    let mut vm = boot_vm();
    let holder = vm.allot_array(1, FALSE);
    let holder_root = vm.data_roots.push(holder);

    for round in 0..100_000 {
        let fresh = vm.allot_array(10, fx(round % 1000));
        let holder = vm.data_roots.get(holder_root);
        array_set(&mut vm, holder, 0, fresh);
    }

    vm.primitive_full_gc();

    let holder = vm.data_roots.get(holder_root);
    let survivor = array_get(&vm, holder, 0);
    assert_eq!(tag_of(survivor), Tag::Array as Cell);
    assert_eq!(object::array_capacity(&vm.heap.mem, untag(survivor)), 10);

    assert_eq!(vm.heap.nursery.occupied_space(), 0);
    assert_eq!(vm.heap.aging.allocator.occupied_space(), 0);
    let live = vm.heap.tenured.allocator.occupied_space();
    assert!(
        live < 64 * object::array_size_for(10),
        "tenured holds {live:#x} bytes after full gc",
    );
    vm.data_roots.pop(holder_root);
}

#[test]
fn nursery_collection_empties_the_nursery()
{
    let mut vm = boot_vm();
    let kept = vm.allot_array(4, fx(7));
    let root = vm.data_roots.push(kept);
    assert!(vm.heap.nursery_contains(untag(kept)));

    vm.gc(GcOp::Nursery, 0);

    assert_eq!(vm.heap.nursery.occupied_space(), 0);
    let kept = vm.data_roots.pop(root);
    assert!(vm.heap.aging_contains(untag(kept)));
    assert_eq!(untag_fixnum(array_get(&vm, kept, 3)), 7);
}

#[test]
fn objects_promote_through_the_generations()
{
    let mut vm = boot_vm();
    let value = vm.string_from_bytes(b"long-lived");
    let root = vm.data_roots.push(value);
    assert!(vm.heap.nursery_contains(untag(value)));

    vm.gc(GcOp::Nursery, 0);
    assert!(vm.heap.aging_contains(untag(vm.data_roots.get(root))));

    vm.gc(GcOp::ToTenured, 0);
    assert!(vm.heap.tenured_contains(untag(vm.data_roots.get(root))));

    let value = vm.data_roots.pop(root);
    assert_eq!(vm.string_bytes(value), b"long-lived");
}

#[test]
fn aging_collection_drops_unreachable_survivors()
{
    let mut vm = boot_vm();
    let kept = vm.allot_array(4, fx(1));
    let root = vm.data_roots.push(kept);
    vm.allot_array(64, fx(2));
    vm.gc(GcOp::Nursery, 0);

    let aging_with_garbage = vm.heap.aging.allocator.occupied_space();
    vm.gc(GcOp::Aging, 0);
    let aging_live = vm.heap.aging.allocator.occupied_space();

    // The unreachable 64-element array is gone; the kept one and the
    // bootstrap objects remain.
    assert!(
        aging_with_garbage - aging_live >= object::array_size_for(64),
        "aging kept its garbage: {aging_with_garbage:#x} -> {aging_live:#x}",
    );
    let kept = vm.data_roots.pop(root);
    assert!(vm.heap.aging_contains(untag(kept)));
    assert_eq!(untag_fixnum(array_get(&vm, kept, 0)), 1);
}

#[test]
fn write_barrier_keeps_tenured_to_nursery_edges_alive()
{
    let mut vm = boot_vm();

    // A tenured holder, via the large-object path.
    let holder_capacity = vm.heap.nursery.size / 4;
    let holder = vm.allot_array(holder_capacity, FALSE);
    assert!(vm.heap.tenured_contains(untag(holder)));
    let holder_root = vm.data_roots.push(holder);

    // A young value referenced only from tenured.
    let young = vm.allot_array(3, fx(11));
    assert!(vm.heap.nursery_contains(untag(young)));
    let holder = vm.data_roots.get(holder_root);
    array_set(&mut vm, holder, 0, young);

    // The store must have marked the holder's card.
    let slot_addr = untag(holder) + object::ARRAY_DATA;
    let card = vm.heap.cards.card_index(slot_addr);
    assert_ne!(vm.heap.cards.cards[card], 0, "barrier missed the card");

    vm.gc(GcOp::Nursery, 0);

    let holder = vm.data_roots.pop(holder_root);
    let young = array_get(&vm, holder, 0);
    assert!(vm.heap.aging_contains(untag(young)));
    assert_eq!(untag_fixnum(array_get(&vm, young, 2)), 11);
}

#[test]
fn full_collection_twice_is_idempotent()
{
    let mut vm = boot_vm();
    let keep = vm.allot_array(32, fx(5));
    let root = vm.data_roots.push(keep);
    for _ in 0..2_000 {
        vm.allot_array(8, FALSE);
    }

    vm.primitive_full_gc();
    let occupied_first = vm.heap.tenured.allocator.occupied_space();
    let largest_first = vm.heap.tenured.allocator.largest_free_block();

    vm.primitive_full_gc();
    assert_eq!(vm.heap.tenured.allocator.occupied_space(), occupied_first);
    assert_eq!(
        vm.heap.tenured.allocator.largest_free_block(),
        largest_first,
    );
    assert!(!vm.heap.high_fragmentation_p());
    vm.data_roots.pop(root);
}

#[test]
fn compaction_slides_live_data_to_the_bottom()
{
    let mut vm = boot_vm();
    let keep = vm.allot_array(16, fx(3));
    let root = vm.data_roots.push(keep);

    vm.primitive_full_gc();
    vm.primitive_compact_gc();

    let keep = vm.data_roots.pop(root);
    assert!(vm.heap.tenured_contains(untag(keep)));
    assert_eq!(untag_fixnum(array_get(&vm, keep, 15)), 3);

    // One contiguous free run at the top.
    let allocator = &vm.heap.tenured.allocator;
    assert_eq!(allocator.largest_free_block(), allocator.free_space);
}

#[test]
fn heap_grows_when_live_data_exceeds_tenured()
{
    let mut vm = Vm::new(VmParameters{
        young_size: 64 * 1024,
        aging_size: 64 * 1024,
        tenured_size: 256 * 1024,
        ..VmParameters::default()
    });
    vm.bootstrap_minimal();
    let tenured_before = vm.heap.tenured.allocator.size;

    // Retain more data than tenured can hold.
    let count = 64;
    let each = 16 * 1024 / 4;
    let holder = vm.allot_array(count, FALSE);
    let root = vm.data_roots.push(holder);
    for index in 0..count {
        let chunk = vm.allot_array(each, fx(index as i32));
        let holder = vm.data_roots.get(root);
        array_set(&mut vm, holder, index, chunk);
    }

    assert!(vm.heap.tenured.allocator.size > tenured_before);

    // Everything is still reachable and intact.
    let holder = vm.data_roots.pop(root);
    for index in 0..count {
        let chunk = array_get(&vm, holder, index);
        assert_eq!(tag_of(chunk), Tag::Array as Cell);
        assert_eq!(
            untag_fixnum(array_get(&vm, chunk, each - 1)),
            index as i32,
        );
    }
}

#[test]
fn cyclic_structures_survive_every_collector()
{
    let mut vm = boot_vm();
    let a = vm.allot_array(2, FALSE);
    let a_root = vm.data_roots.push(a);
    let b = vm.allot_array(2, FALSE);
    let a = vm.data_roots.get(a_root);
    array_set(&mut vm, a, 0, b);
    array_set(&mut vm, b, 0, a);
    array_set(&mut vm, b, 1, fx(99));

    vm.gc(GcOp::Nursery, 0);
    vm.gc(GcOp::Aging, 0);
    vm.primitive_full_gc();
    vm.primitive_compact_gc();

    let a = vm.data_roots.pop(a_root);
    let b = array_get(&vm, a, 0);
    assert_eq!(array_get(&vm, b, 0), a);
    assert_eq!(untag_fixnum(array_get(&vm, b, 1)), 99);
}

#[test]
fn roots_in_special_objects_survive()
{
    let mut vm = boot_vm();
    let table = vm.allot_array(3, fx(1234));
    vm.special_objects[OBJ_GLOBAL] = table;
    for _ in 0..5_000 {
        vm.allot_array(12, FALSE);
    }
    vm.primitive_full_gc();

    let table = vm.special_objects[OBJ_GLOBAL];
    assert_eq!(tag_of(table), Tag::Array as Cell);
    assert_eq!(untag_fixnum(array_get(&vm, table, 2)), 1234);
}

#[test]
fn gc_events_record_collections()
{
    let mut vm = boot_vm();
    vm.gc_events = Some(Vec::new());
    vm.gc(GcOp::Nursery, 0);
    vm.primitive_full_gc();

    let events = vm.gc_events.take().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].op, GcOp::Nursery);
    assert_eq!(events[1].op, GcOp::Full);
}

#[test]
fn data_root_depth_is_preserved_across_collections()
{
    let mut vm = boot_vm();
    let depth_before = vm.data_roots.depth();
    for _ in 0..1_000 {
        vm.allot_array(16, FALSE);
    }
    vm.primitive_full_gc();
    assert_eq!(vm.data_roots.depth(), depth_before);
}

#[test]
fn heap_walk_is_consistent_after_collection()
{
    // H-1/H-2: every live object's header decodes and its size steps
    // exactly to the next object.
    let mut vm = boot_vm();
    for index in 0..200 {
        let array = vm.allot_array(1 + index % 7, FALSE);
        if index % 3 == 0 {
            vm.data_roots.push(array);
        }
        vm.string_from_bytes(b"padding bytes");
    }
    vm.primitive_full_gc();

    let mut count = 0;
    vm.each_object(|obj| {
        assert!(object::header_at(&vm.heap.mem, obj).type_code().is_some());
        assert!(object::object_size(&vm.heap.mem, obj) > 0);
        count += 1;
    });
    assert!(count > 60);
}
