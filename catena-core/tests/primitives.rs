//! Primitive coverage: allocation, sequences, stack reflection,
//! hashing, heap reflection, and the diagnostic counters.

mod common;

use {
    catena_core::{
        cell::{tag_of, untag, untag_fixnum, Cell, Tag, FALSE, FIXNUM_MAX},
        gc::GcOp,
        object,
        special::OBJ_PRIMITIVE_WORD,
        vm::Vm,
    },
    common::*,
};

/// Run `( inputs... -- outputs... )` through the do-primitive pattern.
fn run_primitive(vm: &mut Vm, name: &[u8], inputs: &[Cell])
{
    let name = vm.byte_array_from_bytes(name);
    let marker = vm.special_objects[OBJ_PRIMITIVE_WORD];
    let mut elements = inputs.to_vec();
    elements.push(name);
    elements.push(marker);
    run(vm, &elements);
}

#[test]
fn array_primitive_fills()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_array", &[fx(4), fx(9)]);
    let array = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(array), Tag::Array as Cell);
    for index in 0..4 {
        assert_eq!(
            object::array_nth(&vm.heap.mem, untag(array), index),
            fx(9),
        );
    }
}

#[test]
fn oversized_array_request_is_an_array_size_error()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_array", &[fx(FIXNUM_MAX), FALSE]);
    assert_eq!(
        error_kind_on_stack(&vm),
        Some(catena_core::errors::ErrorKind::ArraySize as u32 as i32),
    );
}

#[test]
fn string_primitive_and_resize()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_string", &[fx(3), fx(b'x' as i32)]);
    let string = *stack(&vm).last().unwrap();
    assert_eq!(vm.string_bytes(string), b"xxx");

    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_resize_string", &[string, fx(5)]);
    let longer = *stack(&vm).last().unwrap();
    assert_eq!(&vm.string_bytes(longer)[..3], b"xxx");
    assert_eq!(object::string_length(&vm.heap.mem, untag(longer)), 5);

    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_resize_string", &[longer, fx(2)]);
    let shorter = *stack(&vm).last().unwrap();
    assert_eq!(vm.string_bytes(shorter), b"xx");
}

#[test]
fn resize_array_preserves_a_prefix()
{
    let mut vm = boot_vm();
    let array = vm.allot_array(3, fx(7));
    run_primitive(&mut vm, b"primitive_resize_array", &[array, fx(6)]);
    let grown = *stack(&vm).last().unwrap();
    assert_eq!(object::array_capacity(&vm.heap.mem, untag(grown)), 6);
    assert_eq!(object::array_nth(&vm.heap.mem, untag(grown), 2), fx(7));
    assert_eq!(object::array_nth(&vm.heap.mem, untag(grown), 5), FALSE);
}

#[test]
fn set_nth_checks_bounds()
{
    let mut vm = boot_vm();
    let array = vm.allot_array(2, FALSE);
    run_primitive(&mut vm, b"primitive_set_nth", &[fx(5), fx(1), array]);
    assert_eq!(object::array_nth(&vm.heap.mem, untag(array), 1), fx(5));

    run_primitive(&mut vm, b"primitive_set_nth", &[fx(5), fx(2), array]);
    assert_eq!(
        error_kind_on_stack(&vm),
        Some(catena_core::errors::ErrorKind::ArraySize as u32 as i32),
    );
}

#[test]
fn clone_is_shallow_but_distinct()
{
    let mut vm = boot_vm();
    let original = vm.allot_array(2, fx(1));
    run_primitive(&mut vm, b"primitive_clone", &[original]);
    let clone = *stack(&vm).last().unwrap();
    assert_ne!(clone, original);
    vm.heap.set_slot(untag(clone), object::ARRAY_DATA, fx(2));
    assert_eq!(object::array_nth(&vm.heap.mem, untag(original), 0), fx(1));
    assert_eq!(object::array_nth(&vm.heap.mem, untag(clone), 0), fx(2));
}

#[test]
fn tuple_boa_fills_from_the_stack()
{
    let mut vm = boot_vm();
    let layout = make_layout(&mut vm, b"pair", 2, 0);
    run_primitive(&mut vm, b"primitive_tuple_boa", &[fx(10), fx(20), layout]);
    let tuple = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(tuple), Tag::Tuple as Cell);
    assert_eq!(
        vm.heap.mem.cell_at(untag(tuple) + object::TUPLE_DATA),
        fx(10),
    );
    assert_eq!(
        vm.heap.mem.cell_at(untag(tuple) + object::TUPLE_DATA + 4),
        fx(20),
    );
    // The slot values were consumed.
    assert_eq!(stack(&vm).len(), 1);
}

#[test]
fn datastack_reflection_round_trips()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_datastack", &[fx(1), fx(2), fx(3)]);
    let snapshot = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(snapshot), Tag::Array as Cell);
    assert_eq!(object::array_capacity(&vm.heap.mem, untag(snapshot)), 3);

    // Replace the stack with the snapshot: back to [1 2 3].
    run_primitive(&mut vm, b"primitive_set_datastack", &[snapshot]);
    assert_eq!(stack_fixnums(&vm), vec![1, 2, 3]);
}

#[test]
fn locals_move_between_data_and_retain_stacks()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_load_locals", &[fx(11), fx(22), fx(2)]);
    assert_eq!(stack(&vm).len(), 0);
    assert_eq!(vm.ctx().retain.depth(), 2);

    run_primitive(&mut vm, b"primitive_get_local", &[fx(0)]);
    assert_eq!(stack_fixnums(&vm), vec![22]);
    vm.ctx_mut().data.top = -1;

    run_primitive(&mut vm, b"primitive_get_local", &[fx(1)]);
    assert_eq!(stack_fixnums(&vm), vec![11]);
    vm.ctx_mut().data.top = -1;

    run_primitive(&mut vm, b"primitive_drop_locals", &[fx(2)]);
    assert_eq!(vm.ctx().retain.depth(), 0);
}

#[test]
fn callstack_objects_round_trip()
{
    let mut vm = boot_vm();
    vm.ctx_mut().call_push(fx(100)).unwrap();
    vm.ctx_mut().call_push(fx(200)).unwrap();

    run_primitive(&mut vm, b"primitive_callstack", &[]);
    let snapshot = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(snapshot), Tag::Callstack as Cell);

    vm.ctx_mut().call.top = -1;
    run_primitive(&mut vm, b"primitive_set_callstack", &[snapshot]);
    assert_eq!(vm.ctx().call.depth(), 2);
    assert_eq!(vm.ctx().call.cells[1], fx(200));
}

#[test]
fn size_primitive_matches_object_sizes()
{
    let mut vm = boot_vm();
    let array = vm.allot_array(10, FALSE);
    run_primitive(&mut vm, b"primitive_size", &[array]);
    assert_eq!(
        stack_fixnums(&vm),
        vec![object::array_size_for(10) as i32],
    );

    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_size", &[fx(3)]);
    assert_eq!(stack_fixnums(&vm), vec![0]);
}

#[test]
fn instances_finds_objects_by_type()
{
    let mut vm = boot_vm();
    vm.string_from_bytes(b"one of several strings");

    run_primitive(&mut vm, b"primitive_instances", &[fx(Tag::Word as i32)]);
    let words = *stack(&vm).last().unwrap();
    let count = object::array_capacity(&vm.heap.mem, untag(words));
    // At least the bootstrap words are present, and every entry is a
    // word.
    assert!(count >= 4);
    for index in 0..count {
        let entry = object::array_nth(&vm.heap.mem, untag(words), index);
        assert_eq!(tag_of(entry), Tag::Word as Cell);
    }
}

#[test]
fn become_rewrites_every_reference()
{
    let mut vm = boot_vm();
    let old = vm.string_from_bytes(b"before");
    let old_root = vm.data_roots.push(old);
    let holder = vm.allot_array(2, FALSE);
    let old = vm.data_roots.get(old_root);
    vm.heap.set_slot(untag(holder), object::ARRAY_DATA, old);
    vm.heap.set_slot(untag(holder), object::ARRAY_DATA + 4, old);
    let holder_root = vm.data_roots.push(holder);

    let new = vm.string_from_bytes(b"after");
    let new_root = vm.data_roots.push(new);
    let olds = vm.allot_array(1, FALSE);
    let olds_root = vm.data_roots.push(olds);
    let news = vm.allot_array(1, FALSE);

    let news_tagged = news;
    let olds = vm.data_roots.pop(olds_root);
    let new = vm.data_roots.pop(new_root);
    let old = vm.data_roots.get(old_root);
    vm.heap.set_slot(untag(olds), object::ARRAY_DATA, old);
    vm.heap.set_slot(untag(news_tagged), object::ARRAY_DATA, new);

    run_primitive(&mut vm, b"primitive_become", &[olds, news_tagged]);

    let holder = vm.data_roots.get(holder_root);
    let slot0 = object::array_nth(&vm.heap.mem, untag(holder), 0);
    let slot1 = object::array_nth(&vm.heap.mem, untag(holder), 1);
    assert_eq!(vm.string_bytes(slot0), b"after");
    assert_eq!(slot0, slot1);

    vm.data_roots.pop(holder_root);
    vm.data_roots.pop(old_root);
}

#[test]
fn identity_hashcodes_are_stable_across_collections()
{
    let mut vm = boot_vm();
    let obj = vm.allot_array(3, FALSE);
    let root = vm.data_roots.push(obj);
    let obj = vm.data_roots.get(root);
    let first = vm.identity_hashcode_of(obj);
    assert_ne!(untag_fixnum(first), 0);

    vm.gc(GcOp::Nursery, 0);
    vm.primitive_full_gc();

    let moved = vm.data_roots.pop(root);
    assert_ne!(untag(moved), untag(obj));
    assert_eq!(vm.identity_hashcode_of(moved), first);
}

#[test]
fn rehash_string_caches_a_hash()
{
    let mut vm = boot_vm();
    let string = vm.string_from_bytes(b"key");
    assert_eq!(
        vm.heap.mem.cell_at(untag(string) + object::STRING_HASHCODE),
        fx(0),
    );
    run_primitive(&mut vm, b"primitive_rehash_string", &[string]);
    let cached = vm.heap.mem.cell_at(untag(string) + object::STRING_HASHCODE);
    assert_ne!(cached, fx(0));
    assert_eq!(vm.hashcode_of(string), cached);
}

#[test]
fn data_room_and_dispatch_stats_decode()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_data_room", &[]);
    let room = *stack(&vm).last().unwrap();
    let bytes = object::byte_array_capacity(&vm.heap.mem, untag(room));
    assert_eq!(bytes, 9 * 4);
    // First field: nursery occupancy, nonzero after the bootstrap.
    let occupied = vm.heap.mem.cell_at(untag(room) + object::BYTE_ARRAY_DATA);
    assert!(occupied > 0);

    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_dispatch_stats", &[]);
    let stats = *stack(&vm).last().unwrap();
    assert_eq!(
        object::byte_array_capacity(&vm.heap.mem, untag(stats)),
        16,
    );
}

#[test]
fn gc_events_surface_as_byte_arrays()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_enable_gc_events", &[]);
    vm.primitive_minor_gc();
    vm.primitive_full_gc();
    run_primitive(&mut vm, b"primitive_disable_gc_events", &[]);

    let events = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(events), Tag::Array as Cell);
    assert_eq!(object::array_capacity(&vm.heap.mem, untag(events)), 2);
    let first = object::array_nth(&vm.heap.mem, untag(events), 0);
    assert_eq!(tag_of(first), Tag::ByteArray as Cell);

    // Disabled again: pushes false.
    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_disable_gc_events", &[]);
    assert_eq!(*stack(&vm).last().unwrap(), FALSE);
}

#[test]
fn numeric_conversions_round_trip()
{
    let mut vm = boot_vm();
    run_primitive(&mut vm, b"primitive_fixnum_to_bignum", &[fx(1234)]);
    let bignum = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(bignum), Tag::Bignum as Cell);

    run_primitive(&mut vm, b"primitive_bignum_to_fixnum", &[bignum]);
    assert_eq!(*stack(&vm).last().unwrap(), fx(1234));

    vm.ctx_mut().data.top = -1;
    run_primitive(&mut vm, b"primitive_fixnum_to_float", &[fx(-7)]);
    let float = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(float), Tag::Float as Cell);
    assert_eq!(vm.float_value(float), -7.0);

    run_primitive(&mut vm, b"primitive_float_to_fixnum", &[float]);
    assert_eq!(*stack(&vm).last().unwrap(), fx(-7));
}

#[test]
fn out_of_range_demotion_faults()
{
    let mut vm = boot_vm();
    let big = vm.allot_bignum_from_i64(FIXNUM_MAX as i64 * 3);
    run_primitive(&mut vm, b"primitive_bignum_to_fixnum", &[big]);
    assert_eq!(
        error_kind_on_stack(&vm),
        Some(catena_core::errors::ErrorKind::OutOfFixnumRange as u32 as i32),
    );
}

#[test]
fn unknown_primitive_name_is_not_dispatched()
{
    let mut vm = boot_vm();
    assert_eq!(vm.dispatch_primitive(b"primitive_no_such").unwrap(), false);
}

#[test]
fn glue_primitives_are_inert()
{
    let mut vm = boot_vm();
    let path = vm.string_from_bytes(b"libsomething.so");
    run_primitive(&mut vm, b"primitive_dlopen", &[path]);
    let dll = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(dll), Tag::Dll as Cell);

    run_primitive(&mut vm, b"primitive_dlsym", &[dll]);
    // ( name dll -- f ): the remaining stack value served as the name.
    assert_eq!(*stack(&vm).last().unwrap(), FALSE);
}
