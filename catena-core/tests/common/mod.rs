//! Shared scaffolding for the end-to-end tests: a small VM with the
//! minimal environment, word builders for the handler fast paths, and
//! stack inspection helpers.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use catena_core::{
    cell::{tag_fixnum, tag_of, untag, untag_fixnum, Cell, Fixnum, Tag, FALSE},
    object,
    special::OBJ_ERROR_HANDLER_QUOT,
    vm::{Vm, VmParameters},
};

pub fn small_params() -> VmParameters
{
    VmParameters{
        young_size: 128 * 1024,
        aging_size: 128 * 1024,
        tenured_size: 1024 * 1024,
        ..VmParameters::default()
    }
}

/// A VM with the minimal bootstrap and an installed (empty) error
/// handler, so faults land on the data stack instead of aborting.
pub fn boot_vm() -> Vm
{
    let mut vm = Vm::new(small_params());
    vm.bootstrap_minimal();
    let handler = vm.make_quotation(&[]);
    vm.special_objects[OBJ_ERROR_HANDLER_QUOT] = handler;
    vm
}

/// A word dispatched through the handler table by name (stack ops,
/// arithmetic, combinators).
pub fn word(vm: &mut Vm, name: &[u8]) -> Cell
{
    vm.make_word(name, b"kernel")
}

/// A literal that pushes the canonical true object: a wrapper around
/// the `t` word, as the bootstrap image encodes it.
pub fn true_literal(vm: &mut Vm) -> Cell
{
    let t = vm.true_object();
    vm.allot_wrapper(t)
}

pub fn fx(value: Fixnum) -> Cell
{
    tag_fixnum(value)
}

/// Run a quotation built from `elements` on a fresh stack.
pub fn run(vm: &mut Vm, elements: &[Cell])
{
    let quot = vm.make_quotation(elements);
    vm.call_callable(quot);
}

/// The data stack, bottom first.
pub fn stack(vm: &Vm) -> Vec<Cell>
{
    let ctx = vm.ctx();
    ctx.data.cells[..ctx.depth()].to_vec()
}

pub fn stack_fixnums(vm: &Vm) -> Vec<Fixnum>
{
    stack(vm)
        .into_iter()
        .map(|cell| {
            assert_eq!(tag_of(cell), Tag::Fixnum as Cell, "non-fixnum on stack");
            untag_fixnum(cell)
        })
        .collect()
}

/// Decode a `(KERNEL_ERROR, kind, arg1, arg2)` array from the stack
/// top, as delivered to the error handler.
pub fn error_kind_on_stack(vm: &Vm) -> Option<Fixnum>
{
    let top = *stack(vm).last()?;
    if tag_of(top) != Tag::Array as Cell {
        return None;
    }
    let arr = untag(top);
    if object::array_capacity(&vm.heap.mem, arr) != 4 {
        return None;
    }
    let marker = object::array_nth(&vm.heap.mem, arr, 0);
    (marker == tag_fixnum(0))
        .then(|| untag_fixnum(object::array_nth(&vm.heap.mem, arr, 1)))
}

/// Build a tuple layout array: class word, slot count, echelon, and
/// one (superclass, hashcode) pair per echelon level.
pub fn make_layout(
    vm: &mut Vm,
    class_name: &[u8],
    size: Fixnum,
    echelon: Fixnum,
) -> Cell
{
    let klass = word(vm, class_name);
    let klass_root = vm.data_roots.push(klass);
    let capacity = 3 + 2 * (echelon as Cell + 1);
    let layout = vm.allot_array(capacity, FALSE);
    let klass = vm.data_roots.pop(klass_root);

    let arr = untag(layout);
    vm.heap.set_slot(arr, object::ARRAY_DATA, klass);
    vm.heap.set_slot(arr, object::ARRAY_DATA + 4, fx(size));
    vm.heap.set_slot(arr, object::ARRAY_DATA + 8, fx(echelon));
    for level in 0..=echelon {
        let hashcode = vm.hashcode_of(klass);
        let base = object::ARRAY_DATA + (3 + 2 * level as Cell) * 4;
        vm.heap.set_slot(arr, base, klass);
        vm.heap.set_slot(arr, base + 4, hashcode);
    }
    layout
}

/// A tuple instance of the given layout with the given slot values.
pub fn make_tuple(vm: &mut Vm, layout: Cell, slots: &[Cell]) -> Cell
{
    let handles: Vec<_> =
        slots.iter().map(|&slot| vm.data_roots.push(slot)).collect();
    let tuple = vm.allot_tuple(layout);
    for (index, handle) in handles.into_iter().enumerate().rev() {
        let value = vm.data_roots.pop(handle);
        vm.heap.set_slot(
            untag(tuple),
            object::TUPLE_DATA + index as Cell * 4,
            value,
        );
    }
    tuple
}
