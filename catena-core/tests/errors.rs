//! Error delivery: the taxonomy reaches the handler quotation as a
//! kernel error array, stacks are repaired first, and the handler
//! resumes execution cleanly.

mod common;

use {
    catena_core::{
        cell::{tag_fixnum, tag_of, untag, untag_fixnum, Cell, Tag, FALSE},
        errors::ErrorKind,
        object,
        special::OBJ_ERROR_HANDLER_QUOT,
    },
    common::*,
};

fn kind(vm: &catena_core::vm::Vm) -> Option<ErrorKind>
{
    let raw = error_kind_on_stack(vm)?;
    Some(match raw as u32 {
        2 => ErrorKind::Type,
        3 => ErrorKind::DivideByZero,
        5 => ErrorKind::ArraySize,
        6 => ErrorKind::OutOfFixnumRange,
        9 => ErrorKind::DatastackUnderflow,
        10 => ErrorKind::DatastackOverflow,
        11 => ErrorKind::RetainstackUnderflow,
        _ => return None,
    })
}

#[test]
fn the_error_array_has_the_kernel_error_shape()
{
    let mut vm = boot_vm();
    let swap = word(&mut vm, b"swap");
    run(&mut vm, &[fx(1), swap]);

    let top = *stack(&vm).last().unwrap();
    assert_eq!(tag_of(top), Tag::Array as Cell);
    let arr = untag(top);
    assert_eq!(object::array_capacity(&vm.heap.mem, arr), 4);
    assert_eq!(object::array_nth(&vm.heap.mem, arr, 0), tag_fixnum(0));
    assert_eq!(
        untag_fixnum(object::array_nth(&vm.heap.mem, arr, 1)),
        ErrorKind::DatastackUnderflow as u32 as i32,
    );
}

#[test]
fn type_errors_carry_expected_and_actual()
{
    let mut vm = boot_vm();
    let execute = word(&mut vm, b"execute");
    run(&mut vm, &[fx(9), execute]);

    let top = *stack(&vm).last().unwrap();
    let arr = untag(top);
    assert_eq!(
        untag_fixnum(object::array_nth(&vm.heap.mem, arr, 1)),
        ErrorKind::Type as u32 as i32,
    );
    assert_eq!(
        untag_fixnum(object::array_nth(&vm.heap.mem, arr, 2)),
        Tag::Word as i32,
    );
    assert_eq!(object::array_nth(&vm.heap.mem, arr, 3), fx(9));
}

#[test]
fn datastack_overflow_is_reported_and_repaired()
{
    let mut vm = boot_vm();
    let capacity = vm.ctx().data.cells.len();
    for _ in 0..capacity {
        vm.ctx_mut().push(fx(0)).unwrap();
    }
    let dup = word(&mut vm, b"dup");
    run(&mut vm, &[dup]);

    // Delivery needed stack room; the handler saw a well-formed stack
    // with the error array on top.
    assert_eq!(kind(&vm), Some(ErrorKind::DatastackOverflow));
    let ctx = vm.ctx();
    assert!(ctx.data.top < ctx.data.cells.len() as isize);
}

#[test]
fn retain_underflow_is_its_own_kind()
{
    let mut vm = boot_vm();
    let name = vm.byte_array_from_bytes(b"primitive_drop_locals");
    let marker =
        vm.special_objects[catena_core::special::OBJ_PRIMITIVE_WORD];
    run(&mut vm, &[fx(1), name, marker]);
    assert_eq!(kind(&vm), Some(ErrorKind::RetainstackUnderflow));
}

#[test]
fn unwinding_discards_the_rest_of_the_quotation()
{
    let mut vm = boot_vm();
    let dup = word(&mut vm, b"dup");
    // The 99 after the underflowing dup must never be pushed.
    run(&mut vm, &[dup, fx(99)]);

    let stack = stack(&vm);
    assert_eq!(stack.len(), 1);
    assert_eq!(tag_of(stack[0]), Tag::Array as Cell);
}

#[test]
fn the_handler_quotation_resumes_execution()
{
    let mut vm = boot_vm();
    // A handler that replaces the error with a marker value.
    let drop_word = word(&mut vm, b"drop");
    let handler = vm.make_quotation(&[drop_word, fx(777)]);
    vm.special_objects[OBJ_ERROR_HANDLER_QUOT] = handler;

    let dup = word(&mut vm, b"dup");
    run(&mut vm, &[dup]);
    assert_eq!(stack_fixnums(&vm), vec![777]);
}

#[test]
fn faults_clear_the_data_root_stack()
{
    let mut vm = boot_vm();
    vm.data_roots.push(FALSE);
    vm.data_roots.push(FALSE);

    let dup = word(&mut vm, b"dup");
    run(&mut vm, &[dup]);
    assert_eq!(vm.data_roots.depth(), 0);
}

#[test]
fn the_handler_receives_exactly_the_error_array()
{
    let mut vm = boot_vm();
    // A handler that duplicates what it was given: both copies stay.
    let dup = word(&mut vm, b"dup");
    let handler = vm.make_quotation(&[dup]);
    vm.special_objects[OBJ_ERROR_HANDLER_QUOT] = handler;

    let swap = word(&mut vm, b"swap");
    run(&mut vm, &[swap]);

    let stack = stack(&vm);
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0], stack[1]);
    assert_eq!(tag_of(stack[0]), Tag::Array as Cell);
}
