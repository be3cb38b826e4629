//! Image save/load round-trips: the object graph survives modulo the
//! relocation offset.

mod common;

use {
    catena_core::{
        cell::{tag_of, untag, untag_fixnum, Tag, Cell, FALSE},
        image, object,
        special::{OBJ_GLOBAL, OBJ_STARTUP_QUOT},
        vm::Vm,
    },
    common::*,
    std::path::PathBuf,
};

fn temp_image(name: &str) -> PathBuf
{
    let mut path = std::env::temp_dir();
    path.push(format!("catena-test-{name}-{}.image", std::process::id()));
    path
}

#[test]
fn save_load_round_trips_the_object_graph()
{
    let path = temp_image("roundtrip");

    let mut vm = boot_vm();
    // A little graph: an array holding a string, a fixnum, a nested
    // array, and a word.
    let string = vm.string_from_bytes(b"persistent");
    let string_root = vm.data_roots.push(string);
    let nested = vm.allot_array(2, fx(17));
    let nested_root = vm.data_roots.push(nested);
    let defined = vm.define_word(b"answer", &[fx(42)]);
    let defined_root = vm.data_roots.push(defined);

    let global = vm.allot_array(4, FALSE);
    let defined = vm.data_roots.pop(defined_root);
    let nested = vm.data_roots.pop(nested_root);
    let string = vm.data_roots.pop(string_root);
    for (index, value) in [string, fx(23), nested, defined].into_iter().enumerate()
    {
        vm.heap.set_slot(
            untag(global),
            object::ARRAY_DATA + index as Cell * 4,
            value,
        );
    }
    vm.special_objects[OBJ_GLOBAL] = global;

    // A startup quotation that pushes 23.
    let startup = vm.make_quotation(&[fx(23)]);
    vm.special_objects[OBJ_STARTUP_QUOT] = startup;

    image::save(&mut vm, &path).expect("save");
    drop(vm);

    let mut vm = Vm::new(small_params());
    image::load(&mut vm, &path).expect("load");

    let global = vm.special_objects[OBJ_GLOBAL];
    assert_eq!(tag_of(global), Tag::Array as Cell);
    let arr = untag(global);

    let string = object::array_nth(&vm.heap.mem, arr, 0);
    assert_eq!(tag_of(string), Tag::String as Cell);
    assert_eq!(vm.string_bytes(string), b"persistent");

    assert_eq!(untag_fixnum(object::array_nth(&vm.heap.mem, arr, 1)), 23);

    let nested = object::array_nth(&vm.heap.mem, arr, 2);
    assert_eq!(tag_of(nested), Tag::Array as Cell);
    assert_eq!(
        untag_fixnum(object::array_nth(&vm.heap.mem, untag(nested), 1)),
        17,
    );

    let defined = object::array_nth(&vm.heap.mem, arr, 3);
    assert_eq!(tag_of(defined), Tag::Word as Cell);

    // The loaded word still runs.
    vm.call_callable(defined);
    assert_eq!(stack_fixnums(&vm), vec![42]);

    // The startup quotation runs too.
    vm.ctx_mut().data.top = -1;
    vm.run_startup();
    assert_eq!(stack_fixnums(&vm), vec![23]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn loaded_image_keeps_collecting_correctly()
{
    let path = temp_image("collects");

    let mut vm = boot_vm();
    let keep = vm.allot_array(8, fx(5));
    vm.special_objects[OBJ_GLOBAL] = keep;
    image::save(&mut vm, &path).expect("save");
    drop(vm);

    let mut vm = Vm::new(small_params());
    image::load(&mut vm, &path).expect("load");

    // Allocate heavily and collect; the loaded data must survive.
    for _ in 0..5_000 {
        vm.allot_array(12, FALSE);
    }
    vm.primitive_full_gc();
    vm.primitive_compact_gc();

    let keep = vm.special_objects[OBJ_GLOBAL];
    assert_eq!(
        untag_fixnum(object::array_nth(&vm.heap.mem, untag(keep), 7)),
        5,
    );

    let _ = std::fs::remove_file(&path);
}

#[test]
fn truncated_image_is_rejected()
{
    let path = temp_image("truncated");
    std::fs::write(&path, [0u8; 10]).unwrap();
    let mut vm = Vm::new(small_params());
    assert!(matches!(
        image::load(&mut vm, &path),
        Err(image::ImageError::Truncated),
    ));
    let _ = std::fs::remove_file(&path);
}
