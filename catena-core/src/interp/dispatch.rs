//! Megamorphic method dispatch.
//!
//! A generic word's call site carries an open-addressed cache mapping
//! class identity to method. On a miss the interpreter walks the
//! generic's echelon-indexed method table: each echelon entry is
//! either a single word (the whole class has one method), false (no
//! method at this echelon), or a hashed association keyed by
//! superclass. The found method is written back into the cache.

use {
    crate::{
        cell::{
            tag_fixnum, tag_of, to_boolean, untag, untag_fixnum, Cell, Fixnum,
            Tag, FALSE, TAG_BITS,
        },
        errors::VmResult,
        object::{self, array_capacity, array_nth},
        vm::Vm,
    },
    log::trace,
};

/// The class of a value for dispatch purposes: a tuple's layout, or
/// the tag as a fixnum for every other type.
pub fn object_class(vm: &Vm, obj: Cell) -> Cell
{
    if tag_of(obj) == Tag::Tuple as Cell {
        vm.heap.mem.cell_at(untag(obj) + object::TUPLE_LAYOUT)
    } else {
        tag_fixnum(tag_of(obj) as Fixnum)
    }
}

/// Linear scan of `(class, method)` pairs, newest last.
fn search_lookup_alist(vm: &Vm, table: Cell, klass: Cell) -> Cell
{
    let elements = untag(table);
    let capacity = array_capacity(&vm.heap.mem, elements);
    let mut index = capacity as i64 - 2;
    while index >= 0 {
        if array_nth(&vm.heap.mem, elements, index as Cell) == klass {
            return array_nth(&vm.heap.mem, elements, index as Cell + 1);
        }
        index -= 2;
    }
    FALSE
}

/// Bucketed lookup: the hashcode selects a bucket which is either a
/// direct entry or an alist.
fn search_lookup_hash(vm: &Vm, table: Cell, klass: Cell, hashcode: Cell) -> Cell
{
    let buckets = untag(table);
    let capacity = array_capacity(&vm.heap.mem, buckets);
    let bucket = array_nth(&vm.heap.mem, buckets, hashcode & (capacity - 1));
    if tag_of(bucket) == Tag::Array as Cell {
        search_lookup_alist(vm, bucket, klass)
    } else {
        bucket
    }
}

/// The superclass at `echelon` recorded in a tuple layout.
fn nth_superclass(vm: &Vm, layout: Cell, echelon: Fixnum) -> Cell
{
    array_nth(&vm.heap.mem, layout, 3 + echelon as Cell * 2)
}

fn nth_hashcode(vm: &Vm, layout: Cell, echelon: Fixnum) -> Cell
{
    array_nth(&vm.heap.mem, layout, 4 + echelon as Cell * 2)
}

fn lookup_tuple_method(vm: &mut Vm, obj: Cell, methods: Cell) -> Cell
{
    let layout = untag(vm.heap.mem.cell_at(untag(obj) + object::TUPLE_LAYOUT));
    let echelons = untag(methods);

    let layout_echelon = untag_fixnum(array_nth(
        &vm.heap.mem,
        layout,
        object::LAYOUT_ECHELON,
    ));
    let mut echelon = layout_echelon
        .min(array_capacity(&vm.heap.mem, echelons) as Fixnum - 1);

    while echelon >= 0 {
        let entry = array_nth(&vm.heap.mem, echelons, echelon as Cell);
        if tag_of(entry) == Tag::Word as Cell {
            return entry;
        }
        if to_boolean(entry) {
            let klass = nth_superclass(vm, layout, echelon);
            let hashcode =
                untag_fixnum(nth_hashcode(vm, layout, echelon)) as Cell;
            let result = search_lookup_hash(vm, entry, klass, hashcode);
            if to_boolean(result) {
                return result;
            }
        }
        echelon -= 1;
    }

    vm.die("cannot find tuple method", methods)
}

/// Find the method for `obj` in a generic's method table: indexed by
/// tag, with tuples refined through the echelon walk.
pub fn lookup_method(vm: &mut Vm, obj: Cell, methods: Cell) -> Cell
{
    let tag = tag_of(obj);
    let method = array_nth(&vm.heap.mem, untag(methods), tag);
    if tag == Tag::Tuple as Cell && tag_of(method) == Tag::Array as Cell {
        return lookup_tuple_method(vm, obj, method);
    }
    method
}

/// Index of a class's slot in a call-site cache: the cache is a
/// power-of-two array of `(class, method)` pairs.
fn method_cache_hashcode(vm: &Vm, klass: Cell, cache: Cell) -> Cell
{
    let capacity = array_capacity(&vm.heap.mem, untag(cache));
    ((klass >> TAG_BITS) & ((capacity >> 1) - 1)) << 1
}

pub fn update_method_cache(vm: &mut Vm, cache: Cell, klass: Cell, method: Cell)
{
    let hashcode = method_cache_hashcode(vm, klass, cache);
    let cache = untag(cache);
    vm.heap.set_slot(cache, object::ARRAY_DATA + hashcode * 4, klass);
    vm.heap
        .set_slot(cache, object::ARRAY_DATA + (hashcode + 1) * 4, method);
}

/// The mega-cache-lookup handler: `( methods index cache -- )`. Runs
/// on a cache miss; finds the method, fills the cache, and schedules
/// the method. The dispatch argument stays on the stack.
pub fn mega_cache_lookup(vm: &mut Vm) -> VmResult<()>
{
    vm.dispatch_stats.megamorphic_cache_misses += 1;

    let cache = vm.ctx_mut().pop()?;
    let index = vm.ctx_mut().pop()?;
    let methods = vm.ctx_mut().pop()?;
    let index = untag_fixnum(index) as usize;

    let obj = vm.ctx().nth_from_top(index)?;
    let klass = object_class(vm, obj);
    let method = lookup_method(vm, obj, methods);
    update_method_cache(vm, cache, klass, method);

    trace!("mega-cache miss, method tag {}", tag_of(method));
    let method_tag = tag_of(method);
    if method_tag == Tag::Word as Cell || method_tag == Tag::Quotation as Cell {
        vm.schedule_callable(method);
        Ok(())
    } else {
        vm.die("mega-cache-lookup found a non-callable method", method)
    }
}

/// The mega-cache-miss primitive: like the handler, but pushes the
/// method instead of calling it.
pub fn mega_cache_miss(vm: &mut Vm) -> VmResult<()>
{
    vm.dispatch_stats.megamorphic_cache_misses += 1;

    let cache = vm.ctx_mut().pop()?;
    let index = vm.ctx_mut().pop()?;
    let methods = vm.ctx_mut().pop()?;
    let index = untag_fixnum(index) as usize;

    let obj = vm.ctx().nth_from_top(index)?;
    let klass = object_class(vm, obj);
    let method = lookup_method(vm, obj, methods);
    update_method_cache(vm, cache, klass, method);
    vm.ctx_mut().push(method)
}
