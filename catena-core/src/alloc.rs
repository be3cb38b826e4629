//! Typed allocators: one constructor per object kind, plus the
//! root-protected growable array used by accumulating primitives.
//!
//! Every allocation may trigger a collection, so any tagged cell a
//! constructor still needs afterwards is parked on the data-root stack
//! for the duration.

use {
    crate::{
        cell::{
            align, immediate_p, retag, tag_fixnum, untag, Cell, Fixnum, Tag,
            DATA_ALIGNMENT, FALSE,
        },
        gc::GcOp,
        object::{self, set_header, Header},
        roots::RootHandle,
        vm::Vm,
    },
    log::trace,
};

impl Vm
{
    /// Reserve `size` bytes in the nursery, collecting first when it
    /// is full. Objects too large for the nursery go straight to
    /// tenured.
    pub fn allot(&mut self, size: Cell) -> Cell
    {
        let size = align(size, DATA_ALIGNMENT);
        if size >= self.heap.nursery.size {
            return self.allot_large(size);
        }
        if self.heap.nursery.free_space() < size {
            trace!("nursery full, collecting for {size:#x} bytes");
            self.gc(GcOp::Nursery, size);
        }
        self.heap.nursery.allot(size)
    }

    fn allot_large(&mut self, size: Cell) -> Cell
    {
        for _ in 0..2 {
            let crate::heap::DataHeap{mem, tenured, ..} = &mut self.heap;
            if let Some(obj) = tenured.allot(mem, size) {
                // The object's slots may be initialized with young
                // pointers before any barrier-checked store runs.
                self.heap.mark_object_cards(obj, size);
                return obj;
            }
            self.gc(GcOp::Growing, size);
        }
        self.die("cannot allocate large object", size)
    }

    /// Reserve and header an object. The body is uninitialized.
    pub fn allot_object(&mut self, ty: Tag, size: Cell) -> Cell
    {
        let obj = self.allot(size);
        set_header(&mut self.heap.mem, obj, Header::new(ty));
        obj
    }

    pub fn allot_array(&mut self, capacity: Cell, fill: Cell) -> Cell
    {
        let fill_root = self.root(fill);
        let obj = self.allot_object(Tag::Array, object::array_size_for(capacity));
        let fill = self.unroot(fill_root);
        self.heap.mem.set_cell(
            obj + object::ARRAY_CAPACITY,
            tag_fixnum(capacity as Fixnum),
        );
        self.heap.mem.fill_cells(obj + object::ARRAY_DATA, capacity, fill);
        retag(obj, Tag::Array as Cell)
    }

    /// Array whose elements the caller writes immediately.
    pub fn allot_uninitialized_array(&mut self, capacity: Cell) -> Cell
    {
        let obj = self.allot_object(Tag::Array, object::array_size_for(capacity));
        self.heap.mem.set_cell(
            obj + object::ARRAY_CAPACITY,
            tag_fixnum(capacity as Fixnum),
        );
        retag(obj, Tag::Array as Cell)
    }

    pub fn allot_array_4(&mut self, v1: Cell, v2: Cell, v3: Cell, v4: Cell)
        -> Cell
    {
        let r1 = self.root(v1);
        let r2 = self.root(v2);
        let r3 = self.root(v3);
        let r4 = self.root(v4);
        let tagged = self.allot_uninitialized_array(4);
        let obj = untag(tagged);
        let v4 = self.unroot(r4);
        let v3 = self.unroot(r3);
        let v2 = self.unroot(r2);
        let v1 = self.unroot(r1);
        for (index, value) in [v1, v2, v3, v4].into_iter().enumerate() {
            self.heap.set_slot(
                obj,
                object::ARRAY_DATA + index as Cell * 4,
                value,
            );
        }
        tagged
    }

    pub fn allot_byte_array(&mut self, capacity: Cell) -> Cell
    {
        let obj = self.allot_object(
            Tag::ByteArray,
            object::byte_array_size_for(capacity),
        );
        self.heap.mem.set_cell(
            obj + object::BYTE_ARRAY_CAPACITY,
            tag_fixnum(capacity as Fixnum),
        );
        self.heap.mem.fill_bytes(obj + object::BYTE_ARRAY_DATA, capacity, 0);
        retag(obj, Tag::ByteArray as Cell)
    }

    pub fn byte_array_from_bytes(&mut self, bytes: &[u8]) -> Cell
    {
        let tagged = self.allot_byte_array(bytes.len() as Cell);
        self.heap.mem
            .slice_mut(untag(tagged) + object::BYTE_ARRAY_DATA, bytes.len() as Cell)
            .copy_from_slice(bytes);
        tagged
    }

    pub fn allot_string(&mut self, length: Cell, fill: u8) -> Cell
    {
        let obj = self.allot_object(Tag::String, object::string_size_for(length));
        self.heap.mem.set_cell(
            obj + object::STRING_LENGTH,
            tag_fixnum(length as Fixnum),
        );
        self.heap.mem.set_cell(obj + object::STRING_AUX, FALSE);
        self.heap.mem.set_cell(obj + object::STRING_HASHCODE, tag_fixnum(0));
        self.heap.mem.fill_bytes(obj + object::STRING_DATA, length, fill);
        retag(obj, Tag::String as Cell)
    }

    pub fn string_from_bytes(&mut self, bytes: &[u8]) -> Cell
    {
        let tagged = self.allot_string(bytes.len() as Cell, 0);
        self.heap.mem
            .slice_mut(untag(tagged) + object::STRING_DATA, bytes.len() as Cell)
            .copy_from_slice(bytes);
        tagged
    }

    /// `array` is the tagged element array.
    pub fn allot_quotation(&mut self, array: Cell) -> Cell
    {
        let root = self.root(array);
        let obj = self.allot_object(Tag::Quotation, object::QUOTATION_SIZE);
        let array = self.unroot(root);
        self.heap.set_slot(obj, object::QUOTATION_ARRAY, array);
        self.heap.mem.set_cell(obj + object::QUOTATION_CACHED_EFFECT, FALSE);
        self.heap.mem.set_cell(obj + object::QUOTATION_CACHE_COUNTER, FALSE);
        retag(obj, Tag::Quotation as Cell)
    }

    pub fn allot_wrapper(&mut self, wrapped: Cell) -> Cell
    {
        let root = self.root(wrapped);
        let obj = self.allot_object(Tag::Wrapper, object::WRAPPER_SIZE);
        let wrapped = self.unroot(root);
        self.heap.set_slot(obj, object::WRAPPER_OBJECT, wrapped);
        retag(obj, Tag::Wrapper as Cell)
    }

    pub fn allot_word(&mut self, name: Cell, vocabulary: Cell, hashcode: Cell)
        -> Cell
    {
        let name_root = self.root(name);
        let vocabulary_root = self.root(vocabulary);
        let obj = self.allot_object(Tag::Word, object::WORD_SIZE);
        let vocabulary = self.unroot(vocabulary_root);
        let name = self.unroot(name_root);
        self.heap.mem.set_cell(obj + object::WORD_HASHCODE, hashcode);
        self.heap.set_slot(obj, object::WORD_NAME, name);
        self.heap.set_slot(obj, object::WORD_VOCABULARY, vocabulary);
        self.heap.mem.set_cell(obj + object::WORD_DEF, FALSE);
        self.heap.mem.set_cell(obj + object::WORD_PROPS, FALSE);
        self.heap.mem.set_cell(obj + object::WORD_PIC_DEF, FALSE);
        self.heap.mem.set_cell(obj + object::WORD_PIC_TAIL_DEF, FALSE);
        self.heap.mem.set_cell(obj + object::WORD_SUBPRIMITIVE, FALSE);
        self.heap.mem.set_cell(obj + object::WORD_ENTRY_POINT, 0);
        retag(obj, Tag::Word as Cell)
    }

    /// `layout` is the tagged layout array; slots are filled with `f`.
    pub fn allot_tuple(&mut self, layout: Cell) -> Cell
    {
        let slots = self.tuple_layout_size(layout);
        let root = self.root(layout);
        let obj = self.allot_object(Tag::Tuple, object::tuple_size_for(slots));
        let layout = self.unroot(root);
        self.heap.set_slot(obj, object::TUPLE_LAYOUT, layout);
        self.heap.mem.fill_cells(obj + object::TUPLE_DATA, slots, FALSE);
        retag(obj, Tag::Tuple as Cell)
    }

    pub fn tuple_layout_size(&self, layout: Cell) -> Cell
    {
        crate::cell::untag_fixnum(object::array_nth(
            &self.heap.mem,
            untag(layout),
            object::LAYOUT_SIZE,
        )) as Cell
    }

    pub fn allot_float(&mut self, value: f64) -> Cell
    {
        let obj = self.allot_object(Tag::Float, object::FLOAT_SIZE);
        self.heap.mem.set_cell(obj + 4, 0);
        self.heap.mem.set_u64(obj + object::FLOAT_PAYLOAD, value.to_bits());
        retag(obj, Tag::Float as Cell)
    }

    pub fn float_value(&self, tagged: Cell) -> f64
    {
        f64::from_bits(self.heap.mem.u64_at(untag(tagged) + object::FLOAT_PAYLOAD))
    }

    pub fn allot_alien(&mut self, base: Cell, address: Cell) -> Cell
    {
        let root = self.root(base);
        let obj = self.allot_object(Tag::Alien, object::ALIEN_SIZE);
        let base = self.unroot(root);
        self.heap.set_slot(obj, object::ALIEN_BASE, base);
        self.heap.mem.set_cell(obj + object::ALIEN_EXPIRED, FALSE);
        self.heap.mem.set_cell(obj + object::ALIEN_DISPLACEMENT, tag_fixnum(0));
        self.heap.mem.set_cell(obj + object::ALIEN_ADDRESS, address);
        retag(obj, Tag::Alien as Cell)
    }

    pub fn allot_dll(&mut self, path: Cell) -> Cell
    {
        let root = self.root(path);
        let obj = self.allot_object(Tag::Dll, object::DLL_SIZE);
        let path = self.unroot(root);
        self.heap.set_slot(obj, object::DLL_PATH, path);
        self.heap.mem.set_cell(obj + object::DLL_HANDLE, FALSE);
        retag(obj, Tag::Dll as Cell)
    }

    /// Wrapped callstacks hold raw cells the GC never traces.
    pub fn allot_callstack(&mut self, cells: &[Cell]) -> Cell
    {
        let length = cells.len() as Cell * 4;
        let obj = self.allot_object(
            Tag::Callstack,
            object::callstack_size_for(length),
        );
        self.heap.mem.set_cell(
            obj + object::CALLSTACK_LENGTH,
            tag_fixnum(length as Fixnum),
        );
        for (index, &cell) in cells.iter().enumerate() {
            self.heap.mem.set_cell(
                obj + object::CALLSTACK_DATA + index as Cell * 4,
                cell,
            );
        }
        retag(obj, Tag::Callstack as Cell)
    }

    /// Shallow copy. Shares nothing but the cell contents.
    pub fn clone_object(&mut self, tagged: Cell) -> Cell
    {
        if immediate_p(tagged) {
            return tagged;
        }
        let tag = crate::cell::tag_of(tagged);
        let root = self.root(tagged);
        let size = object::object_size(&self.heap.mem, untag(tagged));
        let new = self.allot(size);
        let tagged = self.unroot(root);
        self.heap.mem.copy_within(untag(tagged), new, size);
        if self.heap.tenured_contains(new) {
            self.heap.mark_object_cards(new, size);
        }
        retag(new, tag)
    }

    /// Reallocate an array to a new capacity, preserving a prefix.
    pub fn reallot_array(&mut self, tagged: Cell, new_capacity: Cell) -> Cell
    {
        let root = self.root(tagged);
        let new = self.allot_uninitialized_array(new_capacity);
        let old = self.unroot(root);

        let old_capacity = object::array_capacity(&self.heap.mem, untag(old));
        let keep = old_capacity.min(new_capacity);
        self.heap.mem.copy_within(
            untag(old) + object::ARRAY_DATA,
            untag(new) + object::ARRAY_DATA,
            keep * 4,
        );
        self.heap.mem.fill_cells(
            untag(new) + object::ARRAY_DATA + keep * 4,
            new_capacity - keep,
            FALSE,
        );
        if self.heap.tenured_contains(untag(new)) {
            let size = object::array_size_for(new_capacity);
            self.heap.mark_object_cards(untag(new), size);
        }
        new
    }

    fn root(&mut self, value: Cell) -> RootHandle
    {
        self.data_roots.push(value)
    }

    fn unroot(&mut self, handle: RootHandle) -> Cell
    {
        self.data_roots.pop(handle)
    }
}

/// A root-protected array that grows by doubling. Used by primitives
/// that accumulate results while allocating.
pub struct GrowableArray
{
    handle: RootHandle,
    count: Cell,
}

impl GrowableArray
{
    pub fn new(vm: &mut Vm) -> Self
    {
        let array = vm.allot_array(2, FALSE);
        Self{handle: vm.data_roots.push(array), count: 0}
    }

    pub fn add(&mut self, vm: &mut Vm, element: Cell)
    {
        let element_root = vm.data_roots.push(element);
        let array = vm.data_roots.get(self.handle);
        let capacity = object::array_capacity(&vm.heap.mem, untag(array));
        if self.count == capacity {
            let grown = vm.reallot_array(array, capacity * 2);
            vm.data_roots.set(self.handle, grown);
        }
        let element = vm.data_roots.pop(element_root);
        let array = untag(vm.data_roots.get(self.handle));
        vm.heap.set_slot(
            array,
            object::ARRAY_DATA + self.count * 4,
            element,
        );
        self.count += 1;
    }

    /// Shrink to the exact element count, pop the root, and return the
    /// tagged array.
    pub fn finish(self, vm: &mut Vm) -> Cell
    {
        let array = vm.data_roots.get(self.handle);
        let trimmed = vm.reallot_array(array, self.count);
        vm.data_roots.set(self.handle, trimmed);
        vm.data_roots.pop(self.handle)
    }
}
