//! The closed primitive enumeration.
//!
//! A primitive is named by a byte-array literal followed by the
//! do-primitive marker word in a quotation, or stored in a word's
//! subprimitive slot. Dispatch is a match over the name bytes, which
//! the compiler turns into the same kind of switch the name hash would
//! have produced.

use {
    crate::{
        cell::{
            immediate_p, tag_fixnum, tag_of, untag, untag_fixnum, Cell, Fixnum,
            Tag, FALSE, FIXNUM_MAX,
        },
        errors::{ErrorKind, Fault, VmResult},
        gc::{GcOp, SlotVisitor, VmRoots},
        interp::{dispatch, handlers},
        object::{self, array_capacity, array_nth, header_at},
        vm::Vm,
    },
    log::warn,
    std::collections::HashMap,
    std::time::{SystemTime, UNIX_EPOCH},
};

/// Largest array capacity a fixnum request may name.
const ARRAY_SIZE_MAX: Fixnum = FIXNUM_MAX / 4;

impl Vm
{
    /// Run the named primitive. `Ok(false)` means the name is not in
    /// the enumeration.
    pub fn dispatch_primitive(&mut self, name: &[u8]) -> VmResult<bool>
    {
        match name {
            b"primitive_array" => self.primitive_array()?,
            b"primitive_byte_array" => self.primitive_byte_array()?,
            b"primitive_uninitialized_byte_array" =>
                self.primitive_byte_array()?,
            b"primitive_string" => self.primitive_string()?,
            b"primitive_tuple" => self.primitive_tuple()?,
            b"primitive_tuple_boa" => self.primitive_tuple_boa()?,
            b"primitive_array_to_quotation" =>
                self.primitive_array_to_quotation()?,
            b"primitive_wrapper" => self.primitive_wrapper()?,
            b"primitive_word" => self.primitive_word()?,
            b"primitive_clone" => self.primitive_clone()?,

            b"primitive_resize_array" => self.primitive_resize_array()?,
            b"primitive_resize_byte_array" =>
                self.primitive_resize_byte_array()?,
            b"primitive_resize_string" => self.primitive_resize_string()?,
            b"primitive_set_nth" => self.primitive_set_nth()?,
            b"primitive_nth_unsafe" => self.primitive_nth_unsafe()?,

            b"primitive_rehash_string" => self.primitive_rehash_string()?,
            b"primitive_set_string_hashcode" =>
                self.primitive_set_string_hashcode()?,
            b"primitive_hashcode" => self.primitive_hashcode()?,
            b"primitive_identity_hashcode" =>
                self.primitive_identity_hashcode()?,
            b"primitive_hash_at" => self.primitive_hash_at()?,
            b"primitive_key_at" => self.primitive_key_at()?,

            b"primitive_datastack" => self.primitive_datastack()?,
            b"primitive_set_datastack" => self.primitive_set_datastack()?,
            b"primitive_retainstack" => self.primitive_retainstack()?,
            b"primitive_set_retainstack" => self.primitive_set_retainstack()?,
            b"primitive_callstack" => self.primitive_callstack()?,
            b"primitive_set_callstack" => self.primitive_set_callstack()?,
            b"primitive_load_locals" => self.primitive_load_locals()?,
            b"primitive_drop_locals" => self.primitive_drop_locals()?,
            b"primitive_get_local" => self.primitive_get_local()?,
            b"primitive_callstack_bounds" =>
                self.primitive_callstack_bounds()?,

            b"primitive_minor_gc" => self.primitive_minor_gc(),
            b"primitive_full_gc" => self.primitive_full_gc(),
            b"primitive_compact_gc" => self.primitive_compact_gc(),
            b"primitive_enable_gc_events" => self.primitive_enable_gc_events(),
            b"primitive_disable_gc_events" =>
                self.primitive_disable_gc_events()?,
            b"primitive_data_room" => self.primitive_data_room()?,
            b"primitive_size" => self.primitive_size()?,
            b"primitive_instances" => self.primitive_instances()?,
            b"primitive_become" => self.primitive_become()?,
            b"primitive_save_image" => self.primitive_save_image()?,

            b"primitive_die" => {
                let top = self.ctx_mut().pop().unwrap_or(FALSE);
                self.die("die primitive called", top)
            },
            b"primitive_exit" => self.primitive_exit()?,
            b"primitive_nano_count" => self.primitive_nano_count()?,
            b"primitive_sleep" | b"primitive_sleep_raw" =>
                self.primitive_sleep()?,
            b"primitive_current_callback" => self.ctx_mut().push(FALSE)?,
            b"primitive_eq" => {
                handlers::dispatch_handler(self, handlers::HANDLER_EQ)?;
            },

            b"primitive_dispatch_stats" => self.primitive_dispatch_stats()?,
            b"primitive_reset_dispatch_stats" => {
                self.dispatch_stats = Default::default();
            },
            b"primitive_lookup_method" => self.primitive_lookup_method()?,
            b"primitive_mega_cache_miss" => dispatch::mega_cache_miss(self)?,

            b"primitive_special_object" => {
                handlers::dispatch_handler(self, handlers::HANDLER_SPECIAL_OBJECT)?;
            },
            b"primitive_set_special_object" => {
                handlers::dispatch_handler(
                    self,
                    handlers::HANDLER_SET_SPECIAL_OBJECT,
                )?;
            },

            b"primitive_fixnum_to_bignum" =>
                self.primitive_fixnum_to_bignum()?,
            b"primitive_bignum_to_fixnum" =>
                self.primitive_bignum_to_fixnum()?,
            b"primitive_fixnum_to_float" => self.primitive_fixnum_to_float()?,
            b"primitive_float_to_fixnum" => self.primitive_float_to_fixnum()?,

            b"primitive_fixnum+" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_PLUS)?;
            },
            b"primitive_fixnum-" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_MINUS)?;
            },
            b"primitive_fixnum*" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_TIMES)?;
            },
            b"primitive_fixnum_shift" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_SHIFT)?;
            },
            b"primitive_fixnum_divint" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_DIVI)?;
            },
            b"primitive_fixnum_divmod" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_DIVMOD)?;
            },
            b"primitive_fixnum_mod" => {
                handlers::dispatch_handler(self, handlers::HANDLER_FIXNUM_MOD)?;
            },

            b"primitive_print" => self.primitive_print()?,

            // Glue for facilities this target does not have.
            b"primitive_set_innermost_stack_frame" => {
                self.ctx_mut().pop()?;
            },
            b"primitive_callback" =>
                return Err(Fault::bare(ErrorKind::CallbackSpaceOverflow)),
            b"primitive_dlopen" => self.primitive_dlopen()?,
            b"primitive_dlsym" | b"primitive_dlsym_raw" => {
                self.ctx_mut().pop()?;
                self.ctx_mut().pop()?;
                self.ctx_mut().push(FALSE)?;
            },
            b"primitive_dlclose" => {
                self.ctx_mut().pop()?;
            },
            b"primitive_exists" => self.primitive_exists()?,
            b"primitive_disable_ctrl_break"
            | b"primitive_enable_ctrl_break" => (),

            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Pop an array capacity, range-checked.
    fn unbox_array_size(&mut self) -> VmResult<Cell>
    {
        let raw = self.ctx_mut().pop()?;
        if tag_of(raw) != Tag::Fixnum as Cell {
            return Err(Fault::new(ErrorKind::ArraySize, raw, FALSE));
        }
        let size = untag_fixnum(raw);
        if !(0..=ARRAY_SIZE_MAX).contains(&size) {
            return Err(Fault::new(ErrorKind::ArraySize, raw, FALSE));
        }
        Ok(size as Cell)
    }

    // Allocation.

    fn primitive_array(&mut self) -> VmResult<()>
    {
        let fill = self.ctx_mut().pop()?;
        let capacity = self.unbox_array_size()?;
        let array = self.allot_array(capacity, fill);
        self.ctx_mut().push(array)
    }

    fn primitive_byte_array(&mut self) -> VmResult<()>
    {
        let capacity = self.unbox_array_size()?;
        let bytes = self.allot_byte_array(capacity);
        self.ctx_mut().push(bytes)
    }

    fn primitive_string(&mut self) -> VmResult<()>
    {
        let fill = self.ctx_mut().pop()?;
        let length = self.unbox_array_size()?;
        let fill = if tag_of(fill) == Tag::Fixnum as Cell {
            untag_fixnum(fill) as u8
        } else {
            0
        };
        let string = self.allot_string(length, fill);
        self.ctx_mut().push(string)
    }

    fn primitive_tuple(&mut self) -> VmResult<()>
    {
        let layout = self.ctx_mut().pop()?;
        self.check_tagged(layout, Tag::Array)?;
        let tuple = self.allot_tuple(layout);
        self.ctx_mut().push(tuple)
    }

    /// `( slots... layout -- tuple )`: fills the new tuple's slots
    /// from the stack, bottommost value into slot 0.
    fn primitive_tuple_boa(&mut self) -> VmResult<()>
    {
        let layout = self.ctx_mut().pop()?;
        self.check_tagged(layout, Tag::Array)?;
        let slots = self.tuple_layout_size(layout);

        // The values stay on the stack across the allocation so the
        // collector keeps them alive.
        let tuple = self.allot_tuple(layout);
        let obj = untag(tuple);
        for slot in (0..slots).rev() {
            let value = self.ctx_mut().pop()?;
            self.heap.set_slot(obj, object::TUPLE_DATA + slot * 4, value);
        }
        self.ctx_mut().push(tuple)
    }

    fn primitive_array_to_quotation(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let quot = self.allot_quotation(array);
        self.ctx_mut().push(quot)
    }

    fn primitive_wrapper(&mut self) -> VmResult<()>
    {
        let wrapped = self.ctx_mut().pop()?;
        let wrapper = self.allot_wrapper(wrapped);
        self.ctx_mut().push(wrapper)
    }

    fn primitive_word(&mut self) -> VmResult<()>
    {
        let hashcode = self.ctx_mut().pop()?;
        let vocabulary = self.ctx_mut().pop()?;
        let name = self.ctx_mut().pop()?;
        let word = self.allot_word(name, vocabulary, hashcode);
        self.ctx_mut().push(word)
    }

    fn primitive_clone(&mut self) -> VmResult<()>
    {
        let obj = self.ctx_mut().pop()?;
        let clone = self.clone_object(obj);
        self.ctx_mut().push(clone)
    }

    // Sequences.

    fn primitive_resize_array(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let capacity = self.unbox_array_size()?;
        let resized = self.reallot_array(array, capacity);
        self.ctx_mut().push(resized)
    }

    fn primitive_resize_byte_array(&mut self) -> VmResult<()>
    {
        let old = self.ctx_mut().pop()?;
        self.check_tagged(old, Tag::ByteArray)?;
        let capacity = self.unbox_array_size()?;

        let root = self.data_roots.push(old);
        let new = self.allot_byte_array(capacity);
        let old = self.data_roots.pop(root);

        let old_capacity = object::byte_array_capacity(&self.heap.mem, untag(old));
        let keep = old_capacity.min(capacity);
        self.heap.mem.copy_within(
            untag(old) + object::BYTE_ARRAY_DATA,
            untag(new) + object::BYTE_ARRAY_DATA,
            keep,
        );
        self.ctx_mut().push(new)
    }

    fn primitive_resize_string(&mut self) -> VmResult<()>
    {
        let old = self.ctx_mut().pop()?;
        self.check_tagged(old, Tag::String)?;
        let length = self.unbox_array_size()?;

        let root = self.data_roots.push(old);
        let new = self.allot_string(length, 0);
        let old = self.data_roots.pop(root);

        let old_length = object::string_length(&self.heap.mem, untag(old));
        let keep = old_length.min(length);
        self.heap.mem.copy_within(
            untag(old) + object::STRING_DATA,
            untag(new) + object::STRING_DATA,
            keep,
        );
        self.ctx_mut().push(new)
    }

    fn primitive_set_nth(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let index = self.unbox_array_size()?;
        let value = self.ctx_mut().pop()?;
        if index >= array_capacity(&self.heap.mem, untag(array)) {
            return Err(Fault::new(ErrorKind::ArraySize, tag_fixnum(index as Fixnum), array));
        }
        self.heap
            .set_slot(untag(array), object::ARRAY_DATA + index * 4, value);
        Ok(())
    }

    fn primitive_nth_unsafe(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let index = self.unbox_array_size()?;
        if index >= array_capacity(&self.heap.mem, untag(array)) {
            return Err(Fault::new(ErrorKind::ArraySize, tag_fixnum(index as Fixnum), array));
        }
        let value = array_nth(&self.heap.mem, untag(array), index);
        self.ctx_mut().push(value)
    }

    // Strings and hashing.

    fn string_hash(&self, string: Cell) -> Fixnum
    {
        // FNV-1a folded into the fixnum range.
        let mut hash: u32 = 0x811c_9dc5;
        for &byte in self.string_bytes(string) {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        (hash & FIXNUM_MAX as u32) as Fixnum
    }

    fn primitive_rehash_string(&mut self) -> VmResult<()>
    {
        let string = self.ctx_mut().pop()?;
        self.check_tagged(string, Tag::String)?;
        let hash = self.string_hash(string);
        self.heap.mem.set_cell(
            untag(string) + object::STRING_HASHCODE,
            tag_fixnum(hash),
        );
        Ok(())
    }

    fn primitive_set_string_hashcode(&mut self) -> VmResult<()>
    {
        let string = self.ctx_mut().pop()?;
        self.check_tagged(string, Tag::String)?;
        let hashcode = self.ctx_mut().pop()?;
        self.heap
            .mem
            .set_cell(untag(string) + object::STRING_HASHCODE, hashcode);
        Ok(())
    }

    pub fn hashcode_of(&mut self, value: Cell) -> Cell
    {
        let tag = tag_of(value);
        if tag == Tag::Fixnum as Cell {
            value
        } else if tag == Tag::String as Cell {
            let cached =
                self.heap.mem.cell_at(untag(value) + object::STRING_HASHCODE);
            if untag_fixnum(cached) != 0 {
                cached
            } else {
                tag_fixnum(self.string_hash(value))
            }
        } else if tag == Tag::Word as Cell {
            self.heap.mem.cell_at(untag(value) + object::WORD_HASHCODE)
        } else {
            self.identity_hashcode_of(value)
        }
    }

    fn primitive_hashcode(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        let hash = self.hashcode_of(value);
        self.ctx_mut().push(hash)
    }

    /// Identity hashcodes live in the header's high bits, assigned on
    /// first request; copying collections move the header wholesale so
    /// the code stays stable.
    pub fn identity_hashcode_of(&mut self, value: Cell) -> Cell
    {
        if immediate_p(value) {
            return value;
        }
        let obj = untag(value);
        let header = header_at(&self.heap.mem, obj);
        let existing = object::header_hashcode(header);
        if existing != 0 {
            return tag_fixnum(existing as Fixnum);
        }
        self.next_identity_hashcode = self.next_identity_hashcode % 0xffff + 1;
        let assigned = self.next_identity_hashcode;
        self.heap.mem.set_cell(
            obj,
            header.raw() | (assigned << (2 + crate::cell::TAG_BITS)),
        );
        tag_fixnum(assigned as Fixnum)
    }

    fn primitive_identity_hashcode(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        let hash = self.identity_hashcode_of(value);
        self.ctx_mut().push(hash)
    }

    /// `( key array -- slot-index )`: where probing for `key` starts
    /// in an open-addressed pair array.
    fn primitive_hash_at(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let key = self.ctx_mut().pop()?;
        let hash = self.hashcode_of(key);
        let capacity = array_capacity(&self.heap.mem, untag(array));
        let index = ((untag_fixnum(hash) as Cell) & ((capacity >> 1) - 1)) << 1;
        self.ctx_mut().push(tag_fixnum(index as Fixnum))
    }

    /// `( key hashtable -- value/f )`: linear probe over the
    /// hashtable's pair array, stopping at the empty sentinel.
    fn primitive_key_at(&mut self) -> VmResult<()>
    {
        let table = self.ctx_mut().pop()?;
        self.check_tagged(table, Tag::Tuple)?;
        let key = self.ctx_mut().pop()?;

        // A hashtable tuple's third slot is its pair array.
        let array = self.heap.mem.cell_at(untag(table) + object::TUPLE_DATA + 8);
        self.check_tagged(array, Tag::Array)?;
        let arr = untag(array);
        let capacity = array_capacity(&self.heap.mem, arr);
        let empty = self.special_objects[crate::special::OBJ_HASHTABLE_EMPTY];

        let hash = self.hashcode_of(key);
        let mask = (capacity >> 1) - 1;
        let mut index = ((untag_fixnum(hash) as Cell) & mask) << 1;
        for _ in 0..=mask {
            let probe = array_nth(&self.heap.mem, arr, index);
            if probe == key {
                let value = array_nth(&self.heap.mem, arr, index + 1);
                return self.ctx_mut().push(value);
            }
            if probe == empty {
                break;
            }
            index = (index + 2) & (capacity - 2);
        }
        self.ctx_mut().push(FALSE)
    }

    // Stack reflection.

    fn primitive_datastack(&mut self) -> VmResult<()>
    {
        let depth = self.ctx().depth() as Cell;
        let array = self.allot_uninitialized_array(depth);
        for index in 0..depth {
            let value = self.ctx().data.cells[index as usize];
            self.heap
                .set_slot(untag(array), object::ARRAY_DATA + index * 4, value);
        }
        self.ctx_mut().push(array)
    }

    fn primitive_set_datastack(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let depth = array_capacity(&self.heap.mem, untag(array));
        self.ctx_mut().data.top = -1;
        for index in 0..depth {
            let value = array_nth(&self.heap.mem, untag(array), index);
            self.ctx_mut().push(value)?;
        }
        Ok(())
    }

    fn primitive_retainstack(&mut self) -> VmResult<()>
    {
        let depth = self.ctx().retain.depth() as Cell;
        let array = self.allot_uninitialized_array(depth);
        for index in 0..depth {
            let value = self.ctx().retain.cells[index as usize];
            self.heap
                .set_slot(untag(array), object::ARRAY_DATA + index * 4, value);
        }
        self.ctx_mut().push(array)
    }

    fn primitive_set_retainstack(&mut self) -> VmResult<()>
    {
        let array = self.ctx_mut().pop()?;
        self.check_tagged(array, Tag::Array)?;
        let depth = array_capacity(&self.heap.mem, untag(array));
        self.ctx_mut().retain.top = -1;
        for index in 0..depth {
            let value = array_nth(&self.heap.mem, untag(array), index);
            self.ctx_mut().retain_push(value)?;
        }
        Ok(())
    }

    fn primitive_callstack(&mut self) -> VmResult<()>
    {
        let cells: Vec<Cell> = {
            let call = &self.ctx().call;
            call.cells[..call.depth()].to_vec()
        };
        let callstack = self.allot_callstack(&cells);
        self.ctx_mut().push(callstack)
    }

    fn primitive_set_callstack(&mut self) -> VmResult<()>
    {
        let callstack = self.ctx_mut().pop()?;
        self.check_tagged(callstack, Tag::Callstack)?;
        let obj = untag(callstack);
        let length = untag_fixnum(
            self.heap.mem.cell_at(obj + object::CALLSTACK_LENGTH),
        ) as Cell / 4;
        let ctx = self.ctx_mut();
        if length as usize > ctx.call.cells.len() {
            return Err(Fault::bare(ErrorKind::CallstackOverflow));
        }
        ctx.call.top = length as isize - 1;
        for index in 0..length {
            let value = self
                .heap
                .mem
                .cell_at(obj + object::CALLSTACK_DATA + index * 4);
            self.ctx_mut().call.cells[index as usize] = value;
        }
        Ok(())
    }

    fn primitive_load_locals(&mut self) -> VmResult<()>
    {
        let count = self.unbox_array_size()?;
        let mut locals = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locals.push(self.ctx_mut().pop()?);
        }
        for value in locals.into_iter().rev() {
            self.ctx_mut().retain_push(value)?;
        }
        Ok(())
    }

    fn primitive_drop_locals(&mut self) -> VmResult<()>
    {
        let count = self.unbox_array_size()?;
        for _ in 0..count {
            self.ctx_mut().retain_pop()?;
        }
        Ok(())
    }

    fn primitive_get_local(&mut self) -> VmResult<()>
    {
        let offset = self.unbox_array_size()?;
        let value = self.ctx().retain_nth_from_top(offset as usize)?;
        self.ctx_mut().push(value)
    }

    fn primitive_callstack_bounds(&mut self) -> VmResult<()>
    {
        let size = self.ctx().call.cells.len() as Fixnum * 4;
        self.ctx_mut().push(tag_fixnum(0))?;
        self.ctx_mut().push(tag_fixnum(size))
    }

    // Collection triggers and heap reflection.

    pub fn primitive_minor_gc(&mut self)
    {
        self.gc(GcOp::Nursery, 0);
    }

    pub fn primitive_full_gc(&mut self)
    {
        self.gc(GcOp::Full, 0);
    }

    pub fn primitive_compact_gc(&mut self)
    {
        self.gc(GcOp::Compact, 0);
    }

    fn primitive_enable_gc_events(&mut self)
    {
        self.gc_events = Some(Vec::new());
    }

    /// Pushes the recorded events as an array of byte-arrays, or
    /// false when events were never enabled.
    fn primitive_disable_gc_events(&mut self) -> VmResult<()>
    {
        let Some(events) = self.gc_events.take() else {
            return self.ctx_mut().push(FALSE);
        };
        let mut result = crate::alloc::GrowableArray::new(self);
        for event in events {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&(event.op as u32).to_le_bytes());
            bytes.extend_from_slice(&event.cards_scanned.to_le_bytes());
            bytes.extend_from_slice(&event.decks_scanned.to_le_bytes());
            bytes.extend_from_slice(&event.total_nanos.to_le_bytes());
            bytes.extend_from_slice(
                &event.data_before.tenured.occupied_space.to_le_bytes(),
            );
            bytes.extend_from_slice(
                &event.data_after.tenured.occupied_space.to_le_bytes(),
            );
            let encoded = self.byte_array_from_bytes(&bytes);
            result.add(self, encoded);
        }
        let array = result.finish(self);
        self.ctx_mut().push(array)
    }

    fn primitive_data_room(&mut self) -> VmResult<()>
    {
        let room = self.heap.data_room();
        let mut bytes = Vec::new();
        for field in [
            room.nursery_occupied,
            room.nursery_size,
            room.aging_occupied,
            room.aging_size,
            room.tenured.size,
            room.tenured.occupied_space,
            room.tenured.total_free,
            room.tenured.contiguous_free,
            room.tenured.free_block_count,
        ] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        let encoded = self.byte_array_from_bytes(&bytes);
        self.ctx_mut().push(encoded)
    }

    fn primitive_size(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        let size = if immediate_p(value) {
            0
        } else {
            object::object_size(&self.heap.mem, untag(value))
        };
        self.ctx_mut().push(tag_fixnum(size as Fixnum))
    }

    /// `( type -- array )`: every live object with the given type
    /// code. Counts first, allocates once, then fills without
    /// allocating so no address can go stale mid-build.
    fn primitive_instances(&mut self) -> VmResult<()>
    {
        let type_code = self.unbox_array_size()?;
        self.primitive_full_gc();

        let mut count: Cell = 0;
        self.each_object(|obj| {
            if header_at(&self.heap.mem, obj).type_code().map(|t| t as Cell)
                == Some(type_code)
            {
                count += 1;
            }
        });

        let array = self.allot_uninitialized_array(count);
        let mut filled: Cell = 0;
        let mut instances = Vec::with_capacity(count as usize);
        self.each_object(|obj| {
            let is_match = obj != untag(array)
                && header_at(&self.heap.mem, obj)
                    .type_code()
                    .map(|t| t as Cell)
                    == Some(type_code);
            if is_match && (instances.len() as Cell) < count {
                instances.push(crate::cell::retag(obj, type_code));
            }
        });
        for tagged in instances {
            self.heap.set_slot(
                untag(array),
                object::ARRAY_DATA + filled * 4,
                tagged,
            );
            filled += 1;
        }
        for index in filled..count {
            self.heap.set_slot(
                untag(array),
                object::ARRAY_DATA + index * 4,
                FALSE,
            );
        }
        self.ctx_mut().push(array)
    }

    /// `( old-array new-array -- )`: pairwise identity replacement.
    /// Every reference to `old[i]` anywhere in the system becomes a
    /// reference to `new[i]`.
    fn primitive_become(&mut self) -> VmResult<()>
    {
        let new_objects = self.ctx_mut().pop()?;
        let old_objects = self.ctx_mut().pop()?;
        self.check_tagged(new_objects, Tag::Array)?;
        self.check_tagged(old_objects, Tag::Array)?;

        let capacity = array_capacity(&self.heap.mem, untag(old_objects));
        let mut forwarding = HashMap::new();
        for index in 0..capacity {
            let old = array_nth(&self.heap.mem, untag(old_objects), index);
            let new = array_nth(&self.heap.mem, untag(new_objects), index);
            if !immediate_p(old) {
                forwarding.insert(untag(old), untag(new));
            }
        }

        struct BecomeFixup
        {
            forwarding: HashMap<Cell, Cell>,
        }
        impl crate::gc::Fixup for BecomeFixup
        {
            fn fixup(&mut self, _heap: &mut crate::heap::DataHeap, addr: Cell)
                -> Cell
            {
                self.forwarding.get(&addr).copied().unwrap_or(addr)
            }
        }

        // Collect the live set before rewriting, then patch every
        // slot and every root in place.
        let mut live = Vec::new();
        self.each_object(|obj| live.push(obj));

        let mut roots = VmRoots{
            data_roots: &mut self.data_roots,
            special_objects: &mut self.special_objects,
            contexts: &mut self.contexts,
            work_queue: &mut self.work_queue,
        };
        let mut visitor =
            SlotVisitor::new(&mut self.heap, BecomeFixup{forwarding});
        visitor.visit_all_roots(&mut roots);
        for obj in live {
            visitor.visit_slots(obj);
        }

        // Compact away the now-unreferenced originals.
        self.primitive_full_gc();
        Ok(())
    }

    fn primitive_save_image(&mut self) -> VmResult<()>
    {
        let path = self.ctx_mut().pop()?;
        self.check_tagged(path, Tag::String)?;
        let path = String::from_utf8_lossy(self.string_bytes(path)).into_owned();
        if let Err(error) = crate::image::save(self, path.as_ref()) {
            warn!("save-image failed: {error}");
            return Err(Fault::bare(ErrorKind::Io));
        }
        Ok(())
    }

    // Process surface.

    fn primitive_exit(&mut self) -> VmResult<()>
    {
        let code = self.ctx_mut().pop()?;
        let code = if tag_of(code) == Tag::Fixnum as Cell {
            untag_fixnum(code)
        } else {
            0
        };
        std::process::exit(code)
    }

    fn primitive_nano_count(&mut self) -> VmResult<()>
    {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let value = self.allot_bignum_from_u64(nanos);
        self.ctx_mut().push(value)
    }

    fn primitive_sleep(&mut self) -> VmResult<()>
    {
        let nanos = self.ctx_mut().pop()?;
        let nanos = if tag_of(nanos) == Tag::Fixnum as Cell {
            untag_fixnum(nanos).max(0) as u64
        } else if tag_of(nanos) == Tag::Bignum as Cell {
            self.bignum_to_i64(nanos).unwrap_or(0).max(0) as u64
        } else {
            return Err(Fault::type_error(Tag::Fixnum, nanos));
        };
        std::thread::sleep(std::time::Duration::from_nanos(nanos));
        Ok(())
    }

    fn primitive_dispatch_stats(&mut self) -> VmResult<()>
    {
        let stats = self.dispatch_stats;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&stats.megamorphic_cache_misses.to_le_bytes());
        bytes.extend_from_slice(&stats.megamorphic_cache_hits.to_le_bytes());
        let encoded = self.byte_array_from_bytes(&bytes);
        self.ctx_mut().push(encoded)
    }

    fn primitive_lookup_method(&mut self) -> VmResult<()>
    {
        let methods = self.ctx_mut().pop()?;
        let obj = self.ctx_mut().pop()?;
        let method = dispatch::lookup_method(self, obj, methods);
        self.ctx_mut().push(method)
    }

    // Numeric conversions at the fixnum/bignum/float seams.

    fn primitive_fixnum_to_bignum(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        if tag_of(value) != Tag::Fixnum as Cell {
            return Err(Fault::type_error(Tag::Fixnum, value));
        }
        let bignum = self.allot_bignum_from_i64(untag_fixnum(value) as i64);
        self.ctx_mut().push(bignum)
    }

    fn primitive_bignum_to_fixnum(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        self.check_tagged(value, Tag::Bignum)?;
        match self.bignum_to_fixnum(value) {
            Some(fixnum) => self.ctx_mut().push(tag_fixnum(fixnum)),
            None => Err(Fault::new(ErrorKind::OutOfFixnumRange, value, FALSE)),
        }
    }

    fn primitive_fixnum_to_float(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        if tag_of(value) != Tag::Fixnum as Cell {
            return Err(Fault::type_error(Tag::Fixnum, value));
        }
        let float = self.allot_float(untag_fixnum(value) as f64);
        self.ctx_mut().push(float)
    }

    fn primitive_float_to_fixnum(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        self.check_tagged(value, Tag::Float)?;
        let truncated = self.float_value(value) as i64;
        if !crate::cell::fits_fixnum(truncated) {
            return Err(Fault::new(ErrorKind::OutOfFixnumRange, value, FALSE));
        }
        self.ctx_mut().push(tag_fixnum(truncated as Fixnum))
    }

    /// `( obj -- )`: human-readable rendering to stdout, used by boot
    /// diagnostics and the tests' `.` word.
    fn primitive_print(&mut self) -> VmResult<()>
    {
        let value = self.ctx_mut().pop()?;
        let rendered = self.render_cell(value);
        println!("{rendered}");
        Ok(())
    }

    /// Best-effort rendering of a cell for diagnostics.
    pub fn render_cell(&self, value: Cell) -> String
    {
        let tag = tag_of(value);
        if tag == Tag::Fixnum as Cell {
            untag_fixnum(value).to_string()
        } else if value == FALSE {
            "f".to_string()
        } else if tag == Tag::String as Cell {
            String::from_utf8_lossy(self.string_bytes(value)).into_owned()
        } else if tag == Tag::Bignum as Cell {
            self.bignum_to_decimal(value)
        } else if tag == Tag::Float as Cell {
            self.float_value(value).to_string()
        } else if tag == Tag::Word as Cell {
            let name = self.heap.mem.cell_at(untag(value) + object::WORD_NAME);
            if tag_of(name) == Tag::String as Cell {
                String::from_utf8_lossy(self.string_bytes(name)).into_owned()
            } else {
                format!("word@{value:#x}")
            }
        } else {
            format!("object@{value:#x}")
        }
    }

    fn primitive_dlopen(&mut self) -> VmResult<()>
    {
        let path = self.ctx_mut().pop()?;
        let dll = self.allot_dll(path);
        self.ctx_mut().push(dll)
    }

    fn primitive_exists(&mut self) -> VmResult<()>
    {
        let path = self.ctx_mut().pop()?;
        self.check_tagged(path, Tag::String)?;
        let path = String::from_utf8_lossy(self.string_bytes(path)).into_owned();
        let exists = std::path::Path::new(&path).exists();
        let result = self.from_boolean(exists);
        self.ctx_mut().push(result)
    }
}
