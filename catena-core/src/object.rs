//! Heap object headers and per-type layout rules.
//!
//! Every heap object begins with a header cell encoding the type code,
//! a free bit (meaningful inside free-list heaps only) and a
//! forwarding bit used by the copying collectors. The object's size
//! and traced-slot count are derived from the header and the first one
//! or two slots, and from nothing else.

use crate::{
    cell::{
        align, untag_fixnum, Cell, Tag, DATA_ALIGNMENT, TAG_BITS, TAG_MASK,
    },
    mem::LinearMemory,
};

/// Free bit: the block is on a free list.
const FREE_BIT: Cell = 1;

/// Forwarding bit: the header holds the address the object moved to.
const FORWARDING_BIT: Cell = 2;

/// A decoded header cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header(pub Cell);

impl Header
{
    pub fn new(ty: Tag) -> Self
    {
        Self((ty as Cell) << 2)
    }

    pub fn raw(self) -> Cell
    {
        self.0
    }

    pub fn free_p(self) -> bool
    {
        self.0 & FREE_BIT != 0
    }

    pub fn forwarding_p(self) -> bool
    {
        self.0 & FORWARDING_BIT != 0 && !self.free_p()
    }

    /// The address this object was evacuated to. Object addresses are
    /// aligned, so masking the two flag bits recovers the address.
    pub fn forwarding_target(self) -> Cell
    {
        debug_assert!(self.forwarding_p());
        self.0 & !(FREE_BIT | FORWARDING_BIT)
    }

    pub fn forward_to(target: Cell) -> Self
    {
        debug_assert!(target % DATA_ALIGNMENT == 0);
        Self(target | FORWARDING_BIT)
    }

    /// Type code of a live header. `None` when the bits name no type.
    pub fn type_code(self) -> Option<Tag>
    {
        Tag::from_cell((self.0 >> 2) & TAG_MASK)
    }

    /// Size of a free-list block, stored in the header by `make_free`.
    pub fn free_block_size(self) -> Cell
    {
        debug_assert!(self.free_p());
        self.0 & !7
    }

    pub fn make_free(size: Cell) -> Self
    {
        debug_assert!(size > 0);
        Self(size | FREE_BIT)
    }
}

pub fn header_at(mem: &LinearMemory, obj: Cell) -> Header
{
    Header(mem.cell_at(obj))
}

pub fn set_header(mem: &mut LinearMemory, obj: Cell, header: Header)
{
    mem.set_cell(obj, header.0);
}

// Field offsets, relative to the object's address. Traced slots start
// at offset 4 and are contiguous; the slot counts below tell the GC
// how many to visit.

pub const ARRAY_CAPACITY: Cell = 4;
pub const ARRAY_DATA: Cell = 8;

pub const BYTE_ARRAY_CAPACITY: Cell = 4;
pub const BYTE_ARRAY_DATA: Cell = 8;

pub const BIGNUM_CAPACITY: Cell = 4;
pub const BIGNUM_SIGN: Cell = 8;
pub const BIGNUM_LIMBS: Cell = 12;

pub const STRING_LENGTH: Cell = 4;
pub const STRING_AUX: Cell = 8;
pub const STRING_HASHCODE: Cell = 12;
pub const STRING_DATA: Cell = 16;

pub const QUOTATION_ARRAY: Cell = 4;
pub const QUOTATION_CACHED_EFFECT: Cell = 8;
pub const QUOTATION_CACHE_COUNTER: Cell = 12;

pub const WORD_HASHCODE: Cell = 4;
pub const WORD_NAME: Cell = 8;
pub const WORD_VOCABULARY: Cell = 12;
pub const WORD_DEF: Cell = 16;
pub const WORD_PROPS: Cell = 20;
pub const WORD_PIC_DEF: Cell = 24;
pub const WORD_PIC_TAIL_DEF: Cell = 28;
pub const WORD_SUBPRIMITIVE: Cell = 32;
pub const WORD_ENTRY_POINT: Cell = 36;

pub const WRAPPER_OBJECT: Cell = 4;

pub const FLOAT_PAYLOAD: Cell = 8;

pub const ALIEN_BASE: Cell = 4;
pub const ALIEN_EXPIRED: Cell = 8;
pub const ALIEN_DISPLACEMENT: Cell = 12;
pub const ALIEN_ADDRESS: Cell = 16;

pub const DLL_PATH: Cell = 4;
pub const DLL_HANDLE: Cell = 8;

pub const CALLSTACK_LENGTH: Cell = 4;
pub const CALLSTACK_DATA: Cell = 8;

pub const TUPLE_LAYOUT: Cell = 4;
pub const TUPLE_DATA: Cell = 8;

// Tuple layouts are arrays with a fixed element shape.

/// Layout element: the class word.
pub const LAYOUT_KLASS: Cell = 0;
/// Layout element: instance slot count, as a fixnum.
pub const LAYOUT_SIZE: Cell = 1;
/// Layout element: depth in the class hierarchy, as a fixnum.
pub const LAYOUT_ECHELON: Cell = 2;

pub fn array_capacity(mem: &LinearMemory, obj: Cell) -> Cell
{
    untag_fixnum(mem.cell_at(obj + ARRAY_CAPACITY)) as Cell
}

pub fn array_nth(mem: &LinearMemory, obj: Cell, index: Cell) -> Cell
{
    debug_assert!(index < array_capacity(mem, obj));
    mem.cell_at(obj + ARRAY_DATA + index * 4)
}

/// Raw array store. Callers that may write an old-to-young pointer go
/// through the heap's write barrier instead.
pub fn set_array_nth(mem: &mut LinearMemory, obj: Cell, index: Cell, value: Cell)
{
    debug_assert!(index < array_capacity(mem, obj));
    mem.set_cell(obj + ARRAY_DATA + index * 4, value);
}

pub fn byte_array_capacity(mem: &LinearMemory, obj: Cell) -> Cell
{
    untag_fixnum(mem.cell_at(obj + BYTE_ARRAY_CAPACITY)) as Cell
}

pub fn string_length(mem: &LinearMemory, obj: Cell) -> Cell
{
    untag_fixnum(mem.cell_at(obj + STRING_LENGTH)) as Cell
}

/// Size in bytes of an array-shaped object with the given element count
/// and stride, before alignment.
fn sequence_size(capacity: Cell, stride: Cell) -> Cell
{
    8 + capacity * stride
}

pub fn array_size_for(capacity: Cell) -> Cell
{
    align(sequence_size(capacity, 4), DATA_ALIGNMENT)
}

pub fn byte_array_size_for(capacity: Cell) -> Cell
{
    align(sequence_size(capacity, 1), DATA_ALIGNMENT)
}

pub fn string_size_for(length: Cell) -> Cell
{
    align(STRING_DATA + length, DATA_ALIGNMENT)
}

pub fn bignum_size_for(capacity: Cell) -> Cell
{
    align(sequence_size(capacity, 4), DATA_ALIGNMENT)
}

pub fn callstack_size_for(length: Cell) -> Cell
{
    align(CALLSTACK_DATA + length, DATA_ALIGNMENT)
}

pub fn tuple_size_for(slot_count: Cell) -> Cell
{
    align(TUPLE_DATA + slot_count * 4, DATA_ALIGNMENT)
}

pub const QUOTATION_SIZE: Cell = 16;
pub const WORD_SIZE: Cell = 48;
pub const WRAPPER_SIZE: Cell = 16;
pub const FLOAT_SIZE: Cell = 16;
pub const ALIEN_SIZE: Cell = 32;
pub const DLL_SIZE: Cell = 16;

/// Traced-slot counts that do not depend on the object's contents.
fn fixed_slot_count(ty: Tag) -> Cell
{
    match ty {
        Tag::String => 3,
        Tag::Quotation => 3,
        Tag::Word => 8,
        Tag::Wrapper => 1,
        Tag::Alien => 2,
        Tag::Dll => 1,
        _ => 0,
    }
}

/// Size of the object at `addr`, free blocks included.
///
/// `translate` maps an untagged address to where its contents can
/// currently be read; the identity everywhere except mid-relocation,
/// when a tuple's layout pointer may already point at a moved copy.
pub fn object_size_with(
    mem: &LinearMemory,
    addr: Cell,
    translate: impl Fn(Cell) -> Cell,
) -> Cell
{
    let header = header_at(mem, addr);
    if header.free_p() {
        return header.free_block_size();
    }

    let base = match header.type_code() {
        Some(Tag::Array) => sequence_size(array_capacity(mem, addr), 4),
        Some(Tag::ByteArray) => sequence_size(byte_array_capacity(mem, addr), 1),
        Some(Tag::Bignum) => {
            let capacity = untag_fixnum(mem.cell_at(addr + BIGNUM_CAPACITY));
            sequence_size(capacity as Cell, 4)
        },
        Some(Tag::String) => STRING_DATA + string_length(mem, addr),
        Some(Tag::Tuple) => {
            let layout = translate(crate::cell::untag(mem.cell_at(addr + TUPLE_LAYOUT)));
            let slots = untag_fixnum(array_nth(mem, layout, LAYOUT_SIZE)) as Cell;
            TUPLE_DATA + slots * 4
        },
        Some(Tag::Quotation) => QUOTATION_SIZE,
        Some(Tag::Word) => WORD_SIZE,
        Some(Tag::Wrapper) => WRAPPER_SIZE,
        Some(Tag::Float) => FLOAT_SIZE,
        Some(Tag::Alien) => ALIEN_SIZE,
        Some(Tag::Dll) => DLL_SIZE,
        Some(Tag::Callstack) => {
            let length = untag_fixnum(mem.cell_at(addr + CALLSTACK_LENGTH));
            CALLSTACK_DATA + length as Cell
        },
        Some(Tag::Fixnum) | Some(Tag::False) | None => {
            panic!("invalid header {:#x} at {addr:#x}", header.raw());
        },
    };
    align(base, DATA_ALIGNMENT)
}

pub fn object_size(mem: &LinearMemory, addr: Cell) -> Cell
{
    object_size_with(mem, addr, |a| a)
}

/// The number of cells after the header the GC must visit.
pub fn slot_count_with(
    mem: &LinearMemory,
    addr: Cell,
    translate: impl Fn(Cell) -> Cell,
) -> Cell
{
    let header = header_at(mem, addr);
    if header.free_p() {
        return 0;
    }
    match header.type_code() {
        Some(Tag::Array) => 1 + array_capacity(mem, addr),
        Some(Tag::Tuple) => {
            let layout = translate(crate::cell::untag(mem.cell_at(addr + TUPLE_LAYOUT)));
            1 + untag_fixnum(array_nth(mem, layout, LAYOUT_SIZE)) as Cell
        },
        Some(ty) => fixed_slot_count(ty),
        None => panic!("invalid header {:#x} at {addr:#x}", header.raw()),
    }
}

pub fn slot_count(mem: &LinearMemory, addr: Cell) -> Cell
{
    slot_count_with(mem, addr, |a| a)
}

/// Hashcode bits carried in the header, above the flag and type bits.
pub fn header_hashcode(header: Header) -> Cell
{
    header.0 >> (2 + TAG_BITS)
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::cell::tag_fixnum};

    #[test]
    fn header_round_trips_type_codes()
    {
        for ty in [Tag::Array, Tag::Word, Tag::Callstack, Tag::Dll] {
            let header = Header::new(ty);
            assert_eq!(header.type_code(), Some(ty));
            assert!(!header.free_p());
            assert!(!header.forwarding_p());
        }
    }

    #[test]
    fn forwarding_header_recovers_target()
    {
        let header = Header::forward_to(0x1230);
        assert!(header.forwarding_p());
        assert!(!header.free_p());
        assert_eq!(header.forwarding_target(), 0x1230);
    }

    #[test]
    fn free_block_header_recovers_size()
    {
        let header = Header::make_free(0x40);
        assert!(header.free_p());
        assert_eq!(header.free_block_size(), 0x40);
    }

    #[test]
    fn sizes_are_aligned_and_header_driven()
    {
        let mut mem = LinearMemory::new(256);
        set_header(&mut mem, 0, Header::new(Tag::Array));
        mem.set_cell(ARRAY_CAPACITY, tag_fixnum(3));
        assert_eq!(object_size(&mem, 0), align(8 + 12, DATA_ALIGNMENT));
        assert_eq!(slot_count(&mem, 0), 4);

        set_header(&mut mem, 64, Header::new(Tag::String));
        mem.set_cell(64 + STRING_LENGTH, tag_fixnum(5));
        assert_eq!(object_size(&mem, 64), align(16 + 5, DATA_ALIGNMENT));
        assert_eq!(slot_count(&mem, 64), 3);
    }
}
