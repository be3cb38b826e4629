//! Handler identifiers: per-word cached fast paths.
//!
//! The first time a word executes, its name is looked up in a fixed
//! table mapping names to handler ids, and the result is cached in the
//! word's VM-use cell as a fixnum carrying a magic marker in its high
//! bits, so "uncached" and "no handler" stay distinguishable. Handlers
//! come in two classes: stack/arithmetic operations executed inline,
//! and control-flow operations that only push work-queue items.

use {
    super::WorkItem,
    crate::{
        cell::{
            fits_fixnum, immediate_p, tag_fixnum, tag_of, untag, untag_fixnum,
            Cell, Fixnum, Tag,
        },
        errors::{ErrorKind, Fault, VmResult},
        object::{self, array_capacity},
        vm::Vm,
    },
    smallvec::smallvec,
    std::{collections::HashMap, sync::LazyLock},
};

/// No special handler: the word runs via its quotation definition.
pub const HANDLER_NONE: u16 = 0;

// Control-flow handlers. These push work items and never recurse.
pub const HANDLER_IF: u16 = 1;
pub const HANDLER_WHEN: u16 = 2;
pub const HANDLER_UNLESS: u16 = 3;
pub const HANDLER_CALL: u16 = 4;
pub const HANDLER_CALL_EFFECT: u16 = 5;
pub const HANDLER_EXECUTE: u16 = 6;
pub const HANDLER_EXECUTE_EFFECT: u16 = 7;
pub const HANDLER_DIP: u16 = 8;
pub const HANDLER_2DIP: u16 = 9;
pub const HANDLER_3DIP: u16 = 10;
pub const HANDLER_KEEP: u16 = 11;
pub const HANDLER_2KEEP: u16 = 12;
pub const HANDLER_3KEEP: u16 = 13;
pub const HANDLER_BI: u16 = 14;
pub const HANDLER_BI_STAR: u16 = 15;
pub const HANDLER_BI_AT: u16 = 16;
pub const HANDLER_TRI: u16 = 17;
pub const HANDLER_TRI_STAR: u16 = 18;
pub const HANDLER_TRI_AT: u16 = 19;
pub const HANDLER_LOOP: u16 = 20;
pub const HANDLER_WHILE: u16 = 21;
pub const HANDLER_MEGA_CACHE_LOOKUP: u16 = 22;

// Stack-op and arithmetic handlers, executed inline.
pub const HANDLER_DUP: u16 = 200;
pub const HANDLER_DUPD: u16 = 201;
pub const HANDLER_DROP: u16 = 202;
pub const HANDLER_NIP: u16 = 203;
pub const HANDLER_2DROP: u16 = 204;
pub const HANDLER_2NIP: u16 = 205;
pub const HANDLER_3DROP: u16 = 206;
pub const HANDLER_4DROP: u16 = 207;
pub const HANDLER_2DUP: u16 = 208;
pub const HANDLER_3DUP: u16 = 209;
pub const HANDLER_4DUP: u16 = 210;
pub const HANDLER_OVER: u16 = 211;
pub const HANDLER_2OVER: u16 = 212;
pub const HANDLER_PICK: u16 = 213;
pub const HANDLER_SWAP: u16 = 214;
pub const HANDLER_SWAPD: u16 = 215;
pub const HANDLER_ROT: u16 = 216;
pub const HANDLER_NEG_ROT: u16 = 217;
pub const HANDLER_EQ: u16 = 218;
pub const HANDLER_BOTH_FIXNUMS: u16 = 219;
pub const HANDLER_FIXNUM_LT: u16 = 220;
pub const HANDLER_FIXNUM_LE: u16 = 221;
pub const HANDLER_FIXNUM_GT: u16 = 222;
pub const HANDLER_FIXNUM_GE: u16 = 223;
pub const HANDLER_FIXNUM_PLUS: u16 = 224;
pub const HANDLER_FIXNUM_MINUS: u16 = 225;
pub const HANDLER_FIXNUM_TIMES: u16 = 226;
pub const HANDLER_FIXNUM_MOD: u16 = 227;
pub const HANDLER_FIXNUM_DIVI: u16 = 228;
pub const HANDLER_FIXNUM_DIVMOD: u16 = 229;
pub const HANDLER_FIXNUM_SHIFT: u16 = 230;
pub const HANDLER_FIXNUM_BITAND: u16 = 231;
pub const HANDLER_FIXNUM_BITOR: u16 = 232;
pub const HANDLER_FIXNUM_BITXOR: u16 = 233;
pub const HANDLER_FIXNUM_BITNOT: u16 = 234;
pub const HANDLER_TAG: u16 = 235;
pub const HANDLER_SLOT: u16 = 236;
pub const HANDLER_SET_SLOT: u16 = 237;
pub const HANDLER_LENGTH: u16 = 238;
pub const HANDLER_CALLABLE_P: u16 = 239;
pub const HANDLER_SPECIAL_OBJECT: u16 = 240;
pub const HANDLER_SET_SPECIAL_OBJECT: u16 = 241;
pub const HANDLER_CONTEXT_OBJECT: u16 = 242;
pub const HANDLER_SET_CONTEXT_OBJECT: u16 = 243;

/// Magic carried in the high bits of a cached handler fixnum.
pub const HANDLER_CACHE_MAGIC: Fixnum = 0x5A5 << 16;
const HANDLER_CACHE_MAGIC_MASK: Fixnum = !0xFFFF;

static HANDLER_TABLE: LazyLock<HashMap<&'static [u8], u16>> =
    LazyLock::new(|| {
        let entries: &[(&[u8], u16)] = &[
            (b"if", HANDLER_IF),
            (b"when", HANDLER_WHEN),
            (b"unless", HANDLER_UNLESS),
            (b"call", HANDLER_CALL),
            (b"(call)", HANDLER_CALL),
            (b"call-effect", HANDLER_CALL_EFFECT),
            (b"call-effect-unsafe", HANDLER_CALL_EFFECT),
            (b"execute", HANDLER_EXECUTE),
            (b"(execute)", HANDLER_EXECUTE),
            (b"execute-effect", HANDLER_EXECUTE_EFFECT),
            (b"execute-effect-unsafe", HANDLER_EXECUTE_EFFECT),
            (b"dip", HANDLER_DIP),
            (b"2dip", HANDLER_2DIP),
            (b"3dip", HANDLER_3DIP),
            (b"keep", HANDLER_KEEP),
            (b"2keep", HANDLER_2KEEP),
            (b"3keep", HANDLER_3KEEP),
            (b"bi", HANDLER_BI),
            (b"bi*", HANDLER_BI_STAR),
            (b"bi@", HANDLER_BI_AT),
            (b"tri", HANDLER_TRI),
            (b"tri*", HANDLER_TRI_STAR),
            (b"tri@", HANDLER_TRI_AT),
            (b"loop", HANDLER_LOOP),
            (b"while", HANDLER_WHILE),
            (b"mega-cache-lookup", HANDLER_MEGA_CACHE_LOOKUP),
            (b"dup", HANDLER_DUP),
            (b"dupd", HANDLER_DUPD),
            (b"drop", HANDLER_DROP),
            (b"nip", HANDLER_NIP),
            (b"2drop", HANDLER_2DROP),
            (b"2nip", HANDLER_2NIP),
            (b"3drop", HANDLER_3DROP),
            (b"4drop", HANDLER_4DROP),
            (b"2dup", HANDLER_2DUP),
            (b"3dup", HANDLER_3DUP),
            (b"4dup", HANDLER_4DUP),
            (b"over", HANDLER_OVER),
            (b"2over", HANDLER_2OVER),
            (b"pick", HANDLER_PICK),
            (b"swap", HANDLER_SWAP),
            (b"swapd", HANDLER_SWAPD),
            (b"rot", HANDLER_ROT),
            (b"-rot", HANDLER_NEG_ROT),
            (b"eq?", HANDLER_EQ),
            (b"both-fixnums?", HANDLER_BOTH_FIXNUMS),
            (b"fixnum<", HANDLER_FIXNUM_LT),
            (b"fixnum<=", HANDLER_FIXNUM_LE),
            (b"fixnum>", HANDLER_FIXNUM_GT),
            (b"fixnum>=", HANDLER_FIXNUM_GE),
            (b"fixnum+", HANDLER_FIXNUM_PLUS),
            (b"fixnum+fast", HANDLER_FIXNUM_PLUS),
            (b"fixnum-", HANDLER_FIXNUM_MINUS),
            (b"fixnum-fast", HANDLER_FIXNUM_MINUS),
            (b"fixnum*", HANDLER_FIXNUM_TIMES),
            (b"fixnum*fast", HANDLER_FIXNUM_TIMES),
            (b"fixnum-mod", HANDLER_FIXNUM_MOD),
            (b"fixnum/i", HANDLER_FIXNUM_DIVI),
            (b"fixnum/i-fast", HANDLER_FIXNUM_DIVI),
            (b"fixnum/mod", HANDLER_FIXNUM_DIVMOD),
            (b"fixnum/mod-fast", HANDLER_FIXNUM_DIVMOD),
            (b"fixnum-shift", HANDLER_FIXNUM_SHIFT),
            (b"fixnum-shift-fast", HANDLER_FIXNUM_SHIFT),
            (b"fixnum-bitand", HANDLER_FIXNUM_BITAND),
            (b"fixnum-bitor", HANDLER_FIXNUM_BITOR),
            (b"fixnum-bitxor", HANDLER_FIXNUM_BITXOR),
            (b"fixnum-bitnot", HANDLER_FIXNUM_BITNOT),
            (b"tag", HANDLER_TAG),
            (b"slot", HANDLER_SLOT),
            (b"set-slot", HANDLER_SET_SLOT),
            (b"length", HANDLER_LENGTH),
            (b"callable?", HANDLER_CALLABLE_P),
            (b"special-object", HANDLER_SPECIAL_OBJECT),
            (b"set-special-object", HANDLER_SET_SPECIAL_OBJECT),
            (b"context-object", HANDLER_CONTEXT_OBJECT),
            (b"set-context-object", HANDLER_SET_CONTEXT_OBJECT),
        ];
        entries.iter().copied().collect()
    });

/// Read a word's cached handler id, if one has been cached.
pub fn cached_handler_id(vm: &Vm, word: Cell) -> Option<u16>
{
    let cached = vm.heap.mem.cell_at(word + object::WORD_PIC_DEF);
    if tag_of(cached) != Tag::Fixnum as Cell {
        return None;
    }
    let value = untag_fixnum(cached);
    (value & HANDLER_CACHE_MAGIC_MASK == HANDLER_CACHE_MAGIC)
        .then_some(value as u16)
}

/// Hash the word's name in the fixed table and cache the answer
/// (possibly [`HANDLER_NONE`]) in the word's VM-use cell.
pub fn lookup_and_cache_handler_id(vm: &mut Vm, word: Cell) -> u16
{
    let name = vm.heap.mem.cell_at(word + object::WORD_NAME);
    let id = if tag_of(name) == Tag::String as Cell {
        HANDLER_TABLE
            .get(vm.string_bytes(name))
            .copied()
            .unwrap_or(HANDLER_NONE)
    } else {
        HANDLER_NONE
    };
    vm.heap.mem.set_cell(
        word + object::WORD_PIC_DEF,
        tag_fixnum(HANDLER_CACHE_MAGIC | id as Fixnum),
    );
    id
}

/// Execute the handler. `Ok(false)` means this id has no fast path and
/// the word falls back to its definition.
pub fn dispatch_handler(vm: &mut Vm, id: u16) -> VmResult<bool>
{
    if id >= HANDLER_DUP {
        return dispatch_stack_op(vm, id);
    }
    dispatch_control(vm, id)
}

/// Control-flow handlers: expressed entirely as work-queue pushes,
/// LIFO, so "X then Y" is "push Y, push X".
fn dispatch_control(vm: &mut Vm, id: u16) -> VmResult<bool>
{
    match id {
        HANDLER_IF => {
            let false_quot = vm.ctx_mut().pop()?;
            let true_quot = vm.ctx_mut().pop()?;
            let cond = vm.ctx_mut().pop()?;
            vm.schedule_callable(
                if crate::cell::to_boolean(cond) { true_quot } else { false_quot },
            );
        },
        HANDLER_WHEN => {
            let quot = vm.ctx_mut().pop()?;
            let cond = vm.ctx_mut().pop()?;
            if crate::cell::to_boolean(cond) {
                vm.schedule_callable(quot);
            }
        },
        HANDLER_UNLESS => {
            let quot = vm.ctx_mut().pop()?;
            let cond = vm.ctx_mut().pop()?;
            if !crate::cell::to_boolean(cond) {
                vm.schedule_callable(quot);
            }
        },
        HANDLER_CALL | HANDLER_CALL_EFFECT => {
            let quot = vm.ctx_mut().pop()?;
            vm.schedule_callable(quot);
        },
        HANDLER_EXECUTE | HANDLER_EXECUTE_EFFECT => {
            let word = vm.ctx_mut().pop()?;
            vm.check_tagged(word, Tag::Word)?;
            vm.schedule(WorkItem::ExecuteWord(word));
        },
        HANDLER_DIP => {
            let quot = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().pop()?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x]));
            vm.schedule_callable(quot);
        },
        HANDLER_2DIP => {
            let quot = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().pop()?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x, y]));
            vm.schedule_callable(quot);
        },
        HANDLER_3DIP => {
            let quot = vm.ctx_mut().pop()?;
            let z = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().pop()?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x, y, z]));
            vm.schedule_callable(quot);
        },
        HANDLER_KEEP => {
            let quot = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().peek()?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x]));
            vm.schedule_callable(quot);
        },
        HANDLER_2KEEP => {
            let quot = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().nth_from_top(0)?;
            let x = vm.ctx_mut().nth_from_top(1)?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x, y]));
            vm.schedule_callable(quot);
        },
        HANDLER_3KEEP => {
            let quot = vm.ctx_mut().pop()?;
            let z = vm.ctx_mut().nth_from_top(0)?;
            let y = vm.ctx_mut().nth_from_top(1)?;
            let x = vm.ctx_mut().nth_from_top(2)?;
            vm.schedule(WorkItem::RestoreValues(smallvec![x, y, z]));
            vm.schedule_callable(quot);
        },
        HANDLER_BI => {
            let q = vm.ctx_mut().pop()?;
            let p = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().peek()?;
            vm.schedule_callable(q);
            vm.schedule(WorkItem::PushValue(x));
            vm.schedule_callable(p);
        },
        HANDLER_BI_STAR => {
            let q = vm.ctx_mut().pop()?;
            let p = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            vm.schedule_callable(q);
            vm.schedule(WorkItem::PushValue(y));
            vm.schedule_callable(p);
        },
        HANDLER_BI_AT => {
            let quot = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            vm.schedule_callable(quot);
            vm.schedule(WorkItem::PushValue(y));
            vm.schedule_callable(quot);
        },
        HANDLER_TRI => {
            let r = vm.ctx_mut().pop()?;
            let q = vm.ctx_mut().pop()?;
            let p = vm.ctx_mut().pop()?;
            let x = vm.ctx_mut().peek()?;
            vm.schedule_callable(r);
            vm.schedule(WorkItem::PushValue(x));
            vm.schedule_callable(q);
            vm.schedule(WorkItem::PushValue(x));
            vm.schedule_callable(p);
        },
        HANDLER_TRI_STAR => {
            let r = vm.ctx_mut().pop()?;
            let q = vm.ctx_mut().pop()?;
            let p = vm.ctx_mut().pop()?;
            let z = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            vm.schedule_callable(r);
            vm.schedule(WorkItem::PushValue(z));
            vm.schedule_callable(q);
            vm.schedule(WorkItem::PushValue(y));
            vm.schedule_callable(p);
        },
        HANDLER_TRI_AT => {
            let quot = vm.ctx_mut().pop()?;
            let z = vm.ctx_mut().pop()?;
            let y = vm.ctx_mut().pop()?;
            vm.schedule_callable(quot);
            vm.schedule(WorkItem::PushValue(z));
            vm.schedule_callable(quot);
            vm.schedule(WorkItem::PushValue(y));
            vm.schedule_callable(quot);
        },
        HANDLER_LOOP => {
            let quot = vm.ctx_mut().pop()?;
            vm.schedule(WorkItem::LoopContinue(quot));
            vm.schedule_callable(quot);
        },
        HANDLER_WHILE => {
            let body = vm.ctx_mut().pop()?;
            let pred = vm.ctx_mut().pop()?;
            vm.schedule(WorkItem::WhileContinue{pred, body});
            vm.schedule_callable(pred);
        },
        HANDLER_MEGA_CACHE_LOOKUP => {
            super::dispatch::mega_cache_lookup(vm)?;
        },
        _ => return Ok(false),
    }
    Ok(true)
}

fn pop_fixnum(vm: &mut Vm) -> VmResult<Fixnum>
{
    let value = vm.ctx_mut().pop()?;
    if tag_of(value) != Tag::Fixnum as Cell {
        return Err(Fault::type_error(Tag::Fixnum, value));
    }
    Ok(untag_fixnum(value))
}

/// Push a fixnum, or promote to bignum when out of range.
fn push_integer(vm: &mut Vm, value: i64) -> VmResult<()>
{
    if fits_fixnum(value) {
        vm.ctx_mut().push(tag_fixnum(value as Fixnum))
    } else {
        let bignum = vm.allot_bignum_from_i64(value);
        vm.ctx_mut().push(bignum)
    }
}

fn dispatch_stack_op(vm: &mut Vm, id: u16) -> VmResult<bool>
{
    let ctx = vm.ctx_mut();
    match id {
        HANDLER_DUP => {
            let top = ctx.peek()?;
            ctx.push(top)?;
        },
        HANDLER_DUPD => {
            let top = ctx.pop()?;
            let second = ctx.peek()?;
            ctx.push(second)?;
            ctx.push(top)?;
        },
        HANDLER_DROP => {
            ctx.pop()?;
        },
        HANDLER_NIP => {
            let top = ctx.pop()?;
            ctx.pop()?;
            ctx.push(top)?;
        },
        HANDLER_2DROP => {
            ctx.pop()?;
            ctx.pop()?;
        },
        HANDLER_2NIP => {
            let top = ctx.pop()?;
            ctx.pop()?;
            ctx.pop()?;
            ctx.push(top)?;
        },
        HANDLER_3DROP => {
            ctx.pop()?;
            ctx.pop()?;
            ctx.pop()?;
        },
        HANDLER_4DROP => {
            ctx.pop()?;
            ctx.pop()?;
            ctx.pop()?;
            ctx.pop()?;
        },
        HANDLER_2DUP => {
            let y = ctx.nth_from_top(0)?;
            let x = ctx.nth_from_top(1)?;
            ctx.push(x)?;
            ctx.push(y)?;
        },
        HANDLER_3DUP => {
            let z = ctx.nth_from_top(0)?;
            let y = ctx.nth_from_top(1)?;
            let x = ctx.nth_from_top(2)?;
            ctx.push(x)?;
            ctx.push(y)?;
            ctx.push(z)?;
        },
        HANDLER_4DUP => {
            let w = ctx.nth_from_top(0)?;
            let z = ctx.nth_from_top(1)?;
            let y = ctx.nth_from_top(2)?;
            let x = ctx.nth_from_top(3)?;
            ctx.push(x)?;
            ctx.push(y)?;
            ctx.push(z)?;
            ctx.push(w)?;
        },
        HANDLER_OVER => {
            let second = ctx.nth_from_top(1)?;
            ctx.push(second)?;
        },
        HANDLER_2OVER => {
            let y = ctx.nth_from_top(2)?;
            let x = ctx.nth_from_top(1)?;
            ctx.push(y)?;
            ctx.push(x)?;
        },
        HANDLER_PICK => {
            let third = ctx.nth_from_top(2)?;
            ctx.push(third)?;
        },
        HANDLER_SWAP => {
            let y = ctx.pop()?;
            let x = ctx.pop()?;
            ctx.push(y)?;
            ctx.push(x)?;
        },
        HANDLER_SWAPD => {
            let z = ctx.pop()?;
            let y = ctx.pop()?;
            let x = ctx.pop()?;
            ctx.push(y)?;
            ctx.push(x)?;
            ctx.push(z)?;
        },
        HANDLER_ROT => {
            let z = ctx.pop()?;
            let y = ctx.pop()?;
            let x = ctx.pop()?;
            ctx.push(y)?;
            ctx.push(z)?;
            ctx.push(x)?;
        },
        HANDLER_NEG_ROT => {
            let z = ctx.pop()?;
            let y = ctx.pop()?;
            let x = ctx.pop()?;
            ctx.push(z)?;
            ctx.push(x)?;
            ctx.push(y)?;
        },
        HANDLER_EQ => {
            let y = ctx.pop()?;
            let x = ctx.pop()?;
            let result = vm.from_boolean(x == y);
            vm.ctx_mut().push(result)?;
        },
        HANDLER_BOTH_FIXNUMS => {
            let y = ctx.nth_from_top(0)?;
            let x = ctx.nth_from_top(1)?;
            let both = tag_of(x) == Tag::Fixnum as Cell
                && tag_of(y) == Tag::Fixnum as Cell;
            let result = vm.from_boolean(both);
            vm.ctx_mut().push(result)?;
        },
        HANDLER_FIXNUM_LT => return fixnum_compare(vm, |x, y| x < y),
        HANDLER_FIXNUM_LE => return fixnum_compare(vm, |x, y| x <= y),
        HANDLER_FIXNUM_GT => return fixnum_compare(vm, |x, y| x > y),
        HANDLER_FIXNUM_GE => return fixnum_compare(vm, |x, y| x >= y),
        HANDLER_FIXNUM_PLUS => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            push_integer(vm, x as i64 + y as i64)?;
        },
        HANDLER_FIXNUM_MINUS => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            push_integer(vm, x as i64 - y as i64)?;
        },
        HANDLER_FIXNUM_TIMES => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            push_integer(vm, x as i64 * y as i64)?;
        },
        HANDLER_FIXNUM_MOD => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            if y == 0 {
                return Err(Fault::bare(ErrorKind::DivideByZero));
            }
            vm.ctx_mut().push(tag_fixnum(x % y))?;
        },
        HANDLER_FIXNUM_DIVI => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            if y == 0 {
                return Err(Fault::bare(ErrorKind::DivideByZero));
            }
            push_integer(vm, x as i64 / y as i64)?;
        },
        HANDLER_FIXNUM_DIVMOD => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            if y == 0 {
                return Err(Fault::bare(ErrorKind::DivideByZero));
            }
            push_integer(vm, x as i64 / y as i64)?;
            vm.ctx_mut().push(tag_fixnum(x % y))?;
        },
        HANDLER_FIXNUM_SHIFT => return fixnum_shift(vm),
        HANDLER_FIXNUM_BITAND => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            vm.ctx_mut().push(tag_fixnum(x & y))?;
        },
        HANDLER_FIXNUM_BITOR => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            vm.ctx_mut().push(tag_fixnum(x | y))?;
        },
        HANDLER_FIXNUM_BITXOR => {
            let y = pop_fixnum(vm)?;
            let x = pop_fixnum(vm)?;
            vm.ctx_mut().push(tag_fixnum(x ^ y))?;
        },
        HANDLER_FIXNUM_BITNOT => {
            let x = pop_fixnum(vm)?;
            vm.ctx_mut().push(tag_fixnum(!x))?;
        },
        HANDLER_TAG => {
            let value = ctx.pop()?;
            let tag = tag_of(value);
            vm.ctx_mut().push(tag_fixnum(tag as Fixnum))?;
        },
        HANDLER_SLOT => {
            let slot = pop_fixnum(vm)?;
            let obj = vm.ctx_mut().pop()?;
            if immediate_p(obj) {
                return Err(Fault::type_error(Tag::Tuple, obj));
            }
            let value = vm.heap.mem.cell_at(untag(obj) + slot as Cell * 4);
            vm.ctx_mut().push(value)?;
        },
        HANDLER_SET_SLOT => {
            let slot = pop_fixnum(vm)?;
            let obj = vm.ctx_mut().pop()?;
            let value = vm.ctx_mut().pop()?;
            if immediate_p(obj) {
                return Err(Fault::type_error(Tag::Tuple, obj));
            }
            vm.heap.set_slot(untag(obj), slot as Cell * 4, value);
        },
        HANDLER_LENGTH => {
            let obj = ctx.pop()?;
            let tag = tag_of(obj);
            let mem = &vm.heap.mem;
            let length = if tag == Tag::Array as Cell {
                tag_fixnum(array_capacity(mem, untag(obj)) as Fixnum)
            } else if tag == Tag::ByteArray as Cell {
                tag_fixnum(
                    object::byte_array_capacity(mem, untag(obj)) as Fixnum,
                )
            } else if tag == Tag::String as Cell {
                mem.cell_at(untag(obj) + object::STRING_LENGTH)
            } else {
                // Not a primitive sequence; fall back to the word's
                // generic definition.
                vm.ctx_mut().push(obj)?;
                return Ok(false);
            };
            vm.ctx_mut().push(length)?;
        },
        HANDLER_CALLABLE_P => {
            let obj = ctx.pop()?;
            let tag = tag_of(obj);
            let callable = tag == Tag::Quotation as Cell
                || tag == Tag::Word as Cell
                || tag == Tag::Tuple as Cell
                || tag == Tag::Wrapper as Cell;
            let result = vm.from_boolean(callable);
            vm.ctx_mut().push(result)?;
        },
        HANDLER_SPECIAL_OBJECT => {
            let index = pop_fixnum(vm)? as usize;
            let value = *vm
                .special_objects
                .get(index)
                .ok_or(Fault::bare(ErrorKind::ArraySize))?;
            vm.ctx_mut().push(value)?;
        },
        HANDLER_SET_SPECIAL_OBJECT => {
            let index = pop_fixnum(vm)? as usize;
            let value = vm.ctx_mut().pop()?;
            *vm.special_objects
                .get_mut(index)
                .ok_or(Fault::bare(ErrorKind::ArraySize))? = value;
        },
        HANDLER_CONTEXT_OBJECT => {
            let index = pop_fixnum(vm)? as usize;
            let value = *vm
                .ctx()
                .context_objects
                .get(index)
                .ok_or(Fault::bare(ErrorKind::ArraySize))?;
            vm.ctx_mut().push(value)?;
        },
        HANDLER_SET_CONTEXT_OBJECT => {
            let index = pop_fixnum(vm)? as usize;
            let value = vm.ctx_mut().pop()?;
            *vm.ctx_mut()
                .context_objects
                .get_mut(index)
                .ok_or(Fault::bare(ErrorKind::ArraySize))? = value;
        },
        _ => return Ok(false),
    }
    Ok(true)
}

fn fixnum_compare(vm: &mut Vm, cmp: impl Fn(Fixnum, Fixnum) -> bool)
    -> VmResult<bool>
{
    let y = pop_fixnum(vm)?;
    let x = pop_fixnum(vm)?;
    let result = vm.from_boolean(cmp(x, y));
    vm.ctx_mut().push(result)?;
    Ok(true)
}

/// Shifts promote to bignum whenever the mathematical result leaves
/// the fixnum range (Invariant: overflow is never implicit).
fn fixnum_shift(vm: &mut Vm) -> VmResult<bool>
{
    let shift = pop_fixnum(vm)?;
    let x = pop_fixnum(vm)?;
    if shift <= 0 {
        let amount = shift.unsigned_abs().min(31);
        vm.ctx_mut().push(tag_fixnum(x >> amount))?;
        return Ok(true);
    }

    if shift < 63 {
        let wide = (x as i64) << shift;
        if fits_fixnum(wide) {
            vm.ctx_mut().push(tag_fixnum(wide as Fixnum))?;
            return Ok(true);
        }
        if wide >> shift == x as i64 {
            let bignum = vm.allot_bignum_from_i64(wide);
            vm.ctx_mut().push(bignum)?;
            return Ok(true);
        }
    }
    let bignum = vm.allot_bignum_shifted(x, shift as u32);
    vm.ctx_mut().push(bignum)?;
    Ok(true)
}
