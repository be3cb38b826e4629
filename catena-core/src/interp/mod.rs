//! The trampoline interpreter.
//!
//! No interpreter function ever calls user code recursively. A LIFO
//! work queue drives execution: quotation walking, word dispatch, and
//! every control-flow combinator are expressed as pushes onto the
//! queue. "Do X then Y" is "push Y, then push X".

pub use self::handlers::{HANDLER_CACHE_MAGIC, HANDLER_NONE};

use {
    crate::{
        cell::{tag_of, untag, Cell, Tag},
        errors::{Fault, VmResult},
        object::{self, array_capacity, array_nth},
        special::{OBJ_DECLARE_WORD, OBJ_PRIMITIVE_WORD},
        vm::Vm,
    },
    smallvec::SmallVec,
};

pub mod dispatch;
pub mod handlers;

/// One entry on the interpreter's work queue.
#[derive(Clone, Debug)]
pub enum WorkItem
{
    /// Call a quotation, word, wrapper, curried, or composed.
    CallCallable(Cell),

    /// Dispatch a word.
    ExecuteWord(Cell),

    /// Keep walking a quotation's element array from `index`.
    QuotationContinue
    {
        array: Cell,
        length: Cell,
        index: Cell,
    },

    /// Push one saved value back on the data stack.
    PushValue(Cell),

    /// Push saved values in order (the dip/keep family).
    RestoreValues(SmallVec<[Cell; 3]>),

    /// Pop the top of the data stack; while true, run the quotation
    /// and test again.
    LoopContinue(Cell),

    /// Pop the top of the data stack; while true, run the body, rerun
    /// the predicate, and test again.
    WhileContinue
    {
        pred: Cell,
        body: Cell,
    },
}

impl Vm
{
    pub fn schedule(&mut self, item: WorkItem)
    {
        self.work_queue.push(item);
    }

    pub fn schedule_callable(&mut self, callable: Cell)
    {
        self.schedule(WorkItem::CallCallable(callable));
    }

    /// Schedule the tail of a quotation, skipping empty tails.
    pub fn schedule_quotation_range(&mut self, array: Cell, length: Cell, index: Cell)
    {
        if index < length {
            self.schedule(WorkItem::QuotationContinue{array, length, index});
        }
    }

    /// Schedule the element array of a tagged quotation.
    fn schedule_quotation(&mut self, quot: Cell)
    {
        let array = self.heap.mem.cell_at(untag(quot) + object::QUOTATION_ARRAY);
        let length = array_capacity(&self.heap.mem, untag(array));
        self.schedule_quotation_range(array, length, 0);
    }

    /// Run work items until the queue drains. Faults unwind to the
    /// error handler and execution continues with whatever it
    /// scheduled.
    pub fn run_trampoline(&mut self)
    {
        while let Some(item) = self.work_queue.pop() {
            if let Err(fault) = self.dispatch_work_item(item) {
                self.general_error(fault);
            }
        }
    }

    /// Push a callable and run to quiescence.
    pub fn call_callable(&mut self, callable: Cell)
    {
        self.schedule_callable(callable);
        self.run_trampoline();
    }

    fn dispatch_work_item(&mut self, item: WorkItem) -> VmResult<()>
    {
        match item {
            WorkItem::CallCallable(callable) => self.do_call_callable(callable),
            WorkItem::ExecuteWord(word) => self.execute_word(word),
            WorkItem::QuotationContinue{array, length, index} =>
                self.quotation_step(array, length, index),
            WorkItem::PushValue(value) => self.ctx_mut().push(value),
            WorkItem::RestoreValues(values) => {
                for value in values {
                    self.ctx_mut().push(value)?;
                }
                Ok(())
            },
            WorkItem::LoopContinue(quot) => {
                if crate::cell::to_boolean(self.ctx_mut().pop()?) {
                    self.schedule(WorkItem::LoopContinue(quot));
                    self.schedule_callable(quot);
                }
                Ok(())
            },
            WorkItem::WhileContinue{pred, body} => {
                if crate::cell::to_boolean(self.ctx_mut().pop()?) {
                    self.schedule(WorkItem::WhileContinue{pred, body});
                    self.schedule_callable(pred);
                    self.schedule_callable(body);
                }
                Ok(())
            },
        }
    }

    fn do_call_callable(&mut self, callable: Cell) -> VmResult<()>
    {
        match tag_of(callable) {
            t if t == Tag::Quotation as Cell => {
                self.schedule_quotation(callable);
                Ok(())
            },
            t if t == Tag::Word as Cell => self.execute_word(callable),
            t if t == Tag::Tuple as Cell => self.call_tuple(callable),
            t if t == Tag::Wrapper as Cell => {
                let wrapped = self
                    .heap
                    .mem
                    .cell_at(untag(callable) + object::WRAPPER_OBJECT);
                self.schedule_callable(wrapped);
                Ok(())
            },
            _ => Err(Fault::type_error(Tag::Quotation, callable)),
        }
    }

    /// Curried tuples push their object and call their quotation;
    /// composed tuples call `first` then `second`.
    fn call_tuple(&mut self, callable: Cell) -> VmResult<()>
    {
        let tuple = untag(callable);
        if self.tuple_is_class(tuple, TupleClass::Curried) {
            let obj = self.heap.mem.cell_at(tuple + object::TUPLE_DATA);
            let quot = self.heap.mem.cell_at(tuple + object::TUPLE_DATA + 4);
            self.ctx_mut().push(obj)?;
            self.schedule_callable(quot);
            Ok(())
        } else if self.tuple_is_class(tuple, TupleClass::Composed) {
            let first = self.heap.mem.cell_at(tuple + object::TUPLE_DATA);
            let second = self.heap.mem.cell_at(tuple + object::TUPLE_DATA + 4);
            self.schedule_callable(second);
            self.schedule_callable(first);
            Ok(())
        } else {
            Err(Fault::type_error(Tag::Quotation, callable))
        }
    }

    /// One step of the quotation walker.
    fn quotation_step(&mut self, array: Cell, length: Cell, index: Cell)
        -> VmResult<()>
    {
        let arr = untag(array);
        let element = array_nth(&self.heap.mem, arr, index);
        let element_tag = tag_of(element);

        // Primitive pattern: a byte-array naming a primitive, then the
        // do-primitive marker word. The byte-array is not pushed.
        if element_tag == Tag::ByteArray as Cell
            && index + 1 < length
            && array_nth(&self.heap.mem, arr, index + 1)
                == self.special_objects[OBJ_PRIMITIVE_WORD]
        {
            self.schedule_quotation_range(array, length, index + 2);
            let name: SmallVec<[u8; 32]> =
                SmallVec::from_slice(self.byte_array_name(element));
            return match self.dispatch_primitive(&name)? {
                true => Ok(()),
                false => self.die("unknown primitive in quotation", element),
            };
        }

        // Declare pattern: an array then the declare marker word is a
        // type hint; both are skipped.
        if element_tag == Tag::Array as Cell
            && index + 1 < length
            && array_nth(&self.heap.mem, arr, index + 1)
                == self.special_objects[OBJ_DECLARE_WORD]
        {
            self.schedule_quotation_range(array, length, index + 2);
            return Ok(());
        }

        // The rest of the quotation runs after this element's work.
        self.schedule_quotation_range(array, length, index + 1);

        if element_tag == Tag::Word as Cell {
            self.schedule(WorkItem::ExecuteWord(element));
            Ok(())
        } else if element_tag == Tag::Wrapper as Cell {
            let wrapped = self
                .heap
                .mem
                .cell_at(untag(element) + object::WRAPPER_OBJECT);
            self.ctx_mut().push(wrapped)
        } else {
            // Fixnums, floats, strings, arrays, byte-arrays, tuples,
            // and quotations are literals.
            self.ctx_mut().push(element)
        }
    }

    /// Dispatch a word: subprimitive, cached handler, or definition.
    fn execute_word(&mut self, word_tagged: Cell) -> VmResult<()>
    {
        let word = untag(word_tagged);

        if self.word_counters.is_some() {
            let name = self.heap.mem.cell_at(word + object::WORD_NAME);
            if tag_of(name) == Tag::String as Cell {
                let name: Vec<u8> = self.string_bytes(name).to_vec();
                self.count_word_execution(&name);
            }
        }

        let subprimitive = self.heap.mem.cell_at(word + object::WORD_SUBPRIMITIVE);
        if tag_of(subprimitive) == Tag::ByteArray as Cell {
            let name: SmallVec<[u8; 32]> =
                SmallVec::from_slice(self.byte_array_name(subprimitive));
            if self.dispatch_primitive(&name)? {
                return Ok(());
            }
        }

        let handler = match handlers::cached_handler_id(self, word) {
            Some(id) => id,
            None => handlers::lookup_and_cache_handler_id(self, word),
        };
        if handler != HANDLER_NONE {
            let depth_before = self.ctx().depth();
            if handlers::dispatch_handler(self, handler)? {
                if self.validate_stack {
                    self.validate_stack_depth(depth_before, handler);
                }
                return Ok(());
            }
        }

        let def = self.heap.mem.cell_at(word + object::WORD_DEF);
        if tag_of(def) == Tag::Quotation as Cell {
            self.schedule_quotation(def);
        }
        Ok(())
    }

    fn validate_stack_depth(&mut self, _depth_before: usize, handler: u16)
    {
        let ctx = self.ctx();
        let within = ctx.data.top >= -1
            && ctx.data.top < ctx.data.cells.len() as isize;
        if !within {
            self.die("stack depth invariant violated by handler", handler as Cell);
        }
    }

    fn tuple_is_class(&mut self, tuple: Cell, which: TupleClass) -> bool
    {
        let layout = untag(self.heap.mem.cell_at(tuple + object::TUPLE_LAYOUT));
        let cached = match which {
            TupleClass::Curried => self.cached_curried_layout,
            TupleClass::Composed => self.cached_composed_layout,
        };
        if cached != 0 {
            return layout == cached;
        }

        let klass = object::array_nth(&self.heap.mem, layout, object::LAYOUT_KLASS);
        if tag_of(klass) != Tag::Word as Cell {
            return false;
        }
        let name = self.heap.mem.cell_at(untag(klass) + object::WORD_NAME);
        if tag_of(name) != Tag::String as Cell {
            return false;
        }
        if self.string_bytes(name) == which.name() {
            match which {
                TupleClass::Curried => self.cached_curried_layout = layout,
                TupleClass::Composed => self.cached_composed_layout = layout,
            }
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy)]
enum TupleClass
{
    Curried,
    Composed,
}

impl TupleClass
{
    fn name(self) -> &'static [u8]
    {
        match self {
            TupleClass::Curried => b"curried",
            TupleClass::Composed => b"composed",
        }
    }
}
