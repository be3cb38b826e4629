//! Boot-time plumbing: the minimal special-object environment, word
//! and quotation builders, argument passing, and the evaluator
//! surface.
//!
//! A full system boots from an image, which carries all of this; the
//! minimal bootstrap exists for running without one (tests, `-e` on a
//! bare VM) and allocates only what the interpreter itself consults:
//! the canonical true word, the do-primitive and declare marker words,
//! and the hashtable empty sentinel.

use {
    crate::{
        cell::{tag_of, untag, Cell, Fixnum, Tag, FALSE},
        object,
        special::{
            OBJ_ARGS, OBJ_CANONICAL_TRUE, OBJ_CPU_STRING, OBJ_DECLARE_WORD,
            OBJ_HASHTABLE_EMPTY, OBJ_OS_STRING, OBJ_PRIMITIVE_WORD,
            OBJ_STARTUP_QUOT,
        },
        vm::Vm,
    },
    log::info,
};

impl Vm
{
    /// Build a word from host-side name bytes.
    pub fn make_word(&mut self, name: &[u8], vocabulary: &[u8]) -> Cell
    {
        let name = self.string_from_bytes(name);
        let name_root = self.data_roots.push(name);
        let vocabulary = self.string_from_bytes(vocabulary);
        let name = self.data_roots.pop(name_root);
        let hashcode = self.hashcode_of(name);
        self.allot_word(name, vocabulary, hashcode)
    }

    /// Build a word whose execution runs a VM primitive.
    pub fn make_subprimitive_word(
        &mut self,
        name: &[u8],
        primitive: &[u8],
    ) -> Cell
    {
        let word = self.make_word(name, b"kernel");
        let word_root = self.data_roots.push(word);
        let subprimitive = self.byte_array_from_bytes(primitive);
        let word = self.data_roots.pop(word_root);
        self.heap
            .set_slot(untag(word), object::WORD_SUBPRIMITIVE, subprimitive);
        word
    }

    /// Build a quotation from host-side elements.
    pub fn make_quotation(&mut self, elements: &[Cell]) -> Cell
    {
        let handles: Vec<_> =
            elements.iter().map(|&element| self.data_roots.push(element)).collect();
        let array = self.allot_uninitialized_array(elements.len() as Cell);
        for (index, handle) in handles.into_iter().enumerate().rev() {
            let value = self.data_roots.pop(handle);
            self.heap.set_slot(
                untag(array),
                object::ARRAY_DATA + index as Cell * 4,
                value,
            );
        }
        self.allot_quotation(array)
    }

    /// Install the special objects the interpreter consults, for
    /// running without an image.
    pub fn bootstrap_minimal(&mut self)
    {
        let t = self.make_word(b"t", b"syntax");
        self.special_objects[OBJ_CANONICAL_TRUE] = t;

        let do_primitive = self.make_word(b"do-primitive", b"kernel.private");
        self.special_objects[OBJ_PRIMITIVE_WORD] = do_primitive;

        let declare = self.make_word(b"declare", b"kernel.private");
        self.special_objects[OBJ_DECLARE_WORD] = declare;

        let empty = self.make_word(b"((empty))", b"hashtables.private");
        self.special_objects[OBJ_HASHTABLE_EMPTY] = empty;

        let os = self.string_from_bytes(std::env::consts::OS.as_bytes());
        self.special_objects[OBJ_OS_STRING] = os;
        let cpu = self.string_from_bytes(b"interpreter");
        self.special_objects[OBJ_CPU_STRING] = cpu;
    }

    /// Hand the command-line positionals to the language as an array
    /// of strings.
    pub fn pass_args(&mut self, args: &[String])
    {
        let mut accumulated = crate::alloc::GrowableArray::new(self);
        for arg in args {
            let string = self.string_from_bytes(arg.as_bytes());
            accumulated.add(self, string);
        }
        let array = accumulated.finish(self);
        self.special_objects[OBJ_ARGS] = array;
    }

    /// Run the startup quotation, if the image installed one.
    pub fn run_startup(&mut self)
    {
        let startup = self.special_objects[OBJ_STARTUP_QUOT];
        if tag_of(startup) == Tag::Quotation as Cell {
            info!("running startup quotation");
            self.call_callable(startup);
        } else {
            info!("no startup quotation installed");
        }
    }

    /// Evaluate an expression through the language's `eval>string`
    /// word: builds the quotation `[ "expr" eval>string ]`, runs it,
    /// and returns the resulting string.
    pub fn eval_string(&mut self, source: &str) -> Option<String>
    {
        let eval_word = self.find_word_by_name(b"eval>string")?;
        let eval_root = self.data_roots.push(eval_word);
        let string = self.string_from_bytes(source.as_bytes());
        let eval_word = self.data_roots.pop(eval_root);
        let quot = self.make_quotation(&[string, eval_word]);

        self.call_callable(quot);

        let result = self.ctx_mut().pop().ok()?;
        (tag_of(result) == Tag::String as Cell)
            .then(|| String::from_utf8_lossy(self.string_bytes(result)).into_owned())
    }

    /// Define a word in terms of quotation elements; test and boot
    /// helper.
    pub fn define_word(&mut self, name: &[u8], elements: &[Cell]) -> Cell
    {
        let word = self.make_word(name, b"user");
        let word_root = self.data_roots.push(word);
        let def = self.make_quotation(elements);
        let word = self.data_roots.pop(word_root);
        self.heap.set_slot(untag(word), object::WORD_DEF, def);
        word
    }

    /// A fixnum cell, for quotation building.
    pub fn fixnum(&self, value: Fixnum) -> Cell
    {
        crate::cell::tag_fixnum(value)
    }

    /// The false cell, for quotation building.
    pub fn false_object(&self) -> Cell
    {
        FALSE
    }
}
