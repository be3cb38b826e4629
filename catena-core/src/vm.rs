//! The VM instance: heap, contexts, roots, special objects, and the
//! glue between them.
//!
//! There is no global VM and no thread-local state; everything takes
//! an explicit `&mut Vm`.

use {
    crate::{
        cell::{
            immediate_p, tag_fixnum, tag_of, to_boolean, untag, Cell, Tag,
            FALSE,
        },
        context::Context,
        errors::{fatal_error, Fault, KERNEL_ERROR},
        gc::{self, GcEvent, GcOp, VmRoots},
        heap::DataHeap,
        interp::WorkItem,
        object::{self, header_at},
        roots::DataRoots,
        special::{
            SpecialObjects, OBJ_CANONICAL_TRUE, OBJ_CELL_SIZE,
            OBJ_ERROR_HANDLER_QUOT, SPECIAL_OBJECT_COUNT,
        },
    },
    log::trace,
    std::collections::HashMap,
};

/// Boot-time sizing, in bytes. The command-line surface fills this in.
#[derive(Clone, Debug)]
pub struct VmParameters
{
    pub datastack_size: Cell,
    pub retainstack_size: Cell,
    pub callstack_size: Cell,
    pub young_size: Cell,
    pub aging_size: Cell,
    pub tenured_size: Cell,
    pub code_size: Cell,
}

impl Default for VmParameters
{
    fn default() -> Self
    {
        Self{
            datastack_size: 128 * 1024,
            retainstack_size: 128 * 1024,
            callstack_size: 128 * 1024,
            young_size: 2 * 1024 * 1024,
            aging_size: 2 * 1024 * 1024,
            tenured_size: 16 * 1024 * 1024,
            code_size: 64 * 1024,
        }
    }
}

/// Megamorphic dispatch counters, surfaced by `dispatch-stats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchStats
{
    pub megamorphic_cache_misses: u64,
    pub megamorphic_cache_hits: u64,
}

pub struct Vm
{
    pub heap: DataHeap,
    pub code: crate::code::CodeHeap,
    pub special_objects: SpecialObjects,
    pub data_roots: DataRoots,
    pub contexts: Vec<Context>,
    pub current_context: usize,
    pub work_queue: Vec<WorkItem>,

    pub current_gc: Option<GcOp>,
    pub gc_off: bool,
    pub noop_gc: bool,
    pub gc_events: Option<Vec<GcEvent>>,

    pub faulting: bool,
    pub fatal_erroring: bool,

    pub dispatch_stats: DispatchStats,
    pub word_counters: Option<HashMap<Vec<u8>, u64>>,
    pub validate_stack: bool,

    /// Source of identity hashcodes, assigned lazily into headers.
    pub next_identity_hashcode: Cell,

    /// Cached layout addresses for the curried and composed tuple
    /// classes, recognized by class-word name on first use. Zero means
    /// unknown; cleared after every collection since layouts move.
    pub cached_curried_layout: Cell,
    pub cached_composed_layout: Cell,

    pub params: VmParameters,
}

impl Vm
{
    pub fn new(params: VmParameters) -> Self
    {
        let heap = DataHeap::new(
            params.young_size,
            params.aging_size,
            params.tenured_size,
        );
        let context = Context::new(
            params.datastack_size,
            params.retainstack_size,
            params.callstack_size,
        );
        let mut special_objects = [FALSE; SPECIAL_OBJECT_COUNT];
        special_objects[OBJ_CELL_SIZE] = tag_fixnum(4);

        Self{
            heap,
            code: crate::code::CodeHeap::new(),
            special_objects,
            data_roots: DataRoots::new(),
            contexts: vec![context],
            current_context: 0,
            work_queue: Vec::new(),
            current_gc: None,
            gc_off: false,
            noop_gc: false,
            gc_events: None,
            faulting: false,
            fatal_erroring: false,
            dispatch_stats: DispatchStats::default(),
            word_counters: None,
            validate_stack: false,
            next_identity_hashcode: 0,
            cached_curried_layout: 0,
            cached_composed_layout: 0,
            params,
        }
    }

    pub fn ctx(&self) -> &Context
    {
        &self.contexts[self.current_context]
    }

    pub fn ctx_mut(&mut self) -> &mut Context
    {
        &mut self.contexts[self.current_context]
    }

    pub fn true_object(&self) -> Cell
    {
        self.special_objects[OBJ_CANONICAL_TRUE]
    }

    pub fn from_boolean(&self, value: bool) -> Cell
    {
        if value { self.true_object() } else { FALSE }
    }

    /// Run a collection. No-op while collections are suppressed; a
    /// nested request is a VM bug and aborts.
    pub fn gc(&mut self, op: GcOp, requested_size: Cell)
    {
        if self.gc_off || self.noop_gc {
            trace!("gc suppressed, op {op:?}");
            return;
        }
        if self.current_gc.is_some() {
            fatal_error(
                &mut self.fatal_erroring,
                "collection requested during collection",
                0,
            );
        }
        self.current_gc = Some(op);

        let record = self.gc_events.is_some();
        let mut roots = VmRoots{
            data_roots: &mut self.data_roots,
            special_objects: &mut self.special_objects,
            contexts: &mut self.contexts,
            work_queue: &mut self.work_queue,
        };
        let (ran, event) =
            gc::collect(&mut self.heap, &mut roots, op, requested_size, record);
        trace!("gc {op:?} ran as {ran:?}");

        // Code-heap remembered roots: a no-op set on this target, but
        // the lifecycle matches the native configuration.
        match ran {
            GcOp::Nursery => self.code.clear_points_to_nursery(),
            _ => self.code.clear_remembered_set(),
        }
        if ran == GcOp::Full || ran == GcOp::Compact || ran == GcOp::Growing {
            self.code.sweep();
        }

        self.cached_curried_layout = 0;
        self.cached_composed_layout = 0;

        if let (Some(events), Some(event)) = (&mut self.gc_events, event) {
            events.push(event);
        }
        self.current_gc = None;
    }

    /// Raise a runtime error to the language.
    ///
    /// If an error handler is installed and no collection is running,
    /// this pushes a `(KERNEL_ERROR, kind, arg1, arg2)` array, clears
    /// the data roots (the unwound primitives will never pop theirs),
    /// rewinds the call and retain stacks, and schedules the handler
    /// quotation. Otherwise the error is fatal.
    pub fn general_error(&mut self, fault: Fault)
    {
        let Fault{kind, arg1, arg2} = fault;
        self.faulting = true;

        // Stack pointers may be out of bounds after an overflow; fix
        // them before the handler allocates anything.
        self.ctx_mut().fix_stacks();
        self.gc_off = false;

        let handler = self.special_objects[OBJ_ERROR_HANDLER_QUOT];
        if self.current_gc.is_none() && to_boolean(handler) {
            let error_object = self.allot_array_4(
                tag_fixnum(KERNEL_ERROR),
                tag_fixnum(kind as i32),
                arg1,
                arg2,
            );
            // The allocation may have moved the handler quotation.
            let handler = self.special_objects[OBJ_ERROR_HANDLER_QUOT];
            // A full data stack would make the push fault again; make
            // room rather than dying inside error delivery.
            if self.ctx_mut().push(error_object).is_err() {
                self.ctx_mut().reset();
                self.ctx_mut().push(error_object).expect("empty stack");
            }
            self.data_roots.clear();
            self.unwind_native_frames(handler);
        } else {
            eprintln!("catena: unhandled error {kind:?} ({arg1:#x}, {arg2:#x})");
            crate::debug::dump_memory_layout(self, &mut std::io::stderr().lock());
            fatal_error(&mut self.fatal_erroring, "error before handler installed", kind as Cell);
        }
    }

    /// On a target with no native frames, unwinding means: empty the
    /// call and retain stacks, drop all queued work, and hand control
    /// to the handler.
    pub fn unwind_native_frames(&mut self, handler: Cell)
    {
        let ctx = self.ctx_mut();
        ctx.call.top = -1;
        ctx.retain.top = -1;
        self.work_queue.clear();
        self.work_queue.push(WorkItem::CallCallable(handler));
        self.faulting = false;
    }

    /// Check a tagged cell against an expected type.
    pub fn check_tagged(&self, value: Cell, expected: Tag) -> Result<Cell, Fault>
    {
        if tag_of(value) == expected as Cell {
            Ok(untag(value))
        } else {
            Err(Fault::type_error(expected, value))
        }
    }

    /// Walk every live object in every generation, in address order.
    /// Must not be called during a collection.
    pub fn each_object(&self, mut f: impl FnMut(Cell))
    {
        debug_assert!(self.current_gc.is_none());
        let heap = &self.heap;

        let mut scan = heap.nursery.start;
        while scan < heap.nursery.here {
            f(scan);
            scan += object::object_size(&heap.mem, scan);
        }

        let mut scan = heap.aging.first_object();
        while let Some(obj) = scan {
            f(obj);
            scan = heap.aging.next_object_after(&heap.mem, obj);
        }

        let mut scan = heap.tenured.first_object(&heap.mem);
        while let Some(obj) = scan {
            f(obj);
            scan = heap.tenured.next_object_after(&heap.mem, obj);
        }
    }

    /// All word objects whose name equals `name`, as a tagged word, if
    /// any. Used by the evaluator surface.
    pub fn find_word_by_name(&self, name: &[u8]) -> Option<Cell>
    {
        let mut found = None;
        self.each_object(|obj| {
            if found.is_some() {
                return;
            }
            if header_at(&self.heap.mem, obj).type_code() == Some(Tag::Word) {
                let word_name = self.heap.mem.cell_at(obj + object::WORD_NAME);
                if !immediate_p(word_name)
                    && tag_of(word_name) == Tag::String as Cell
                    && self.string_bytes(word_name) == name
                {
                    found = Some(crate::cell::retag(obj, Tag::Word as Cell));
                }
            }
        });
        found
    }

    /// The byte contents of a tagged string.
    pub fn string_bytes(&self, tagged: Cell) -> &[u8]
    {
        let addr = untag(tagged);
        let length = object::string_length(&self.heap.mem, addr);
        self.heap.mem.slice(addr + object::STRING_DATA, length)
    }

    /// The byte contents of a tagged byte-array, up to the first NUL.
    /// Primitive names are stored this way.
    pub fn byte_array_name(&self, tagged: Cell) -> &[u8]
    {
        let addr = untag(tagged);
        let capacity = object::byte_array_capacity(&self.heap.mem, addr);
        let bytes = self.heap.mem.slice(addr + object::BYTE_ARRAY_DATA, capacity);
        match bytes.iter().position(|&b| b == 0) {
            Some(nul) => &bytes[..nul],
            None => bytes,
        }
    }

    pub fn count_word_execution(&mut self, name: &[u8])
    {
        if let Some(counters) = &mut self.word_counters {
            *counters.entry(name.to_vec()).or_insert(0) += 1;
        }
    }

    /// Fatal errors funnel here so the double-fault path is shared.
    pub fn die(&mut self, msg: &str, value: Cell) -> !
    {
        crate::debug::dump_memory_layout(self, &mut std::io::stderr().lock());
        fatal_error(&mut self.fatal_erroring, msg, value)
    }
}

