//! Diagnostics: the memory-layout dump printed on fatal errors, the
//! low-level `-fep` console, and the word-counter report.

use {
    crate::{
        cell::Cell,
        vm::Vm,
    },
    std::io::{BufRead, Write},
};

/// Region bounds and occupancy, printed before aborting and from the
/// low-level console.
pub fn dump_memory_layout(vm: &Vm, out: &mut impl Write)
{
    let heap = &vm.heap;
    let _ = writeln!(out, "data heap:");
    let _ = writeln!(
        out,
        "  nursery  {:#010x}..{:#010x}  occupied {:#x}",
        heap.nursery.start,
        heap.nursery.end,
        heap.nursery.occupied_space(),
    );
    let _ = writeln!(
        out,
        "  aging    {:#010x}..{:#010x}  occupied {:#x}",
        heap.aging.allocator.start,
        heap.aging.allocator.end,
        heap.aging.allocator.occupied_space(),
    );
    let _ = writeln!(
        out,
        "  tenured  {:#010x}..{:#010x}  occupied {:#x} largest-free {:#x}",
        heap.tenured.allocator.start,
        heap.tenured.allocator.end,
        heap.tenured.allocator.occupied_space(),
        heap.tenured.allocator.largest_free_block(),
    );
    let _ = writeln!(
        out,
        "  stacks   data {} retain {} call {}",
        vm.ctx().depth(),
        vm.ctx().retain.depth(),
        vm.ctx().call.depth(),
    );
}

fn print_stack(vm: &Vm, out: &mut impl Write, cells: &[Cell], depth: usize)
{
    for (index, &cell) in cells[..depth].iter().enumerate().rev() {
        let _ = writeln!(out, "  [{index}] {}", vm.render_cell(cell));
    }
}

/// The low-level debugger entered by `-fep`, and by fatal paths that
/// still have a coherent VM. Reads single-letter commands from stdin.
pub fn debugger_repl(vm: &mut Vm)
{
    let stdin = std::io::stdin();
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "low-level debugger; one of: d r s m c q");

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "d" => {
                let depth = vm.ctx().depth();
                let cells = vm.ctx().data.cells.clone();
                print_stack(vm, &mut out, &cells, depth);
            },
            "r" => {
                let depth = vm.ctx().retain.depth();
                let cells = vm.ctx().retain.cells.clone();
                print_stack(vm, &mut out, &cells, depth);
            },
            "s" => {
                for (index, &cell) in vm.special_objects.iter().enumerate() {
                    if cell != crate::cell::FALSE {
                        let _ = writeln!(
                            out,
                            "  special[{index}] {}",
                            vm.render_cell(cell),
                        );
                    }
                }
            },
            "m" => dump_memory_layout(vm, &mut out),
            "c" => return,
            "q" => std::process::exit(1),
            other => {
                let _ = writeln!(out, "unknown command {other:?}");
            },
        }
    }
}

/// The per-word execution counts, highest first. Dumped at shutdown
/// when counting is enabled.
pub fn dump_word_counters(vm: &Vm, out: &mut impl Write)
{
    let Some(counters) = &vm.word_counters else { return };
    let mut entries: Vec<_> = counters.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let _ = writeln!(out, "word execution counts:");
    for (name, count) in entries {
        let _ = writeln!(out, "  {:>10}  {}", count, String::from_utf8_lossy(name));
    }
}
