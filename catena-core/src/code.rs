//! The code heap, in its no-native-code configuration.
//!
//! This target generates no machine code, so the code heap holds no
//! executable bytes. The remembered sets and the uninitialized-block
//! table are kept so the collectors' phase structure matches the
//! native configuration; scanning them is a no-op until a backend
//! populates them.

use {
    crate::cell::Cell,
    std::collections::{BTreeMap, BTreeSet},
};

#[derive(Default)]
pub struct CodeHeap
{
    /// Code blocks whose literals point into the nursery.
    pub points_to_nursery: BTreeSet<Cell>,

    /// Code blocks whose literals point into aging.
    pub points_to_aging: BTreeSet<Cell>,

    /// Blocks whose owner objects are still being initialized, mapped
    /// to those owners. The owners are GC roots.
    pub uninitialized_blocks: BTreeMap<Cell, Cell>,
}

impl CodeHeap
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// After a nursery collection nothing can point into the nursery.
    pub fn clear_points_to_nursery(&mut self)
    {
        self.points_to_nursery.clear();
    }

    /// After an aging or older collection both young sets are stale.
    pub fn clear_remembered_set(&mut self)
    {
        self.points_to_nursery.clear();
        self.points_to_aging.clear();
    }

    /// Sweep is a no-op with no blocks to free.
    pub fn sweep(&mut self)
    {
    }
}
