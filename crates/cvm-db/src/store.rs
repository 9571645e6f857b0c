//! The per-module Random-BBL store (§4.3): fixed/movable RBBLs, switch-case
//! jump-in target sets, and main-executable jump tables, plus the derived
//! RBBU partition.

use cvm_types::{build_units, RandomBbl, RbbUnit, RbblClass};

/// One module's collection of RBBLs and the static-analysis tables the
/// instruction templater and layout arranger consult alongside them.
#[derive(Debug, Clone, Default)]
pub struct RbblStore {
    fixed: Vec<RandomBbl>,
    movable: Vec<RandomBbl>,
    /// `(src_offset, target_set)`, insertion order preserved so the
    /// database round-trips byte-identically.
    switch_case_jmpin: Vec<(u32, Vec<u32>)>,
    /// `(table_offset, entries)`.
    main_jump_tables: Vec<(u32, Vec<u32>)>,
    units: Vec<RbbUnit>,
}

impl RbblStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_fixed(&mut self, rbbl: RandomBbl) {
        debug_assert_eq!(rbbl.class, RbblClass::Fixed);
        self.fixed.push(rbbl);
    }

    pub fn insert_movable(&mut self, rbbl: RandomBbl) {
        debug_assert_eq!(rbbl.class, RbblClass::Movable);
        self.movable.push(rbbl);
    }

    pub fn insert_switch_case_jmpin(&mut self, src_offset: u32, target_set: Vec<u32>) {
        self.switch_case_jmpin.push((src_offset, target_set));
    }

    pub fn insert_main_switch_case_jump_table(&mut self, offset: u32, entries: Vec<u32>) {
        self.main_jump_tables.push((offset, entries));
    }

    pub fn fixed(&self) -> &[RandomBbl] {
        &self.fixed
    }

    pub fn movable(&self) -> &[RandomBbl] {
        &self.movable
    }

    pub fn switch_case_jmpin(&self) -> &[(u32, Vec<u32>)] {
        &self.switch_case_jmpin
    }

    pub fn main_jump_tables(&self) -> &[(u32, Vec<u32>)] {
        &self.main_jump_tables
    }

    pub fn units(&self) -> &[RbbUnit] {
        &self.units
    }

    /// The union of every switch-case jmp-in target set, deduplicated and
    /// sorted; used by the layout arranger to place the trampoline group
    /// (§4.4 item 3).
    pub fn switch_case_target_union(&self) -> Vec<u32> {
        let mut all: Vec<u32> = self.switch_case_jmpin.iter().flat_map(|(_, t)| t.iter().copied()).collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Rebuild RBBUs by scanning the union of fixed+movable in increasing
    /// offset order, breaking a unit whenever the current block's
    /// `last_branch_target` is not the next block's `original_offset`
    /// (§4.3). Must be called after every `insert_fixed`/`insert_movable`
    /// batch and before the layout arranger runs in unit-level mode.
    pub fn rebuild_units(&mut self) {
        let mut ordered: Vec<&RandomBbl> = self.fixed.iter().chain(self.movable.iter()).collect();
        ordered.sort_by_key(|r| r.original_offset);
        self.units = build_units(ordered.into_iter());
    }
}
