//! Engine-wide tunables, threaded from the CLI (`cvm-cli`) down through
//! every crate that needs to consult one of them. Grouped here, rather than
//! duplicated per crate, because the instruction templater, the layout
//! arranger, and the relocator all read a subset of the same knobs.

/// Chooses how RBBLs are permuted by the layout arranger (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RandomizationMode {
    /// Fisher-Yates over the full concatenated RBBL list.
    BlockLevel,
    /// Fisher-Yates over RBBUs within windows of `rbbu_range` blocks each,
    /// keeping each unit's members in original fallthrough order.
    UnitLevel,
}

/// Optimisation and behaviour toggles consumed across the templater, the
/// layout arranger, and the relocator; one-to-one with "CLI/options
/// consumed" in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub randomization_mode: RandomizationMode,
    /// Window size, in RBBUs, for unit-level Fisher-Yates.
    pub rbbu_range: u32,
    /// Maximum number of random padding bytes inserted between RBBL bodies.
    pub rbbu_padding: u32,
    /// Materialise an IndirectCall's computed target in a caller-saved
    /// register rather than spilling it to the main stack, when legal.
    pub caller_saved_destroy: bool,
    /// For a general indirect jump whose source operand is a register,
    /// destroy that register in place instead of going through the stack.
    pub jmpin_register_destroy: bool,
    /// For a general indirect jump whose source operand is
    /// memory-indexed, destroy the index register in place.
    pub jmpin_mem_index_destroy: bool,
    /// Copy main-executable switch-case tables into the cache verbatim
    /// (§4.4 item 2) instead of routing through the generic trampoline
    /// dispatch.
    pub main_switch_case_copy: bool,
    /// Record the trampoline-group base offset on indirect-jump sites with
    /// a recognised target set, so relocation can use a `TRAMPOLINE`
    /// relocation instead of a generic `CC` one.
    pub trampoline_record: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            randomization_mode: RandomizationMode::UnitLevel,
            rbbu_range: 32,
            rbbu_padding: 0,
            caller_saved_destroy: true,
            jmpin_register_destroy: true,
            jmpin_mem_index_destroy: false,
            main_switch_case_copy: true,
            trampoline_record: true,
        }
    }
}
