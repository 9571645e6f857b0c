//! The layout arranger (§4.4): builds one cache half's [`CacheLayout`] and
//! byte buffer from a module's [`RbblStore`] — fixed trampolines (with
//! rel8-relay scavenging), the optional main-executable switch-case table
//! copy, the switch-case trampoline group, and the permuted RBBL bodies.
//!
//! Produces placement data only; patching relocations against the finished
//! placement is the relocator's job (`cvm-relocate`).

mod bodies;
mod fixed;
mod tables;

use std::collections::HashMap;

use cvm_db::RbblStore;
use cvm_types::{CacheLayout, EngineOptions, LayoutMapError};

/// The gap left between the fixed-trampoline region and the switch-case
/// trampoline group, and again before the RBBL bodies, so a later
/// regeneration that grows either region by a few entries does not
/// immediately collide with the next. Arbitrary but generous relative to a
/// single trampoline's size.
const REGION_GAP: u32 = 16;

/// Everything the relocator needs after a layout pass: the placed regions,
/// the rendered (still relocation-pending) bytes, and the map from an
/// RBBL's original offset to where its body landed.
#[derive(Debug, Clone)]
pub struct ArrangedCache {
    pub layout: CacheLayout,
    pub bytes: Vec<u8>,
    /// Original offset -> cache-relative address of the placed RBBL body.
    pub rbbl_addresses: HashMap<u32, u32>,
    /// Start of the switch-case trampoline group.
    pub trampoline_base: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache layout error: {0}")]
    Layout(#[from] LayoutMapError),
}

/// Arrange one cache half's worth of layout for `store` under `options`,
/// using `seed` to drive RBBL body permutation (§8: same seed + same store
/// must reproduce the same cache byte-for-byte).
pub fn arrange(
    store: &RbblStore,
    cache_size: u32,
    options: EngineOptions,
    seed: u64,
) -> Result<ArrangedCache, Error> {
    let mut layout = CacheLayout::new(cache_size);
    let mut bytes = vec![0xccu8; cache_size as usize];
    let mut rbbl_addresses = HashMap::new();

    let fixed_end = fixed::place_fixed_trampolines(store, &mut layout, &mut bytes)?;

    let after_tables = if options.main_switch_case_copy {
        tables::copy_main_jump_tables(store, &mut layout, &mut bytes, fixed_end)?
    } else {
        fixed_end
    };

    let trampoline_base = after_tables.saturating_add(REGION_GAP);
    let after_trampolines =
        tables::place_switch_case_trampolines(store, &mut layout, &mut bytes, trampoline_base)?;

    let bodies_start = after_trampolines.saturating_add(REGION_GAP);
    bodies::place_bodies(
        store,
        options,
        seed,
        &mut layout,
        &mut bytes,
        bodies_start,
        &mut rbbl_addresses,
    )?;

    Ok(ArrangedCache { layout, bytes, rbbl_addresses, trampoline_base })
}
