//! Cross-variant PC and return-address migration (§4.6): once a fresh cache
//! half is published, every live PC, return address, and shadow-stack entry
//! pointing into the consumed half must be translated to the matching
//! location in the new one before it is resumed.

use cvm_layout::ArrangedCache;
use cvm_types::LayoutTag;
use rayon::prelude::*;

/// Walk `cache`'s layout starting at cache-relative offset `rel_offset`,
/// following fixed-trampoline relays, to the RBBL whose body actually
/// contains the live PC. Returns `None` if `rel_offset` does not land in a
/// real RBBL body (mid-trampoline or padding addresses are not valid PCs
/// to migrate).
pub fn find_rbbl_from_cache_pc(cache: &ArrangedCache, rel_offset: u32) -> Option<u32> {
    let mut cursor = rel_offset;
    // Trampoline chains are finite and acyclic by construction; bound the
    // walk anyway so a corrupted layout cannot hang migration.
    for _ in 0..64 {
        let entry = cache.layout.find(cursor)?;
        match entry.tag {
            LayoutTag::RbblBody { original_offset } => return Some(original_offset),
            LayoutTag::TrampJmp8 { relay_to } => cursor = relay_to,
            LayoutTag::TrampJmp32 { target_original_offset } => {
                cursor = *cache.rbbl_addresses.get(&target_original_offset)?;
            }
            LayoutTag::Boundary | LayoutTag::InvTramp | LayoutTag::MainJumpTable { .. } => return None,
        }
    }
    None
}

/// Translate a single PC from `source`'s address space to the matching
/// point in `dest`'s. Returns 0 if the old PC lies outside a real RBBL
/// body, per the original `translate_pc` contract.
///
/// `rel` can land on an RBBL body directly, or on a fixed trampoline that
/// relays to one (`find_rbbl_from_cache_pc` follows `TrampJmp8`/`TrampJmp32`
/// chains transparently). Only the direct case carries a meaningful
/// intra-body offset — `rel - source_start` measures how far into the body
/// `rel` itself sits, which is nonsensical once `rel` is a trampoline
/// address nowhere near that body. A PC reached through a trampoline
/// relay instead translates to the destination body's entry point.
pub fn translate_pc(old_pc: u64, source: &ArrangedCache, dest: &ArrangedCache, source_base: u64, dest_base: u64) -> u64 {
    if old_pc < source_base {
        return 0;
    }
    let rel = (old_pc - source_base) as u32;
    let Some(original_offset) = find_rbbl_from_cache_pc(source, rel) else {
        return 0;
    };
    let Some(&dest_start) = dest.rbbl_addresses.get(&original_offset) else {
        return 0;
    };
    let landed_in_body = matches!(
        source.layout.find(rel),
        Some(entry) if matches!(entry.tag, LayoutTag::RbblBody { original_offset: o } if o == original_offset)
    );
    let intra_body_offset = if landed_in_body {
        let Some(&source_start) = source.rbbl_addresses.get(&original_offset) else {
            return 0;
        };
        rel - source_start
    } else {
        0
    };
    dest_base + dest_start as u64 + intra_body_offset as u64
}

/// One stack's worth of saved return addresses to migrate, identified only
/// by an opaque label for error reporting.
pub struct StackMigration<'a> {
    pub label: &'a str,
    pub addresses: &'a mut [u64],
}

/// Translate every return address on every given stack in parallel, one
/// rayon worker per stack (§4.6 "multi-stack parallel translation").
pub fn translate_stacks(stacks: &mut [StackMigration], source: &ArrangedCache, dest: &ArrangedCache, source_base: u64, dest_base: u64) {
    stacks.par_iter_mut().for_each(|stack| {
        for addr in stack.addresses.iter_mut() {
            let translated = translate_pc(*addr, source, dest, source_base, dest_base);
            if translated == 0 {
                tracing::warn!(stack = stack.label, old_pc = *addr, "return address did not translate to the new variant");
                continue;
            }
            *addr = translated;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_layout::arrange;
    use cvm_db::RbblStore;
    use cvm_types::{EngineOptions, RandomBbl, RbblClass, RbblFingerprint};

    fn store() -> RbblStore {
        let mut store = RbblStore::new();
        store.insert_movable(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x10),
            original_offset: 0x10,
            class: RbblClass::Movable,
            template: vec![0x90, 0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.rebuild_units();
        store
    }

    #[test]
    fn translate_pc_finds_matching_body_in_a_different_permutation() {
        let store = store();
        let source = arrange(&store, 0x1000, EngineOptions::default(), 1).unwrap();
        let dest = arrange(&store, 0x1000, EngineOptions::default(), 2).unwrap();

        let source_start = *source.rbbl_addresses.get(&0x10).unwrap();
        let old_pc = 0x7f00_0000_0000 + source_start as u64;

        let new_pc = translate_pc(old_pc, &source, &dest, 0x7f00_0000_0000, 0x7f00_0001_0000);
        let dest_start = *dest.rbbl_addresses.get(&0x10).unwrap();
        assert_eq!(new_pc, 0x7f00_0001_0000 + dest_start as u64);
    }

    #[test]
    fn translate_pc_returns_zero_outside_any_body() {
        let store = store();
        let source = arrange(&store, 0x1000, EngineOptions::default(), 1).unwrap();
        let dest = arrange(&store, 0x1000, EngineOptions::default(), 2).unwrap();
        assert_eq!(translate_pc(0, &source, &dest, 0x7f00_0000_0000, 0x7f00_0001_0000), 0);
    }

    fn fixed_store() -> RbblStore {
        let mut store = RbblStore::new();
        store.insert_fixed(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x100),
            original_offset: 0x100,
            class: RbblClass::Fixed,
            template: vec![0x90, 0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.rebuild_units();
        store
    }

    #[test]
    fn translate_pc_through_a_fixed_trampoline_lands_on_the_body_start() {
        let store = fixed_store();
        let source = arrange(&store, 0x1000, EngineOptions::default(), 1).unwrap();
        let dest = arrange(&store, 0x1000, EngineOptions::default(), 2).unwrap();

        // 0x100 is the fixed RBBL's trampoline address, not its (moved)
        // body; `find` there must report `TrampJmp32`, never `RbblBody`.
        assert!(matches!(source.layout.find(0x100).unwrap().tag, LayoutTag::TrampJmp32 { .. }));

        let old_pc = 0x7f00_0000_0000 + 0x100;
        let new_pc = translate_pc(old_pc, &source, &dest, 0x7f00_0000_0000, 0x7f00_0001_0000);
        let dest_start = *dest.rbbl_addresses.get(&0x100).unwrap();
        assert_eq!(new_pc, 0x7f00_0001_0000 + dest_start as u64);
    }
}
