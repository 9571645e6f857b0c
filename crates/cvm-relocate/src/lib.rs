//! The relocator (§4.5): walks an [`ArrangedCache`]'s layout map and patches
//! every relocation — branch, RIP, shadow-stack, code-cache, trampoline, and
//! main jump-table — to its final cache-absolute value.
//!
//! Ordering note (§5): `arrange_layout` must fully populate
//! `ArrangedCache::rbbl_addresses` before this crate runs; the relocator has
//! no way to place anything itself.

mod fixup;

use std::collections::HashMap;

use cvm_db::RbblStore;
use cvm_layout::ArrangedCache;
use cvm_types::{LayoutTag, RandomBbl};

pub use fixup::RelocContext;

/// Errors raised while resolving a relocation. Both are fatal per §7 tier 1:
/// a relocation that cannot resolve means the layout and the relocation
/// list have gone out of sync, which the design treats as unrecoverable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("relocation references RBBL at original offset {0:#x}, which was never placed")]
    UnresolvedRbbl(u32),
    #[error("RBBL body at original offset {0:#x} has no entry in the store")]
    MissingRbbl(u32),
}

/// Patch every relocation in `arranged` in place, given the per-cache-half
/// addressing constants in `ctx`.
pub fn relocate(arranged: &mut ArrangedCache, store: &RbblStore, ctx: &RelocContext) -> Result<(), Error> {
    let by_offset: HashMap<u32, &RandomBbl> =
        store.fixed().iter().chain(store.movable().iter()).map(|r| (r.original_offset, r)).collect();

    let entries: Vec<_> = arranged.layout.iter().cloned().collect();
    let addr_of = |offset: u32| arranged.rbbl_addresses.get(&offset).map(|&rel| ctx.cache_base + rel as u64);

    for entry in entries {
        match entry.tag {
            LayoutTag::Boundary | LayoutTag::InvTramp | LayoutTag::TrampJmp8 { .. } => {}
            LayoutTag::TrampJmp32 { target_original_offset } => {
                let target = addr_of(target_original_offset)
                    .ok_or(Error::UnresolvedRbbl(target_original_offset))?;
                let next_pc = ctx.cache_base + entry.start as u64 + 5;
                let disp = (target as i64 - next_pc as i64) as i32;
                write_u32(&mut arranged.bytes, entry.start + 1, disp as u32);
            }
            LayoutTag::MainJumpTable { target_original_offset } => {
                let target = addr_of(target_original_offset)
                    .ok_or(Error::UnresolvedRbbl(target_original_offset))?;
                // Main-executable jump tables hold 32-bit absolute VAs; see
                // `Module::is_main_executable`.
                write_u32(&mut arranged.bytes, entry.start, target as u32);
            }
            LayoutTag::RbblBody { original_offset } => {
                let rbbl = by_offset.get(&original_offset).ok_or(Error::MissingRbbl(original_offset))?;
                for reloc in &rbbl.relocations {
                    let reloc_end = reloc.byte_position + reloc.byte_size as u32;
                    if reloc_end > entry.size {
                        // Folded into the elided trailing JMP; nothing to patch.
                        continue;
                    }
                    let abs_pos = entry.start + reloc.byte_position;
                    let value = fixup::resolve(reloc, abs_pos, ctx, &addr_of)?;
                    write_u32(&mut arranged.bytes, abs_pos, value);
                }
            }
        }
    }
    Ok(())
}

fn write_u32(bytes: &mut [u8], pos: u32, value: u32) {
    let pos = pos as usize;
    bytes[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_layout::arrange;
    use cvm_types::{EngineOptions, RandomBbl, RbblClass, RbblFingerprint, RelocKind, Relocation};

    fn ctx() -> RelocContext {
        RelocContext {
            cache_base: 0x7f00_0000_0000,
            orig_base: 0x40_0000,
            cc_offset: 0x7f00_0000_0000 - 0x40_0000,
            ss_offset: -0x1000,
            trampoline_delta: 0,
            debug_base: None,
        }
    }

    #[test]
    fn branch_relocation_resolves_to_placed_rbbl() {
        let mut store = RbblStore::new();
        store.insert_movable(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x10),
            original_offset: 0x10,
            class: RbblClass::Movable,
            template: vec![0xe9, 0, 0, 0, 0],
            relocations: vec![Relocation::new(RelocKind::Branch, 1, 4, 0, 0x20)],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.insert_movable(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x20),
            original_offset: 0x20,
            class: RbblClass::Movable,
            template: vec![0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.rebuild_units();

        let mut arranged = arrange(&store, 0x1000, EngineOptions::default(), 7).unwrap();
        relocate(&mut arranged, &store, &ctx()).unwrap();

        let first = arranged.layout.find_rbbl(0x10).unwrap();
        let second = arranged.layout.find_rbbl(0x20).unwrap();
        let rel_pos = (first.start + 1) as usize;
        let written = i32::from_le_bytes(arranged.bytes[rel_pos..rel_pos + 4].try_into().unwrap());
        let next_pc = first.start + 5;
        assert_eq!(written, second.start as i32 - next_pc as i32);
    }

    #[test]
    fn fixed_trampoline_resolves_to_body_address() {
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

        let mut arranged = arrange(&store, 0x1000, EngineOptions::default(), 1).unwrap();
        relocate(&mut arranged, &store, &ctx()).unwrap();

        let body = arranged.layout.find_rbbl(0x100).unwrap();
        let tramp_pos = 0x101usize;
        let written = i32::from_le_bytes(arranged.bytes[tramp_pos..tramp_pos + 4].try_into().unwrap());
        let next_pc = 0x100 + 5;
        assert_eq!(written, body.start as i32 - next_pc as i32);
    }
}
