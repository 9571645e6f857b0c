//! RBBL body placement (§4.4 items 4-6): permute the fixed+movable bodies
//! (block-level or unit-level/RBBU-windowed), place them back to back with
//! fallthrough elision and optional random padding between them.

use std::collections::HashMap;

use cvm_db::RbblStore;
use cvm_types::{CacheLayout, EngineOptions, LayoutTag, RandomBbl, RandomizationMode};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::Error;

const ELIDED_JMP_SIZE: u32 = 5;

pub(crate) fn place_bodies(
    store: &RbblStore,
    options: EngineOptions,
    seed: u64,
    layout: &mut CacheLayout,
    bytes: &mut [u8],
    start: u32,
    rbbl_addresses: &mut HashMap<u32, u32>,
) -> Result<(), Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    let order = placement_order(store, options, &mut rng);

    let by_offset: HashMap<u32, &RandomBbl> =
        store.fixed().iter().chain(store.movable().iter()).map(|r| (r.original_offset, r)).collect();

    let mut cursor = start;
    for (i, &original_offset) in order.iter().enumerate() {
        let rbbl = by_offset[&original_offset];
        let next_offset = order.get(i + 1).copied();
        let elide = rbbl.last_branch_target.is_some()
            && rbbl.last_branch_target == next_offset
            && rbbl.template.len() as u32 >= ELIDED_JMP_SIZE;
        let placed_size =
            if elide { rbbl.template.len() as u32 - ELIDED_JMP_SIZE } else { rbbl.template.len() as u32 };

        layout.insert(cursor, placed_size, LayoutTag::RbblBody { original_offset })?;
        let at = cursor as usize;
        bytes[at..at + placed_size as usize].copy_from_slice(&rbbl.template[..placed_size as usize]);
        rbbl_addresses.insert(original_offset, cursor);
        cursor += placed_size;

        if options.rbbu_padding > 0 {
            let pad = rng.random_range(0..=options.rbbu_padding);
            if pad > 0 {
                layout.insert(cursor, pad, LayoutTag::InvTramp)?;
                for b in &mut bytes[cursor as usize..(cursor + pad) as usize] {
                    *b = 0xcc;
                }
                cursor += pad;
            }
        }
    }
    Ok(())
}

/// Decide the placement order of every fixed+movable RBBL's body, permuted
/// under the configured randomization mode.
fn placement_order(store: &RbblStore, options: EngineOptions, rng: &mut StdRng) -> Vec<u32> {
    match options.randomization_mode {
        RandomizationMode::BlockLevel => {
            let mut offsets: Vec<u32> =
                store.fixed().iter().chain(store.movable().iter()).map(|r| r.original_offset).collect();
            offsets.sort_unstable();
            offsets.shuffle(rng);
            offsets
        }
        RandomizationMode::UnitLevel => {
            let mut units = store.units().to_vec();
            let window = options.rbbu_range.max(1) as usize;
            for chunk in units.chunks_mut(window) {
                chunk.shuffle(rng);
            }
            units.into_iter().flat_map(|u| u.members).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{RbblClass, RbblFingerprint};

    fn rbbl(offset: u32, template: Vec<u8>, last_branch_target: Option<u32>) -> RandomBbl {
        RandomBbl {
            fingerprint: RbblFingerprint::from_offset(offset),
            original_offset: offset,
            class: RbblClass::Movable,
            template,
            relocations: vec![],
            last_branch_target,
            has_lock_repeat_prefix: false,
        }
    }

    #[test]
    fn elides_trailing_jump_when_adjacent_in_placement_order() {
        let mut store = RbblStore::new();
        // 1 nop + 5-byte jmp, targeting 0x20 which we force to place right after.
        store.insert_movable(rbbl(0x10, vec![0x90, 0xe9, 0, 0, 0, 0], Some(0x20)));
        store.insert_movable(rbbl(0x20, vec![0x90], None));
        store.rebuild_units();

        let mut options = EngineOptions::default();
        options.randomization_mode = RandomizationMode::UnitLevel;
        options.rbbu_padding = 0;

        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];
        let mut addresses = HashMap::new();
        place_bodies(&store, options, 1, &mut layout, &mut bytes, 0x100, &mut addresses).unwrap();

        let first = layout.find_rbbl(0x10).unwrap();
        assert_eq!(first.size, 1, "trailing 5-byte jmp should have been elided");
        let second = layout.find_rbbl(0x20).unwrap();
        assert_eq!(second.start, first.end());
    }

    #[test]
    fn same_seed_reproduces_identical_placement() {
        let mut store = RbblStore::new();
        for offset in [0x10, 0x20, 0x30, 0x40, 0x50] {
            store.insert_movable(rbbl(offset, vec![0x90; 4], None));
        }
        store.rebuild_units();
        let options = EngineOptions::default();

        let mut addr_a = HashMap::new();
        let mut layout_a = CacheLayout::new(0x1000);
        let mut bytes_a = vec![0u8; 0x1000];
        place_bodies(&store, options, 42, &mut layout_a, &mut bytes_a, 0x100, &mut addr_a).unwrap();

        let mut addr_b = HashMap::new();
        let mut layout_b = CacheLayout::new(0x1000);
        let mut bytes_b = vec![0u8; 0x1000];
        place_bodies(&store, options, 42, &mut layout_b, &mut bytes_b, 0x100, &mut addr_b).unwrap();

        assert_eq!(addr_a, addr_b);
        assert_eq!(bytes_a, bytes_b);
    }
}
