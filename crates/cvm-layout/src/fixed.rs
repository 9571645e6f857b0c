//! Fixed-trampoline placement (§4.4 item 1): every fixed RBBL keeps a stub
//! at its original offset so any guest code that still addresses that
//! offset directly (a raw `call`/`jmp` baked into unrelocatable data, a
//! signal trampoline, a vdso entry) keeps working, while the RBBL's actual
//! body is free to move with everything else.

use cvm_db::RbblStore;
use cvm_types::{CacheLayout, LayoutTag, RbblClass};

use crate::Error;

const TRAMP_JMP32_SIZE: u32 = 5;
const TRAMP_JMP8_SIZE: u32 = 2;
/// How far back a rel8 relay scavenge will look for an unused 5-byte slot
/// before giving up and degrading to an invalid-opcode marker.
const SCAVENGE_WINDOW: u32 = 4096;

/// Place one 5-byte `JMP rel32` stub per fixed RBBL at its original offset,
/// falling back to a 2-byte `JMP rel8` relay (to a scavenged 5-byte slot
/// further back in the cache) or, failing that, an invalid-opcode marker,
/// when the gap to the next fixed offset is too small. Returns the highest
/// byte offset used.
pub(crate) fn place_fixed_trampolines(
    store: &RbblStore,
    layout: &mut CacheLayout,
    bytes: &mut [u8],
) -> Result<u32, Error> {
    let mut fixed: Vec<u32> = store.fixed().iter().map(|r| r.original_offset).collect();
    fixed.sort_unstable();

    let mut high_water = 0u32;
    for (i, &start) in fixed.iter().enumerate() {
        let next_boundary = fixed.get(i + 1).copied().unwrap_or(layout.capacity());
        let gap = next_boundary.saturating_sub(start);

        if gap >= TRAMP_JMP32_SIZE {
            place_jmp32(layout, bytes, start, start)?;
            high_water = high_water.max(start + TRAMP_JMP32_SIZE);
        } else if gap >= TRAMP_JMP8_SIZE {
            match scavenge_slot(layout, start) {
                Some(slot) => {
                    place_jmp32(layout, bytes, slot, start)?;
                    place_jmp8_relay(layout, bytes, start, slot)?;
                    high_water = high_water.max(start + TRAMP_JMP8_SIZE);
                }
                None => {
                    tracing::warn!(
                        offset = start,
                        "no scavenged slot found within the backward search window; \
                         degrading fixed trampoline to an invalid-opcode marker"
                    );
                    place_invalid_marker(layout, bytes, start, TRAMP_JMP8_SIZE)?;
                    high_water = high_water.max(start + TRAMP_JMP8_SIZE);
                }
            }
        } else if gap > 0 {
            place_invalid_marker(layout, bytes, start, gap)?;
            high_water = high_water.max(start + gap);
        }
        // gap == 0 means two fixed RBBLs claim the same offset, which the
        // disassembler database should never produce; nothing to place.
    }
    Ok(high_water)
}

fn place_jmp32(
    layout: &mut CacheLayout,
    bytes: &mut [u8],
    at: u32,
    target_original_offset: u32,
) -> Result<(), Error> {
    layout.insert(at, TRAMP_JMP32_SIZE, LayoutTag::TrampJmp32 { target_original_offset })?;
    let at = at as usize;
    bytes[at] = 0xe9;
    bytes[at + 1..at + 5].copy_from_slice(&target_original_offset.to_le_bytes());
    Ok(())
}

fn place_jmp8_relay(layout: &mut CacheLayout, bytes: &mut [u8], at: u32, relay_to: u32) -> Result<(), Error> {
    layout.insert(at, TRAMP_JMP8_SIZE, LayoutTag::TrampJmp8 { relay_to })?;
    let rel = (relay_to as i64 - (at as i64 + TRAMP_JMP8_SIZE as i64)) as i8;
    let at = at as usize;
    bytes[at] = 0xeb;
    bytes[at + 1] = rel as u8;
    Ok(())
}

fn place_invalid_marker(layout: &mut CacheLayout, bytes: &mut [u8], at: u32, size: u32) -> Result<(), Error> {
    layout.insert(at, size, LayoutTag::InvTramp)?;
    for b in &mut bytes[at as usize..(at + size) as usize] {
        *b = 0xcc;
    }
    Ok(())
}

/// Bounded backward scan for an unused 5-byte window below `upper_bound`,
/// used when the gap before a fixed RBBL is too small to hold a direct
/// `JMP rel32`.
fn scavenge_slot(layout: &CacheLayout, upper_bound: u32) -> Option<u32> {
    let floor = upper_bound.saturating_sub(SCAVENGE_WINDOW);
    let mut candidate = upper_bound.checked_sub(TRAMP_JMP32_SIZE)?;
    loop {
        if is_free(layout, candidate, TRAMP_JMP32_SIZE) {
            return Some(candidate);
        }
        if candidate <= floor {
            return None;
        }
        candidate -= 1;
    }
}

fn is_free(layout: &CacheLayout, start: u32, size: u32) -> bool {
    let end = start + size;
    !layout.iter().any(|e| e.start < end && start < e.end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{RandomBbl, RbblFingerprint};

    fn fixed_rbbl(offset: u32) -> RandomBbl {
        RandomBbl {
            fingerprint: RbblFingerprint::from_offset(offset),
            original_offset: offset,
            class: RbblClass::Fixed,
            template: vec![0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        }
    }

    #[test]
    fn places_a_full_trampoline_when_room_allows() {
        let mut store = RbblStore::new();
        store.insert_fixed(fixed_rbbl(0x100));
        store.insert_fixed(fixed_rbbl(0x200));
        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];

        let high_water = place_fixed_trampolines(&store, &mut layout, &mut bytes).unwrap();

        assert_eq!(bytes[0x100], 0xe9);
        assert_eq!(u32::from_le_bytes(bytes[0x101..0x105].try_into().unwrap()), 0x100);
        assert_eq!(high_water, 0x105);
        assert!(matches!(layout.find(0x100).unwrap().tag, LayoutTag::TrampJmp32 { target_original_offset: 0x100 }));
    }

    #[test]
    fn relays_through_a_scavenged_slot_when_gap_is_small() {
        let mut store = RbblStore::new();
        store.insert_fixed(fixed_rbbl(0x100));
        store.insert_fixed(fixed_rbbl(0x103));
        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];

        place_fixed_trampolines(&store, &mut layout, &mut bytes).unwrap();

        assert_eq!(bytes[0x100], 0xeb);
        let entry = layout.find(0x100).unwrap();
        assert!(matches!(entry.tag, LayoutTag::TrampJmp8 { .. }));
    }

    #[test]
    fn degrades_to_invalid_marker_when_gap_is_too_small() {
        let mut store = RbblStore::new();
        store.insert_fixed(fixed_rbbl(0x100));
        store.insert_fixed(fixed_rbbl(0x101));
        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];

        place_fixed_trampolines(&store, &mut layout, &mut bytes).unwrap();

        let entry = layout.find(0x100).unwrap();
        assert!(matches!(entry.tag, LayoutTag::InvTramp));
        assert_eq!(entry.size, 1);
    }
}
