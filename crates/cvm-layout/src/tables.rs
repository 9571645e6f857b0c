//! Main-executable switch-case table copy and the switch-case trampoline
//! group (§4.4 items 2 and 3).

use cvm_db::RbblStore;
use cvm_types::{CacheLayout, LayoutTag};

use crate::Error;

const TABLE_ENTRY_SIZE: u32 = 4;
const TRAMP_JMP32_SIZE: u32 = 5;

/// Copy every main-executable switch-case table entry-by-entry starting at
/// `start`, one [`LayoutTag::MainJumpTable`] slot per 4-byte entry, so the
/// relocator can later rewrite each slot to the entry's cache guest
/// address. Returns the offset right after the last entry placed.
pub(crate) fn copy_main_jump_tables(
    store: &RbblStore,
    layout: &mut CacheLayout,
    bytes: &mut [u8],
    start: u32,
) -> Result<u32, Error> {
    let mut cursor = start;
    for (_, entries) in store.main_jump_tables() {
        for &target_original_offset in entries {
            layout.insert(cursor, TABLE_ENTRY_SIZE, LayoutTag::MainJumpTable { target_original_offset })?;
            let at = cursor as usize;
            bytes[at..at + 4].copy_from_slice(&target_original_offset.to_le_bytes());
            cursor += TABLE_ENTRY_SIZE;
        }
    }
    Ok(cursor)
}

/// Place one 5-byte `JMP rel32` trampoline per distinct switch-case jump-in
/// target, starting at `start`. Every indirect jump templated against a
/// switch-case table (`template_switch_case_jmpin`) dispatches through one
/// of these rather than jumping straight to a (movable) RBBL body, so the
/// guest-visible jump table can keep pointing at a stable address across
/// regenerations. Returns the offset right after the last trampoline placed.
pub(crate) fn place_switch_case_trampolines(
    store: &RbblStore,
    layout: &mut CacheLayout,
    bytes: &mut [u8],
    start: u32,
) -> Result<u32, Error> {
    let mut cursor = start;
    for target_original_offset in store.switch_case_target_union() {
        layout.insert(cursor, TRAMP_JMP32_SIZE, LayoutTag::TrampJmp32 { target_original_offset })?;
        let at = cursor as usize;
        bytes[at] = 0xe9;
        bytes[at + 1..at + 5].copy_from_slice(&target_original_offset.to_le_bytes());
        cursor += TRAMP_JMP32_SIZE;
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_jump_table_entries_one_slot_per_entry() {
        let mut store = RbblStore::new();
        store.insert_main_switch_case_jump_table(0x900, vec![0x910, 0x920, 0x930]);
        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];

        let end = copy_main_jump_tables(&store, &mut layout, &mut bytes, 0x100).unwrap();

        assert_eq!(end, 0x100 + 12);
        assert_eq!(u32::from_le_bytes(bytes[0x100..0x104].try_into().unwrap()), 0x910);
        assert_eq!(u32::from_le_bytes(bytes[0x108..0x10c].try_into().unwrap()), 0x930);
    }

    #[test]
    fn places_one_trampoline_per_distinct_target() {
        let mut store = RbblStore::new();
        store.insert_switch_case_jmpin(0x500, vec![0x600, 0x700]);
        store.insert_switch_case_jmpin(0x510, vec![0x700, 0x800]);
        let mut layout = CacheLayout::new(0x1000);
        let mut bytes = vec![0u8; 0x1000];

        let end = place_switch_case_trampolines(&store, &mut layout, &mut bytes, 0x200).unwrap();

        assert_eq!(end, 0x200 + 3 * TRAMP_JMP32_SIZE);
    }
}
