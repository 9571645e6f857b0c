//! Random Basic Blocks (RBBLs): the unit the layout arranger schedules.

use crate::reloc::Relocation;

/// Whether an RBBL must stay at its original offset in the cache (`Fixed`,
/// because untransformed code such as the vdso, signal machinery, or a
/// switch-case table the guest indexes directly may still reference that
/// address) or can be freely permuted (`Movable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RbblClass {
    Fixed,
    Movable,
}

/// A fingerprint derived from an RBBL's original offset, used to detect
/// stale/mismatched entries when round-tripping through the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RbblFingerprint(pub u64);

impl RbblFingerprint {
    pub fn from_offset(original_offset: u32) -> Self {
        // A simple, stable (non-cryptographic) mix; only used to catch
        // accidental offset/template mismatches, not for security.
        let x = original_offset as u64;
        let x = (x ^ (x >> 16)).wrapping_mul(0x45d9f3b);
        let x = (x ^ (x >> 16)).wrapping_mul(0x45d9f3b);
        Self(x ^ (x >> 16))
    }
}

/// One Random Basic Block: the generated template plus everything the
/// layout arranger and relocator need to place and patch it.
#[derive(Debug, Clone)]
pub struct RandomBbl {
    pub fingerprint: RbblFingerprint,
    pub original_offset: u32,
    pub class: RbblClass,
    /// Position-independent byte template, ready to be copied into a cache
    /// at any placement; relocations below describe how to patch it once
    /// placed.
    pub template: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Offset of the last branch target taken by this block's terminator,
    /// or `None` when the block has no statically-known single successor
    /// (e.g. an indirect jump/call, or a return). Used by the layout
    /// arranger to elide a trailing `JMP rel32` when the next placed RBBL
    /// happens to start right there.
    pub last_branch_target: Option<u32>,
    pub has_lock_repeat_prefix: bool,
}

impl RandomBbl {
    pub fn template_size(&self) -> usize {
        self.template.len()
    }
}

/// A maximal run of RBBLs, in increasing original-offset order, where each
/// block's `last_branch_target` equals the next block's `original_offset`.
/// RBBUs are the unit of randomisation in unit-level (RBBU) mode: permuted
/// as a bloc, emitted internally in original fallthrough order.
#[derive(Debug, Clone)]
pub struct RbbUnit {
    /// Original offsets of the member RBBLs, in fallthrough order.
    pub members: Vec<u32>,
}

impl RbbUnit {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Build RBBUs from the union of fixed + movable RBBLs, scanning in
/// increasing offset order and breaking a unit whenever the current block's
/// `last_branch_target` is not the next block's `original_offset`.
pub fn build_units<'a>(ordered: impl Iterator<Item = &'a RandomBbl>) -> Vec<RbbUnit> {
    let mut units = Vec::new();
    let mut current: Vec<u32> = Vec::new();
    let mut prev_target: Option<u32> = None;

    for rbbl in ordered {
        let starts_new_unit = match (prev_target, current.is_empty()) {
            (_, true) => false,
            (Some(t), false) => t != rbbl.original_offset,
            (None, false) => true,
        };
        if starts_new_unit {
            units.push(RbbUnit { members: std::mem::take(&mut current) });
        }
        current.push(rbbl.original_offset);
        prev_target = rbbl.last_branch_target;
    }
    if !current.is_empty() {
        units.push(RbbUnit { members: current });
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rbbl(offset: u32, last_branch_target: Option<u32>) -> RandomBbl {
        RandomBbl {
            fingerprint: RbblFingerprint::from_offset(offset),
            original_offset: offset,
            class: RbblClass::Movable,
            template: vec![0x90],
            relocations: vec![],
            last_branch_target,
            has_lock_repeat_prefix: false,
        }
    }

    #[test]
    fn units_break_on_non_contiguous_fallthrough() {
        let blocks = vec![rbbl(0x10, Some(0x20)), rbbl(0x20, Some(0x30)), rbbl(0x40, None)];
        let units = build_units(blocks.iter());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].members, vec![0x10, 0x20]);
        assert_eq!(units[1].members, vec![0x40]);
    }

    #[test]
    fn single_block_with_no_target_is_its_own_unit() {
        let blocks = vec![rbbl(0x10, None)];
        let units = build_units(blocks.iter());
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].members, vec![0x10]);
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(RbblFingerprint::from_offset(0x1234), RbblFingerprint::from_offset(0x1234));
        assert_ne!(RbblFingerprint::from_offset(0x1234), RbblFingerprint::from_offset(0x1235));
    }
}
