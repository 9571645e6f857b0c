//! The cache layout: a disjoint-range map from one cache half's address
//! space to what lives there.

use std::collections::BTreeMap;

/// What occupies one range of a cache layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutTag {
    /// Sentinel marking the start/end of a reserved region; carries no bytes.
    Boundary,
    /// Padding filled with an undefined-opcode byte (0x0f 0x0b, UD2).
    InvTramp,
    /// A 2-byte `JMP rel8` trampoline, already fully encoded at placement
    /// time, relaying to a scavenged slot at `relay_to` (a cache-relative
    /// offset).
    TrampJmp8 { relay_to: u32 },
    /// A 5-byte `JMP rel32` trampoline whose operand still holds the
    /// target RBBL's *original* offset; the relocator rewrites it to a
    /// cache-relative displacement once the RBBL map is known.
    TrampJmp32 { target_original_offset: u32 },
    /// One entry of a copied main-executable switch-case table, holding the
    /// original table-entry offset until the relocator rewrites it to a
    /// cache guest address.
    MainJumpTable { target_original_offset: u32 },
    /// The body of an RBBL, identified by its original offset (stable
    /// across both cache halves, used by `translate_pc`).
    RbblBody { original_offset: u32 },
}

/// One placed region: start offset (relative to the cache half's base),
/// size in bytes, and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub start: u32,
    pub size: u32,
    pub tag: LayoutTag,
}

impl LayoutEntry {
    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// Errors raised while building a cache layout.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutMapError {
    #[error("layout range [{new_start}, {new_end}) overlaps existing entry [{existing_start}, {existing_end})")]
    Overlap {
        new_start: u32,
        new_end: u32,
        existing_start: u32,
        existing_end: u32,
    },
    #[error("cache overflow: placed {used} bytes into a {capacity}-byte cache half")]
    CacheOverflow { used: u32, capacity: u32 },
}

/// An ordered map from disjoint byte ranges (relative to one cache half's
/// base) to what occupies them. Cleared and rebuilt on every regeneration.
#[derive(Debug, Clone, Default)]
pub struct CacheLayout {
    entries: BTreeMap<u32, LayoutEntry>,
    capacity: u32,
}

impl CacheLayout {
    pub fn new(capacity: u32) -> Self {
        Self { entries: BTreeMap::new(), capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Highest byte offset used by any placed entry.
    pub fn used(&self) -> u32 {
        self.entries.values().map(|e| e.end()).max().unwrap_or(0)
    }

    /// Reserve `[start, start+size)` for `tag`. Fails on overlap with an
    /// existing entry or if the reservation would exceed `capacity`.
    pub fn insert(&mut self, start: u32, size: u32, tag: LayoutTag) -> Result<(), LayoutMapError> {
        let end = start + size;
        if end > self.capacity {
            return Err(LayoutMapError::CacheOverflow { used: end, capacity: self.capacity });
        }
        if let Some((_, prev)) = self.entries.range(..start).next_back() {
            if prev.end() > start {
                return Err(LayoutMapError::Overlap {
                    new_start: start,
                    new_end: end,
                    existing_start: prev.start,
                    existing_end: prev.end(),
                });
            }
        }
        if let Some((&next_start, next)) = self.entries.range(start..).next() {
            if next_start < end {
                return Err(LayoutMapError::Overlap {
                    new_start: start,
                    new_end: end,
                    existing_start: next.start,
                    existing_end: next.end(),
                });
            }
        }
        self.entries.insert(start, LayoutEntry { start, size, tag });
        Ok(())
    }

    /// Find the entry whose range contains `offset`, if any.
    pub fn find(&self, offset: u32) -> Option<&LayoutEntry> {
        self.entries
            .range(..=offset)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(offset))
    }

    pub fn find_mut(&mut self, offset: u32) -> Option<&mut LayoutEntry> {
        let start = self.entries
            .range(..=offset)
            .next_back()
            .map(|(&s, e)| (s, e.contains(offset)))
            .filter(|(_, contains)| *contains)
            .map(|(s, _)| s);
        start.and_then(move |s| self.entries.get_mut(&s))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayoutEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find the placed entry for a given RBBL by its original offset.
    pub fn find_rbbl(&self, original_offset: u32) -> Option<&LayoutEntry> {
        self.entries
            .values()
            .find(|e| matches!(e.tag, LayoutTag::RbblBody { original_offset: o } if o == original_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap() {
        let mut layout = CacheLayout::new(0x1000);
        layout.insert(0x10, 0x10, LayoutTag::Boundary).unwrap();
        let err = layout.insert(0x18, 0x10, LayoutTag::Boundary).unwrap_err();
        assert!(matches!(err, LayoutMapError::Overlap { .. }));
    }

    #[test]
    fn rejects_overflow() {
        let mut layout = CacheLayout::new(0x10);
        let err = layout.insert(0x8, 0x10, LayoutTag::Boundary).unwrap_err();
        assert!(matches!(err, LayoutMapError::CacheOverflow { .. }));
    }

    #[test]
    fn find_locates_containing_entry() {
        let mut layout = CacheLayout::new(0x1000);
        layout.insert(0x100, 0x20, LayoutTag::RbblBody { original_offset: 0x800 }).unwrap();
        let found = layout.find(0x110).unwrap();
        assert_eq!(found.start, 0x100);
        assert!(layout.find(0x120).is_none());
    }
}
