//! The on-disk database segment format (§6): a fixed sequence of
//! self-describing segments, one database file per module per
//! shadow-stack type (`.oss`/`.sss`/`.pss`).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use cvm_types::{RbblClass, ShadowStackType};

use crate::store::RbblStore;
use crate::wire::{read_rbbl, write_rbbl, Reader, Writer};
use crate::Error;

const SEG_MOVABLE: u32 = 0;
const SEG_FIXED: u32 = 1;
const SEG_SWITCH_CASE_JMPIN: u32 = 2;
const SEG_MAIN_JUMP_TABLE: u32 = 3;

/// Database filename suffix for a shadow-stack type (§6).
pub fn suffix_for(ss_type: ShadowStackType) -> &'static str {
    match ss_type {
        ShadowStackType::Offset => "oss",
        ShadowStackType::Seg => "sss",
        ShadowStackType::SegPp => "pss",
    }
}

/// Serialise a store to the segment format, in the fixed order
/// fixed(1), movable(0), switch_case_jmpin(2), main_jump_table(3).
pub fn encode(store: &RbblStore) -> Vec<u8> {
    let mut w = Writer::new();

    w.u32(SEG_FIXED);
    w.u32(store.fixed().len() as u32);
    for rbbl in store.fixed() {
        write_rbbl(&mut w, rbbl);
    }

    w.u32(SEG_MOVABLE);
    w.u32(store.movable().len() as u32);
    for rbbl in store.movable() {
        write_rbbl(&mut w, rbbl);
    }

    w.u32(SEG_SWITCH_CASE_JMPIN);
    w.u32(store.switch_case_jmpin().len() as u32);
    for (src_offset, targets) in store.switch_case_jmpin() {
        w.u32(*src_offset);
        w.u32(targets.len() as u32);
        for t in targets {
            w.u32(*t);
        }
    }

    w.u32(SEG_MAIN_JUMP_TABLE);
    w.u32(store.main_jump_tables().len() as u32);
    for (offset, entries) in store.main_jump_tables() {
        w.u32(*offset);
        w.u32(entries.len() as u32);
        for e in entries {
            w.u32(*e);
        }
    }

    w.buf
}

/// Parse the segment format. Rejects a segment-type mismatch (§7 tier 1)
/// and any trailing bytes after the four expected segments.
pub fn decode(buf: &[u8]) -> Result<RbblStore, Error> {
    let mut r = Reader::new(buf);
    let mut store = RbblStore::new();

    read_segment(&mut r, SEG_FIXED, |r| {
        let count = r.u32()? as usize;
        for _ in 0..count {
            store.insert_fixed(read_rbbl(r, RbblClass::Fixed)?);
        }
        Ok(())
    })?;

    read_segment(&mut r, SEG_MOVABLE, |r| {
        let count = r.u32()? as usize;
        for _ in 0..count {
            store.insert_movable(read_rbbl(r, RbblClass::Movable)?);
        }
        Ok(())
    })?;

    read_segment(&mut r, SEG_SWITCH_CASE_JMPIN, |r| {
        let count = r.u32()? as usize;
        for _ in 0..count {
            let src_offset = r.u32()?;
            let n = r.u32()? as usize;
            let mut targets = Vec::with_capacity(n);
            for _ in 0..n {
                targets.push(r.u32()?);
            }
            store.insert_switch_case_jmpin(src_offset, targets);
        }
        Ok(())
    })?;

    read_segment(&mut r, SEG_MAIN_JUMP_TABLE, |r| {
        let count = r.u32()? as usize;
        for _ in 0..count {
            let offset = r.u32()?;
            let n = r.u32()? as usize;
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                entries.push(r.u32()?);
            }
            store.insert_main_switch_case_jump_table(offset, entries);
        }
        Ok(())
    })?;

    if r.remaining() != 0 {
        return Err(Error::TrailingBytes { extra: r.remaining() });
    }

    store.rebuild_units();
    Ok(store)
}

fn read_segment<'a>(
    r: &mut Reader<'a>,
    expected_type: u32,
    body: impl FnOnce(&mut Reader<'a>) -> Result<(), Error>,
) -> Result<(), Error> {
    let seg_type = r.u32()?;
    if seg_type != expected_type {
        return Err(Error::SegmentTypeMismatch { expected: expected_type, found: seg_type });
    }
    body(r)
}

/// Append the shadow-stack-type suffix to a module database's base path,
/// e.g. `libexample.so` + `ShadowStackType::Offset` -> `libexample.so.oss`.
/// Appends rather than replacing, since a module's real filename extension
/// (`.so`, the main executable's none at all) is part of `base`.
pub fn database_path(base: impl AsRef<Path>, ss_type: ShadowStackType) -> PathBuf {
    let mut os_string = base.as_ref().as_os_str().to_os_string();
    os_string.push(".");
    os_string.push(suffix_for(ss_type));
    PathBuf::from(os_string)
}

/// Read and parse a module's database file.
pub fn read_from_path(path: impl AsRef<Path>) -> Result<RbblStore, Error> {
    let mut f = std::fs::File::open(path.as_ref()).map_err(Error::Io)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).map_err(Error::Io)?;
    decode(&buf)
}

/// Serialise and write a module's database file.
pub fn write_to_path(path: impl AsRef<Path>, store: &RbblStore) -> Result<(), Error> {
    let bytes = encode(store);
    let mut f = std::fs::File::create(path.as_ref()).map_err(Error::Io)?;
    f.write_all(&bytes).map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{RandomBbl, RbblFingerprint, RelocKind, Relocation};

    fn sample_rbbl(offset: u32, class: RbblClass) -> RandomBbl {
        RandomBbl {
            fingerprint: RbblFingerprint::from_offset(offset),
            original_offset: offset,
            class,
            template: vec![0x90, 0x90, 0xe9, 0, 0, 0, 0],
            relocations: vec![Relocation::new(RelocKind::Branch, 3, 4, 0, 0x800)],
            last_branch_target: Some(0x800),
            has_lock_repeat_prefix: false,
        }
    }

    #[test]
    fn round_trips_a_populated_store() {
        let mut store = RbblStore::new();
        store.insert_fixed(sample_rbbl(0x10, RbblClass::Fixed));
        store.insert_movable(sample_rbbl(0x800, RbblClass::Movable));
        store.insert_switch_case_jmpin(0x900, vec![0x910, 0x920]);
        store.insert_main_switch_case_jump_table(0xa00, vec![0xa10, 0xa20, 0xa30]);
        store.rebuild_units();

        let bytes = encode(&store);
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.fixed().len(), 1);
        assert_eq!(decoded.movable().len(), 1);
        assert_eq!(decoded.fixed()[0].original_offset, 0x10);
        assert_eq!(decoded.movable()[0].template, store.movable()[0].template);
        assert_eq!(decoded.switch_case_jmpin(), store.switch_case_jmpin());
        assert_eq!(decoded.main_jump_tables(), store.main_jump_tables());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let store = RbblStore::new();
        let mut bytes = encode(&store);
        bytes.push(0xff);
        assert!(matches!(decode(&bytes), Err(Error::TrailingBytes { .. })));
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libexample.so.oss");
        let mut store = RbblStore::new();
        store.insert_fixed(sample_rbbl(0x10, RbblClass::Fixed));
        store.rebuild_units();
        write_to_path(&path, &store).unwrap();
        let decoded = read_from_path(&path).unwrap();
        assert_eq!(decoded.fixed().len(), 1);
    }
}
