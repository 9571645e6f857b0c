//! Hand-rolled little-endian codec for the database segment format (§6).
//! This is a fixed wire format, not a serde-derived shape, matching the
//! teacher's binemit code: every field has an explicit byte layout.

use cvm_types::{RandomBbl, RbblClass, RbblFingerprint, RelocKind, Relocation};

use crate::Error;

pub(crate) struct Writer {
    pub(crate) buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }
}

pub(crate) struct Reader<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::Truncated { needed: n, available: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn reloc_kind_tag(kind: RelocKind) -> u8 {
    match kind {
        RelocKind::Rip => 0,
        RelocKind::Branch => 1,
        RelocKind::Ss => 2,
        RelocKind::Cc => 3,
        RelocKind::Low32Cc => 4,
        RelocKind::High32Cc => 5,
        RelocKind::Low32Org => 6,
        RelocKind::High32Org => 7,
        RelocKind::Trampoline => 8,
        RelocKind::DebugLow32 => 9,
        RelocKind::DebugHigh32 => 10,
    }
}

fn reloc_kind_from_tag(tag: u8) -> Result<RelocKind, Error> {
    Ok(match tag {
        0 => RelocKind::Rip,
        1 => RelocKind::Branch,
        2 => RelocKind::Ss,
        3 => RelocKind::Cc,
        4 => RelocKind::Low32Cc,
        5 => RelocKind::High32Cc,
        6 => RelocKind::Low32Org,
        7 => RelocKind::High32Org,
        8 => RelocKind::Trampoline,
        9 => RelocKind::DebugLow32,
        10 => RelocKind::DebugHigh32,
        other => return Err(Error::UnknownRelocKind { tag: other }),
    })
}

pub(crate) fn write_relocation(w: &mut Writer, r: &Relocation) {
    w.u8(reloc_kind_tag(r.kind));
    w.u32(r.byte_position);
    w.u8(r.byte_size);
    w.i64(r.addend);
    w.i64(r.value);
}

pub(crate) fn read_relocation(r: &mut Reader) -> Result<Relocation, Error> {
    let kind = reloc_kind_from_tag(r.u8()?)?;
    let byte_position = r.u32()?;
    let byte_size = r.u8()?;
    let addend = r.i64()?;
    let value = r.i64()?;
    Ok(Relocation::new(kind, byte_position, byte_size, addend, value))
}

/// Write one RBBL record. The segment the record lives in (`fixed` vs
/// `movable`) already carries the class, so `class` is not repeated here.
pub(crate) fn write_rbbl(w: &mut Writer, rbbl: &RandomBbl) {
    w.u64(rbbl.fingerprint.0);
    w.u32(rbbl.original_offset);
    w.bytes(&rbbl.template);
    w.u32(rbbl.relocations.len() as u32);
    for reloc in &rbbl.relocations {
        write_relocation(w, reloc);
    }
    // 0 is a legal offset, so last_branch_target is carried as a
    // present/absent flag followed by the value.
    match rbbl.last_branch_target {
        Some(t) => {
            w.u8(1);
            w.u32(t);
        }
        None => {
            w.u8(0);
            w.u32(0);
        }
    }
    w.u8(rbbl.has_lock_repeat_prefix as u8);
}

pub(crate) fn read_rbbl(r: &mut Reader, class: RbblClass) -> Result<RandomBbl, Error> {
    let fingerprint = RbblFingerprint(r.u64()?);
    let original_offset = r.u32()?;
    let template = r.bytes()?;
    let reloc_count = r.u32()? as usize;
    let mut relocations = Vec::with_capacity(reloc_count);
    for _ in 0..reloc_count {
        relocations.push(read_relocation(r)?);
    }
    let has_target = r.u8()? != 0;
    let target = r.u32()?;
    let last_branch_target = has_target.then_some(target);
    let has_lock_repeat_prefix = r.u8()? != 0;
    Ok(RandomBbl {
        fingerprint,
        original_offset,
        class,
        template,
        relocations,
        last_branch_target,
        has_lock_repeat_prefix,
    })
}
