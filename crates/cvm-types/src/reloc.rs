//! Relocation records produced by the instruction and basic-block templaters
//! and consumed by the relocator (see `cvm-relocate`).

/// The kind of a relocation, fixing how the relocator interprets `addend`
/// and what it writes back at `byte_position`.
///
/// Every kind except the `*32` split kinds writes a signed 32-bit value;
/// `LOW32_*`/`HIGH32_*` each write one 32-bit half of a 64-bit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// RIP-relative displacement: rewritten so the effective address at the
    /// new PC matches the original effective address.
    Rip,
    /// A branch displacement (Jcc/JMP/CALL rel32) to another RBBL or trampoline.
    Branch,
    /// A shadow-stack-relative displacement.
    Ss,
    /// `cc_offset + addend`.
    Cc,
    /// Low 32 bits of a cache address.
    Low32Cc,
    /// High 32 bits of a cache address.
    High32Cc,
    /// Low 32 bits of an original-module address.
    Low32Org,
    /// High 32 bits of an original-module address.
    High32Org,
    /// `trampoline_base + addend`.
    Trampoline,
    /// Low 32 bits of a debug-trace-buffer address.
    DebugLow32,
    /// High 32 bits of a debug-trace-buffer address.
    DebugHigh32,
}

/// A single relocation entry. The `byte_position` starts out template-local
/// (an offset into one instruction's template), is renumbered to be
/// block-local by the basic-block templater, and is resolved to a
/// cache-absolute write by the relocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub kind: RelocKind,
    /// Byte offset, within whatever buffer currently owns this relocation,
    /// of the first byte to overwrite.
    pub byte_position: u32,
    /// Number of bytes to write: 4 for every kind in this design.
    pub byte_size: u8,
    /// Signed value folded into the kind's resolution formula (see
    /// `cvm-relocate`'s per-kind fixup).
    pub addend: i64,
    /// The original-module offset or target this relocation refers to,
    /// interpretation depends on `kind` (e.g. the original branch target
    /// offset for `Branch`, the referenced original address for `Rip`).
    pub value: i64,
}

impl Relocation {
    pub fn new(kind: RelocKind, byte_position: u32, byte_size: u8, addend: i64, value: i64) -> Self {
        Self {
            kind,
            byte_position,
            byte_size,
            addend,
            value,
        }
    }

    /// Shift this relocation's `byte_position` forward by `delta` bytes,
    /// used when concatenating instruction templates into a block template.
    pub fn shift(&mut self, delta: u32) {
        self.byte_position += delta;
    }
}
