//! Decoded x86-64 instructions, as produced by the external disassembler and
//! stored opaquely inside a module's database.

use smallvec::SmallVec;

/// The terminator-relevant class of a decoded instruction. Collapses the
/// original per-kind class hierarchy into one tagged enum (see design notes
/// on basic-block classification, which mirrors this split one level up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrClass {
    Sequence,
    DirectCall,
    IndirectCall,
    DirectJump,
    IndirectJump,
    ConditionBranch,
    Ret,
    Cmov,
    Sys,
    Int,
}

/// A register, simple-memory, or indexed-memory operand. Only the shape
/// that matters for relocation and dispatch-sequence generation is kept;
/// full decode detail (register numbers used for encoding) lives in the
/// opaque byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register { num: u8 },
    Memory { base: Option<u8> },
    IndexedMemory { base: Option<u8>, index: u8, scale: u8 },
}

/// Displacement size, in bytes, used by memory operands. RIP-relative
/// addressing requires `Thirty32` for the instruction templater to emit a
/// `RIP` relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispSize {
    None,
    Eight8,
    Thirty32,
}

/// The original encoding shape of a `ConditionBranch` terminator, needed to
/// reconstruct an equivalent `Jcc rel32` (or rel8-relay chain) in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    /// A standard `Jcc` with a four-bit condition code, encodable as both
    /// `7x rel8` and `0F 8x rel32`.
    Jcc(u8),
    /// `LOOP`/`LOOPE`/`LOOPNE`/`JCXZ`/`JRCXZ`: limited to a rel8 encoding,
    /// carrying the original one-byte opcode.
    Rel8Only(u8),
}

/// A decoded instruction: opcode class, size, operands, and an immutable
/// copy of its original bytes as encoded in the guest module.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub class: InstrClass,
    /// Offset of this instruction within its module.
    pub offset: u32,
    /// Size of the original encoding, in bytes.
    pub size: u8,
    pub operands: SmallVec<[Operand; 2]>,
    pub disp_value: i64,
    pub disp_size: DispSize,
    /// Whether this instruction's addressing is RIP-relative.
    pub is_rip_relative: bool,
    /// Byte offset, within `bytes`, of the displacement field. Only
    /// meaningful when `is_rip_relative` is set; the disassembler-provided
    /// database always locates it for RIP-relative forms.
    pub disp_byte_offset: u8,
    /// Set only for `ConditionBranch` terminators: distinguishes a regular
    /// `Jcc` (re-encodable as rel8 or rel32) from the rel8-only
    /// LOOP/LOOPE/LOOPNE/JCXZ/JRCXZ family.
    pub cond_kind: Option<CondKind>,
    /// Immutable copy of the original bytes.
    pub bytes: SmallVec<[u8; 15]>,
}

impl Instruction {
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size as u32
    }

    /// True when this class terminates a basic block unconditionally
    /// (a fallthrough to `offset + size` is not implied).
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.class,
            InstrClass::DirectCall
                | InstrClass::IndirectCall
                | InstrClass::DirectJump
                | InstrClass::IndirectJump
                | InstrClass::ConditionBranch
                | InstrClass::Ret
        )
    }
}
