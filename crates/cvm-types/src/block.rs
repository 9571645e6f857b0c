//! Basic blocks: ordered runs of instructions sharing one terminator.

use crate::instr::Instruction;
use std::collections::BTreeMap;

/// Basic-block classification, mirroring its terminator instruction's class.
/// Collapses the original `SequenceBBL`/`RetBBL`/... class hierarchy into one
/// tagged enum; the tag drives template generation via dispatch in
/// `cvm-template`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Sequence,
    Ret,
    DirectCall,
    IndirectCall,
    DirectJump,
    IndirectJump,
    ConditionBranch,
}

/// Static analysis hints for an indirect jump, supplied by the external
/// disassembler database. Drives which of the dispatch sequences in
/// `cvm-template`'s indirect-jump emitter is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndirectJumpAnalysis {
    /// A finite target set sharing the same high 32 bits: emit a linear
    /// `cmp/je` chain. `targets` is the switch-case target offset set.
    SwitchCaseJmpin {
        targets: Vec<u32>,
        protect_eflags: bool,
        protect_stack_vars: bool,
    },
    /// A jump through the vsyscall page.
    Vsyscall,
    /// A main-executable switch table the arranger has copied verbatim.
    MainJumpTable { table_offset: u32 },
    /// A PLT stub: load the GOT entry and add `cc_offset`.
    Plt,
    /// No static analysis available: fall back to the generic dispatch.
    Unknown,
}

/// An ordered, non-empty sequence of instructions with one terminator.
///
/// Invariants (see `cvm-types` root docs): `target`/`fallthrough` are
/// non-zero exactly as implied by `kind`; `instructions` is ordered by
/// offset and non-empty; if `has_prefix`, a second entry point exists one
/// byte after `start`.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u32,
    pub size: u32,
    pub kind: BlockKind,
    /// Non-zero only for DirectCall/DirectJump/ConditionBranch/IndirectJump
    /// sites with a statically known target.
    pub target: u32,
    /// Non-zero for every kind except DirectJump/IndirectJump/Ret.
    pub fallthrough: u32,
    pub has_lock_repeat_prefix: bool,
    pub is_nop_only: bool,
    pub has_ud2_or_hlt: bool,
    /// Set only for IndirectJump blocks.
    pub indirect_jump_analysis: Option<IndirectJumpAnalysis>,
    /// Set only for Ret blocks: true when the shadow stack does not hold a
    /// matching value for this return (e.g. a tail-call-optimised return),
    /// in which case the templater retains a real `RET` against the main
    /// stack instead of dispatching through the shadow stack.
    pub is_unmatched_return: bool,
    instructions: BTreeMap<u32, Instruction>,
}

impl BasicBlock {
    pub fn new(
        start: u32,
        size: u32,
        kind: BlockKind,
        target: u32,
        fallthrough: u32,
        has_lock_repeat_prefix: bool,
        instructions: BTreeMap<u32, Instruction>,
    ) -> Self {
        assert!(!instructions.is_empty(), "basic block must contain at least one instruction");
        let is_nop_only = instructions.values().all(|i| i.bytes.iter().all(|&b| b == 0x90));
        let has_ud2_or_hlt = instructions
            .values()
            .any(|i| i.bytes.as_slice() == [0x0f, 0x0b] || i.bytes.as_slice() == [0xf4]);
        Self {
            start,
            size,
            kind,
            target,
            fallthrough,
            has_lock_repeat_prefix,
            is_nop_only,
            has_ud2_or_hlt,
            indirect_jump_analysis: None,
            is_unmatched_return: false,
            instructions,
        }
    }

    /// Builder-style setter used by callers that already know the return
    /// match classification (e.g. the database loader) at construction time.
    pub fn with_unmatched_return(mut self, is_unmatched_return: bool) -> Self {
        self.is_unmatched_return = is_unmatched_return;
        self
    }

    pub fn with_indirect_jump_analysis(mut self, analysis: IndirectJumpAnalysis) -> Self {
        self.indirect_jump_analysis = Some(analysis);
        self
    }

    pub fn end_offset(&self) -> u32 {
        self.start + self.size
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.values()
    }

    pub fn last_instruction(&self) -> &Instruction {
        self.instructions
            .values()
            .next_back()
            .expect("basic block invariant: non-empty instruction map")
    }

    /// The second entry point, one byte after `start`, present only when
    /// `has_lock_repeat_prefix` is set.
    pub fn prefix_entry_offset(&self) -> Option<u32> {
        self.has_lock_repeat_prefix.then_some(self.start + 1)
    }
}
