//! Basic-block templating (§4.2): concatenate a block's instruction
//! templates, renumber their relocations to be block-local, and append the
//! trailing control transfer a `Sequence`-classified block needs (since its
//! last instruction, unlike every other terminator class, does not already
//! end in one).

use crate::enc;
use crate::instr::{template_instruction, InstrContext, TemplateError};
use cvm_types::{BasicBlock, BlockKind, EngineOptions, RelocKind, Relocation};

/// A basic block's template: concatenated instruction bytes (plus any
/// trailing control-transfer/sentinel), block-local relocations, and the
/// last statically-known branch target (used by the layout arranger for
/// fallthrough elision).
#[derive(Debug, Clone, Default)]
pub struct BlockTemplate {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub last_branch_target: Option<u32>,
}

/// Template a whole basic block. See module docs and §4.2.
pub fn template_block(block: &BasicBlock, options: EngineOptions) -> Result<BlockTemplate, TemplateError> {
    let mut out = BlockTemplate::default();

    for instr in block.instructions() {
        let ctx = InstrContext {
            block_target: block.target,
            next_offset: instr.next_offset(),
            indirect_jump_analysis: block.indirect_jump_analysis.clone(),
            is_unmatched_return: block.is_unmatched_return,
            options,
        };
        let tpl = template_instruction(instr, &ctx)?;
        let delta = out.bytes.len() as u32;
        out.bytes.extend_from_slice(&tpl.bytes);
        out.relocations
            .extend(tpl.relocations.into_iter().map(|mut r| {
                r.shift(delta);
                r
            }));
    }

    // The "last branch target" is whatever the block template's final
    // instruction unconditionally *jumps* to, since that is the JMP the
    // layout arranger may elide (§4.4 point 4). DirectJump ends in
    // `JMP target`; ConditionBranch ends in `JMP fallthrough` (the Jcc to
    // target comes first); Sequence gets its trailing JMP appended below.
    // DirectCall's terminator is a CALL, not a JMP, so it is never elidable
    // even though `block.target` is statically known; IndirectCall/
    // IndirectJump/Ret have no statically-known single successor at all.
    out.last_branch_target = match block.kind {
        BlockKind::DirectJump if block.target != 0 => Some(block.target),
        BlockKind::ConditionBranch if block.fallthrough != 0 => Some(block.fallthrough),
        _ => None,
    };

    if block.kind == BlockKind::Sequence && block.fallthrough != 0 {
        let (bytes, off) = enc::jmp_rel32();
        let base = out.bytes.len() as u32;
        out.bytes.extend_from_slice(&bytes);
        out.relocations
            .push(Relocation::new(RelocKind::Branch, base + off, 4, 0, block.fallthrough as i64));
        out.last_branch_target = Some(block.fallthrough);
    } else if block.fallthrough == 0 {
        // DirectJump/IndirectJump/Ret: the terminator already transfers
        // control unconditionally; pad with a sentinel so nothing falls
        // through into whatever the layout arranger places next.
        out.bytes.extend_from_slice(&enc::ud2());
    }

    if out.bytes.len() > u16::MAX as usize {
        return Err(TemplateError::TemplateTooLarge { offset: block.start, size: out.bytes.len() });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{DispSize, Instruction, InstrClass};
    use smallvec::smallvec;
    use std::collections::BTreeMap;

    fn seq_instr(offset: u32, size: u8) -> Instruction {
        Instruction {
            class: InstrClass::Sequence,
            offset,
            size,
            operands: smallvec![],
            disp_value: 0,
            disp_size: DispSize::None,
            is_rip_relative: false,
            disp_byte_offset: 0,
            cond_kind: None,
            bytes: smallvec![0x90; size as usize],
        }
    }

    #[test]
    fn sequence_block_appends_trailing_jump() {
        let mut instrs = BTreeMap::new();
        instrs.insert(0x40, seq_instr(0x40, 1));
        let block = BasicBlock::new(0x40, 1, BlockKind::Sequence, 0, 0x41, false, instrs);
        let tpl = template_block(&block, EngineOptions::default()).unwrap();
        // one NOP byte, then a 5-byte JMP rel32
        assert_eq!(tpl.bytes.len(), 6);
        assert_eq!(tpl.bytes[1], 0xe9);
        assert_eq!(tpl.last_branch_target, Some(0x41));
    }
}
