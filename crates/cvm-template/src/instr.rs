//! Per-instruction templating (§4.1): for one decoded instruction, emit a
//! position-independent byte template plus the relocation list describing
//! how the relocator patches it once placed in a cache.

use crate::enc;
use cvm_types::{CondKind, DispSize, EngineOptions, IndirectJumpAnalysis, Instruction, InstrClass, Operand, RelocKind, Relocation};

/// Errors raised while templating a single instruction. All are fatal per
/// §7 tier 1 ("disassembly-provided displacement not exactly 32 bits where
/// required" is the concrete condition named there).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("instruction at offset {offset:#x} is RIP-relative with a {size}-bit displacement, expected 32")]
    NonThirtyTwoBitRipDisplacement { offset: u32, size: &'static str },
    #[error("ConditionBranch at offset {offset:#x} carries no cond_kind")]
    MissingCondKind { offset: u32 },
    #[error("IndirectJump at offset {offset:#x} carries no operand")]
    MissingIndirectOperand { offset: u32 },
    #[error("block-template size {size} at offset {offset:#x} exceeds the 16-bit size limit")]
    TemplateTooLarge { offset: u32, size: usize },
}

/// Context the caller (the basic-block templater, per §4.2) supplies for
/// one instruction: its block's statically-known successors and the
/// engine-wide optimisation toggles relevant to indirect control transfers.
#[derive(Debug, Clone, Copy)]
pub struct InstrContext {
    /// Non-zero for DirectCall/DirectJump/ConditionBranch-with-target
    /// sites; the statically-known branch target offset.
    pub block_target: u32,
    /// Offset, in the original module, of the instruction immediately
    /// after this one (used as the fallthrough/return address).
    pub next_offset: u32,
    pub indirect_jump_analysis: Option<IndirectJumpAnalysis>,
    /// Set only for Ret: true when the shadow stack holds no matching
    /// value for this return.
    pub is_unmatched_return: bool,
    pub options: EngineOptions,
}

/// One instruction's template: position-independent bytes plus its
/// template-local relocation list (byte positions relative to the start
/// of `bytes`).
#[derive(Debug, Clone, Default)]
pub struct InstrTemplate {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

impl InstrTemplate {
    fn push(&mut self, bytes: Vec<u8>) {
        self.bytes.extend_from_slice(&bytes);
    }

    /// Append `bytes` and register a relocation at `rel_off` within them
    /// (i.e. at `base + rel_off` in the accumulated template).
    fn push_reloc(&mut self, bytes: Vec<u8>, rel_off: u32, kind: RelocKind, addend: i64, value: i64) {
        let base = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&bytes);
        self.relocations.push(Relocation::new(kind, base + rel_off, 4, addend, value));
    }
}

/// Template one decoded instruction. See module docs and §4.1 for the
/// per-class contract.
pub fn template_instruction(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    match instr.class {
        InstrClass::Sequence | InstrClass::Cmov | InstrClass::Sys | InstrClass::Int => {
            template_copy_with_rip(instr)
        }
        InstrClass::DirectCall => template_direct_call(instr, ctx),
        InstrClass::IndirectCall => template_indirect_call(instr, ctx),
        InstrClass::DirectJump => template_direct_jump(ctx),
        InstrClass::IndirectJump => template_indirect_jump(instr, ctx),
        InstrClass::ConditionBranch => template_condition_branch(instr, ctx),
        InstrClass::Ret => template_ret(ctx),
    }
}

/// Sequence/Cmov/Sys/Int: copy the original bytes verbatim, adding a `RIP`
/// relocation when the instruction addresses memory RIP-relatively.
fn template_copy_with_rip(instr: &Instruction) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    t.bytes.extend_from_slice(&instr.bytes);
    if instr.is_rip_relative {
        if instr.disp_size != DispSize::Thirty32 {
            return Err(TemplateError::NonThirtyTwoBitRipDisplacement {
                offset: instr.offset,
                size: match instr.disp_size {
                    DispSize::None => "none",
                    DispSize::Eight8 => "8",
                    DispSize::Thirty32 => "32",
                },
            });
        }
        // value carries the original effective address the relocator must
        // preserve: original_pc_of_disp_field + disp_value, expressed here
        // as the displacement itself; the relocator combines it with
        // `next_pc_in_cache` vs. `original_pc + instr_size` (§4.5).
        t.relocations.push(Relocation::new(
            RelocKind::Rip,
            instr.disp_byte_offset as u32,
            4,
            (instr.offset + instr.size as u32) as i64,
            instr.disp_value,
        ));
    }
    Ok(t)
}

/// Writes the 64-bit `cache_value`/`orig_value` return-address pair: two
/// dword stores into the shadow stack (via `SS` relocations on the
/// displacement) for the cache half, and two dword stores into the main
/// stack (literal displacement, via `LOW32_ORG`/`HIGH32_ORG` on the
/// immediate) for the original-module half. Always emits the 4-relocation
/// split form per §4.1's note that the split is "an optimisation, not a
/// semantic difference."
fn push_return_address_prologue(t: &mut InstrTemplate, fallthrough: u32) {
    // Shadow stack: mov dword [rsp+ss_lo], low32(fallthrough); mov dword
    // [rsp+ss_hi], high32(fallthrough). `value` on these Relocations is the
    // original-module fallthrough offset the relocator resolves into the
    // *cache* address's low/high half.
    for (addend, kind) in [(-8i64, RelocKind::Low32Cc), (-4i64, RelocKind::High32Cc)] {
        let (bytes, disp_off, imm_off) = enc::mov_mem_disp32_imm32(enc::RSP);
        let base = t.bytes.len() as u32;
        t.bytes.extend_from_slice(&bytes);
        t.relocations.push(Relocation::new(RelocKind::Ss, base + disp_off, 4, addend, 0));
        t.relocations.push(Relocation::new(kind, base + imm_off, 4, 0, fallthrough as i64));
    }
    // Main stack: reserve 8 bytes, then store the original-module address.
    t.push(enc::sub_rsp_imm8(8));
    for (disp, kind) in [(0u8, RelocKind::Low32Org), (4u8, RelocKind::High32Org)] {
        let (bytes, disp_off, imm_off) = enc::mov_mem_disp32_imm32(enc::RSP);
        let base = t.bytes.len() as u32;
        let mut bytes = bytes;
        bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        t.bytes.extend_from_slice(&bytes);
        t.relocations.push(Relocation::new(kind, base + imm_off, 4, 0, fallthrough as i64));
    }
}

fn template_direct_call(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    push_return_address_prologue(&mut t, ctx.next_offset);
    let (bytes, off) = enc::jmp_rel32();
    t.push_reloc(bytes, off, RelocKind::Branch, 0, ctx.block_target as i64);
    let _ = instr;
    Ok(t)
}

/// Materialise an IndirectCall's computed target into RAX, honouring the
/// `caller_saved_destroy`/register-destroy toggles where the operand shape
/// allows it, then add `cc_offset` and transfer control.
fn template_indirect_call(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    push_return_address_prologue(&mut t, ctx.next_offset);
    let operand = instr
        .operands
        .first()
        .ok_or(TemplateError::MissingIndirectOperand { offset: instr.offset })?;
    let target_reg = match *operand {
        Operand::Register { num } => {
            if ctx.options.caller_saved_destroy {
                num
            } else {
                t.push(enc::mov_reg_reg(enc::RAX, num));
                enc::RAX
            }
        }
        Operand::Memory { base } => {
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let base_pos = t.bytes.len() as u32;
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.bytes.extend_from_slice(&bytes);
            let _ = base_pos;
            enc::RAX
        }
        Operand::IndexedMemory { base, .. } => {
            // Indexed addressing collapses to a base-relative load; scale
            // and index are resolved by the decoder into `disp_value`
            // already (the database stores the fully-folded displacement).
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.push(bytes);
            enc::RAX
        }
    };
    let (bytes, off) = enc::add_reg_imm32(target_reg);
    t.push_reloc(bytes, off, RelocKind::Cc, 0, 0);
    t.push(enc::jmp_reg(target_reg));
    Ok(t)
}

/// When the memory operand's base is RSP, our own prologue has already
/// pushed extra words onto the main stack; compensate the displacement by
/// +8 per original slot so the effective address still lands on the
/// caller's intended location (§4.1 "compensate for the stack slots
/// already pushed").
fn adjust_rsp_base(base: Option<u8>, disp: i64) -> (u8, i32) {
    let base_reg = base.unwrap_or(enc::RAX);
    let disp = if base_reg & 7 == enc::RSP { disp + 8 } else { disp };
    (base_reg, disp as i32)
}

fn template_direct_jump(ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    let (bytes, off) = enc::jmp_rel32();
    t.push_reloc(bytes, off, RelocKind::Branch, 0, ctx.block_target as i64);
    Ok(t)
}

fn template_indirect_jump(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    match ctx.indirect_jump_analysis.clone() {
        Some(IndirectJumpAnalysis::SwitchCaseJmpin { targets, .. }) => {
            template_switch_case_jmpin(instr, &targets)
        }
        Some(IndirectJumpAnalysis::Vsyscall) => template_vsyscall_jump(instr, ctx),
        Some(IndirectJumpAnalysis::MainJumpTable { .. }) => template_main_jump_table(instr),
        Some(IndirectJumpAnalysis::Plt) => template_plt_jump(instr),
        Some(IndirectJumpAnalysis::Unknown) | None => template_general_indirect_jump(instr, ctx),
    }
}

/// A linear `cmp reg32, imm32; je rel32` chain over a finite target set
/// sharing the same high 32 bits, terminated by an invalid-opcode sentinel.
fn template_switch_case_jmpin(instr: &Instruction, targets: &[u32]) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    let operand = instr
        .operands
        .first()
        .ok_or(TemplateError::MissingIndirectOperand { offset: instr.offset })?;
    let reg = match *operand {
        Operand::Register { num } => num,
        _ => enc::RAX,
    };
    for &target in targets {
        let (cmp_bytes, cmp_off) = enc::cmp_reg32_imm32(reg);
        let base = t.bytes.len() as u32;
        let mut cmp_bytes = cmp_bytes;
        cmp_bytes[cmp_off as usize..cmp_off as usize + 4].copy_from_slice(&(target as i32).to_le_bytes());
        t.bytes.extend_from_slice(&cmp_bytes);
        let _ = base;
        let (je_bytes, je_off) = enc::jcc_rel32(0x4); // JE
        t.push_reloc(je_bytes, je_off, RelocKind::Branch, 0, target as i64);
    }
    t.push(enc::ud2());
    Ok(t)
}

/// `cmp` against zero, short-jump to the normal path, stash the return
/// slot onto the shadow stack, then the original JMP verbatim (vsyscall
/// pages are kernel-resident and cannot be intercepted).
fn template_vsyscall_jump(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    let reg = match instr.operands.first() {
        Some(Operand::Register { num }) => *num,
        _ => enc::RAX,
    };
    let (cmp_bytes, cmp_off) = enc::cmp_reg_imm32(reg);
    let mut cmp_bytes = cmp_bytes;
    cmp_bytes[cmp_off as usize..cmp_off as usize + 4].copy_from_slice(&0i32.to_le_bytes());
    t.push(cmp_bytes);
    // JNE rel8 over the vsyscall-passthrough arm, straight to the
    // general-dispatch fallback appended below.
    let (jne_bytes, jne_off) = enc::jcc_rel8(0x5);
    let jne_pos = t.bytes.len() as u32;
    t.bytes.extend_from_slice(&jne_bytes);
    let shadow_start = t.bytes.len() as u32;
    for (addend, kind) in [(-8i64, RelocKind::Low32Cc), (-4i64, RelocKind::High32Cc)] {
        let (bytes, disp_off, imm_off) = enc::mov_mem_disp32_imm32(enc::RSP);
        let base = t.bytes.len() as u32;
        t.bytes.extend_from_slice(&bytes);
        t.relocations.push(Relocation::new(RelocKind::Ss, base + disp_off, 4, addend, 0));
        t.relocations.push(Relocation::new(kind, base + imm_off, 4, 0, ctx.next_offset as i64));
    }
    t.bytes.extend_from_slice(&instr.bytes);
    let after_vsyscall = t.bytes.len() as u32;
    t.bytes[(jne_pos + jne_off) as usize] = (after_vsyscall - (jne_pos + jne_off + 1)) as u8;
    let _ = shadow_start;
    Ok(t)
}

/// Copy the original indirect JMP verbatim with a `CC` relocation on its
/// displacement, so the jump-table lookup hits the cache's table copy.
fn template_main_jump_table(instr: &Instruction) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    t.bytes.extend_from_slice(&instr.bytes);
    t.relocations.push(Relocation::new(RelocKind::Cc, instr.disp_byte_offset as u32, 4, 0, 0));
    Ok(t)
}

/// Load the GOT entry into RAX and add `cc_offset`.
fn template_plt_jump(instr: &Instruction) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    let base = match instr.operands.first() {
        Some(Operand::Memory { base }) | Some(Operand::IndexedMemory { base, .. }) => base.unwrap_or(enc::RAX),
        _ => enc::RAX,
    };
    let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base);
    let mut bytes = bytes;
    bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(instr.disp_value as i32).to_le_bytes());
    t.push(bytes);
    let (add_bytes, add_off) = enc::add_reg_imm32(enc::RAX);
    t.push_reloc(add_bytes, add_off, RelocKind::Cc, 0, 0);
    t.push(enc::jmp_reg(enc::RAX));
    Ok(t)
}

/// Push the target, add `cc_offset` (or the trampoline offset when a
/// target set was recognised but didn't qualify for the `cmp/je` chain),
/// then `RET` to transfer control. When the source operand is a register
/// and `jmpin_register_destroy` is set, or the source is memory-indexed and
/// `jmpin_mem_index_destroy` is set, skip the stack round-trip entirely:
/// add the delta straight into the register already holding the target and
/// jump through it in place (§4.1 "it may be destroyed in place to avoid
/// stack churn").
fn template_general_indirect_jump(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    let operand = instr
        .operands
        .first()
        .ok_or(TemplateError::MissingIndirectOperand { offset: instr.offset })?;
    let kind = if ctx.options.trampoline_record {
        RelocKind::Trampoline
    } else {
        RelocKind::Cc
    };

    let destroyed_reg = match *operand {
        Operand::Register { num } if ctx.options.jmpin_register_destroy => {
            Some(num)
        }
        Operand::Memory { base } if ctx.options.jmpin_mem_index_destroy => {
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.push(bytes);
            Some(enc::RAX)
        }
        Operand::IndexedMemory { base, .. } if ctx.options.jmpin_mem_index_destroy => {
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.push(bytes);
            Some(enc::RAX)
        }
        _ => None,
    };

    if let Some(reg) = destroyed_reg {
        let (bytes, off) = enc::add_reg_imm32(reg);
        t.push_reloc(bytes, off, kind, 0, 0);
        t.push(enc::jmp_reg(reg));
        return Ok(t);
    }

    match *operand {
        Operand::Register { num } => {
            t.push(enc::push_reg(num));
        }
        Operand::Memory { base } => {
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.push(bytes);
            t.push(enc::push_reg(enc::RAX));
        }
        Operand::IndexedMemory { base, .. } => {
            let base_reg = adjust_rsp_base(base, instr.disp_value);
            let (bytes, disp_off) = enc::mov_reg_mem_disp32(enc::RAX, base_reg.0);
            let mut bytes = bytes;
            bytes[disp_off as usize..disp_off as usize + 4].copy_from_slice(&(base_reg.1).to_le_bytes());
            t.push(bytes);
            t.push(enc::push_reg(enc::RAX));
        }
    }
    let (bytes, off) = enc::add_mem_rsp0_imm32();
    t.push_reloc(bytes, off, kind, 0, 0);
    t.push(enc::ret());
    Ok(t)
}

/// Convert a short-form conditional branch into `Jcc rel32` to the target
/// followed by `JMP rel32` to the fallthrough; for the rel8-only family
/// (LOOP/LOOPZ/LOOPNZ/JCXZ/JRCXZ), emit a rel8 relay that lands on a
/// trailing `JMP rel32` to the real target, after the fallthrough jump.
fn template_condition_branch(instr: &Instruction, ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let cond = instr.cond_kind.ok_or(TemplateError::MissingCondKind { offset: instr.offset })?;
    let mut t = InstrTemplate::default();
    match cond {
        CondKind::Jcc(cc) => {
            let (jcc_bytes, jcc_off) = enc::jcc_rel32(cc);
            t.push_reloc(jcc_bytes, jcc_off, RelocKind::Branch, 0, ctx.block_target as i64);
            let (jmp_bytes, jmp_off) = enc::jmp_rel32();
            t.push_reloc(jmp_bytes, jmp_off, RelocKind::Branch, 0, ctx.next_offset as i64);
        }
        CondKind::Rel8Only(opcode) => {
            let (rel8_bytes, rel8_off) = enc::rel8_only(opcode);
            let rel8_pos = t.bytes.len() as u32;
            t.bytes.extend_from_slice(&rel8_bytes);
            let (jmp_ft_bytes, jmp_ft_off) = enc::jmp_rel32();
            t.push_reloc(jmp_ft_bytes, jmp_ft_off, RelocKind::Branch, 0, ctx.next_offset as i64);
            let relay_pos = t.bytes.len() as u32;
            let (jmp_target_bytes, jmp_target_off) = enc::jmp_rel32();
            t.push_reloc(jmp_target_bytes, jmp_target_off, RelocKind::Branch, 0, ctx.block_target as i64);
            let rel8_value = (relay_pos as i64) - ((rel8_pos + rel8_off + 1) as i64);
            t.bytes[(rel8_pos + rel8_off) as usize] = rel8_value as i8 as u8;
        }
    }
    Ok(t)
}

/// Unmatched return (shadow stack holds no value for this site): bump the
/// main-stack return slot by `cc_offset` and retain the `RET`. Otherwise,
/// discard the decoy main-stack slot and jump indirect through the
/// matching shadow-stack slot.
fn template_ret(ctx: &InstrContext) -> Result<InstrTemplate, TemplateError> {
    let mut t = InstrTemplate::default();
    if ctx.is_unmatched_return {
        let (bytes, off) = enc::add_mem_rsp0_imm32();
        t.push_reloc(bytes, off, RelocKind::Cc, 0, 0);
        t.push(enc::ret());
    } else {
        t.push(enc::add_rsp_imm8(8));
        let (bytes, disp_off) = enc::jmp_mem_disp32(enc::RSP);
        let base = t.bytes.len() as u32;
        t.bytes.extend_from_slice(&bytes);
        t.relocations.push(Relocation::new(RelocKind::Ss, base + disp_off, 4, -8, 0));
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{EngineOptions, RandomizationMode};
    use smallvec::smallvec;

    fn ctx(block_target: u32, next_offset: u32) -> InstrContext {
        InstrContext {
            block_target,
            next_offset,
            indirect_jump_analysis: None,
            is_unmatched_return: false,
            options: EngineOptions { randomization_mode: RandomizationMode::BlockLevel, ..EngineOptions::default() },
        }
    }

    fn direct_jump_instr(offset: u32) -> Instruction {
        Instruction {
            class: InstrClass::DirectJump,
            offset,
            size: 5,
            operands: smallvec![],
            disp_value: 0,
            disp_size: DispSize::None,
            is_rip_relative: false,
            disp_byte_offset: 0,
            cond_kind: None,
            bytes: smallvec![0xe9, 0, 0, 0, 0],
        }
    }

    #[test]
    fn direct_jump_emits_branch_to_target() {
        let instr = direct_jump_instr(0x10);
        let tpl = template_instruction(&instr, &ctx(0x200, 0)).unwrap();
        assert_eq!(tpl.bytes[0], 0xe9);
        assert_eq!(tpl.relocations.len(), 1);
        assert_eq!(tpl.relocations[0].kind, RelocKind::Branch);
        assert_eq!(tpl.relocations[0].value, 0x200);
    }

    #[test]
    fn condition_branch_jcc_ends_with_jmp_to_fallthrough() {
        let mut instr = direct_jump_instr(0x40);
        instr.class = InstrClass::ConditionBranch;
        instr.cond_kind = Some(CondKind::Jcc(0x5)); // JNE
        let tpl = template_instruction(&instr, &ctx(0x80, 0x45)).unwrap();
        // 0F 85 rel32, then E9 rel32
        assert_eq!(&tpl.bytes[0..2], &[0x0f, 0x85]);
        assert_eq!(tpl.bytes[6], 0xe9);
        assert_eq!(tpl.bytes.len(), 11);
        assert_eq!(tpl.relocations.len(), 2);
        assert_eq!(tpl.relocations[0].value, 0x80);
        assert_eq!(tpl.relocations[1].value, 0x45);
    }

    #[test]
    fn ret_matched_discards_main_stack_and_jumps_through_shadow_stack() {
        let mut instr = direct_jump_instr(0x90);
        instr.class = InstrClass::Ret;
        instr.bytes = smallvec![0xc3];
        let tpl = template_instruction(&instr, &ctx(0, 0)).unwrap();
        // ADD rsp,8 then FF /4 indirect jmp through [rsp+disp32]
        assert_eq!(&tpl.bytes[0..4], &[0x48, 0x83, 0xc4, 0x08]);
        assert!(tpl.relocations.iter().any(|r| r.kind == RelocKind::Ss));
    }

    #[test]
    fn general_indirect_jump_register_destroy_skips_the_stack() {
        let mut instr = direct_jump_instr(0x50);
        instr.class = InstrClass::IndirectJump;
        instr.operands = smallvec![Operand::Register { num: 2 }]; // RDX
        let mut c = ctx(0, 0);
        c.options.jmpin_register_destroy = true;
        let tpl = template_instruction(&instr, &c).unwrap();
        // ADD rdx, imm32 then JMP rdx — no PUSH, no RET.
        assert!(!tpl.bytes.contains(&0xc3));
        assert_eq!(tpl.relocations.len(), 1);
        assert_eq!(tpl.relocations[0].kind, RelocKind::Trampoline);
        assert_eq!(&tpl.bytes[tpl.bytes.len() - 2..], &[0xff, 0xe2]); // JMP rdx
    }

    #[test]
    fn general_indirect_jump_falls_back_to_push_ret_when_destroy_disabled() {
        let mut instr = direct_jump_instr(0x50);
        instr.class = InstrClass::IndirectJump;
        instr.operands = smallvec![Operand::Register { num: 2 }]; // RDX
        let mut c = ctx(0, 0);
        c.options.jmpin_register_destroy = false;
        let tpl = template_instruction(&instr, &c).unwrap();
        assert_eq!(tpl.bytes.last(), Some(&0xc3)); // trailing RET
    }

    #[test]
    fn general_indirect_jump_mem_index_destroy_skips_the_stack() {
        let mut instr = direct_jump_instr(0x60);
        instr.class = InstrClass::IndirectJump;
        instr.operands = smallvec![Operand::IndexedMemory { base: Some(3), index: 1, scale: 4 }];
        instr.disp_value = 0x20;
        let mut c = ctx(0, 0);
        c.options.jmpin_mem_index_destroy = true;
        let tpl = template_instruction(&instr, &c).unwrap();
        assert!(!tpl.bytes.contains(&0xc3));
        assert_eq!(&tpl.bytes[tpl.bytes.len() - 2..], &[0xff, 0xe0]); // JMP rax
    }

    #[test]
    fn direct_call_prologue_carries_all_seven_relocations() {
        let mut instr = direct_jump_instr(0x100);
        instr.class = InstrClass::DirectCall;
        let tpl = template_instruction(&instr, &ctx(0x2000, 0x105)).unwrap();
        let kinds: Vec<_> = tpl.relocations.iter().map(|r| r.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::Ss).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::Low32Cc).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::High32Cc).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::Low32Org).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::High32Org).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == RelocKind::Branch).count(), 1);
        assert_eq!(tpl.relocations.last().unwrap().value, 0x2000);
    }
}
