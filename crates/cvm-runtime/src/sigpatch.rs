//! Signal-handler trampoline patching (§4.6 `handle_sigaction`): redirects a
//! registered handler's cache entry point through a small generated patch
//! that first overwrites the signal frame's return slot with the
//! cache-space sigreturn address, then jumps to the handler's real body.
//!
//! Caches are rebuilt from scratch on every regeneration, so unlike the
//! original's one-shot patch, `apply` re-derives and re-applies every
//! registered handler's patch each time a cache half is regenerated; the
//! per-variant `patched` flag exists only to make repeated registration of
//! the same handler idempotent, not to skip re-patching after a rebuild.

use std::collections::HashMap;

use cvm_layout::ArrangedCache;
use cvm_types::{CacheSlot, LayoutTag, Module, SignalHandlerRecord};

use crate::controller::VariantController;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no room left in the cache to place the patch for handler at {handler_addr:#x}")]
    OutOfSpace { handler_addr: u64 },
}

/// Register (or re-register) a signal handler's trampoline patch (§4.6
/// `handle_sigaction`). Pauses the producer, idempotently inserts/updates
/// `(handler_addr, sigreturn_addr)` in `Engine::signal_handlers`, and
/// resumes; `apply` picks the record up on the next regeneration of either
/// variant. `current_pc` is accepted per the §4.6 signature but carries no
/// information this engine needs: the patch targets the handler's entry
/// trampoline regardless of where execution currently sits.
///
/// Per §7 tier 2, registering the same handler again is idempotent — the
/// `patched` flags are reset so the next regeneration re-applies the patch
/// against whatever layout that generation produces, but registration
/// itself never errors or duplicates the record.
pub fn handle_sigaction(
    controller: &VariantController,
    handler_addr: u64,
    sigreturn_addr: u64,
    _current_pc: u64,
) {
    controller.pause();
    {
        let mut engine = controller.engine().lock().unwrap();
        engine
            .signal_handlers
            .entry(handler_addr)
            .and_modify(|record| {
                record.sigreturn_addr = sigreturn_addr;
                record.reset_patched();
            })
            .or_insert_with(|| SignalHandlerRecord::new(handler_addr, sigreturn_addr));
    }
    controller.resume();
}

const PATCH_SIZE: u32 = 2 * MOV_SIZE + JMP_SIZE;
const MOV_SIZE: u32 = 11;
const JMP_SIZE: u32 = 5;

/// Re-apply every registered handler's patch against a freshly arranged
/// cache half belonging to `module`.
pub fn apply(
    arranged: &mut ArrangedCache,
    handlers: &mut HashMap<u64, SignalHandlerRecord>,
    module: &Module,
    slot: CacheSlot,
    virtual_ss_offset: i64,
) -> Result<(), Error> {
    for record in handlers.values_mut() {
        if record.handler_addr < module.orig_base || record.handler_addr >= module.orig_base + module.orig_size {
            continue;
        }

        let handler_offset = (record.handler_addr - module.orig_base) as u32;
        let sigreturn_offset = (record.sigreturn_addr - module.orig_base) as u32;

        let Some(handler_body) = arranged.layout.find_rbbl(handler_offset) else {
            tracing::warn!(handler_addr = record.handler_addr, "handler body not placed in this variant, skipping patch");
            continue;
        };
        let handler_body_start = handler_body.start;

        let Some(sigreturn_body) = arranged.layout.find_rbbl(sigreturn_offset) else {
            tracing::warn!(sigreturn_addr = record.sigreturn_addr, "sigreturn body not placed in this variant, skipping patch");
            continue;
        };
        let sigreturn_cache_addr = arranged_base(arranged, module, slot) + sigreturn_body.start as u64;
        let low32 = (sigreturn_cache_addr & 0xffff_ffff) as u32;
        let high32 = (sigreturn_cache_addr >> 32) as u32;

        let patch_start = arranged.layout.used();
        let jmp_target = arranged_base(arranged, module, slot) + handler_body_start as u64;
        let next_pc = arranged_base(arranged, module, slot) + patch_start as u64 + PATCH_SIZE as u64;
        let jmp_disp = (jmp_target as i64 - next_pc as i64) as i32;

        let patch = build_patch(-virtual_ss_offset, 4 - virtual_ss_offset, low32, high32, jmp_disp);
        place_patch(arranged, patch_start, &patch, record.handler_addr)?;

        retarget_entry_trampoline(arranged, handler_offset, patch_start);
        record.mark_patched(slot);
    }
    Ok(())
}

fn arranged_base(_arranged: &ArrangedCache, module: &Module, slot: CacheSlot) -> u64 {
    module.cache_slot_base(slot)
}

fn place_patch(arranged: &mut ArrangedCache, start: u32, patch: &[u8], handler_addr: u64) -> Result<(), Error> {
    arranged
        .layout
        .insert(start, patch.len() as u32, LayoutTag::InvTramp)
        .map_err(|_| Error::OutOfSpace { handler_addr })?;
    let start = start as usize;
    if start + patch.len() > arranged.bytes.len() {
        return Err(Error::OutOfSpace { handler_addr });
    }
    arranged.bytes[start..start + patch.len()].copy_from_slice(patch);
    Ok(())
}

/// Retarget the fixed entry trampoline at `handler_offset` (a
/// `TrampJmp32` placed by the layout arranger) to jump into the patch
/// region instead of straight to the handler's body.
fn retarget_entry_trampoline(arranged: &mut ArrangedCache, handler_offset: u32, patch_start: u32) {
    let Some(entry) = arranged.layout.find_mut(handler_offset) else {
        return;
    };
    let entry_start = entry.start;
    let next_pc = entry_start + 5;
    let disp = (patch_start as i64 - next_pc as i64) as i32;
    let pos = (entry_start + 1) as usize;
    arranged.bytes[pos..pos + 4].copy_from_slice(&disp.to_le_bytes());
}

/// `mov dword [rsp+disp32], imm32` twice (sigreturn low/high halves), then
/// `jmp rel32` to the handler's real body.
fn build_patch(disp_low: i64, disp_high: i64, imm_low: u32, imm_high: u32, jmp_disp: i32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PATCH_SIZE as usize);
    bytes.extend_from_slice(&mov_rsp_disp32_imm32(disp_low as i32, imm_low));
    bytes.extend_from_slice(&mov_rsp_disp32_imm32(disp_high as i32, imm_high));
    bytes.push(0xe9);
    bytes.extend_from_slice(&jmp_disp.to_le_bytes());
    bytes
}

/// `C7 84 24 disp32 imm32` — `mov dword [rsp+disp32], imm32`.
fn mov_rsp_disp32_imm32(disp: i32, imm: u32) -> [u8; 11] {
    let d = disp.to_le_bytes();
    let v = imm.to_le_bytes();
    [0xc7, 0x84, 0x24, d[0], d[1], d[2], d[3], v[0], v[1], v[2], v[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_encoding_has_the_expected_prefix_and_length() {
        let bytes = mov_rsp_disp32_imm32(-8, 0xdead_beef);
        assert_eq!(bytes.len(), MOV_SIZE as usize);
        assert_eq!(&bytes[..3], &[0xc7, 0x84, 0x24]);
        assert_eq!(i32::from_le_bytes(bytes[3..7].try_into().unwrap()), -8);
        assert_eq!(u32::from_le_bytes(bytes[7..11].try_into().unwrap()), 0xdead_beef);
    }

    #[test]
    fn build_patch_has_the_expected_total_size() {
        let patch = build_patch(-8, -4, 1, 2, 0x100);
        assert_eq!(patch.len() as u32, PATCH_SIZE);
        assert_eq!(patch[2 * MOV_SIZE as usize], 0xe9);
    }

    #[test]
    fn handle_sigaction_registers_and_re_registering_resets_patched_flags() {
        use crate::engine::Engine;
        use cvm_types::{EngineOptions, ShadowStackType};

        let engine = Engine::new(EngineOptions::default(), ShadowStackType::Offset, 0, 0);
        let controller = VariantController::new(engine);

        handle_sigaction(&controller, 0x1000, 0x2000, 0x1234);
        {
            let guard = controller.engine().lock().unwrap();
            let record = guard.signal_handlers.get(&0x1000).unwrap();
            assert_eq!(record.sigreturn_addr, 0x2000);
            assert_eq!(record.patched, [false, false]);
        }

        controller.engine().lock().unwrap().signal_handlers.get_mut(&0x1000).unwrap().mark_patched(CacheSlot::First);

        // Re-registering the same handler is idempotent (§7 tier 2) but
        // resets the patched flags so the next regeneration re-applies it.
        handle_sigaction(&controller, 0x1000, 0x2008, 0x1234);
        let guard = controller.engine().lock().unwrap();
        assert_eq!(guard.signal_handlers.len(), 1);
        let record = guard.signal_handlers.get(&0x1000).unwrap();
        assert_eq!(record.sigreturn_addr, 0x2008);
        assert_eq!(record.patched, [false, false]);
    }
}
