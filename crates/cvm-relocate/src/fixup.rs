//! Per-relocation-kind resolution (§4.5's fixup table).

use cvm_types::{RelocKind, Relocation};

use crate::Error;

/// The per-cache-half addressing constants every relocation kind needs.
/// One `RelocContext` covers one module, one cache half.
#[derive(Debug, Clone, Copy)]
pub struct RelocContext {
    /// Guest base address of this cache half.
    pub cache_base: u64,
    /// Guest base address of the module's original code.
    pub orig_base: u64,
    /// `cache_base - orig_base`, possibly 32- or 64-bit per the module
    /// kind; stored here as the full signed delta.
    pub cc_offset: i64,
    /// The already-resolved shadow-stack displacement: `ss_offset` for
    /// `ShadowStackType::Offset`, or `ss_offset + gs_base` for the
    /// segment-based models (§6 runtime constants).
    pub ss_offset: i64,
    /// `(cache_base + trampoline_group_base) - orig_base`, the delta a
    /// general indirect jump adds instead of `cc_offset` when routed
    /// through the switch-case trampoline group (§4.1, §4.4 item 3).
    pub trampoline_delta: i64,
    /// Guest base of the optional debug trace buffer, when mapped.
    pub debug_base: Option<u64>,
}

/// Resolve one RBBL-local relocation to the 4-byte value to write at
/// `abs_pos` (cache-relative). `addr_of` maps an RBBL's original offset to
/// its placed cache-guest address.
pub(crate) fn resolve(
    reloc: &Relocation,
    abs_pos: u32,
    ctx: &RelocContext,
    addr_of: &impl Fn(u32) -> Option<u64>,
) -> Result<u32, Error> {
    let lookup = |offset: i64| {
        let offset = offset as u32;
        addr_of(offset).ok_or(Error::UnresolvedRbbl(offset))
    };

    Ok(match reloc.kind {
        RelocKind::Rip => {
            let next_pc_in_cache = ctx.cache_base as i64 + abs_pos as i64 + reloc.byte_size as i64;
            let original_next_pc = reloc.addend;
            let new_disp = reloc.value - (next_pc_in_cache - original_next_pc);
            new_disp as i32 as u32
        }
        RelocKind::Branch => {
            let target = lookup(reloc.value)?;
            let next_pc_in_cache = ctx.cache_base + abs_pos as u64 + reloc.byte_size as u64;
            (target as i64 - next_pc_in_cache as i64) as i32 as u32
        }
        RelocKind::Ss => (ctx.ss_offset + reloc.addend) as i32 as u32,
        RelocKind::Cc => (ctx.cc_offset + reloc.addend) as i32 as u32,
        RelocKind::Low32Cc => (lookup(reloc.value)? & 0xffff_ffff) as u32,
        RelocKind::High32Cc => (lookup(reloc.value)? >> 32) as u32,
        RelocKind::Low32Org => (ctx.orig_base.wrapping_add(reloc.value as u64) & 0xffff_ffff) as u32,
        RelocKind::High32Org => (ctx.orig_base.wrapping_add(reloc.value as u64) >> 32) as u32,
        RelocKind::Trampoline => (ctx.trampoline_delta + reloc.addend) as i32 as u32,
        RelocKind::DebugLow32 => {
            let base = ctx.debug_base.unwrap_or_else(|| {
                tracing::warn!("DEBUG_LOW32 relocation with no debug trace buffer mapped");
                0
            });
            (base.wrapping_add(reloc.value as u64) & 0xffff_ffff) as u32
        }
        RelocKind::DebugHigh32 => {
            let base = ctx.debug_base.unwrap_or_else(|| {
                tracing::warn!("DEBUG_HIGH32 relocation with no debug trace buffer mapped");
                0
            });
            (base.wrapping_add(reloc.value as u64) >> 32) as u32
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RelocContext {
        RelocContext {
            cache_base: 0x1000,
            orig_base: 0x500,
            cc_offset: 0x1000 - 0x500,
            ss_offset: -0x100,
            trampoline_delta: 0,
            debug_base: None,
        }
    }

    #[test]
    fn cc_adds_addend() {
        let r = Relocation::new(RelocKind::Cc, 0, 4, 5, 0);
        let v = resolve(&r, 0, &ctx(), &|_| None).unwrap();
        assert_eq!(v as i32, (0x1000 - 0x500 + 5) as i32);
    }

    #[test]
    fn low32_org_high32_org_split_a_64_bit_address() {
        let r_lo = Relocation::new(RelocKind::Low32Org, 0, 4, 0, 0x20);
        let r_hi = Relocation::new(RelocKind::High32Org, 0, 4, 0, 0x20);
        let lo = resolve(&r_lo, 0, &ctx(), &|_| None).unwrap();
        let hi = resolve(&r_hi, 0, &ctx(), &|_| None).unwrap();
        let full = ((hi as u64) << 32) | lo as u64;
        assert_eq!(full, 0x520);
    }

    #[test]
    fn branch_missing_target_is_an_error() {
        let r = Relocation::new(RelocKind::Branch, 0, 4, 0, 0x30);
        let err = resolve(&r, 0, &ctx(), &|_| None).unwrap_err();
        assert_eq!(err, Error::UnresolvedRbbl(0x30));
    }
}
