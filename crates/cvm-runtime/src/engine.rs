//! The engine (§2.2 "global state" redesign note): owns every loaded
//! module's double-buffered cache, the registered shadow stacks and signal
//! handlers, and the tunables everything below it consults. One `Engine`
//! replaces the original's process-wide statics.

use std::collections::HashMap;

use cvm_db::RbblStore;
use cvm_layout::{arrange, ArrangedCache};
use cvm_types::{
    CacheSlot, CacheState, EngineOptions, Module, ShadowStackRecord, ShadowStackType, SignalHandlerRecord,
};
use rayon::prelude::*;

use crate::shmem::MappedRegion;
use crate::sigpatch;
use crate::Error;

/// One loaded module's identity, database, and shared-memory mapping.
pub struct ModuleRuntime {
    pub module: Module,
    pub store: RbblStore,
    mapping: MappedRegion,
    halves: [CacheHalf; 2],
}

struct CacheHalf {
    state: CacheState,
    arranged: Option<ArrangedCache>,
}

impl CacheHalf {
    fn empty() -> Self {
        Self { state: CacheState::Empty, arranged: None }
    }
}

impl ModuleRuntime {
    pub fn new(module: Module, store: RbblStore, mapping: MappedRegion) -> Self {
        Self { module, store, mapping, halves: [CacheHalf::empty(), CacheHalf::empty()] }
    }

    fn half(&self, slot: CacheSlot) -> &CacheHalf {
        &self.halves[slot_index(slot)]
    }

    fn half_mut(&mut self, slot: CacheSlot) -> &mut CacheHalf {
        &mut self.halves[slot_index(slot)]
    }

    pub fn cache_state(&self, slot: CacheSlot) -> CacheState {
        self.half(slot).state
    }

    /// Arrange and relocate this module's cache half, but do not yet patch
    /// signal handlers or publish to shared memory; those steps run
    /// sequentially across modules after the parallel arrange+relocate pass
    /// (§4.6).
    fn regenerate(&mut self, slot: CacheSlot, options: EngineOptions, seed: u64, ss_offset: i64, debug_base: Option<u64>) -> Result<(), Error> {
        self.half_mut(slot).state = CacheState::Generating;

        let mut arranged = arrange(&self.store, self.module.cache_half_size as u32, options, seed)?;
        let ctx = cvm_relocate::RelocContext {
            cache_base: self.module.cache_slot_base(slot),
            orig_base: self.module.orig_base,
            cc_offset: self.module.cc_offset(slot),
            ss_offset,
            trampoline_delta: self.module.cache_slot_base(slot) as i64 + arranged.trampoline_base as i64
                - self.module.orig_base as i64,
            debug_base,
        };
        cvm_relocate::relocate(&mut arranged, &self.store, &ctx)?;

        self.half_mut(slot).arranged = Some(arranged);
        Ok(())
    }

    /// Copy this half's rendered bytes into the shared-memory mapping and
    /// mark it ready for consumption.
    fn publish(&mut self, slot: CacheSlot) {
        let half_size = self.module.cache_half_size as usize;
        let byte_offset = match slot {
            CacheSlot::First => 0,
            CacheSlot::Second => half_size,
        };
        let Some(arranged) = self.half(slot).arranged.as_ref() else {
            return;
        };
        let bytes = arranged.bytes.clone();
        let dest = self.mapping.as_mut_slice();
        dest[byte_offset..byte_offset + half_size].copy_from_slice(&bytes);
        self.half_mut(slot).state = CacheState::Ready;
    }

    fn mark_consumed(&mut self, slot: CacheSlot) {
        let half = self.half_mut(slot);
        half.state = CacheState::Consumed;
    }

    fn reclaim(&mut self, slot: CacheSlot) {
        let half = self.half_mut(slot);
        half.state = CacheState::Empty;
        half.arranged = None;
    }

    pub fn arranged(&self, slot: CacheSlot) -> Option<&ArrangedCache> {
        self.half(slot).arranged.as_ref()
    }
}

fn slot_index(slot: CacheSlot) -> usize {
    match slot {
        CacheSlot::First => 0,
        CacheSlot::Second => 1,
    }
}

/// Process-wide engine state: every loaded module plus the addressing
/// constants shared across them.
pub struct Engine {
    pub modules: Vec<ModuleRuntime>,
    pub signal_handlers: HashMap<u64, SignalHandlerRecord>,
    pub shadow_stacks: Vec<ShadowStackRecord>,
    pub options: EngineOptions,
    pub ss_type: ShadowStackType,
    pub ss_offset: i64,
    pub gs_base: u64,
    pub debug_base: Option<u64>,
    seed_counter: u64,
}

impl Engine {
    pub fn new(options: EngineOptions, ss_type: ShadowStackType, ss_offset: i64, gs_base: u64) -> Self {
        Self {
            modules: Vec::new(),
            signal_handlers: HashMap::new(),
            shadow_stacks: Vec::new(),
            options,
            ss_type,
            ss_offset,
            gs_base,
            debug_base: None,
            seed_counter: 0,
        }
    }

    /// The shadow-stack displacement relocations and signal patches should
    /// use: `ss_offset` for the offset model, `ss_offset + gs_base` for
    /// either segment model (§6 runtime constants).
    pub fn virtual_ss_offset(&self) -> i64 {
        match self.ss_type {
            ShadowStackType::Offset => self.ss_offset,
            ShadowStackType::Seg | ShadowStackType::SegPp => self.ss_offset + self.gs_base as i64,
        }
    }

    pub fn find_module(&self, name: &str) -> Option<&ModuleRuntime> {
        self.modules.iter().find(|m| m.module.name == name)
    }

    pub fn find_module_mut(&mut self, name: &str) -> Option<&mut ModuleRuntime> {
        self.modules.iter_mut().find(|m| m.module.name == name)
    }

    fn next_seed(&mut self) -> u64 {
        self.seed_counter = self.seed_counter.wrapping_add(1);
        self.seed_counter
    }

    /// Regenerate every module's cache half in `slot`: arrange and relocate
    /// all modules in parallel, then patch signal handlers and publish to
    /// shared memory sequentially, since patching mutates already-rendered
    /// bytes and must finish before those bytes are copied out (§4.6).
    pub fn regenerate_all(&mut self, slot: CacheSlot) -> Result<(), Error> {
        let options = self.options;
        let ss_offset = self.virtual_ss_offset();
        let debug_base = self.debug_base;
        let seed = self.next_seed();

        self.modules
            .par_iter_mut()
            .try_for_each(|m| m.regenerate(slot, options, seed ^ (m.module.id.0 as u64), ss_offset, debug_base))?;

        for module_rt in self.modules.iter_mut() {
            let ModuleRuntime { module, halves, .. } = module_rt;
            if let Some(arranged) = halves[slot_index(slot)].arranged.as_mut() {
                sigpatch::apply(arranged, &mut self.signal_handlers, module, slot, ss_offset)
                    .map_err(|err| Error::SignalPatch(err.to_string()))?;
            }
            module_rt.publish(slot);
        }
        Ok(())
    }

    /// Mark `slot` consumed across every module (the guest has switched to
    /// it) and then reclaim it back to `Empty` so the producer can refill
    /// it. §4.6's state machine transitions `CONSUMED -> EMPTY`
    /// "immediately", so `consume` drives both steps itself rather than
    /// leaving the half stuck in `Consumed` until some other caller
    /// remembers to reclaim it.
    pub fn consume(&mut self, slot: CacheSlot) {
        for module in self.modules.iter_mut() {
            module.mark_consumed(slot);
            module.reclaim(slot);
        }
    }

    /// True when every module's `slot` half has reached `Ready`.
    pub fn all_ready(&self, slot: CacheSlot) -> bool {
        self.modules.iter().all(|m| m.cache_state(slot) == CacheState::Ready)
    }

    /// True when every module's `slot` half is back to `Empty` (safe to
    /// regenerate).
    pub fn all_empty(&self, slot: CacheSlot) -> bool {
        self.modules.iter().all(|m| m.cache_state(slot) == CacheState::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{RandomBbl, RbblClass, RbblFingerprint};

    fn sample_module(shm_path: std::path::PathBuf) -> Module {
        Module {
            id: cvm_types::ModuleId(0),
            name: "libexample.so".to_string(),
            orig_base: 0x40_0000,
            orig_size: 0x1000,
            cache_base: 0x7f00_0000_0000,
            cache_half_size: 0x1000,
            shm_path,
            is_main_executable: false,
        }
    }

    fn sample_store() -> RbblStore {
        let mut store = RbblStore::new();
        store.insert_movable(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x10),
            original_offset: 0x10,
            class: RbblClass::Movable,
            template: vec![0x90, 0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.rebuild_units();
        store
    }

    #[test]
    fn regenerate_all_marks_both_halves_ready_and_publishes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let shm_path = dir.path().join("1-libexample.so.cc");
        let mapping = MappedRegion::open(&shm_path, 0x2000).unwrap();

        let module = sample_module(shm_path);
        let mut engine = Engine::new(EngineOptions::default(), ShadowStackType::Offset, -0x100, 0);
        engine.modules.push(ModuleRuntime::new(module, sample_store(), mapping));

        engine.regenerate_all(CacheSlot::First).unwrap();
        assert_eq!(engine.modules[0].cache_state(CacheSlot::First), CacheState::Ready);
        assert_eq!(engine.modules[0].cache_state(CacheSlot::Second), CacheState::Empty);

        engine.regenerate_all(CacheSlot::Second).unwrap();
        assert_eq!(engine.modules[0].cache_state(CacheSlot::Second), CacheState::Ready);

        engine.consume(CacheSlot::First);
        assert_eq!(engine.modules[0].cache_state(CacheSlot::First), CacheState::Empty);
        assert!(engine.all_empty(CacheSlot::First));
    }

    #[test]
    fn virtual_ss_offset_adds_gs_base_only_for_segment_models() {
        let offset_engine = Engine::new(EngineOptions::default(), ShadowStackType::Offset, -0x100, 0x7000);
        assert_eq!(offset_engine.virtual_ss_offset(), -0x100);

        let seg_engine = Engine::new(EngineOptions::default(), ShadowStackType::Seg, -0x100, 0x7000);
        assert_eq!(seg_engine.virtual_ss_offset(), -0x100 + 0x7000);
    }
}
