//! Module identity and the auxiliary shadow-stack / signal-handler records
//! that accompany it.

use std::path::PathBuf;

/// Index into the engine's module arena. Instructions/blocks/RBBLs refer to
/// their owning module by this index rather than a back-pointer, per the
/// "cyclic ownership" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Selects one half of a module's double-buffered code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    First,
    Second,
}

impl CacheSlot {
    pub fn other(self) -> Self {
        match self {
            CacheSlot::First => CacheSlot::Second,
            CacheSlot::Second => CacheSlot::First,
        }
    }
}

/// State machine driving one cache half's generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    Empty,
    Generating,
    Ready,
    Consumed,
}

impl CacheState {
    /// Apply the one legal transition out of `self`, or return `self`
    /// unchanged if `self` is not the expected source state.
    pub fn advance(self, to: CacheState) -> CacheState {
        use CacheState::*;
        match (self, to) {
            (Empty, Generating) => Generating,
            (Generating, Ready) => Ready,
            (Ready, Consumed) => Consumed,
            (Consumed, Empty) => Empty,
            _ => self,
        }
    }
}

/// Canonical identity and geometry of one loaded module (the main
/// executable or a shared library).
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Canonical filename, as it appears in `/proc/<pid>/maps`.
    pub name: String,
    /// Load base of the *original* code in the guest.
    pub orig_base: u64,
    pub orig_size: u64,
    /// Load base of the code cache in the guest (shared by both halves;
    /// the second half starts at `cache_base + cache_half_size`).
    pub cache_base: u64,
    /// Size, in bytes, of a single cache half.
    pub cache_half_size: u64,
    /// Path to the backing shared-memory object, named `<pid>-<name>.cc`.
    pub shm_path: PathBuf,
    /// True when `orig_base`/`cache_base` fit in 32 bits end to end, i.e.
    /// the main executable rather than a PIE shared library; selects the
    /// non-split DirectCall/DirectJump return-address encoding.
    pub is_main_executable: bool,
}

impl Module {
    /// Distance from the original code base to the cache base, the
    /// `cc_offset` relocations add to convert an original-module offset
    /// into a cache-guest address.
    pub fn cc_offset(&self, slot: CacheSlot) -> i64 {
        let base = match slot {
            CacheSlot::First => self.cache_base,
            CacheSlot::Second => self.cache_base + self.cache_half_size,
        };
        base as i64 - self.orig_base as i64
    }

    pub fn cache_slot_base(&self, slot: CacheSlot) -> u64 {
        match slot {
            CacheSlot::First => self.cache_base,
            CacheSlot::Second => self.cache_base + self.cache_half_size,
        }
    }
}

/// The shadow-stack addressing model in force for the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowStackType {
    /// Displacement from main `RSP`.
    Offset,
    /// Displacement from a segment base (`%gs`).
    Seg,
    /// Segment-based, per-process-pinned variant.
    SegPp,
}

/// A mapped shadow stack: guest base/size and the shared-memory object
/// backing it.
#[derive(Debug, Clone)]
pub struct ShadowStackRecord {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub shm_path: PathBuf,
}

/// A registered signal handler, with one "patched" flag per cache variant.
#[derive(Debug, Clone)]
pub struct SignalHandlerRecord {
    pub handler_addr: u64,
    pub sigreturn_addr: u64,
    pub patched: [bool; 2],
}

impl SignalHandlerRecord {
    pub fn new(handler_addr: u64, sigreturn_addr: u64) -> Self {
        Self { handler_addr, sigreturn_addr, patched: [false; 2] }
    }

    pub fn is_patched(&self, slot: CacheSlot) -> bool {
        self.patched[slot_index(slot)]
    }

    pub fn mark_patched(&mut self, slot: CacheSlot) {
        self.patched[slot_index(slot)] = true;
    }

    /// Clear both variants' `patched` flags so the next `regenerate_all`
    /// re-applies this handler's trampoline patch even if it was already
    /// applied against the previous generation's layout.
    pub fn reset_patched(&mut self) {
        self.patched = [false; 2];
    }
}

fn slot_index(slot: CacheSlot) -> usize {
    match slot {
        CacheSlot::First => 0,
        CacheSlot::Second => 1,
    }
}
