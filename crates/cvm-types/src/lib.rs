//! Core data model for the code variant manager.
//!
//! This crate has no knowledge of files, threads, or shared memory; it is
//! the shared vocabulary `cvm-template`, `cvm-db`, `cvm-layout`,
//! `cvm-relocate`, and `cvm-runtime` all build on.

pub mod block;
pub mod instr;
pub mod layout;
pub mod module;
pub mod options;
pub mod rbbl;
pub mod reloc;

pub use block::{BasicBlock, BlockKind, IndirectJumpAnalysis};
pub use instr::{CondKind, DispSize, Instruction, InstrClass, Operand};
pub use layout::{CacheLayout, LayoutEntry, LayoutMapError, LayoutTag};
pub use module::{
    CacheSlot, CacheState, Module, ModuleId, ShadowStackRecord, ShadowStackType, SignalHandlerRecord,
};
pub use options::{EngineOptions, RandomizationMode};
pub use rbbl::{build_units, RandomBbl, RbbUnit, RbblClass, RbblFingerprint};
pub use reloc::{RelocKind, Relocation};
