//! Instruction and basic-block templaters.
//!
//! Turns decoded [`cvm_types::Instruction`]s and [`cvm_types::BasicBlock`]s
//! into position-independent byte templates plus the relocation lists the
//! layout arranger and relocator need to make the bytes position-correct
//! once placed in a cache. No knowledge of cache addresses or placement
//! order lives here; every address-dependent field goes out as a
//! [`cvm_types::Relocation`] instead.

pub mod block;
mod enc;
pub mod instr;

pub use block::{template_block, BlockTemplate};
pub use instr::{template_instruction, InstrTemplate, TemplateError};
