//! Per-module Random-BBL store and database segment format (§4.3, §6).
//!
//! Reads the disassembler-provided database file into an [`RbblStore`] the
//! rest of the engine can place and patch, and writes it back out
//! byte-identically (used by the round-trip property in §8).

mod file;
mod store;
mod wire;

pub use file::{database_path, decode, encode, read_from_path, suffix_for, write_to_path};
pub use store::RbblStore;

/// Errors raised while reading or writing a module's database file. All are
/// fatal per §7 tier 1 ("segment-type mismatch while reading the
/// database").
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("database segment type mismatch: expected {expected}, found {found}")]
    SegmentTypeMismatch { expected: u32, found: u32 },
    #[error("database buffer truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("database has {extra} trailing bytes after its last segment")]
    TrailingBytes { extra: usize },
    #[error("unknown relocation kind tag {tag}")]
    UnknownRelocKind { tag: u8 },
}
