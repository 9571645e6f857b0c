//! The variant controller, process-map discovery, cross-variant migration,
//! signal-handler patching, and dlopen/dlclose (§4.6, §5, §6).
//!
//! This is the only crate in the workspace that knows about threads, shared
//! memory, and `/proc`; everything below it (`cvm-db`, `cvm-layout`,
//! `cvm-relocate`) is pure and single-threaded. Per design note 9 ("global
//! state"), every process-wide value the original collects into file-scope
//! statics lives instead on one [`engine::Engine`] value with explicit
//! ownership.

pub mod controller;
pub mod dlopen;
pub mod engine;
pub mod migrate;
pub mod procmap;
pub mod shmem;
pub mod sigpatch;

pub use controller::VariantController;
pub use engine::{Engine, ModuleRuntime};
pub use procmap::{ProcMaps, ProcMapsError};
pub use sigpatch::handle_sigaction;

/// Errors raised by the runtime crate. Composes the lower crates' errors
/// (per §7, each crate boundary gets its own tier-tagged enum; this is the
/// boundary the CLI's `anyhow` collects into).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] cvm_db::Error),
    #[error(transparent)]
    Layout(#[from] cvm_layout::Error),
    #[error(transparent)]
    Relocate(#[from] cvm_relocate::Error),
    #[error(transparent)]
    SharedMemory(#[from] shmem::Error),
    #[error("module {0:?} is not loaded")]
    UnknownModule(String),
    #[error("signal handler patch failed: {0}")]
    SignalPatch(String),
}
