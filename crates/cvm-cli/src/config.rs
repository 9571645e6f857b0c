//! The module-set configuration file: the one piece of genuinely
//! structured CLI input, so it is `serde`-derived rather than hand-parsed
//! (§2.1 "serialization").

use std::path::{Path, PathBuf};

use cvm_types::Module as EngineModule;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read module-set config {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse module-set config {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub modules: Vec<ModuleConfig>,
}

/// One module's static geometry and database location. Mirrors
/// [`cvm_types::Module`] field for field, plus the database path that
/// geometry alone can't express.
#[derive(Debug, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub orig_base: u64,
    pub orig_size: u64,
    pub cache_base: u64,
    pub cache_half_size: u64,
    pub shm_path: PathBuf,
    #[serde(default)]
    pub is_main_executable: bool,
    /// Path to the module's database file, *without* the shadow-stack-type
    /// suffix; the suffix is appended from the active `ss_type`.
    pub db_path: PathBuf,
}

impl ModuleConfig {
    pub fn to_module(&self, id: u32) -> EngineModule {
        EngineModule {
            id: cvm_types::ModuleId(id),
            name: self.name.clone(),
            orig_base: self.orig_base,
            orig_size: self.orig_size,
            cache_base: self.cache_base,
            cache_half_size: self.cache_half_size,
            shm_path: self.shm_path.clone(),
            is_main_executable: self.is_main_executable,
        }
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<RuntimeConfig, Error> {
    let path_ref = path.as_ref();
    let path_str = path_ref.display().to_string();
    let text = std::fs::read_to_string(path_ref).map_err(|source| Error::Read { path: path_str.clone(), source })?;
    serde_json::from_str(&text).map_err(|source| Error::Parse { path: path_str, source })
}
