//! `dlopen`/`dlclose` handling (§7 tier 2): loading or unloading a module
//! at runtime means pausing the producer, mutating `Engine::modules`, and
//! resuming it — the same exclusion protocol signal-handler registration
//! uses.

use std::path::Path;

use cvm_types::{Module, ShadowStackType};

use crate::controller::VariantController;
use crate::engine::ModuleRuntime;
use crate::shmem::MappedRegion;
use crate::Error;

/// Load `module`'s database from `db_path` (suffixed per `ss_type`), map
/// its shared-memory cache, and register it with the running controller.
/// A no-op, per §7, if a module of the same name is already loaded.
pub fn handle_dlopen(
    controller: &VariantController,
    module: Module,
    db_path: impl AsRef<Path>,
    ss_type: ShadowStackType,
) -> Result<(), Error> {
    controller.pause();
    let result: Result<(), Error> = (|| {
        let mut engine = controller.engine().lock().unwrap();
        if engine.find_module(&module.name).is_some() {
            tracing::info!(module = module.name, "dlopen of an already-loaded module, ignoring");
            return Ok(());
        }

        let suffixed = cvm_db::database_path(db_path.as_ref(), ss_type);
        let store = cvm_db::read_from_path(&suffixed)?;
        let mapping = MappedRegion::open(&module.shm_path, module.cache_half_size as usize * 2)?;

        engine.modules.push(ModuleRuntime::new(module, store, mapping));
        Ok(())
    })();
    controller.resume();
    result
}

/// Unload the named module and drop its shared-memory mapping.
pub fn handle_dlclose(controller: &VariantController, name: &str) -> Result<(), Error> {
    controller.pause();
    let result: Result<(), Error> = (|| {
        let mut engine = controller.engine().lock().unwrap();
        let before = engine.modules.len();
        engine.modules.retain(|m| m.module.name != name);
        if engine.modules.len() == before {
            return Err(Error::UnknownModule(name.to_string()));
        }
        Ok(())
    })();
    controller.resume();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_types::{EngineOptions, RandomBbl, RbblClass, RbblFingerprint};

    use crate::engine::Engine;

    fn sample_module(name: &str, shm_path: std::path::PathBuf) -> Module {
        Module {
            id: cvm_types::ModuleId(0),
            name: name.to_string(),
            orig_base: 0x40_0000,
            orig_size: 0x1000,
            cache_base: 0x7f00_0000_0000,
            cache_half_size: 0x1000,
            shm_path,
            is_main_executable: false,
        }
    }

    #[test]
    fn dlopen_loads_a_module_and_dlclose_removes_it() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = cvm_db::RbblStore::new();
        store.insert_movable(RandomBbl {
            fingerprint: RbblFingerprint::from_offset(0x10),
            original_offset: 0x10,
            class: RbblClass::Movable,
            template: vec![0x90],
            relocations: vec![],
            last_branch_target: None,
            has_lock_repeat_prefix: false,
        });
        store.rebuild_units();
        let db_base = dir.path().join("libexample.so");
        let db_path = cvm_db::database_path(&db_base, ShadowStackType::Offset);
        cvm_db::write_to_path(&db_path, &store).unwrap();

        let shm_path = dir.path().join("1-libexample.so.cc");
        let module = sample_module("libexample.so", shm_path);

        let engine = Engine::new(EngineOptions::default(), ShadowStackType::Offset, 0, 0);
        let controller = VariantController::new(engine);

        handle_dlopen(&controller, module, &db_base, ShadowStackType::Offset).unwrap();
        assert_eq!(controller.engine().lock().unwrap().modules.len(), 1);

        // Loading the same module again is a no-op, not an error.
        let module_again = sample_module("libexample.so", dir.path().join("1-libexample.so.cc"));
        handle_dlopen(&controller, module_again, &db_base, ShadowStackType::Offset).unwrap();
        assert_eq!(controller.engine().lock().unwrap().modules.len(), 1);

        handle_dlclose(&controller, "libexample.so").unwrap();
        assert_eq!(controller.engine().lock().unwrap().modules.len(), 0);
    }

    #[test]
    fn dlclose_of_an_unknown_module_is_an_error() {
        let engine = Engine::new(EngineOptions::default(), ShadowStackType::Offset, 0, 0);
        let controller = VariantController::new(engine);
        let err = handle_dlclose(&controller, "nonexistent.so").unwrap_err();
        assert!(matches!(err, Error::UnknownModule(name) if name == "nonexistent.so"));
    }
}
