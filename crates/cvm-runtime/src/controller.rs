//! The variant controller (§4.6): owns the background producer thread that
//! keeps both cache halves full, and the pause/resume protocol `dlopen`,
//! `dlclose`, and signal-handler registration use to get exclusive access
//! to the engine without racing the producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cvm_types::CacheSlot;

use crate::engine::Engine;
use crate::Error;

/// Spawns and supervises the background generation loop for one `Engine`.
pub struct VariantController {
    engine: Arc<Mutex<Engine>>,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl VariantController {
    pub fn new(engine: Engine) -> Self {
        let engine = Arc::new(Mutex::new(engine));
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let handle = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let paused = Arc::clone(&paused);
            std::thread::spawn(move || producer_loop(engine, stop, paused))
        };

        Self { engine, stop, paused, handle: Some(handle) }
    }

    pub fn engine(&self) -> &Arc<Mutex<Engine>> {
        &self.engine
    }

    /// Request the producer stand down. Held by `dlopen`/`dlclose` and
    /// signal-handler registration while they mutate `Engine::modules` or
    /// `Engine::signal_handlers` directly.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        // The producer checks `paused` between iterations, never mid-regeneration,
        // so a caller that then locks `engine` will block until it is safe.
        let _ = self.engine.lock().unwrap();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VariantController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn producer_loop(engine: Arc<Mutex<Engine>>, stop: Arc<AtomicBool>, paused: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        if !paused.load(Ordering::SeqCst) {
            if let Err(err) = fill_slot(&engine, CacheSlot::First) {
                tracing::error!(%err, slot = "first", "variant regeneration failed");
            }
            if let Err(err) = fill_slot(&engine, CacheSlot::Second) {
                tracing::error!(%err, slot = "second", "variant regeneration failed");
            }
        }

        while paused.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        // Unconditional trailing yield every iteration, matching the
        // original generation loop's shape regardless of whether this pass
        // did any work.
        std::thread::yield_now();
    }
}

fn fill_slot(engine: &Arc<Mutex<Engine>>, slot: CacheSlot) -> Result<(), Error> {
    let mut guard = engine.lock().unwrap();
    if guard.all_empty(slot) {
        guard.regenerate_all(slot)?;
    }
    Ok(())
}
