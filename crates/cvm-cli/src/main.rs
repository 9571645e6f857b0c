//! `cvm`: loads a module-set configuration, builds the engine, and either
//! renders one generation or runs the producer loop until interrupted.

mod cli;
mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cvm_runtime::engine::{Engine, ModuleRuntime};
use cvm_runtime::shmem::MappedRegion;
use cvm_runtime::VariantController;
use cvm_types::CacheSlot;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SharedArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Generate(args) => run_generate(args.shared),
        Command::Serve(args) => run_serve(args.shared),
    }
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_engine(shared: &SharedArgs) -> anyhow::Result<Engine> {
    let runtime_config =
        config::load(&shared.config).with_context(|| format!("loading module-set config {}", shared.config.display()))?;

    let ss_type = shared.ss_type.into();
    let options = shared.options.clone().into();
    let mut engine = Engine::new(options, ss_type, shared.ss_offset, shared.gs_base);

    for (index, module_config) in runtime_config.modules.iter().enumerate() {
        let module = module_config.to_module(index as u32);
        let db_path = cvm_db::database_path(&module_config.db_path, ss_type);
        let store = cvm_db::read_from_path(&db_path)
            .with_context(|| format!("reading database {} for module {:?}", db_path.display(), module.name))?;
        let mapping = MappedRegion::open(&module.shm_path, module.cache_half_size as usize * 2)
            .with_context(|| format!("mapping shared-memory cache for module {:?}", module.name))?;
        engine.modules.push(ModuleRuntime::new(module, store, mapping));
    }

    Ok(engine)
}

fn run_generate(shared: SharedArgs) -> anyhow::Result<()> {
    let mut engine = build_engine(&shared)?;

    engine.regenerate_all(CacheSlot::First).context("regenerating cache 1")?;
    engine.regenerate_all(CacheSlot::Second).context("regenerating cache 2")?;

    for module in &engine.modules {
        tracing::info!(
            module = module.module.name,
            cache1 = ?module.cache_state(CacheSlot::First),
            cache2 = ?module.cache_state(CacheSlot::Second),
            "generation complete",
        );
    }
    Ok(())
}

fn run_serve(shared: SharedArgs) -> anyhow::Result<()> {
    let engine = build_engine(&shared)?;
    let mut controller = VariantController::new(engine);

    let stop_requested = Arc::new(AtomicBool::new(false));
    install_signal_handler(Arc::clone(&stop_requested))?;

    tracing::info!("producer running, waiting for SIGINT/SIGTERM");
    while !stop_requested.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    tracing::info!("stop signal received, shutting down producer");
    controller.stop();
    Ok(())
}

static STOP_FLAG: AtomicBool = AtomicBool::new(false);

fn install_signal_handler(stop_requested: Arc<AtomicBool>) -> anyhow::Result<()> {
    // `signal` takes a plain `extern "C" fn`, so the flag it sets has to be
    // a static; `run_serve`'s loop polls the `Arc` clone, which we keep in
    // lockstep with the static via a second polling step below.
    unsafe {
        if libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t) == libc::SIG_ERR {
            anyhow::bail!("failed to install SIGINT handler");
        }
        if libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t) == libc::SIG_ERR {
            anyhow::bail!("failed to install SIGTERM handler");
        }
    }

    std::thread::spawn(move || loop {
        if STOP_FLAG.load(Ordering::SeqCst) {
            stop_requested.store(true, Ordering::SeqCst);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    });

    Ok(())
}

extern "C" fn handle_signal(_signum: libc::c_int) {
    STOP_FLAG.store(true, Ordering::SeqCst);
}
