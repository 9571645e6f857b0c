//! Command-line surface (§6 "CLI/options consumed"), one flag per knob the
//! engine actually reads. Mirrors the flattened, derive-based `Options`
//! struct style the teacher's flags crate uses for its own CLI surface.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use cvm_types::{EngineOptions, RandomizationMode, ShadowStackType};

#[derive(Debug, Parser)]
#[command(name = "cvm", about = "Continuous binary code-variant engine", version)]
pub struct Cli {
    /// Increase log verbosity; repeat for more detail. Overridden by
    /// `RUST_LOG` when set.
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render one generation of both cache halves from a module-set
    /// configuration file and exit. Useful for validating a database and
    /// option set without running the background producer.
    Generate(GenerateArgs),
    /// Start the background producer and keep both cache halves full until
    /// interrupted (SIGINT/SIGTERM).
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct SharedArgs {
    /// Path to a JSON module-set configuration file (see `cvm_cli::config`).
    #[arg(long)]
    pub config: PathBuf,

    #[command(flatten)]
    pub options: OptionsArgs,

    /// Shadow-stack addressing model in effect for this process.
    #[arg(long, value_enum, default_value_t = ShadowStackTypeArg::Offset)]
    pub ss_type: ShadowStackTypeArg,

    /// Displacement from main RSP (or from the segment base, for the
    /// segment models) to the shadow-stack top.
    #[arg(long, default_value_t = 0)]
    pub ss_offset: i64,

    /// Segment base used for segment-based shadow stacks.
    #[arg(long, default_value_t = 0)]
    pub gs_base: u64,
}

#[derive(Debug, Clone, Args)]
pub struct OptionsArgs {
    #[arg(long, value_enum, default_value_t = RandomizationModeArg::UnitLevel)]
    pub randomization_mode: RandomizationModeArg,

    /// Window size, in RBBUs, for unit-level Fisher-Yates.
    #[arg(long, default_value_t = 32)]
    pub rbbu_range: u32,

    /// Maximum number of random padding bytes inserted between RBBL bodies.
    #[arg(long, default_value_t = 0)]
    pub rbbu_padding: u32,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub caller_saved_destroy: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub jmpin_register_destroy: bool,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub jmpin_mem_index_destroy: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub main_switch_case_copy: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub trampoline_record: bool,
}

impl From<OptionsArgs> for EngineOptions {
    fn from(args: OptionsArgs) -> Self {
        Self {
            randomization_mode: args.randomization_mode.into(),
            rbbu_range: args.rbbu_range,
            rbbu_padding: args.rbbu_padding,
            caller_saved_destroy: args.caller_saved_destroy,
            jmpin_register_destroy: args.jmpin_register_destroy,
            jmpin_mem_index_destroy: args.jmpin_mem_index_destroy,
            main_switch_case_copy: args.main_switch_case_copy,
            trampoline_record: args.trampoline_record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RandomizationModeArg {
    BlockLevel,
    UnitLevel,
}

impl From<RandomizationModeArg> for RandomizationMode {
    fn from(arg: RandomizationModeArg) -> Self {
        match arg {
            RandomizationModeArg::BlockLevel => RandomizationMode::BlockLevel,
            RandomizationModeArg::UnitLevel => RandomizationMode::UnitLevel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShadowStackTypeArg {
    Offset,
    Seg,
    SegPp,
}

impl From<ShadowStackTypeArg> for ShadowStackType {
    fn from(arg: ShadowStackTypeArg) -> Self {
        match arg {
            ShadowStackTypeArg::Offset => ShadowStackType::Offset,
            ShadowStackTypeArg::Seg => ShadowStackType::Seg,
            ShadowStackTypeArg::SegPp => ShadowStackType::SegPp,
        }
    }
}
