//! Command-line configuration for the engine and the replay worker.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Calling convention used when invoking functions of the target library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CallConvention {
    /// The C calling convention.
    Cdecl,
    /// The platform's stdcall equivalent (x86 only; elsewhere treated as C).
    Stdcall,
}

/// Breadth knob for mutation scheduling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FuzzMode {
    /// One unit at a time.
    Sequential,
    /// All units advanced in lockstep.
    Simultaneous,
}

/// All engine options.
///
/// Components hold a reference to this struct and read the keys they need;
/// nothing is re-parsed after startup.
#[derive(Clone, Debug, Parser)]
#[command(name = "morpher", about = "Mutational API fuzzer for native shared libraries")]
pub struct MorpherOptions {
    /// Path to the target shared library.
    #[arg(long)]
    pub target: PathBuf,

    /// Path to the XML type model. Defaults to `<data>/model.xml`.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Path to the collection list: one `<exe> [args...]` line per host run.
    #[arg(long)]
    pub list: Option<PathBuf>,

    /// Skip the collection phase.
    #[arg(long, default_value_t = false)]
    pub skip_collector: bool,

    /// Skip the fuzzing phase.
    #[arg(long, default_value_t = false)]
    pub skip_fuzzer: bool,

    /// Wall-clock budget for one host-program run, in seconds.
    #[arg(long, default_value_t = 60)]
    pub collector_timeout: u64,

    /// Stack slot alignment of the target ABI, in bytes.
    #[arg(long, default_value_t = core::mem::size_of::<usize>())]
    pub stack_align: usize,

    /// Number of snapshots captured per function.
    #[arg(long, default_value_t = 3)]
    pub copy_limit: usize,

    /// Enforce the copy limit across all host runs instead of per run.
    #[arg(long, default_value_t = false)]
    pub global_limit: bool,

    /// Calling convention of the target library.
    #[arg(long, value_enum, default_value_t = CallConvention::Cdecl)]
    pub dll_type: CallConvention,

    /// Wall-clock budget for one replay, in seconds.
    #[arg(long, default_value_t = 30)]
    pub fuzzer_timeout: u64,

    /// Mutate pointer-typed values as well.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub fuzz_pointers: bool,

    /// Within one snapshot, fuzz tags one at a time or all at once.
    #[arg(long, value_enum, default_value_t = FuzzMode::Sequential)]
    pub snapshot_mode: FuzzMode,

    /// Across snapshots of a trace, proceed one at a time or in lockstep.
    #[arg(long, value_enum, default_value_t = FuzzMode::Sequential)]
    pub trace_mode: FuzzMode,

    /// Enable mutational value generation.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub mutational: bool,

    /// Neighborhood radius for mutational integer generation.
    #[arg(long, default_value_t = 5)]
    pub mutate_range: u32,

    /// Enable heuristic boundary values.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub heuristic: bool,

    /// Enable random value generation.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub random: bool,

    /// Number of random candidates per value.
    #[arg(long, default_value_t = 10)]
    pub random_cases: u32,

    /// Data directory holding traces and failure artifacts.
    #[arg(long, default_value = "data")]
    pub data: PathBuf,

    /// Directory holding auxiliary tools (including the replay worker).
    #[arg(long, default_value = "tools")]
    pub tools: PathBuf,

    /// Directory for log files.
    #[arg(long, default_value = "logs")]
    pub logs: PathBuf,
}

impl MorpherOptions {
    /// Whether the collection phase should run.
    #[must_use]
    pub fn collector_enabled(&self) -> bool {
        !self.skip_collector
    }

    /// Whether the fuzzing phase should run.
    #[must_use]
    pub fn fuzzer_enabled(&self) -> bool {
        !self.skip_fuzzer
    }

    /// Resolved path of the type model file.
    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.model
            .clone()
            .unwrap_or_else(|| self.data.join("model.xml"))
    }

    /// Directory holding the captured trace files.
    #[must_use]
    pub fn trace_dir(&self) -> PathBuf {
        self.data.join("traces")
    }

    /// Directory holding crash artifacts.
    #[must_use]
    pub fn crash_dir(&self) -> PathBuf {
        self.data.join("crashers")
    }

    /// Directory holding hang artifacts.
    #[must_use]
    pub fn hang_dir(&self) -> PathBuf {
        self.data.join("hangers")
    }
}

impl Default for MorpherOptions {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            model: None,
            list: None,
            skip_collector: false,
            skip_fuzzer: false,
            collector_timeout: 60,
            stack_align: core::mem::size_of::<usize>(),
            copy_limit: 3,
            global_limit: false,
            dll_type: CallConvention::Cdecl,
            fuzzer_timeout: 30,
            fuzz_pointers: true,
            snapshot_mode: FuzzMode::Sequential,
            trace_mode: FuzzMode::Sequential,
            mutational: true,
            mutate_range: 5,
            heuristic: true,
            random: false,
            random_cases: 10,
            data: PathBuf::from("data"),
            tools: PathBuf::from("tools"),
            logs: PathBuf::from("logs"),
        }
    }
}
