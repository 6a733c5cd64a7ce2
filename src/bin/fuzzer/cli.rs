//! CLI surface (design §4.9): the options enumerated in spec.md §6, derived
//! with `clap` and lowered into a validated [`greyfuzz::config::Config`].
//! This is deliberately thin — the out-of-scope "CLI parsing and
//! configuration schema loading" collaborator, present only so the crate is
//! runnable end to end.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use greyfuzz::config::Config;
use greyfuzz::scheduler::SortStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SeedSortStrategyArg {
    Energy,
    Fifo,
}

impl From<SeedSortStrategyArg> for SortStrategy {
    fn from(value: SeedSortStrategyArg) -> Self {
        match value {
            SeedSortStrategyArg::Energy => SortStrategy::Energy,
            SeedSortStrategyArg::Fifo => SortStrategy::Fifo,
        }
    }
}

/// A coverage-guided, mutational greybox fuzzer in the AFL/AFL++ tradition.
#[derive(Debug, Parser)]
#[command(name = "greyfuzz", author, version, about)]
pub struct Cli {
    /// Path to the instrumented target binary.
    #[arg(long)]
    pub target: PathBuf,

    /// Argv template passed to the target. Include the literal token `@@`
    /// to have the input staged to a temp file; otherwise input goes on
    /// stdin.
    #[arg(long, num_args = 0.., allow_hyphen_values = true)]
    pub args: Vec<OsString>,

    /// Directory of initial seed inputs.
    #[arg(long)]
    pub seeds: PathBuf,

    /// Output directory for queue/crashes/hangs/timeline/checkpoints.
    #[arg(long, default_value = "output")]
    pub output: PathBuf,

    /// Wall-clock duration to fuzz for, in seconds. Omit to run until
    /// interrupted.
    #[arg(long)]
    pub duration: Option<u64>,

    /// Per-execution wall-clock timeout, in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub timeout: f64,

    /// Per-process address-space limit, in MB. Omit for no limit.
    #[arg(long)]
    pub mem_limit: Option<u64>,

    /// Coverage bitmap size, in bytes.
    #[arg(long, default_value_t = 65536)]
    pub bitmap_size: usize,

    /// Maximum size of any seed or mutated input, in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    pub max_seed_size: usize,

    /// Number of stacked mutations per havoc round.
    #[arg(long, default_value_t = 16)]
    pub havoc_iterations: usize,

    /// Seed selection strategy.
    #[arg(long, value_enum, default_value_t = SeedSortStrategyArg::Energy)]
    pub seed_sort_strategy: SeedSortStrategyArg,

    /// Maximum number of seeds retained in the corpus.
    #[arg(long, default_value_t = 10_000)]
    pub max_seeds: usize,

    /// Maximum total bytes of seed data retained in the corpus.
    #[arg(long, default_value_t = 1 << 30)]
    pub max_seeds_memory: usize,

    /// Maximum captured stderr length, in bytes.
    #[arg(long, default_value_t = 4096)]
    pub stderr_max_len: usize,

    /// Maximum length of the sibling `.stderr` file saved with a crash.
    #[arg(long, default_value_t = 65536)]
    pub crash_info_max_len: usize,

    /// Run the target under a bubblewrap sandbox, if `bwrap` is available.
    #[arg(long, default_value_t = false)]
    pub use_sandbox: bool,

    /// Path to write periodic checkpoints to.
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    /// Resume a previous run from this checkpoint file.
    #[arg(long)]
    pub resume_from: Option<PathBuf>,

    /// Run `splice` instead of plain `havoc` every Nth iteration.
    #[arg(long, default_value_t = 4)]
    pub splice_period: u64,

    /// Seconds between timeline rows / stats.json flushes.
    #[arg(long, default_value_t = 5)]
    pub log_interval: u64,

    /// Seconds between checkpoint writes.
    #[arg(long, default_value_t = 60)]
    pub checkpoint_interval: u64,
}

impl Cli {
    pub fn into_config(self) -> greyfuzz::error::Result<Config> {
        let output_dir = self.output;
        let checkpoint_path = self
            .checkpoint_path
            .unwrap_or_else(|| output_dir.join("checkpoints").join("checkpoint.json"));

        let config = Config {
            target: self.target,
            args: self.args,
            seeds_dir: self.seeds,
            output_dir,
            duration: self.duration.map(Duration::from_secs),
            timeout: Duration::from_secs_f64(self.timeout),
            mem_limit_mb: self.mem_limit,
            bitmap_size: self.bitmap_size,
            max_seed_size: self.max_seed_size,
            havoc_iterations: self.havoc_iterations,
            seed_sort_strategy: self.seed_sort_strategy.into(),
            max_seeds: self.max_seeds,
            max_seeds_memory: self.max_seeds_memory,
            stderr_max_len: self.stderr_max_len,
            crash_info_max_len: self.crash_info_max_len,
            use_sandbox: self.use_sandbox,
            checkpoint_path,
            resume_from: self.resume_from,
            splice_period: self.splice_period,
            log_interval: Duration::from_secs(self.log_interval),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval),
        };
        config.validate()?;
        Ok(config)
    }
}
