//! Validated run configuration, lowered from the CLI surface (§6) or a
//! resumed checkpoint. Intentionally plain data: no parsing logic lives
//! here, only the invariants the rest of the crate relies on.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::SortStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub target: PathBuf,
    pub args: Vec<OsString>,
    pub seeds_dir: PathBuf,
    pub output_dir: PathBuf,
    pub duration: Option<Duration>,
    pub timeout: Duration,
    pub mem_limit_mb: Option<u64>,
    pub bitmap_size: usize,
    pub max_seed_size: usize,
    pub havoc_iterations: usize,
    pub seed_sort_strategy: SortStrategy,
    pub max_seeds: usize,
    pub max_seeds_memory: usize,
    pub stderr_max_len: usize,
    pub crash_info_max_len: usize,
    pub use_sandbox: bool,
    pub checkpoint_path: PathBuf,
    pub resume_from: Option<PathBuf>,
    pub splice_period: u64,
    pub log_interval: Duration,
    pub checkpoint_interval: Duration,
}

impl Config {
    /// Validates cross-field invariants not already enforced by clap's
    /// per-field parsers (range/choice checks live on the CLI struct).
    pub fn validate(&self) -> Result<()> {
        if self.bitmap_size == 0 {
            return Err(Error::Configuration("bitmap_size must be > 0".into()));
        }
        if self.max_seed_size == 0 {
            return Err(Error::Configuration("max_seed_size must be > 0".into()));
        }
        if self.max_seeds == 0 {
            return Err(Error::Configuration("max_seeds must be > 0".into()));
        }
        if self.splice_period == 0 {
            return Err(Error::Configuration("splice_period must be > 0".into()));
        }
        if !self.target.exists() {
            return Err(Error::Configuration(format!(
                "target binary {:?} does not exist",
                self.target
            )));
        }
        if let Some(resume) = &self.resume_from {
            if !resume.exists() {
                return Err(Error::Configuration(format!(
                    "resume_from checkpoint {resume:?} does not exist"
                )));
            }
        } else if !self.seeds_dir.exists() {
            return Err(Error::Configuration(format!(
                "seeds directory {:?} does not exist",
                self.seeds_dir
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            target: PathBuf::from("/bin/true"),
            args: vec![],
            seeds_dir: PathBuf::from("/tmp"),
            output_dir: PathBuf::from("/tmp/out"),
            duration: None,
            timeout: Duration::from_secs(1),
            mem_limit_mb: None,
            bitmap_size: 65536,
            max_seed_size: 1 << 20,
            havoc_iterations: 16,
            seed_sort_strategy: SortStrategy::Energy,
            max_seeds: 10_000,
            max_seeds_memory: 1 << 30,
            stderr_max_len: 4096,
            crash_info_max_len: 65536,
            use_sandbox: false,
            checkpoint_path: PathBuf::from("/tmp/out/checkpoints/checkpoint.json"),
            resume_from: None,
            splice_period: 4,
            log_interval: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn rejects_zero_bitmap_size() {
        let mut c = base_config();
        c.bitmap_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_missing_target() {
        let mut c = base_config();
        c.target = PathBuf::from("/no/such/binary");
        assert!(c.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        let c = base_config();
        assert!(c.validate().is_ok());
    }
}
