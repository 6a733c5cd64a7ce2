//! The fuzz loop: select → mutate → execute → classify → save, with
//! checkpointing, timeline recording, and graceful shutdown (design §4.6,
//! §5).

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorConfig};
use crate::monitor::Monitor;
use crate::mutator::{self, Strategy};
use crate::scheduler::Scheduler;

/// Shutdown signal state: two flags a process's signal handlers can set
/// directly via `signal_hook::flag::register`, polled only at loop
/// iteration boundaries (never inside `execute`). SIGINT takes priority
/// over SIGTERM if both somehow arrive between polls.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    sigint: Arc<AtomicBool>,
    sigterm: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            sigint: Arc::new(AtomicBool::new(false)),
            sigterm: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag a SIGINT handler should register against: finish the
    /// in-flight execution, write a checkpoint, flush the timeline, exit.
    pub fn sigint_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sigint)
    }

    /// The flag a SIGTERM handler should register against: same, but skip
    /// the checkpoint and write the final report.
    pub fn sigterm_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sigterm)
    }

    #[cfg(test)]
    fn request_with_checkpoint(&self) {
        self.sigint.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn request_without_checkpoint(&self) {
        self.sigterm.store(true, Ordering::SeqCst);
    }

    fn requested(&self) -> Option<bool> {
        if self.sigint.load(Ordering::SeqCst) {
            Some(true)
        } else if self.sigterm.load(Ordering::SeqCst) {
            Some(false)
        } else {
            None
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

struct Timeline {
    file: fs::File,
}

impl Timeline {
    fn new(path: &std::path::Path) -> Result<Self> {
        let is_new = !path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::FilesystemSave {
                path: path.to_owned(),
                source,
            })?;
        let mut this = Self { file };
        if is_new {
            let _ = writeln!(
                this.file,
                "elapsed_s,total_execs,exec_rate,total_crashes,saved_crashes,total_hangs,saved_hangs,coverage_bits"
            );
        }
        Ok(this)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        elapsed_s: u64,
        total_execs: u64,
        exec_rate: f64,
        total_crashes: u64,
        saved_crashes: u64,
        total_hangs: u64,
        saved_hangs: u64,
        coverage_bits: u32,
    ) {
        let _ = writeln!(
            self.file,
            "{elapsed_s},{total_execs},{exec_rate:.2},{total_crashes},{saved_crashes},{total_hangs},{saved_hangs},{coverage_bits}"
        );
    }
}

pub struct FuzzLoop {
    config: Config,
    executor: Executor,
    monitor: Monitor,
    scheduler: Scheduler,
    rng: StdRng,
    shutdown: ShutdownFlag,
    timeline: Timeline,
    rng_seed: u64,
}

impl FuzzLoop {
    pub fn new(config: Config, shutdown: ShutdownFlag) -> Result<Self> {
        let executor = Executor::new(ExecutorConfig {
            target: config.target.clone(),
            args: config.args.clone(),
            bitmap_size: config.bitmap_size,
            timeout: config.timeout,
            mem_limit_mb: config.mem_limit_mb,
            stderr_max_len: config.stderr_max_len,
            use_sandbox: config.use_sandbox,
        })?;
        let monitor = Monitor::new(config.output_dir.clone(), config.bitmap_size, config.crash_info_max_len)?;
        let scheduler = Scheduler::new(config.seed_sort_strategy, config.max_seeds, config.max_seeds_memory);
        let timeline = Timeline::new(&config.output_dir.join("timeline.csv"))?;
        let rng_seed: u64 = rand::thread_rng().gen();

        let mut this = Self {
            config,
            executor,
            monitor,
            scheduler,
            rng: StdRng::seed_from_u64(rng_seed),
            shutdown,
            timeline,
            rng_seed,
        };

        if let Some(resume_path) = this.config.resume_from.clone() {
            this.resume_from_checkpoint(&resume_path)?;
        } else {
            this.load_initial_seeds()?;
        }

        Ok(this)
    }

    /// §4.6 initialization: loads every file under `seeds_dir`, rejecting
    /// oversized ones, and executes each once to populate `coverage_bits`
    /// and `exec_time_us` before scheduler insertion. Does not checkpoint.
    fn load_initial_seeds(&mut self) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.config.seeds_dir)
            .map_err(|source| Error::FilesystemSave {
                path: self.config.seeds_dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        if entries.is_empty() {
            return Err(Error::Configuration(format!(
                "no seed files found under {:?}",
                self.config.seeds_dir
            )));
        }

        for path in entries {
            let data = fs::read(&path).map_err(|source| Error::FilesystemSave {
                path: path.clone(),
                source,
            })?;
            if data.len() > self.config.max_seed_size {
                log::warn!("skipping oversized seed {path:?} ({} bytes)", data.len());
                continue;
            }
            let result = self.executor.execute(&data)?;
            let coverage_bits = result
                .coverage
                .as_ref()
                .map(|snap| crate::bitmap::seed_bitmap_size(snap))
                .unwrap_or(0);
            self.scheduler
                .add_initial_seed(data, coverage_bits, result.exec_time_us, now_us())?;
        }
        Ok(())
    }

    fn resume_from_checkpoint(&mut self, path: &std::path::Path) -> Result<()> {
        let checkpoint = Checkpoint::load(path)?;
        let virgin_bits = checkpoint.decode_virgin_bits()?;
        let virgin_crash = checkpoint.decode_virgin_crash()?;
        let virgin_tmout = checkpoint.decode_virgin_tmout()?;
        self.monitor.restore(
            virgin_bits,
            virgin_crash,
            virgin_tmout,
            checkpoint.stats.clone(),
            checkpoint.next_queue_seq,
        );
        self.rng = StdRng::seed_from_u64(checkpoint.rng_state);
        self.rng_seed = checkpoint.rng_state;
        for (data, coverage_bits, exec_time_us, exec_count, discovered_at_us) in checkpoint.decode_seeds()? {
            self.scheduler
                .add_seed_resumed(data, coverage_bits, exec_time_us, exec_count, discovered_at_us);
        }
        Ok(())
    }

    /// Main iteration (§4.6), until `duration` elapses or a shutdown signal
    /// is handled. Returns the process exit code the binary should use.
    pub fn run(mut self) -> Result<i32> {
        let run_start = Instant::now();
        let mut last_log = Instant::now();
        let mut last_checkpoint = Instant::now();
        let mut iterations_since_splice = 0u64;

        loop {
            if let Some(save_checkpoint) = self.shutdown.requested() {
                return self.shutdown_cleanly(run_start, save_checkpoint);
            }
            if let Some(duration) = self.config.duration {
                if run_start.elapsed() >= duration {
                    break;
                }
            }
            if self.scheduler.is_empty() {
                log::warn!("scheduler has no seeds left; stopping");
                break;
            }

            let seed_index = self.scheduler.select_next().expect("non-empty scheduler");
            let base = self.scheduler.seed_data(seed_index).to_vec();

            iterations_since_splice += 1;
            let use_splice = iterations_since_splice % self.config.splice_period == 0;

            let variant = if use_splice {
                match self.scheduler.splice_partner(seed_index, &mut self.rng) {
                    Some(partner_index) => {
                        let partner = self.scheduler.seed_data(partner_index).to_vec();
                        mutator::splice(
                            &base,
                            &partner,
                            self.config.havoc_iterations,
                            self.config.max_seed_size,
                            &mut self.rng,
                        )
                    }
                    None => mutator::havoc(
                        &base,
                        self.config.havoc_iterations,
                        self.config.max_seed_size,
                        &mut self.rng,
                    ),
                }
            } else {
                mutator::mutate(
                    &base,
                    Strategy::havoc(self.config.havoc_iterations),
                    self.config.max_seed_size,
                    None,
                    &mut self.rng,
                )
            };

            let result = self.executor.execute(&variant)?;
            let is_new = self.monitor.process_execution(&variant, &result);
            if is_new {
                let coverage_bits = result
                    .coverage
                    .as_ref()
                    .map(|snap| crate::bitmap::seed_bitmap_size(snap))
                    .unwrap_or(0);
                self.scheduler.add_seed(variant, coverage_bits, result.exec_time_us, now_us());
            }

            if last_log.elapsed() >= self.config.log_interval {
                self.record_timeline(run_start);
                last_log = Instant::now();
            }
            if last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                self.save_checkpoint(run_start.elapsed().as_secs())?;
                last_checkpoint = Instant::now();
            }
        }

        self.record_timeline(run_start);
        self.write_final_report(run_start.elapsed().as_secs())?;
        Ok(0)
    }

    fn shutdown_cleanly(mut self, run_start: Instant, save_checkpoint: bool) -> Result<i32> {
        self.record_timeline(run_start);
        if save_checkpoint {
            self.save_checkpoint(run_start.elapsed().as_secs())?;
        } else {
            self.write_final_report(run_start.elapsed().as_secs())?;
        }
        Ok(0)
    }

    fn record_timeline(&mut self, run_start: Instant) {
        let elapsed_s = run_start.elapsed().as_secs();
        let stats = self.monitor.stats().clone();
        let exec_rate = if elapsed_s > 0 {
            stats.total_execs as f64 / elapsed_s as f64
        } else {
            0.0
        };
        let coverage_bits = self.monitor.coverage_bits();
        self.timeline.record(
            elapsed_s,
            stats.total_execs,
            exec_rate,
            stats.total_crashes,
            stats.saved_crashes,
            stats.total_hangs,
            stats.saved_hangs,
            coverage_bits,
        );
        let _ = self.monitor.write_stats(&self.config.output_dir.join("stats.json"));
    }

    fn save_checkpoint(&mut self, elapsed_s: u64) -> Result<()> {
        let checkpoint = Checkpoint::build(
            elapsed_s,
            self.monitor.stats(),
            self.monitor.virgin_bits(),
            self.monitor.virgin_crash(),
            self.monitor.virgin_tmout(),
            self.scheduler.seeds(),
            self.rng_seed,
            self.monitor.next_queue_seq(),
        );
        if let Err(e) = checkpoint.save(&self.config.checkpoint_path) {
            log::error!("checkpoint write failed: {e}");
        }
        Ok(())
    }

    fn write_final_report(&self, elapsed_s: u64) -> Result<()> {
        let report = serde_json::json!({
            "elapsed_s": elapsed_s,
            "stats": self.monitor.stats(),
            "target": self.config.target,
            "seeds_in_corpus": self.scheduler.len(),
        });
        let path = self.config.output_dir.join("final_report.json");
        fs::write(&path, serde_json::to_vec_pretty(&report)?).map_err(|source| Error::FilesystemSave {
            path,
            source,
        })
    }
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_defaults_to_running() {
        let flag = ShutdownFlag::new();
        assert!(flag.requested().is_none());
    }

    #[test]
    fn sigint_requests_checkpointed_shutdown() {
        let flag = ShutdownFlag::new();
        flag.request_with_checkpoint();
        assert_eq!(flag.requested(), Some(true));
    }

    #[test]
    fn sigterm_requests_shutdown_without_checkpoint() {
        let flag = ShutdownFlag::new();
        flag.request_without_checkpoint();
        assert_eq!(flag.requested(), Some(false));
    }
}
