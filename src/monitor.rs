//! Coverage monitor: maintains the virgin-bits/virgin-crash/virgin-tmout
//! bitmaps, decides whether an execution produced new coverage, dedups
//! crashes and hangs, and persists interesting artifacts under `output/`.

use std::fs;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::xxh3_128;

use crate::bitmap::{classified, VirginMap};
use crate::error::{Error, Result};
use crate::executor::ExecutionResult;

/// Running counters, serialized into `stats.json`/`final_report.json`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MonitorStats {
    pub total_execs: u64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub last_save_at_us: Option<u64>,
}

pub struct Monitor {
    output_dir: PathBuf,
    virgin_bits: VirginMap,
    virgin_crash: VirginMap,
    virgin_tmout: VirginMap,
    stats: MonitorStats,
    next_queue_seq: u64,
    crash_info_max_len: usize,
}

impl Monitor {
    pub fn new(output_dir: PathBuf, bitmap_size: usize, crash_info_max_len: usize) -> Result<Self> {
        for sub in ["queue", "crashes", "hangs", "checkpoints"] {
            fs::create_dir_all(output_dir.join(sub)).map_err(|source| Error::FilesystemSave {
                path: output_dir.join(sub),
                source,
            })?;
        }
        Ok(Self {
            output_dir,
            virgin_bits: VirginMap::new(bitmap_size),
            virgin_crash: VirginMap::new(bitmap_size),
            virgin_tmout: VirginMap::new(bitmap_size),
            stats: MonitorStats::default(),
            next_queue_seq: 0,
            crash_info_max_len,
        })
    }

    /// Restores virgin bitmaps, counters, and the queue sequence counter
    /// from a loaded checkpoint.
    pub fn restore(
        &mut self,
        virgin_bits: VirginMap,
        virgin_crash: VirginMap,
        virgin_tmout: VirginMap,
        stats: MonitorStats,
        next_queue_seq: u64,
    ) {
        self.virgin_bits = virgin_bits;
        self.virgin_crash = virgin_crash;
        self.virgin_tmout = virgin_tmout;
        self.stats = stats;
        self.next_queue_seq = next_queue_seq;
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn virgin_bits(&self) -> &VirginMap {
        &self.virgin_bits
    }

    pub fn virgin_crash(&self) -> &VirginMap {
        &self.virgin_crash
    }

    pub fn virgin_tmout(&self) -> &VirginMap {
        &self.virgin_tmout
    }

    pub fn next_queue_seq(&self) -> u64 {
        self.next_queue_seq
    }

    pub fn coverage_bits(&mut self) -> u32 {
        self.virgin_bits.coverage_bits() as u32
    }

    /// §4.3: ingests one execution, returns `true` iff `input` should be
    /// appended to the scheduler's corpus (it produced coverage strictly new
    /// to `virgin_bits`). Crashes and hangs are saved here directly and
    /// never cause a scheduler insertion.
    pub fn process_execution(&mut self, input: &[u8], result: &ExecutionResult) -> bool {
        self.stats.total_execs += 1;

        let Some(snapshot) = result.coverage.as_ref() else {
            return false;
        };
        let bucketized = classified(snapshot);

        if result.hanged {
            self.stats.total_hangs += 1;
            if self.virgin_tmout.has_new_bits(&bucketized) {
                let key = dedup_key(&[], &bucketized);
                if self.save_artifact("hangs", &key, input, None) {
                    self.stats.saved_hangs += 1;
                }
            }
            return false;
        }

        if result.crashed {
            self.stats.total_crashes += 1;
            if self.virgin_crash.has_new_bits(&bucketized) {
                let key = dedup_key(&result.stderr, &bucketized);
                let truncated;
                let stderr_for_sibling = if result.stderr.is_empty() {
                    None
                } else {
                    let end = result.stderr.len().min(self.crash_info_max_len);
                    truncated = &result.stderr[..end];
                    Some(truncated)
                };
                if self.save_artifact("crashes", &key, input, stderr_for_sibling) {
                    self.stats.saved_crashes += 1;
                }
            }
            return false;
        }

        if self.virgin_bits.has_new_bits(&bucketized) {
            let seq = self.next_queue_seq;
            let name = format!("{seq:08}");
            if self.save_artifact("queue", &name, input, None) {
                self.next_queue_seq += 1;
                self.stats.last_save_at_us = Some(now_us());
                return true;
            }
        }
        false
    }

    /// Writes `input` under `<output_dir>/<subdir>/<name>`, and — when
    /// `sibling_stderr` is given — a `<name>.stderr` alongside it, truncated
    /// by the caller to `crash_info_max_len` before this is called. Returns
    /// `false` (logging, not propagating) on I/O failure, per §7's
    /// filesystem-save-error handling.
    fn save_artifact(&self, subdir: &str, name: &str, input: &[u8], sibling_stderr: Option<&[u8]>) -> bool {
        let path = self.output_dir.join(subdir).join(name);
        if let Err(source) = fs::write(&path, input) {
            log::error!("failed to save {subdir}/{name}: {source}");
            return false;
        }
        if let Some(stderr) = sibling_stderr {
            let stderr_path = self.output_dir.join(subdir).join(format!("{name}.stderr"));
            if let Err(source) = fs::write(&stderr_path, stderr) {
                log::error!("failed to save {subdir}/{name}.stderr: {source}");
            }
        }
        true
    }

    pub fn write_stats(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.stats)?;
        fs::write(path, json).map_err(|source| Error::FilesystemSave {
            path: path.to_owned(),
            source,
        })
    }
}

/// First 16 hex chars of a 128-bit hash of the trimmed stderr, falling back
/// to the bucketized bitmap when stderr is empty (§4.3).
fn dedup_key(stderr: &[u8], bucketized: &[u8]) -> String {
    let trimmed: &[u8] = {
        let start = stderr.iter().position(|b| !b.is_ascii_whitespace());
        let end = stderr.iter().rposition(|b| !b.is_ascii_whitespace());
        match (start, end) {
            (Some(s), Some(e)) => &stderr[s..=e],
            _ => &[],
        }
    };
    let hash = if trimmed.is_empty() {
        xxh3_128(bucketized)
    } else {
        xxh3_128(trimmed)
    };
    format!("{:016x}", (hash >> 64) as u64)
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
    use std::path::PathBuf;

    fn fake_result(coverage: Vec<u8>, crashed: bool, hanged: bool, stderr: Vec<u8>) -> ExecutionResult {
        ExecutionResult {
            exit_code: if crashed { 77 } else { 0 },
            signal: None,
            crashed,
            hanged,
            exec_time_us: 100,
            stdout: Vec::new(),
            stderr,
            coverage: Some(coverage),
        }
    }

    fn tmp_monitor() -> (Monitor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mon = Monitor::new(dir.path().to_owned(), 16, 65536).unwrap();
        (mon, dir)
    }

    #[test]
    fn new_coverage_triggers_save_and_queue_growth() {
        let (mut mon, _dir) = tmp_monitor();
        let mut cov = vec![0u8; 16];
        cov[0] = 1;
        let result = fake_result(cov, false, false, vec![]);
        assert!(mon.process_execution(b"input", &result));
        assert_eq!(mon.next_queue_seq(), 1);
        assert!(_dir.path().join("queue/00000000").exists());
    }

    #[test]
    fn repeated_coverage_is_not_new() {
        let (mut mon, _dir) = tmp_monitor();
        let mut cov = vec![0u8; 16];
        cov[0] = 1;
        let result = fake_result(cov.clone(), false, false, vec![]);
        assert!(mon.process_execution(b"a", &result));
        assert!(!mon.process_execution(b"b", &result));
        assert_eq!(mon.next_queue_seq(), 1);
    }

    #[test]
    fn duplicate_crash_saved_exactly_once() {
        let (mut mon, dir) = tmp_monitor();
        let mut cov = vec![0u8; 16];
        cov[1] = 2;
        let result = fake_result(cov, true, false, b"same stderr".to_vec());
        assert!(!mon.process_execution(b"crasher", &result));
        assert!(!mon.process_execution(b"crasher2", &result));
        assert_eq!(mon.stats().saved_crashes, 1);
        assert_eq!(mon.stats().total_crashes, 2);
        let crash_files: Vec<_> = fs::read_dir(dir.path().join("crashes"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().ends_with(".stderr"))
            .collect();
        assert_eq!(crash_files.len(), 1);
    }

    #[test]
    fn hang_and_crash_are_independent_dedup_spaces() {
        let (mut mon, _dir) = tmp_monitor();
        let mut cov = vec![0u8; 16];
        cov[2] = 3;
        let hang = fake_result(cov.clone(), false, true, vec![]);
        let crash = fake_result(cov, true, false, vec![]);
        assert!(!mon.process_execution(b"h", &hang));
        assert!(!mon.process_execution(b"c", &crash));
        assert_eq!(mon.stats().saved_hangs, 1);
        assert_eq!(mon.stats().saved_crashes, 1);
    }

    #[test]
    fn coverage_bits_matches_popcount_after_mutation() {
        let (mut mon, _dir) = tmp_monitor();
        let mut cov = vec![0u8; 16];
        cov[0] = 1;
        cov[1] = 2;
        let result = fake_result(cov, false, false, vec![]);
        mon.process_execution(b"x", &result);
        assert_eq!(mon.coverage_bits(), 2);
    }

    #[test]
    fn dedup_key_falls_back_to_bitmap_when_stderr_empty() {
        let bmp_a = vec![1u8, 0, 0];
        let bmp_b = vec![0u8, 1, 0];
        assert_ne!(dedup_key(&[], &bmp_a), dedup_key(&[], &bmp_b));
        assert_eq!(dedup_key(&[], &bmp_a), dedup_key(&[], &bmp_a));
    }

    #[test]
    fn dedup_key_trims_whitespace_before_hashing() {
        assert_eq!(
            dedup_key(b"  boom  \n", &[]),
            dedup_key(b"boom", &[])
        );
    }
}
