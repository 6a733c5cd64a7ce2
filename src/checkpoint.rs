//! JSON checkpoint schema (design §6): virgin bitmaps, monitor stats, and
//! the full seed corpus, enough to resume a run without repeating the
//! initial-seed dry run.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::bitmap::VirginMap;
use crate::error::{Error, Result};
use crate::monitor::MonitorStats;
use crate::scheduler::Seed;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct SeedRecord {
    pub data_b64: String,
    pub coverage_bits: u32,
    pub exec_time_us: u64,
    pub exec_count: u64,
    pub energy: f64,
    pub discovered_at_us: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub elapsed_s: u64,
    pub stats: MonitorStats,
    pub virgin_bits: String,
    pub virgin_crash: String,
    pub virgin_tmout: String,
    pub seeds: Vec<SeedRecord>,
    pub rng_state: u64,
    pub next_queue_seq: u64,
}

impl Checkpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        elapsed_s: u64,
        stats: &MonitorStats,
        virgin_bits: &VirginMap,
        virgin_crash: &VirginMap,
        virgin_tmout: &VirginMap,
        seeds: &[Seed],
        rng_state: u64,
        next_queue_seq: u64,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            elapsed_s,
            stats: stats.clone(),
            virgin_bits: BASE64.encode(virgin_bits.as_slice()),
            virgin_crash: BASE64.encode(virgin_crash.as_slice()),
            virgin_tmout: BASE64.encode(virgin_tmout.as_slice()),
            seeds: seeds
                .iter()
                .map(|s| SeedRecord {
                    data_b64: BASE64.encode(&s.data),
                    coverage_bits: s.coverage_bits,
                    exec_time_us: s.exec_time_us,
                    exec_count: s.exec_count,
                    energy: s.energy,
                    discovered_at_us: s.discovered_at_us,
                })
                .collect(),
            rng_state,
            next_queue_seq,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::FilesystemSave {
                path: parent.to_owned(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| Error::FilesystemSave {
            path: path.to_owned(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| Error::Checkpoint {
            path: path.to_owned(),
            reason: source.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Checkpoint {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    pub fn decode_virgin_bits(&self) -> Result<VirginMap> {
        decode_virgin(&self.virgin_bits)
    }

    pub fn decode_virgin_crash(&self) -> Result<VirginMap> {
        decode_virgin(&self.virgin_crash)
    }

    pub fn decode_virgin_tmout(&self) -> Result<VirginMap> {
        decode_virgin(&self.virgin_tmout)
    }

    pub fn decode_seeds(&self) -> Result<Vec<(Vec<u8>, u32, u64, u64, u64)>> {
        self.seeds
            .iter()
            .map(|r| {
                let data = BASE64
                    .decode(&r.data_b64)
                    .map_err(|e| Error::Checkpoint {
                        path: Path::new("<checkpoint>").to_owned(),
                        reason: e.to_string(),
                    })?;
                Ok((data, r.coverage_bits, r.exec_time_us, r.exec_count, r.discovered_at_us))
            })
            .collect()
    }
}

fn decode_virgin(encoded: &str) -> Result<VirginMap> {
    let bytes = BASE64.decode(encoded).map_err(|e| Error::Checkpoint {
        path: Path::new("<checkpoint>").to_owned(),
        reason: e.to_string(),
    })?;
    Ok(VirginMap::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_virgin_bitmaps_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut virgin_bits = VirginMap::new(8);
        virgin_bits.has_new_bits(&[1, 0, 0, 0, 0, 0, 0, 0]);
        let virgin_crash = VirginMap::new(8);
        let virgin_tmout = VirginMap::new(8);

        let stats = MonitorStats {
            total_execs: 42,
            total_crashes: 1,
            saved_crashes: 1,
            total_hangs: 0,
            saved_hangs: 0,
            last_save_at_us: Some(1000),
        };

        let seeds = vec![Seed::new(b"abc".to_vec(), 3, 200, 10, true)];

        let checkpoint = Checkpoint::build(
            60,
            &stats,
            &virgin_bits,
            &virgin_crash,
            &virgin_tmout,
            &seeds,
            12345,
            7,
        );
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.stats.total_execs, 42);
        assert_eq!(loaded.next_queue_seq, 7);
        assert_eq!(loaded.rng_state, 12345);

        let loaded_virgin = loaded.decode_virgin_bits().unwrap();
        assert_eq!(loaded_virgin.as_slice(), virgin_bits.as_slice());

        let decoded_seeds = loaded.decode_seeds().unwrap();
        assert_eq!(decoded_seeds.len(), 1);
        assert_eq!(decoded_seeds[0].0, b"abc");
    }
}
