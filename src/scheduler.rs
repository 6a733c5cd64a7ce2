//! Seed corpus and energy-based scheduler.
//!
//! Saved inputs live in an append-only `Vec<Seed>`; a parallel max-heap keyed
//! on energy gives O(log n) selection. Energy follows AFL's
//! `calculate_score` approximation (design §4.5): a base derived from how
//! this seed's exec time and coverage compare to the corpus running means,
//! decayed by how many times it has already been selected.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;

use crate::error::{Error, Result};

const MIN_ENERGY: f64 = 1.0;
const MAX_ENERGY: f64 = 1600.0;

/// A saved corpus entry. `data` never changes after construction; `exec_count`
/// and `energy` mutate only through the scheduler.
#[derive(Debug, Clone)]
pub struct Seed {
    pub data: Vec<u8>,
    pub coverage_bits: u32,
    pub exec_time_us: u64,
    pub exec_count: u64,
    pub energy: f64,
    pub discovered_at_us: u64,
    initial: bool,
}

impl Seed {
    pub fn new(
        data: Vec<u8>,
        coverage_bits: u32,
        exec_time_us: u64,
        discovered_at_us: u64,
        initial: bool,
    ) -> Self {
        Self {
            data,
            coverage_bits,
            exec_time_us,
            exec_count: 0,
            energy: MIN_ENERGY,
            discovered_at_us,
            initial,
        }
    }
}

/// Running means used by the energy formula, updated incrementally on every
/// add and every selection so no full corpus pass is ever needed.
#[derive(Debug, Clone, Copy, Default)]
struct RunningMeans {
    exec_time_sum: f64,
    cov_sum: f64,
    samples: f64,
}

impl RunningMeans {
    fn observe(&mut self, exec_time_us: u64, coverage_bits: u32) {
        self.exec_time_sum += exec_time_us as f64;
        self.cov_sum += coverage_bits as f64;
        self.samples += 1.0;
    }

    fn mean_exec_time(&self) -> f64 {
        if self.samples == 0.0 {
            0.0
        } else {
            self.exec_time_sum / self.samples
        }
    }

    fn mean_coverage(&self) -> f64 {
        if self.samples == 0.0 {
            0.0
        } else {
            self.cov_sum / self.samples
        }
    }
}

/// AFL's `calculate_score`, as approximated in design §4.5.
fn calculate_energy(
    exec_time_us: u64,
    coverage_bits: u32,
    exec_count: u64,
    means: &RunningMeans,
) -> f64 {
    let exec_time = exec_time_us as f64;
    let cov = coverage_bits as f64;
    let mu_t = means.mean_exec_time();
    let mu_c = means.mean_coverage();

    let mut base = if mu_t > 0.0 && exec_time * 4.0 < mu_t {
        300.0
    } else if mu_t > 0.0 && exec_time * 2.0 < mu_t {
        200.0
    } else if mu_t > 0.0 && exec_time < mu_t {
        150.0
    } else if mu_t > 0.0 && exec_time * 2.0 > mu_t {
        75.0
    } else if mu_t > 0.0 && exec_time * 4.0 > mu_t {
        50.0
    } else {
        100.0
    };

    if mu_c > 0.0 && cov * 0.3 > mu_c {
        base *= 3.0;
    } else if mu_c > 0.0 && cov * 0.5 > mu_c {
        base *= 2.0;
    } else if mu_c > 0.0 && cov * 0.75 > mu_c {
        base *= 1.5;
    } else if mu_c > 0.0 && cov < mu_c * 0.25 {
        base *= 0.25;
    } else if mu_c > 0.0 && cov < mu_c * 0.5 {
        base *= 0.5;
    } else if mu_c > 0.0 && cov < mu_c * 0.75 {
        base *= 0.75;
    }

    base /= 1.0 + 0.2 * exec_count as f64;
    base.clamp(MIN_ENERGY, MAX_ENERGY)
}

/// A heap entry: just enough to order by energy and look the seed back up by
/// index. The corpus `Vec<Seed>` is the sole owner of seed data.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    energy: f64,
    index: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.energy
            .partial_cmp(&other.energy)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Seed-sort strategy, as exposed on the CLI (`seed_sort_strategy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    Energy,
    Fifo,
}

/// Priority queue over saved seeds, bounded by count and total data bytes.
pub struct Scheduler {
    seeds: Vec<Seed>,
    heap: BinaryHeap<HeapEntry>,
    fifo: VecDeque<usize>,
    strategy: SortStrategy,
    means: RunningMeans,
    max_seeds: usize,
    max_seeds_memory: usize,
    total_bytes: usize,
}

impl Scheduler {
    pub fn new(strategy: SortStrategy, max_seeds: usize, max_seeds_memory: usize) -> Self {
        Self {
            seeds: Vec::new(),
            heap: BinaryHeap::new(),
            fifo: VecDeque::new(),
            strategy,
            means: RunningMeans::default(),
            max_seeds,
            max_seeds_memory,
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    /// Loads an initial (never-evicted) seed. Per design §9(a): if the
    /// initial corpus alone already exceeds `max_seeds`, this is a
    /// configuration error raised at startup rather than a silent eviction.
    pub fn add_initial_seed(
        &mut self,
        data: Vec<u8>,
        coverage_bits: u32,
        exec_time_us: u64,
        discovered_at_us: u64,
    ) -> Result<()> {
        if self.seeds.len() >= self.max_seeds {
            return Err(Error::Configuration(format!(
                "initial seed corpus ({} seeds) already meets or exceeds max_seeds ({}); \
                 raise max_seeds or trim the seed directory",
                self.seeds.len() + 1,
                self.max_seeds
            )));
        }
        self.insert(Seed::new(data, coverage_bits, exec_time_us, discovered_at_us, true));
        Ok(())
    }

    /// Restores a seed from a loaded checkpoint, preserving its exact
    /// `exec_count`/`energy`/`discovered_at_us` rather than recomputing them
    /// from scratch. Treated as never-evicted, matching the corpus the
    /// checkpoint was taken from; the checkpoint schema does not carry an
    /// "initial" flag (design §6), so this is the conservative choice.
    pub fn add_seed_resumed(
        &mut self,
        data: Vec<u8>,
        coverage_bits: u32,
        exec_time_us: u64,
        exec_count: u64,
        discovered_at_us: u64,
    ) {
        self.means.observe(exec_time_us, coverage_bits);
        let energy = calculate_energy(exec_time_us, coverage_bits, exec_count, &self.means);
        let seed = Seed {
            data,
            coverage_bits,
            exec_time_us,
            exec_count,
            energy,
            discovered_at_us,
            initial: true,
        };
        self.total_bytes += seed.data.len();
        let index = self.seeds.len();
        self.seeds.push(seed);
        match self.strategy {
            SortStrategy::Energy => self.heap.push(HeapEntry {
                energy: self.seeds[index].energy,
                index,
            }),
            SortStrategy::Fifo => self.fifo.push_back(index),
        }
    }

    /// Adds a newly discovered seed, evicting the lowest-energy non-initial
    /// seed if this push exceeds `max_seeds` or `max_seeds_memory`.
    pub fn add_seed(
        &mut self,
        data: Vec<u8>,
        coverage_bits: u32,
        exec_time_us: u64,
        discovered_at_us: u64,
    ) {
        self.insert(Seed::new(data, coverage_bits, exec_time_us, discovered_at_us, false));
        self.enforce_capacity();
    }

    fn insert(&mut self, mut seed: Seed) {
        self.means.observe(seed.exec_time_us, seed.coverage_bits);
        seed.energy = calculate_energy(seed.exec_time_us, seed.coverage_bits, seed.exec_count, &self.means);
        self.total_bytes += seed.data.len();
        let index = self.seeds.len();
        self.seeds.push(seed);
        match self.strategy {
            SortStrategy::Energy => self.heap.push(HeapEntry {
                energy: self.seeds[index].energy,
                index,
            }),
            SortStrategy::Fifo => self.fifo.push_back(index),
        }
    }

    fn enforce_capacity(&mut self) {
        while self.seeds.len() > self.max_seeds || self.total_bytes > self.max_seeds_memory {
            match self.min_energy_non_initial_index() {
                Some(_) => self.evict_min_energy_non_initial(),
                None => break,
            }
        }
    }

    fn min_energy_non_initial_index(&self) -> Option<usize> {
        self.seeds
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.initial)
            .min_by(|(_, a), (_, b)| a.energy.partial_cmp(&b.energy).unwrap_or(Ordering::Equal))
            .map(|(i, _)| i)
    }

    /// Removes the lowest-energy non-initial seed, compacting indices. The
    /// heap/fifo are rebuilt, which is O(n) but eviction is rare relative to
    /// selection.
    fn evict_min_energy_non_initial(&mut self) {
        let Some(victim) = self.min_energy_non_initial_index() else {
            return;
        };
        let removed = self.seeds.remove(victim);
        self.total_bytes -= removed.data.len();
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.heap.clear();
        self.fifo.clear();
        for (index, seed) in self.seeds.iter().enumerate() {
            match self.strategy {
                SortStrategy::Energy => self.heap.push(HeapEntry {
                    energy: seed.energy,
                    index,
                }),
                SortStrategy::Fifo => self.fifo.push_back(index),
            }
        }
    }

    /// Pops the highest-energy (or, in fifo mode, oldest) seed, bumps its
    /// `exec_count`, recomputes its energy, and pushes it back. Returns the
    /// seed's index so callers can clone its data without holding a borrow
    /// across the mutation/execute step.
    pub fn select_next(&mut self) -> Option<usize> {
        if self.seeds.is_empty() {
            return None;
        }
        let index = match self.strategy {
            SortStrategy::Energy => {
                let top = self.heap.pop()?;
                top.index
            }
            SortStrategy::Fifo => {
                let index = self.fifo.pop_front()?;
                self.fifo.push_back(index);
                index
            }
        };
        let seed = &mut self.seeds[index];
        seed.exec_count += 1;
        seed.energy = calculate_energy(seed.exec_time_us, seed.coverage_bits, seed.exec_count, &self.means);
        if matches!(self.strategy, SortStrategy::Energy) {
            self.heap.push(HeapEntry {
                energy: seed.energy,
                index,
            });
        }
        Some(index)
    }

    pub fn seed_data(&self, index: usize) -> &[u8] {
        &self.seeds[index].data
    }

    /// A second parent for splice, distinct from `exclude` when more than
    /// one seed exists.
    pub fn splice_partner(&self, exclude: usize, rng: &mut impl rand::Rng) -> Option<usize> {
        if self.seeds.len() < 2 {
            return None;
        }
        loop {
            let candidate = rng.gen_range(0..self.seeds.len());
            if candidate != exclude {
                return Some(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn scheduler() -> Scheduler {
        Scheduler::new(SortStrategy::Energy, 1000, 1 << 30)
    }

    #[test]
    fn select_next_round_trip_preserves_multiset() {
        let mut s = scheduler();
        s.add_initial_seed(b"a".to_vec(), 1, 100, 0).unwrap();
        s.add_initial_seed(b"bb".to_vec(), 2, 100, 0).unwrap();
        s.add_initial_seed(b"ccc".to_vec(), 3, 100, 0).unwrap();

        let mut before: Vec<Vec<u8>> = s.seeds().iter().map(|sd| sd.data.clone()).collect();
        before.sort();

        for _ in 0..10 {
            s.select_next().unwrap();
        }

        let mut after: Vec<Vec<u8>> = s.seeds().iter().map(|sd| sd.data.clone()).collect();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn energy_decays_monotonically_without_new_coverage() {
        let mut s = scheduler();
        s.add_initial_seed(b"seed".to_vec(), 10, 1000, 0).unwrap();
        let mut last = f64::MAX;
        for _ in 0..20 {
            let idx = s.select_next().unwrap();
            let e = s.seeds()[idx].energy;
            assert!(e <= last, "{e} should not exceed previous {last}");
            last = e;
        }
    }

    #[test]
    fn initial_seeds_are_never_evicted() {
        let mut s = Scheduler::new(SortStrategy::Energy, 2, 1 << 30);
        s.add_initial_seed(b"a".to_vec(), 1, 100, 0).unwrap();
        s.add_initial_seed(b"b".to_vec(), 1, 100, 0).unwrap();
        // Third initial seed would exceed max_seeds: configuration error.
        assert!(s.add_initial_seed(b"c".to_vec(), 1, 100, 0).is_err());
    }

    #[test]
    fn capacity_eviction_prefers_lowest_energy_non_initial() {
        let mut s = Scheduler::new(SortStrategy::Energy, 2, 1 << 30);
        s.add_initial_seed(b"init".to_vec(), 100, 100, 0).unwrap();
        s.add_seed(b"a".to_vec(), 1, 100, 1);
        s.add_seed(b"b".to_vec(), 1, 100, 2);
        assert_eq!(s.len(), 2);
        assert!(s.seeds().iter().any(|sd| sd.data == b"init"));
    }

    #[test]
    fn fifo_strategy_returns_in_insertion_order() {
        let mut s = Scheduler::new(SortStrategy::Fifo, 1000, 1 << 30);
        s.add_initial_seed(b"first".to_vec(), 1, 100, 0).unwrap();
        s.add_initial_seed(b"second".to_vec(), 1, 100, 0).unwrap();
        let first = s.select_next().unwrap();
        assert_eq!(s.seed_data(first), b"first");
        let second = s.select_next().unwrap();
        assert_eq!(s.seed_data(second), b"second");
    }

    #[test]
    fn splice_partner_excludes_self_when_possible() {
        let mut s = scheduler();
        s.add_initial_seed(b"a".to_vec(), 1, 100, 0).unwrap();
        s.add_initial_seed(b"b".to_vec(), 1, 100, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let partner = s.splice_partner(0, &mut rng).unwrap();
        assert_ne!(partner, 0);
    }
}
