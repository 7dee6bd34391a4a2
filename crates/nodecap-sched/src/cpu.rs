//! CPU core binding scheduler.
//!
//! A request of `r` cores is `round(r * share_base)` pieces: some whole
//! cores plus at most one fragment. Each plan takes:
//!
//! 1. a fragment donor: affinity cores first, then already fragmented cores
//!    with the fewest free pieces, then the rest by core id,
//! 2. whole-core donors among the remaining cores with a full share free,
//!    affinity cores first, then by core id.
//!
//! A fragment donor is rejected when it would push the node past
//! `max_fragment_cores` fragmented cores. With NUMA declared, each NUMA node
//! is tried in order before falling back to a plan spanning nodes.

use std::collections::BTreeSet;

use nodecap_core::SchedulerConfig;
use nodecap_core::cpumem::{CpuMap, CpuMemArgs, NumaMemory, cmp_core_ids};
use tracing::debug;

/// Per-replica demand.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuRequest {
    /// Cores, fractional.
    pub cpu: f64,
    /// Bytes.
    pub memory: i64,
}

/// One replica's binding. `numa_node` is empty for plans spanning nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuPlan {
    pub cpu_map: CpuMap,
    pub numa_node: String,
}

/// Successive plans for `req` against `available`, at most `max_count`.
pub fn cpu_plans(
    available: &CpuMemArgs,
    req: CpuRequest,
    affinity: Option<&CpuMap>,
    config: &SchedulerConfig,
    max_count: usize,
) -> Vec<CpuPlan> {
    let pieces = (req.cpu * config.share_base as f64).round() as i64;
    if pieces <= 0 || config.share_base <= 0 {
        return Vec::new();
    }

    let mut host = CpuHost::new(available, affinity, config);
    let mut plans = Vec::new();
    while plans.len() < max_count {
        match host.plan(pieces, req.memory) {
            Some(plan) => plans.push(plan),
            None => break,
        }
    }
    debug!(
        cpu = req.cpu,
        memory = req.memory,
        plans = plans.len(),
        "cpu plans computed"
    );
    plans
}

struct CpuHost<'a> {
    free: CpuMap,
    memory: i64,
    numa_memory: NumaMemory,
    available: &'a CpuMemArgs,
    affinity: BTreeSet<String>,
    share_base: i64,
    max_fragment_cores: i64,
}

impl<'a> CpuHost<'a> {
    fn new(available: &'a CpuMemArgs, affinity: Option<&CpuMap>, config: &SchedulerConfig) -> Self {
        let affinity = affinity
            .map(|a| {
                a.iter()
                    .filter(|(_, pieces)| **pieces > 0)
                    .map(|(core, _)| core.clone())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            free: available.cpu_map.clone(),
            memory: available.memory,
            numa_memory: available.numa_memory.clone(),
            available,
            affinity,
            share_base: config.share_base,
            max_fragment_cores: config.max_fragment_cores,
        }
    }

    fn plan(&mut self, pieces: i64, memory: i64) -> Option<CpuPlan> {
        if self.memory < memory {
            return None;
        }

        for node in self.available.numa_nodes() {
            if self.numa_memory.get(&node).copied().unwrap_or(0) < memory {
                continue;
            }
            let cores: Vec<String> = self
                .available
                .numa
                .iter()
                .filter(|(_, n)| **n == node)
                .map(|(core, _)| core.clone())
                .collect();
            if let Some(cpu_map) = self.pick(&cores, pieces) {
                *self.numa_memory.entry(node.clone()).or_insert(0) -= memory;
                return Some(self.commit(cpu_map, node, memory));
            }
        }

        let cores: Vec<String> = self.free.keys().cloned().collect();
        let cpu_map = self.pick(&cores, pieces)?;
        Some(self.commit(cpu_map, String::new(), memory))
    }

    fn commit(&mut self, cpu_map: CpuMap, numa_node: String, memory: i64) -> CpuPlan {
        self.free.sub(&cpu_map);
        self.memory -= memory;
        CpuPlan { cpu_map, numa_node }
    }

    fn is_fragmented(&self, free: i64) -> bool {
        free > 0 && free % self.share_base != 0
    }

    /// Affinity cores first, then natural id order.
    fn by_affinity(&self, a: &str, b: &str) -> std::cmp::Ordering {
        let (a_aff, b_aff) = (self.affinity.contains(a), self.affinity.contains(b));
        b_aff.cmp(&a_aff).then_with(|| cmp_core_ids(a, b))
    }

    fn pick(&self, cores: &[String], pieces: i64) -> Option<CpuMap> {
        let full = pieces / self.share_base;
        let fragment = pieces % self.share_base;

        let mut donors: Vec<&str> = cores
            .iter()
            .map(String::as_str)
            .filter(|c| self.free.pieces(c) >= self.share_base)
            .collect();
        donors.sort_by(|a, b| self.by_affinity(a, b));

        let take_full = |skip: Option<&str>| -> Option<CpuMap> {
            let chosen: Vec<&str> = donors
                .iter()
                .copied()
                .filter(|c| Some(*c) != skip)
                .take(full as usize)
                .collect();
            (chosen.len() as i64 == full)
                .then(|| chosen.into_iter().map(|c| (c, self.share_base)).collect())
        };

        if fragment == 0 {
            return take_full(None);
        }

        let fragmented_now = self
            .free
            .values()
            .filter(|free| self.is_fragmented(**free))
            .count() as i64;

        let mut candidates: Vec<&str> = cores
            .iter()
            .map(String::as_str)
            .filter(|c| self.free.pieces(c) >= fragment)
            .collect();
        candidates.sort_by(|a, b| {
            let (a_free, b_free) = (self.free.pieces(a), self.free.pieces(b));
            let rank = |core: &str, free: i64| {
                if self.affinity.contains(core) {
                    0
                } else if self.is_fragmented(free) {
                    1
                } else {
                    2
                }
            };
            let (a_rank, b_rank) = (rank(a, a_free), rank(b, b_free));
            a_rank.cmp(&b_rank).then_with(|| {
                if a_rank == 1 {
                    a_free.cmp(&b_free).then_with(|| cmp_core_ids(a, b))
                } else {
                    cmp_core_ids(a, b)
                }
            })
        });

        for candidate in candidates {
            let free = self.free.pieces(candidate);
            let after = fragmented_now - self.is_fragmented(free) as i64
                + self.is_fragmented(free - fragment) as i64;
            if self.max_fragment_cores >= 0 && after > self.max_fragment_cores {
                continue;
            }
            if let Some(mut cpu_map) = take_full(Some(candidate)) {
                cpu_map.insert(candidate.to_string(), fragment);
                return Some(cpu_map);
            }
        }
        None
    }
}
