//! CPU share and memory resource types.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::accounting::ResourceArgs;
use crate::error::{CoreError, CoreResult};
use crate::params::RawParams;
use crate::units::parse_bytes;

/// Float comparisons on cpu counts tolerate accumulated rounding.
pub const CPU_EPSILON: f64 = 1e-9;

/// Order core ids numerically when both parse, otherwise lexicographically.
pub fn cmp_core_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Core id to share pieces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuMap(BTreeMap<String, i64>);

impl CpuMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pieces(&self, core: &str) -> i64 {
        self.0.get(core).copied().unwrap_or(0)
    }

    pub fn total_pieces(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn add(&mut self, other: &CpuMap) {
        for (core, pieces) in &other.0 {
            *self.0.entry(core.clone()).or_insert(0) += pieces;
        }
    }

    pub fn sub(&mut self, other: &CpuMap) {
        for (core, pieces) in &other.0 {
            *self.0.entry(core.clone()).or_insert(0) -= pieces;
        }
    }

    /// Core ids in natural order.
    pub fn sorted_cores(&self) -> Vec<&str> {
        let mut cores: Vec<&str> = self.0.keys().map(String::as_str).collect();
        cores.sort_by(|a, b| cmp_core_ids(a, b));
        cores
    }
}

impl Deref for CpuMap {
    type Target = BTreeMap<String, i64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for CpuMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>> FromIterator<(K, i64)> for CpuMap {
    fn from_iter<I: IntoIterator<Item = (K, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Core id to NUMA node id.
pub type Numa = BTreeMap<String, String>;

/// NUMA node id to bytes.
pub type NumaMemory = BTreeMap<String, i64>;

fn add_numa_memory(target: &mut NumaMemory, delta: &NumaMemory) {
    for (node, bytes) in delta {
        *target.entry(node.clone()).or_insert(0) += bytes;
    }
}

fn sub_numa_memory(target: &mut NumaMemory, delta: &NumaMemory) {
    for (node, bytes) in delta {
        *target.entry(node.clone()).or_insert(0) -= bytes;
    }
}

/// Capacity or usage of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuMemArgs {
    pub cpu: f64,
    pub cpu_map: CpuMap,
    pub memory: i64,
    pub numa_memory: NumaMemory,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub numa: Numa,
}

impl CpuMemArgs {
    /// NUMA node ids in natural order.
    pub fn numa_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.numa.values().cloned().collect();
        nodes.sort_by(|a, b| cmp_core_ids(a, b));
        nodes.dedup();
        nodes
    }
}

impl ResourceArgs for CpuMemArgs {
    fn add(&mut self, delta: &Self) {
        self.cpu += delta.cpu;
        self.cpu_map.add(&delta.cpu_map);
        self.memory += delta.memory;
        add_numa_memory(&mut self.numa_memory, &delta.numa_memory);
        for (core, node) in &delta.numa {
            self.numa.insert(core.clone(), node.clone());
        }
    }

    fn sub(&mut self, delta: &Self) {
        self.cpu -= delta.cpu;
        self.cpu_map.sub(&delta.cpu_map);
        self.memory -= delta.memory;
        sub_numa_memory(&mut self.numa_memory, &delta.numa_memory);
    }

    fn zeroed(&self) -> Self {
        Self {
            cpu: 0.0,
            cpu_map: self.cpu_map.keys().map(|k| (k.clone(), 0)).collect(),
            memory: 0,
            numa_memory: self.numa_memory.keys().map(|k| (k.clone(), 0)).collect(),
            numa: Numa::new(),
        }
    }

    fn fill_missing(&mut self, capacity: &Self) {
        for core in capacity.cpu_map.keys() {
            self.cpu_map.entry(core.clone()).or_insert(0);
        }
        for node in capacity.numa_memory.keys() {
            self.numa_memory.entry(node.clone()).or_insert(0);
        }
    }

    fn validate(capacity: &Self, usage: &Self) -> CoreResult<()> {
        if capacity.cpu_map.is_empty() {
            return Err(CoreError::InvalidCapacity);
        }
        if usage.cpu_map.keys().any(|k| !capacity.cpu_map.contains_key(k))
            || usage
                .numa_memory
                .keys()
                .any(|k| !capacity.numa_memory.contains_key(k))
        {
            return Err(CoreError::InvalidUsage);
        }

        if capacity.cpu < 0.0
            || usage.cpu < -CPU_EPSILON
            || usage.cpu > capacity.cpu + CPU_EPSILON
        {
            return Err(CoreError::InvalidCpu);
        }
        for (core, &total) in capacity.cpu_map.iter() {
            let used = usage.cpu_map.pieces(core);
            if total < 0 || used < 0 || used > total {
                return Err(CoreError::InvalidCpuMap);
            }
        }

        if capacity.memory < 0 || usage.memory < 0 || usage.memory > capacity.memory {
            return Err(CoreError::InvalidMemory);
        }

        if !capacity.numa.is_empty() {
            for core in capacity.cpu_map.keys() {
                match capacity.numa.get(core) {
                    Some(node) if capacity.numa_memory.contains_key(node) => {}
                    _ => return Err(CoreError::InvalidNuma),
                }
            }
        }
        for (node, &total) in &capacity.numa_memory {
            let used = usage.numa_memory.get(node).copied().unwrap_or(0);
            if total < 0 || used < 0 || used > total {
                return Err(CoreError::InvalidNumaMemory);
            }
        }

        Ok(())
    }

    fn prune_empty(capacity: &mut Self, usage: &mut Self) {
        let empty: Vec<String> = capacity
            .cpu_map
            .iter()
            .filter(|(core, total)| **total == 0 && usage.cpu_map.pieces(core) == 0)
            .map(|(core, _)| core.clone())
            .collect();
        for core in empty {
            capacity.cpu_map.remove(&core);
            usage.cpu_map.remove(&core);
            capacity.numa.remove(&core);
        }
        capacity.cpu = capacity.cpu_map.len() as f64;
    }
}

/// What one workload holds on its node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuMemWorkloadArgs {
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request: i64,
    pub memory_limit: i64,
    pub cpu_map: CpuMap,
    pub numa_memory: NumaMemory,
    pub numa_node: String,
}

impl CpuMemWorkloadArgs {
    /// Accumulate another workload into a running total.
    pub fn add(&mut self, other: &Self) {
        self.cpu_request += other.cpu_request;
        self.cpu_limit += other.cpu_limit;
        self.memory_request += other.memory_request;
        self.memory_limit += other.memory_limit;
        self.cpu_map.add(&other.cpu_map);
        add_numa_memory(&mut self.numa_memory, &other.numa_memory);
    }

    /// The node usage this workload accounts for.
    pub fn usage(&self) -> CpuMemArgs {
        CpuMemArgs {
            cpu: self.cpu_request,
            cpu_map: self.cpu_map.clone(),
            memory: self.memory_request,
            numa_memory: self.numa_memory.clone(),
            numa: Numa::new(),
        }
    }
}

/// Arguments handed to the container engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMemEngineArgs {
    pub cpu: f64,
    pub cpu_map: CpuMap,
    pub numa_node: String,
    pub memory: i64,
}

/// Workload request as entered by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuMemWorkloadOpts {
    pub cpu_bind: bool,
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub mem_request: i64,
    pub mem_limit: i64,
}

impl CpuMemWorkloadOpts {
    /// Recognised keys: `cpu-bind` (flag), `cpu-request`, `cpu-limit`, `cpu`
    /// (sets both), `memory-request`, `memory-limit`, `memory` (sets both).
    pub fn from_params(p: &RawParams) -> CoreResult<Self> {
        let mut opts = Self {
            cpu_bind: p.is_set("cpu-bind"),
            cpu_request: p.float("cpu-request"),
            cpu_limit: p.float("cpu-limit"),
            mem_request: size_param(p, "memory-request")?,
            mem_limit: size_param(p, "memory-limit")?,
        };
        if p.is_set("cpu") {
            opts.cpu_request = p.float("cpu");
            opts.cpu_limit = opts.cpu_request;
        }
        if p.is_set("memory") {
            opts.mem_request = size_param(p, "memory")?;
            opts.mem_limit = opts.mem_request;
        }
        Ok(opts)
    }

    /// Reject negatives and settle request/limit pairs.
    pub fn normalize(&mut self) -> CoreResult<()> {
        if self.cpu_request < 0.0 || self.cpu_limit < 0.0 {
            return Err(CoreError::InvalidCpu);
        }
        if self.mem_request < 0 || self.mem_limit < 0 {
            return Err(CoreError::InvalidMemory);
        }

        if self.cpu_request == 0.0 && self.cpu_limit > 0.0 {
            self.cpu_request = self.cpu_limit;
        }
        if self.cpu_limit == 0.0 && self.cpu_request > 0.0 {
            self.cpu_limit = self.cpu_request;
        }
        if self.cpu_limit < self.cpu_request {
            self.cpu_limit = self.cpu_request;
        }

        if self.mem_request == 0 && self.mem_limit > 0 {
            self.mem_request = self.mem_limit;
        }
        if self.mem_limit == 0 && self.mem_request > 0 {
            self.mem_limit = self.mem_request;
        }
        if self.mem_limit < self.mem_request {
            self.mem_limit = self.mem_request;
        }

        if self.cpu_bind {
            if self.cpu_limit <= 0.0 {
                return Err(CoreError::InvalidCpu);
            }
            self.cpu_request = self.cpu_limit;
        }
        Ok(())
    }

    /// Field-wise sum, used to turn a realloc delta into final opts.
    pub fn add(&mut self, other: &Self) {
        self.cpu_request += other.cpu_request;
        self.cpu_limit += other.cpu_limit;
        self.mem_request += other.mem_request;
        self.mem_limit += other.mem_limit;
    }
}

/// Node capacity as entered by an operator. `None` leaves a dimension
/// untouched when updating an existing node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuMemNodeOpts {
    pub cpu_map: Option<CpuMap>,
    pub memory: Option<i64>,
    pub numa: Option<Numa>,
    pub numa_memory: Option<NumaMemory>,
}

impl CpuMemNodeOpts {
    /// Recognised keys: `cpu` (`"4"` for four cores of `share` pieces, or
    /// `"0:100,1:100"`), `share`, `memory`, `numa-cpu` (one `"0,1"` entry
    /// per NUMA node), `numa-memory` (one size per NUMA node).
    pub fn from_params(p: &RawParams, share_base: i64) -> CoreResult<Self> {
        let mut opts = Self::default();

        if p.is_set("cpu") {
            let share = if p.is_set("share") {
                p.float("share") as i64
            } else {
                share_base
            };
            let layout = match p.string("cpu") {
                "" => format!("{}", p.float("cpu") as i64),
                s => s.to_string(),
            };
            opts.cpu_map = Some(parse_cpu_map(&layout, share)?);
        }

        if p.is_set("memory") {
            opts.memory = Some(size_param(p, "memory")?);
        }

        if let Some(groups) = p.string_slice("numa-cpu") {
            let mut numa = Numa::new();
            for (node, cores) in groups.iter().enumerate() {
                for core in cores.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    numa.insert(core.to_string(), node.to_string());
                }
            }
            opts.numa = Some(numa);
        }

        if let Some(sizes) = p.string_slice("numa-memory") {
            let mut numa_memory = NumaMemory::new();
            for (node, size) in sizes.iter().enumerate() {
                numa_memory.insert(node.to_string(), parse_bytes(size)?);
            }
            opts.numa_memory = Some(numa_memory);
        }

        Ok(opts)
    }

    /// Capacity described by these opts. Unset dimensions are empty and an
    /// unset NUMA memory is split evenly across the declared NUMA nodes.
    pub fn to_capacity(&self) -> CpuMemArgs {
        let cpu_map = self.cpu_map.clone().unwrap_or_default();
        let memory = self.memory.unwrap_or(0);
        let numa = self.numa.clone().unwrap_or_default();
        let numa_memory = match &self.numa_memory {
            Some(numa_memory) => numa_memory.clone(),
            None => even_numa_memory(&numa, memory),
        };
        CpuMemArgs {
            cpu: cpu_map.len() as f64,
            cpu_map,
            memory,
            numa_memory,
            numa,
        }
    }

    /// Fill unset dimensions from `current`.
    pub fn or_current(&self, current: &CpuMemArgs) -> Self {
        Self {
            cpu_map: Some(
                self.cpu_map
                    .clone()
                    .unwrap_or_else(|| current.cpu_map.clone()),
            ),
            memory: Some(self.memory.unwrap_or(current.memory)),
            numa: Some(self.numa.clone().unwrap_or_else(|| current.numa.clone())),
            numa_memory: match (&self.numa_memory, &self.numa) {
                (Some(numa_memory), _) => Some(numa_memory.clone()),
                (None, Some(_)) => None,
                (None, None) => Some(current.numa_memory.clone()),
            },
        }
    }
}

fn even_numa_memory(numa: &Numa, memory: i64) -> NumaMemory {
    let mut nodes: Vec<&String> = numa.values().collect();
    nodes.sort();
    nodes.dedup();
    if nodes.is_empty() {
        return NumaMemory::new();
    }
    let share = memory / nodes.len() as i64;
    nodes.into_iter().map(|n| (n.clone(), share)).collect()
}

fn size_param(p: &RawParams, key: &str) -> CoreResult<i64> {
    if !p.is_set(key) {
        return Ok(0);
    }
    match p.string(key) {
        "" => Ok(p.float(key) as i64),
        s => parse_bytes(s),
    }
}

/// `"4"` expands to cores `0..4` with `share` pieces each; otherwise a
/// comma list of `core:pieces`.
fn parse_cpu_map(layout: &str, share: i64) -> CoreResult<CpuMap> {
    let layout = layout.trim();
    if !layout.contains(':') {
        let count: i64 = layout
            .parse()
            .map_err(|_| CoreError::InvalidOption(format!("cpu: {layout}")))?;
        return Ok((0..count.max(0)).map(|i| (i.to_string(), share)).collect());
    }

    let mut cpu_map = CpuMap::new();
    for entry in layout.split(',').filter(|e| !e.trim().is_empty()) {
        let (core, pieces) = entry
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidOption(format!("cpu: {entry}")))?;
        let core = core.trim();
        if core.parse::<u64>().is_err() {
            return Err(CoreError::InvalidOption(format!("cpu id: {core}")));
        }
        let pieces: i64 = pieces
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidOption(format!("cpu pieces: {pieces}")))?;
        cpu_map.insert(core.to_string(), pieces);
    }
    Ok(cpu_map)
}
