//! CPU share and memory kind.

use std::collections::{BTreeMap, BTreeSet};

use nodecap_core::cpumem::{
    CPU_EPSILON, CpuMap, CpuMemArgs, CpuMemEngineArgs, CpuMemNodeOpts, CpuMemWorkloadArgs,
    CpuMemWorkloadOpts, NumaMemory, cmp_core_ids,
};
use nodecap_core::{CoreResult, RawParams, ResourceArgs, SchedulerConfig};
use nodecap_sched::{CpuPlan, CpuRequest, cpu_plans};

use crate::error::{PluginError, PluginResult};
use crate::kind::{
    Deploy, DeployOf, InfoOf, NodeCapacityInfo, Realloc, ReallocOf, ResourceKind, UNBOUNDED,
    ratio, used_ratio,
};

/// Without binding, capacity is bounded by memory; binding is bounded by
/// the CPU plans, so it weighs much more when capacities are combined.
const MEMORY_WEIGHT: i64 = 1;
const BIND_WEIGHT: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct CpuMemKind {
    config: SchedulerConfig,
}

impl CpuMemKind {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn plans(
        &self,
        available: &CpuMemArgs,
        opts: &CpuMemWorkloadOpts,
        affinity: Option<&CpuMap>,
        max_count: usize,
    ) -> Vec<CpuPlan> {
        let req = CpuRequest {
            cpu: opts.cpu_request,
            memory: opts.mem_request,
        };
        let max_count = max_count.min(cpu_headroom(available.cpu, opts.cpu_request));
        cpu_plans(available, req, affinity, &self.config, max_count)
    }

    /// Replicas that fit without binding.
    fn unbound_capacity(&self, info: &InfoOf<Self>, opts: &CpuMemWorkloadOpts) -> usize {
        if opts.cpu_request > info.capacity.cpu_map.len() as f64 {
            return 0;
        }
        let available = info.available();
        let capacity = if opts.mem_request == 0 {
            UNBOUNDED
        } else {
            (available.memory / opts.mem_request).max(0) as usize
        };
        capacity
            .min(cpu_headroom(available.cpu, opts.cpu_request))
            .min(self.config.max_deploy_count)
    }
}

/// Replicas of `request` cores that still fit in the node's CPU count.
fn cpu_headroom(available: f64, request: f64) -> usize {
    if request <= 0.0 {
        return UNBOUNDED;
    }
    ((available + CPU_EPSILON) / request).floor().max(0.0) as usize
}

fn engine_args(opts: &CpuMemWorkloadOpts, plan: Option<&CpuPlan>) -> CpuMemEngineArgs {
    CpuMemEngineArgs {
        cpu: opts.cpu_limit,
        cpu_map: plan.map(|p| p.cpu_map.clone()).unwrap_or_default(),
        numa_node: plan.map(|p| p.numa_node.clone()).unwrap_or_default(),
        memory: opts.mem_limit,
    }
}

fn workload_args(opts: &CpuMemWorkloadOpts, plan: Option<&CpuPlan>) -> CpuMemWorkloadArgs {
    let mut args = CpuMemWorkloadArgs {
        cpu_request: opts.cpu_request,
        cpu_limit: opts.cpu_limit,
        memory_request: opts.mem_request,
        memory_limit: opts.mem_limit,
        ..Default::default()
    };
    if let Some(plan) = plan {
        args.cpu_map = plan.cpu_map.clone();
        args.numa_node = plan.numa_node.clone();
        if !plan.numa_node.is_empty() {
            args.numa_memory = NumaMemory::from([(plan.numa_node.clone(), opts.mem_request)]);
        }
    }
    args
}

impl ResourceKind for CpuMemKind {
    const NAME: &'static str = "cpumem";

    type Args = CpuMemArgs;
    type NodeOpts = CpuMemNodeOpts;
    type WorkloadOpts = CpuMemWorkloadOpts;
    type WorkloadArgs = CpuMemWorkloadArgs;
    type EngineArgs = CpuMemEngineArgs;

    fn parse_node_opts(&self, params: &RawParams) -> CoreResult<CpuMemNodeOpts> {
        CpuMemNodeOpts::from_params(params, self.config.share_base)
    }

    fn parse_workload_opts(&self, params: &RawParams) -> CoreResult<CpuMemWorkloadOpts> {
        CpuMemWorkloadOpts::from_params(params)
    }

    fn capacity_from_opts(&self, opts: &CpuMemNodeOpts) -> CpuMemArgs {
        opts.to_capacity()
    }

    fn fill_node_opts(&self, opts: &CpuMemNodeOpts, current: &CpuMemArgs) -> CpuMemNodeOpts {
        opts.or_current(current)
    }

    fn normalize_opts(&self, opts: &mut CpuMemWorkloadOpts) -> CoreResult<()> {
        opts.normalize()
    }

    fn workload_usage(&self, args: &CpuMemWorkloadArgs) -> CpuMemArgs {
        args.usage()
    }

    fn node_capacity(
        &self,
        node: &str,
        info: &InfoOf<Self>,
        opts: &CpuMemWorkloadOpts,
    ) -> NodeCapacityInfo {
        if !opts.cpu_bind {
            return NodeCapacityInfo {
                node_name: node.to_string(),
                capacity: self.unbound_capacity(info, opts),
                usage: ratio(info.usage.memory as f64, info.capacity.memory as f64),
                rate: ratio(opts.mem_request as f64, info.capacity.memory as f64),
                weight: MEMORY_WEIGHT,
            };
        }

        let plans = self.plans(&info.available(), opts, None, self.config.max_deploy_count);
        NodeCapacityInfo {
            node_name: node.to_string(),
            capacity: plans.len(),
            usage: ratio(info.usage.cpu, info.capacity.cpu),
            rate: ratio(opts.cpu_request, info.capacity.cpu),
            weight: BIND_WEIGHT,
        }
    }

    fn alloc(
        &self,
        info: &InfoOf<Self>,
        count: usize,
        opts: &CpuMemWorkloadOpts,
    ) -> PluginResult<DeployOf<Self>> {
        let mut deploy = Deploy::default();

        if !opts.cpu_bind {
            if self.unbound_capacity(info, opts) < count {
                return Err(PluginError::InsufficientResource);
            }
            for _ in 0..count {
                deploy.engine_args.push(engine_args(opts, None));
                deploy.workload_args.push(workload_args(opts, None));
            }
            return Ok(deploy);
        }

        let plans = self.plans(&info.available(), opts, None, count);
        if plans.len() < count {
            return Err(PluginError::InsufficientResource);
        }
        for plan in &plans {
            deploy.engine_args.push(engine_args(opts, Some(plan)));
            deploy.workload_args.push(workload_args(opts, Some(plan)));
        }
        Ok(deploy)
    }

    fn realloc(
        &self,
        info: &InfoOf<Self>,
        origin: &CpuMemWorkloadArgs,
        opts: &CpuMemWorkloadOpts,
    ) -> PluginResult<ReallocOf<Self>> {
        let mut target = CpuMemWorkloadOpts {
            cpu_bind: opts.cpu_bind,
            cpu_request: origin.cpu_request,
            cpu_limit: origin.cpu_limit,
            mem_request: origin.memory_request,
            mem_limit: origin.memory_limit,
        };
        target.add(opts);
        target.normalize()?;

        let origin_usage = origin.usage();
        let mut available = info.available();
        available.add(&origin_usage);

        let plan = if target.cpu_bind {
            let plans = self.plans(&available, &target, Some(&origin.cpu_map), 1);
            let plan = plans
                .into_iter()
                .next()
                .ok_or(PluginError::InsufficientResource)?;
            Some(plan)
        } else {
            if target.cpu_request > info.capacity.cpu_map.len() as f64
                || cpu_headroom(available.cpu, target.cpu_request) < 1
                || target.mem_request > available.memory
            {
                return Err(PluginError::InsufficientResource);
            }
            None
        };

        let workload_args = workload_args(&target, plan.as_ref());
        let mut delta = workload_args.usage();
        delta.sub(&origin_usage);

        Ok(Realloc {
            engine_args: engine_args(&target, plan.as_ref()),
            delta,
            workload_args,
        })
    }

    /// Workloads without a binding float over every core that still has a
    /// full share free.
    fn remap(
        &self,
        info: &InfoOf<Self>,
        workloads: &BTreeMap<String, CpuMemWorkloadArgs>,
    ) -> BTreeMap<String, CpuMemEngineArgs> {
        let base = self.config.share_base;
        let available = info.available();
        let shared: CpuMap = available
            .cpu_map
            .iter()
            .filter(|(_, free)| **free >= base)
            .map(|(core, _)| (core.clone(), base))
            .collect();

        workloads
            .iter()
            .filter(|(_, args)| args.cpu_map.is_empty())
            .map(|(id, args)| {
                let engine = CpuMemEngineArgs {
                    cpu: args.cpu_limit,
                    cpu_map: shared.clone(),
                    numa_node: String::new(),
                    memory: args.memory_limit,
                };
                (id.clone(), engine)
            })
            .collect()
    }

    fn usage_diffs(&self, recorded: &CpuMemArgs, expected: &CpuMemArgs) -> Vec<String> {
        let mut diffs = Vec::new();

        if (recorded.cpu - expected.cpu).abs() > 1e-6 {
            diffs.push(format!(
                "node.CPUUsed != sum(workload.CPURequest): {:.2} != {:.2}",
                recorded.cpu, expected.cpu
            ));
        }

        let mut cores: Vec<&String> = recorded
            .cpu_map
            .keys()
            .chain(expected.cpu_map.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        cores.sort_by(|a, b| cmp_core_ids(a, b));
        for core in cores {
            let (have, want) = (recorded.cpu_map.pieces(core), expected.cpu_map.pieces(core));
            if have != want {
                diffs.push(format!(
                    "node.CPUMap[{core}] != sum(workload.CPUMap[{core}]): {have} != {want}"
                ));
            }
        }

        let nodes: BTreeSet<&String> = recorded
            .numa_memory
            .keys()
            .chain(expected.numa_memory.keys())
            .collect();
        for node in nodes {
            let have = recorded.numa_memory.get(node).copied().unwrap_or(0);
            let want = expected.numa_memory.get(node).copied().unwrap_or(0);
            if have != want {
                diffs.push(format!(
                    "node.NUMAMemory[{node}] != sum(workload.NUMAMemory[{node}]): {have} != {want}"
                ));
            }
        }

        if recorded.memory != expected.memory {
            diffs.push(format!(
                "node.MemUsed != sum(workload.MemoryRequest): {} != {}",
                recorded.memory, expected.memory
            ));
        }

        diffs
    }

    /// The busier of the two dimensions.
    fn usage_rate(&self, info: &InfoOf<Self>) -> f64 {
        let cpu = used_ratio(
            info.usage.cpu_map.total_pieces() as f64,
            info.capacity.cpu_map.total_pieces() as f64,
        );
        let memory = used_ratio(info.usage.memory as f64, info.capacity.memory as f64);
        cpu.max(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodecap_core::NodeResourceInfo;
    use nodecap_core::units::GIB;

    fn node(cores: usize, memory: i64) -> InfoOf<CpuMemKind> {
        NodeResourceInfo::new(CpuMemArgs {
            cpu: cores as f64,
            cpu_map: (0..cores).map(|i| (i.to_string(), 100)).collect(),
            memory,
            ..Default::default()
        })
    }

    fn bind(cpu: f64, memory: i64) -> CpuMemWorkloadOpts {
        let mut opts = CpuMemWorkloadOpts {
            cpu_bind: true,
            cpu_request: cpu,
            mem_request: memory,
            ..Default::default()
        };
        opts.normalize().unwrap();
        opts
    }

    #[test]
    fn unbound_capacity_follows_memory() {
        let kind = CpuMemKind::default();
        let info = node(4, 4 * GIB);

        let mut opts = CpuMemWorkloadOpts {
            cpu_request: 1.0,
            mem_request: GIB,
            ..Default::default()
        };
        opts.normalize().unwrap();
        let capacity = kind.node_capacity("n", &info, &opts);
        assert_eq!(capacity.capacity, 4);
        assert_eq!(capacity.weight, MEMORY_WEIGHT);
        assert_eq!(capacity.rate, 0.25);

        opts.cpu_request = 5.0;
        assert_eq!(kind.node_capacity("n", &info, &opts).capacity, 0);

        let opts = CpuMemWorkloadOpts::default();
        assert_eq!(
            kind.node_capacity("n", &info, &opts).capacity,
            SchedulerConfig::default().max_deploy_count
        );
    }

    #[test]
    fn unbound_capacity_counts_cpu_in_use() {
        let kind = CpuMemKind::default();
        let mut info = node(4, 10 * GIB);
        let mut opts = CpuMemWorkloadOpts {
            cpu_request: 3.0,
            mem_request: GIB,
            ..Default::default()
        };
        opts.normalize().unwrap();
        assert_eq!(kind.node_capacity("n", &info, &opts).capacity, 1);

        info.usage.cpu = 2.0;
        opts.cpu_request = 1.0;
        opts.cpu_limit = 1.0;
        assert_eq!(kind.node_capacity("n", &info, &opts).capacity, 2);
        assert!(matches!(
            kind.alloc(&info, 3, &opts),
            Err(PluginError::InsufficientResource)
        ));
    }

    #[test]
    fn bound_capacity_counts_plans() {
        let kind = CpuMemKind::default();
        let capacity = kind.node_capacity("n", &node(4, 4 * GIB), &bind(1.2, 0));
        assert_eq!(capacity.capacity, 3);
        assert_eq!(capacity.weight, BIND_WEIGHT);
        assert_eq!(capacity.rate, 0.3);
    }

    #[test]
    fn alloc_records_numa_memory() {
        let kind = CpuMemKind::default();
        let mut info = node(4, 4 * GIB);
        info.capacity.numa = [("0", "0"), ("1", "0"), ("2", "1"), ("3", "1")]
            .into_iter()
            .map(|(c, n)| (c.to_string(), n.to_string()))
            .collect();
        info.capacity.numa_memory = NumaMemory::from([("0".into(), 2 * GIB), ("1".into(), 2 * GIB)]);
        info.normalize();

        let deploy = kind.alloc(&info, 2, &bind(1.0, GIB)).unwrap();
        assert_eq!(deploy.workload_args.len(), 2);
        let first = &deploy.workload_args[0];
        assert_eq!(first.numa_node, "0");
        assert_eq!(first.numa_memory["0"], GIB);
        assert_eq!(deploy.engine_args[0].numa_node, "0");
        assert_eq!(deploy.engine_args[0].memory, GIB);

        assert!(matches!(
            kind.alloc(&info, 5, &bind(1.0, GIB)),
            Err(PluginError::InsufficientResource)
        ));
    }

    #[test]
    fn realloc_keeps_affinity() {
        let kind = CpuMemKind::default();
        let mut info = node(4, 4 * GIB);
        let deploy = kind.alloc(&info, 1, &bind(1.0, GIB)).unwrap();
        let origin = deploy.workload_args[0].clone();
        info.usage.add(&origin.usage());
        let bound_core = origin.cpu_map.sorted_cores()[0].to_string();

        let delta = CpuMemWorkloadOpts {
            cpu_bind: true,
            cpu_request: 1.0,
            cpu_limit: 1.0,
            ..Default::default()
        };
        let result = kind.realloc(&info, &origin, &delta).unwrap();
        assert_eq!(result.workload_args.cpu_request, 2.0);
        assert_eq!(result.workload_args.cpu_map.total_pieces(), 200);
        assert_eq!(result.workload_args.cpu_map.pieces(&bound_core), 100);
        assert_eq!(result.delta.cpu, 1.0);
        assert_eq!(result.delta.cpu_map.total_pieces(), 100);
        assert_eq!(result.delta.memory, 0);

        info.usage.add(&result.delta);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn realloc_unbound_checks_memory() {
        let kind = CpuMemKind::default();
        let mut info = node(2, 2 * GIB);
        let origin = CpuMemWorkloadArgs {
            cpu_request: 1.0,
            cpu_limit: 1.0,
            memory_request: GIB,
            memory_limit: GIB,
            ..Default::default()
        };
        info.usage.add(&origin.usage());

        let grow = CpuMemWorkloadOpts {
            mem_request: GIB,
            mem_limit: GIB,
            ..Default::default()
        };
        let result = kind.realloc(&info, &origin, &grow).unwrap();
        assert_eq!(result.delta.memory, GIB);
        assert_eq!(result.engine_args.memory, 2 * GIB);

        let too_much = CpuMemWorkloadOpts {
            mem_request: 2 * GIB,
            mem_limit: 2 * GIB,
            ..Default::default()
        };
        assert!(matches!(
            kind.realloc(&info, &origin, &too_much),
            Err(PluginError::InsufficientResource)
        ));
    }

    #[test]
    fn remap_shares_free_cores() {
        let kind = CpuMemKind::default();
        let mut info = node(3, GIB);
        info.usage.cpu_map.insert("1".into(), 50);

        let workloads = BTreeMap::from([
            (
                "floating".to_string(),
                CpuMemWorkloadArgs {
                    cpu_limit: 0.5,
                    memory_limit: 1024,
                    ..Default::default()
                },
            ),
            (
                "pinned".to_string(),
                CpuMemWorkloadArgs {
                    cpu_map: CpuMap::from_iter([("1", 50)]),
                    ..Default::default()
                },
            ),
        ]);
        let remapped = kind.remap(&info, &workloads);
        assert_eq!(remapped.len(), 1);
        let engine = &remapped["floating"];
        assert_eq!(engine.cpu_map, CpuMap::from_iter([("0", 100), ("2", 100)]));
        assert_eq!(engine.memory, 1024);
        assert!(engine.numa_node.is_empty());
    }

    #[test]
    fn diffs_name_each_mismatch() {
        let kind = CpuMemKind::default();
        let recorded = CpuMemArgs {
            cpu: 1.0,
            cpu_map: CpuMap::from_iter([("0", 100), ("1", 0)]),
            memory: GIB,
            ..Default::default()
        };
        let expected = CpuMemArgs {
            cpu: 1.5,
            cpu_map: CpuMap::from_iter([("0", 100), ("1", 50)]),
            memory: GIB,
            ..Default::default()
        };
        assert!(kind.usage_diffs(&recorded, &recorded).is_empty());
        let diffs = kind.usage_diffs(&recorded, &expected);
        assert_eq!(diffs.len(), 2);
        assert!(diffs[0].contains("1.00 != 1.50"));
        assert_eq!(diffs[1], "node.CPUMap[1] != sum(workload.CPUMap[1]): 0 != 50");
    }

    #[test]
    fn usage_rate_takes_busier_dimension() {
        let kind = CpuMemKind::default();
        let mut info = node(4, 4 * GIB);
        assert_eq!(kind.usage_rate(&info), 0.0);
        info.usage.cpu_map.insert("0".into(), 100);
        info.usage.memory = 2 * GIB;
        assert_eq!(kind.usage_rate(&info), 0.5);
    }
}
