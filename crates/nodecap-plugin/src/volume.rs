//! Block-device volume kind.

use std::collections::{BTreeMap, BTreeSet};

use nodecap_core::volume::{
    BindingKey, VolumeArgs, VolumeBinding, VolumeEngineArgs, VolumeMap, VolumeNodeOpts,
    VolumePlan, VolumeWorkloadArgs, VolumeWorkloadOpts, total_size,
};
use nodecap_core::{CoreResult, RawParams, SchedulerConfig};
use nodecap_sched::volume_plans;

use crate::error::{PluginError, PluginResult};
use crate::kind::{
    Deploy, DeployOf, InfoOf, NodeCapacityInfo, Realloc, ReallocOf, ResourceKind, ratio,
    used_ratio,
};

#[derive(Debug, Clone, Default)]
pub struct VolumeKind {
    config: SchedulerConfig,
}

impl VolumeKind {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

/// Limit bindings placed on the devices their request copies landed on.
fn limit_plan(opts: &VolumeWorkloadOpts, request_plan: &VolumePlan) -> VolumePlan {
    let limits: BTreeMap<BindingKey, &VolumeBinding> =
        opts.volumes_limit.iter().map(|b| (b.key(), b)).collect();

    let mut plan = VolumePlan::new();
    for (binding, map) in request_plan.iter() {
        let limit = limits.get(&binding.key()).copied().unwrap_or(binding);
        if let Some(device) = map.keys().next() {
            plan.insert(
                limit.clone(),
                VolumeMap::single(device.clone(), limit.size_in_bytes),
            );
        }
    }
    plan
}

fn engine_args(opts: &VolumeWorkloadOpts, changed: bool) -> VolumeEngineArgs {
    VolumeEngineArgs {
        volumes: opts.volumes_limit.iter().map(|b| b.render(true)).collect(),
        volume_changed: changed,
        storage: opts.storage_limit,
    }
}

fn workload_args(opts: &VolumeWorkloadOpts, plan: VolumePlan) -> VolumeWorkloadArgs {
    VolumeWorkloadArgs {
        volumes_request: opts.volumes_request.clone(),
        volumes_limit: opts.volumes_limit.clone(),
        volume_plan_limit: limit_plan(opts, &plan),
        volume_plan_request: plan,
        storage_request: opts.storage_request,
        storage_limit: opts.storage_limit,
    }
}

impl ResourceKind for VolumeKind {
    const NAME: &'static str = "volume";

    type Args = VolumeArgs;
    type NodeOpts = VolumeNodeOpts;
    type WorkloadOpts = VolumeWorkloadOpts;
    type WorkloadArgs = VolumeWorkloadArgs;
    type EngineArgs = VolumeEngineArgs;

    fn parse_node_opts(&self, params: &RawParams) -> CoreResult<VolumeNodeOpts> {
        VolumeNodeOpts::from_params(params)
    }

    fn parse_workload_opts(&self, params: &RawParams) -> CoreResult<VolumeWorkloadOpts> {
        VolumeWorkloadOpts::from_params(params)
    }

    fn capacity_from_opts(&self, opts: &VolumeNodeOpts) -> VolumeArgs {
        opts.to_capacity()
    }

    fn fill_node_opts(&self, opts: &VolumeNodeOpts, current: &VolumeArgs) -> VolumeNodeOpts {
        opts.or_current(current)
    }

    fn normalize_opts(&self, opts: &mut VolumeWorkloadOpts) -> CoreResult<()> {
        opts.normalize()
    }

    fn workload_usage(&self, args: &VolumeWorkloadArgs) -> VolumeArgs {
        args.usage()
    }

    fn node_capacity(
        &self,
        node: &str,
        info: &InfoOf<Self>,
        opts: &VolumeWorkloadOpts,
    ) -> NodeCapacityInfo {
        let plans = volume_plans(
            &info.capacity.volumes,
            &info.usage.volumes,
            &opts.volumes_request,
            self.config.max_deploy_count,
        );
        let total = info.capacity.volumes.total() as f64;
        NodeCapacityInfo {
            node_name: node.to_string(),
            capacity: plans.len(),
            usage: ratio(info.usage.volumes.total() as f64, total),
            rate: ratio(total_size(&opts.volumes_request) as f64, total),
            weight: 1,
        }
    }

    fn alloc(
        &self,
        info: &InfoOf<Self>,
        count: usize,
        opts: &VolumeWorkloadOpts,
    ) -> PluginResult<DeployOf<Self>> {
        let plans = volume_plans(
            &info.capacity.volumes,
            &info.usage.volumes,
            &opts.volumes_request,
            count,
        );
        if plans.len() < count {
            return Err(PluginError::InsufficientResource);
        }

        let mut deploy = Deploy::default();
        for plan in plans {
            deploy.engine_args.push(engine_args(opts, false));
            deploy.workload_args.push(workload_args(opts, plan));
        }
        Ok(deploy)
    }

    /// Slots present before the resize stay on their device and only grow
    /// in place. Added slots are scheduled; dropped slots are released.
    fn realloc(
        &self,
        info: &InfoOf<Self>,
        origin: &VolumeWorkloadArgs,
        opts: &VolumeWorkloadOpts,
    ) -> PluginResult<ReallocOf<Self>> {
        let mut delta = opts.clone();
        if delta.volumes_request.is_empty() {
            delta.volumes_request = delta.volumes_limit.clone();
        }
        if delta.volumes_limit.is_empty() {
            delta.volumes_limit = delta.volumes_request.clone();
        }
        let mut target = origin.opts().merged(&delta);
        target.normalize()?;

        let mut plan = VolumePlan::new();
        let mut added = Vec::new();
        for binding in target.volumes_request.iter().filter(|b| b.requires_schedule()) {
            let kept = origin
                .volume_plan_request
                .get(&binding.key())
                .and_then(|map| map.keys().next().map(|device| (device, map)));
            match kept {
                Some((_, map)) if binding.is_monopoly() => plan.insert(binding.clone(), map.clone()),
                Some((device, _)) => plan.insert(
                    binding.clone(),
                    VolumeMap::single(device.clone(), binding.size_in_bytes),
                ),
                None => added.push(binding.clone()),
            }
        }

        let mut usage = info.usage.volumes.clone();
        usage.sub(&origin.volume_plan_request.total());
        usage.add(&plan.total());
        if usage
            .iter()
            .any(|(device, used)| *used > info.capacity.volumes.size(device))
        {
            return Err(PluginError::InsufficientResource);
        }

        if !added.is_empty() {
            let placed = volume_plans(&info.capacity.volumes, &usage, &added, 1)
                .into_iter()
                .next()
                .ok_or(PluginError::InsufficientResource)?;
            plan.merge(placed);
        }

        let mut volumes = plan.total();
        volumes.sub(&origin.volume_plan_request.total());
        volumes.retain(|_, size| *size != 0);
        let delta = VolumeArgs::from_volumes(volumes);

        let changed = !added.is_empty() || target.volumes_request != origin.volumes_request;
        Ok(Realloc {
            engine_args: engine_args(&target, changed),
            delta,
            workload_args: workload_args(&target, plan),
        })
    }

    fn usage_diffs(&self, recorded: &VolumeArgs, expected: &VolumeArgs) -> Vec<String> {
        let mut diffs = Vec::new();
        let devices: BTreeSet<&String> = recorded
            .volumes
            .keys()
            .chain(expected.volumes.keys())
            .collect();
        for device in devices {
            let (have, want) = (recorded.volumes.size(device), expected.volumes.size(device));
            if have != want {
                diffs.push(format!(
                    "node.Volumes[{device}] != sum(workload.Volumes[{device}]): {have} != {want}"
                ));
            }
        }
        if recorded.storage != expected.storage {
            diffs.push(format!(
                "node.Storage != sum(workload.Storage): {} != {}",
                recorded.storage, expected.storage
            ));
        }
        diffs
    }

    fn usage_rate(&self, info: &InfoOf<Self>) -> f64 {
        used_ratio(
            info.usage.volumes.total() as f64,
            info.capacity.volumes.total() as f64,
        )
    }
}
