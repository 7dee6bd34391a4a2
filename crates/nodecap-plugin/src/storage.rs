//! Storage quota kind.

use nodecap_core::storage::{
    StorageArgs, StorageEngineArgs, StorageNodeOpts, StorageWorkloadArgs, StorageWorkloadOpts,
};
use nodecap_core::{CoreResult, RawParams, ResourceArgs, SchedulerConfig};

use crate::error::{PluginError, PluginResult};
use crate::kind::{
    Deploy, DeployOf, InfoOf, NodeCapacityInfo, Realloc, ReallocOf, ResourceKind, ratio,
    used_ratio,
};

#[derive(Debug, Clone, Default)]
pub struct StorageKind {
    config: SchedulerConfig,
}

impl StorageKind {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn capacity(&self, available: i64, request: i64) -> usize {
        let capacity = if request == 0 {
            self.config.max_deploy_count
        } else {
            (available / request).max(0) as usize
        };
        capacity.min(self.config.max_deploy_count)
    }
}

impl ResourceKind for StorageKind {
    const NAME: &'static str = "storage";

    type Args = StorageArgs;
    type NodeOpts = StorageNodeOpts;
    type WorkloadOpts = StorageWorkloadOpts;
    type WorkloadArgs = StorageWorkloadArgs;
    type EngineArgs = StorageEngineArgs;

    fn parse_node_opts(&self, params: &RawParams) -> CoreResult<StorageNodeOpts> {
        StorageNodeOpts::from_params(params)
    }

    fn parse_workload_opts(&self, params: &RawParams) -> CoreResult<StorageWorkloadOpts> {
        StorageWorkloadOpts::from_params(params)
    }

    fn capacity_from_opts(&self, opts: &StorageNodeOpts) -> StorageArgs {
        opts.to_capacity()
    }

    fn fill_node_opts(&self, opts: &StorageNodeOpts, current: &StorageArgs) -> StorageNodeOpts {
        opts.or_current(current)
    }

    fn normalize_opts(&self, opts: &mut StorageWorkloadOpts) -> CoreResult<()> {
        opts.normalize()
    }

    fn workload_usage(&self, args: &StorageWorkloadArgs) -> StorageArgs {
        args.usage()
    }

    fn node_capacity(
        &self,
        node: &str,
        info: &InfoOf<Self>,
        opts: &StorageWorkloadOpts,
    ) -> NodeCapacityInfo {
        let total = info.capacity.storage as f64;
        NodeCapacityInfo {
            node_name: node.to_string(),
            capacity: self.capacity(info.available().storage, opts.storage_request),
            usage: ratio(info.usage.storage as f64, total),
            rate: ratio(opts.storage_request as f64, total),
            weight: 1,
        }
    }

    fn alloc(
        &self,
        info: &InfoOf<Self>,
        count: usize,
        opts: &StorageWorkloadOpts,
    ) -> PluginResult<DeployOf<Self>> {
        if self.capacity(info.available().storage, opts.storage_request) < count {
            return Err(PluginError::InsufficientResource);
        }
        let engine = StorageEngineArgs {
            storage: opts.storage_limit,
        };
        Ok(Deploy {
            engine_args: vec![engine; count],
            workload_args: vec![*opts; count],
        })
    }

    fn realloc(
        &self,
        info: &InfoOf<Self>,
        origin: &StorageWorkloadArgs,
        opts: &StorageWorkloadOpts,
    ) -> PluginResult<ReallocOf<Self>> {
        let mut target = *origin;
        target.add(opts);
        target.normalize()?;

        let mut available = info.available();
        available.add(&origin.usage());
        if target.storage_request > available.storage {
            return Err(PluginError::InsufficientResource);
        }

        let mut delta = target.usage();
        delta.sub(&origin.usage());
        Ok(Realloc {
            engine_args: StorageEngineArgs {
                storage: target.storage_limit,
            },
            delta,
            workload_args: target,
        })
    }

    fn usage_diffs(&self, recorded: &StorageArgs, expected: &StorageArgs) -> Vec<String> {
        if recorded.storage == expected.storage {
            return Vec::new();
        }
        vec![format!(
            "node.Storage != sum(workload.Storage): {} != {}",
            recorded.storage, expected.storage
        )]
    }

    fn usage_rate(&self, info: &InfoOf<Self>) -> f64 {
        used_ratio(info.usage.storage as f64, info.capacity.storage as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodecap_core::NodeResourceInfo;
    use nodecap_core::units::GIB;

    fn node(storage: i64) -> InfoOf<StorageKind> {
        NodeResourceInfo::new(StorageArgs { storage })
    }

    fn request(storage: i64) -> StorageWorkloadOpts {
        StorageWorkloadOpts {
            storage_request: storage,
            storage_limit: storage,
        }
    }

    #[test]
    fn capacity_divides_available() {
        let kind = StorageKind::default();
        let info = node(10 * GIB);
        assert_eq!(kind.node_capacity("n", &info, &request(GIB)).capacity, 10);
        assert_eq!(kind.node_capacity("n", &info, &request(11 * GIB)).capacity, 0);
        assert_eq!(
            kind.node_capacity("n", &info, &request(0)).capacity,
            SchedulerConfig::default().max_deploy_count
        );

        let capped = StorageKind::new(SchedulerConfig {
            max_deploy_count: 3,
            ..Default::default()
        });
        assert_eq!(capped.node_capacity("n", &info, &request(GIB)).capacity, 3);
    }

    #[test]
    fn alloc_needs_room_for_every_replica() {
        let kind = StorageKind::default();
        let info = node(10 * GIB);
        let deploy = kind.alloc(&info, 3, &request(3 * GIB)).unwrap();
        assert_eq!(deploy.engine_args.len(), 3);
        assert_eq!(deploy.engine_args[0].storage, 3 * GIB);
        assert!(matches!(
            kind.alloc(&info, 4, &request(3 * GIB)),
            Err(PluginError::InsufficientResource)
        ));
    }

    #[test]
    fn realloc_counts_origin_as_available() {
        let kind = StorageKind::default();
        let mut info = node(10 * GIB);
        let origin = request(4 * GIB);
        info.usage.add(&origin.usage());
        info.usage.storage += 4 * GIB;

        let result = kind.realloc(&info, &origin, &request(2 * GIB)).unwrap();
        assert_eq!(result.delta.storage, 2 * GIB);
        assert_eq!(result.workload_args.storage_request, 6 * GIB);
        assert_eq!(result.engine_args.storage, 6 * GIB);

        assert!(matches!(
            kind.realloc(&info, &origin, &request(3 * GIB)),
            Err(PluginError::InsufficientResource)
        ));

        let shrink = kind.realloc(&info, &origin, &request(-GIB)).unwrap();
        assert_eq!(shrink.delta.storage, -GIB);
    }

    #[test]
    fn diffs_and_rate() {
        let kind = StorageKind::default();
        let mut info = node(4 * GIB);
        info.usage.storage = GIB;
        assert_eq!(kind.usage_rate(&info), 0.25);
        assert_eq!(kind.usage_rate(&node(0)), 1.0);
        assert!(kind.usage_diffs(&info.usage, &info.usage).is_empty());
        assert_eq!(kind.usage_diffs(&info.usage, &StorageArgs::default()).len(), 1);
    }
}
