//! Store-backed orchestration shared by every resource kind.

use std::collections::BTreeMap;

use nodecap_core::ResourceArgs;
use nodecap_store::ResourceStore;
use tracing::{debug, error, info, warn};

use crate::context::OpContext;
use crate::error::{PluginError, PluginResult};
use crate::kind::{
    DeployCapacity, DeployOf, IdleNode, InfoOf, ReallocOf, ResourceKind, ResourceUpdate, UpdateOf,
};

/// One resource kind bound to a store.
///
/// Each operation reads the node, computes with the kind, validates and
/// only then writes. Callers serialize concurrent mutations of one node.
pub struct ResourcePlugin<K, S> {
    kind: K,
    store: S,
}

impl<K: ResourceKind, S: ResourceStore> ResourcePlugin<K, S> {
    pub fn new(kind: K, store: S) -> Self {
        Self { kind, store }
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        K::NAME
    }

    /// Store key holding `node`'s state for this kind.
    pub fn key(node: &str) -> String {
        format!("/resource/{}/{}", K::NAME, node)
    }

    async fn load(&self, ctx: &OpContext, node: &str) -> PluginResult<Option<InfoOf<K>>> {
        let key = Self::key(node);
        let bytes = ctx
            .run(self.store.get_one(&key))
            .await
            .inspect_err(|e| log_store_failure(K::NAME, node, "read", e))?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let mut info = InfoOf::<K>::from_slice(&bytes)?;
        info.normalize();
        Ok(Some(info))
    }

    async fn require(&self, ctx: &OpContext, node: &str) -> PluginResult<InfoOf<K>> {
        self.load(ctx, node)
            .await?
            .ok_or_else(|| PluginError::NodeNotFound(node.to_string()))
    }

    async fn save(&self, ctx: &OpContext, node: &str, info: &InfoOf<K>) -> PluginResult<()> {
        info.validate()?;
        let key = Self::key(node);
        let bytes = info.to_vec()?;
        ctx.write(self.store.put(&key, bytes))
            .await
            .inspect_err(|e| log_store_failure(K::NAME, node, "write", e))?;
        debug!(kind = K::NAME, node = %node, "node resource written");
        Ok(())
    }

    /// Register a node with the capacity described by `opts`.
    pub async fn add_node(
        &self,
        ctx: &OpContext,
        node: &str,
        opts: &K::NodeOpts,
    ) -> PluginResult<InfoOf<K>> {
        if self.load(ctx, node).await?.is_some() {
            return Err(PluginError::NodeExists(node.to_string()));
        }
        let info = InfoOf::<K>::new(self.kind.capacity_from_opts(opts));
        self.save(ctx, node, &info).await?;
        info!(kind = K::NAME, node = %node, "node added");
        Ok(info)
    }

    pub async fn remove_node(&self, ctx: &OpContext, node: &str) -> PluginResult<()> {
        let key = Self::key(node);
        let existed = ctx
            .write(self.store.delete(&key))
            .await
            .inspect_err(|e| log_store_failure(K::NAME, node, "delete", e))?;
        if !existed {
            return Err(PluginError::NodeNotFound(node.to_string()));
        }
        info!(kind = K::NAME, node = %node, "node removed");
        Ok(())
    }

    /// Node state plus the mismatches between its recorded usage and the
    /// usage `workloads` account for. With `fix`, the usage is replaced by
    /// the accounted one.
    pub async fn get_node_resource_info(
        &self,
        ctx: &OpContext,
        node: &str,
        workloads: &[K::WorkloadArgs],
        fix: bool,
    ) -> PluginResult<(InfoOf<K>, Vec<String>)> {
        let mut info = self.require(ctx, node).await?;

        let mut expected = info.capacity.zeroed();
        for workload in workloads {
            expected.add(&self.kind.workload_usage(workload));
        }
        expected.fill_missing(&info.capacity);

        let mut diffs = self.kind.usage_diffs(&info.usage, &expected);
        if fix && !diffs.is_empty() {
            let mut fixed = info.clone();
            fixed.usage = expected;
            fixed.normalize();
            match self.save(ctx, node, &fixed).await {
                Ok(()) => info = fixed,
                Err(PluginError::Core(e)) => {
                    warn!(kind = K::NAME, node = %node, error = %e, "usage fix failed");
                    diffs.push("fix failed".to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok((info, diffs))
    }

    /// Overwrite capacity and usage.
    pub async fn set_node_resource_info(
        &self,
        ctx: &OpContext,
        node: &str,
        capacity: K::Args,
        usage: K::Args,
    ) -> PluginResult<InfoOf<K>> {
        self.require(ctx, node).await?;
        let mut info = InfoOf::<K> { capacity, usage };
        info.normalize();
        self.save(ctx, node, &info).await?;
        Ok(info)
    }

    /// Returns the usage before and after.
    pub async fn set_node_resource_usage(
        &self,
        ctx: &OpContext,
        node: &str,
        update: &UpdateOf<K>,
        delta: bool,
        incr: bool,
    ) -> PluginResult<(K::Args, K::Args)> {
        let mut info = self.require(ctx, node).await?;
        let before = info.usage.clone();

        let amount = self.amount(update, &info.capacity, false);
        let mut usage = if delta {
            before.clone()
        } else {
            info.capacity.zeroed()
        };
        apply(&mut usage, &amount, incr);

        info.usage = usage;
        info.normalize();
        self.save(ctx, node, &info).await?;
        Ok((before, info.usage))
    }

    /// Returns the capacity before and after. Without `delta`, node opts
    /// keep the dimensions they leave unset.
    pub async fn set_node_resource_capacity(
        &self,
        ctx: &OpContext,
        node: &str,
        update: &UpdateOf<K>,
        delta: bool,
        incr: bool,
    ) -> PluginResult<(K::Args, K::Args)> {
        let mut info = self.require(ctx, node).await?;
        let before = info.capacity.clone();

        let amount = self.amount(update, &info.capacity, !delta);
        let mut capacity = if delta {
            before.clone()
        } else {
            before.zeroed()
        };
        apply(&mut capacity, &amount, incr);

        info.capacity = capacity;
        info.normalize();
        info.prune_empty();
        self.save(ctx, node, &info).await?;
        Ok((before, info.capacity))
    }

    fn amount(&self, update: &UpdateOf<K>, current: &K::Args, fill: bool) -> K::Args {
        match update {
            ResourceUpdate::NodeOpts(opts) if fill => self
                .kind
                .capacity_from_opts(&self.kind.fill_node_opts(opts, current)),
            ResourceUpdate::NodeOpts(opts) => self.kind.capacity_from_opts(opts),
            ResourceUpdate::NodeArgs(args) => args.clone(),
            ResourceUpdate::Workloads(workloads) => {
                let mut total = K::Args::default();
                for workload in workloads {
                    total.add(&self.kind.workload_usage(workload));
                }
                total
            }
        }
    }

    /// Capacity of each node for `opts`. Nodes that can take nothing are
    /// left out.
    pub async fn get_nodes_deploy_capacity(
        &self,
        ctx: &OpContext,
        nodes: &[String],
        opts: &K::WorkloadOpts,
    ) -> PluginResult<DeployCapacity> {
        let mut opts = opts.clone();
        self.kind.normalize_opts(&mut opts)?;

        let mut capacity = DeployCapacity::default();
        for node in nodes {
            let info = self.require(ctx, node).await?;
            let node_capacity = self.kind.node_capacity(node, &info, &opts);
            if node_capacity.capacity > 0 {
                capacity.insert(node_capacity);
            }
        }
        debug!(
            kind = K::NAME,
            nodes = nodes.len(),
            total = capacity.total,
            "deploy capacity computed"
        );
        Ok(capacity)
    }

    /// Engine and workload args for `count` new replicas on `node`.
    pub async fn get_deploy_args(
        &self,
        ctx: &OpContext,
        node: &str,
        count: usize,
        opts: &K::WorkloadOpts,
    ) -> PluginResult<DeployOf<K>> {
        let mut opts = opts.clone();
        self.kind.normalize_opts(&mut opts)?;
        let info = self.require(ctx, node).await?;
        self.kind
            .alloc(&info, count, &opts)
            .inspect_err(|e| log_insufficient(K::NAME, node, e))
    }

    /// Resize `origin` by the delta `opts`.
    pub async fn realloc(
        &self,
        ctx: &OpContext,
        node: &str,
        origin: &K::WorkloadArgs,
        opts: &K::WorkloadOpts,
    ) -> PluginResult<ReallocOf<K>> {
        let info = self.require(ctx, node).await?;
        self.kind
            .realloc(&info, origin, opts)
            .inspect_err(|e| log_insufficient(K::NAME, node, e))
    }

    pub async fn remap(
        &self,
        ctx: &OpContext,
        node: &str,
        workloads: &BTreeMap<String, K::WorkloadArgs>,
    ) -> PluginResult<BTreeMap<String, K::EngineArgs>> {
        let info = self.require(ctx, node).await?;
        Ok(self.kind.remap(&info, workloads))
    }

    /// The node with the lowest usage rate. Ties go to the earlier node.
    pub async fn get_most_idle_node(
        &self,
        ctx: &OpContext,
        nodes: &[String],
    ) -> PluginResult<Option<IdleNode>> {
        let mut idle: Option<(String, f64)> = None;
        for node in nodes {
            let info = self.require(ctx, node).await?;
            let rate = self.kind.usage_rate(&info);
            if idle.as_ref().is_none_or(|(_, best)| rate < *best) {
                idle = Some((node.clone(), rate));
            }
        }
        Ok(idle.map(|(node_name, rate)| IdleNode {
            node_name,
            priority: (rate * 100.0).round() as i64,
        }))
    }
}

fn apply<A: ResourceArgs>(target: &mut A, amount: &A, incr: bool) {
    if incr {
        target.add(amount);
    } else {
        target.sub(amount);
    }
}

fn log_store_failure(kind: &str, node: &str, op: &str, e: &PluginError) {
    if let PluginError::Store(e) = e {
        error!(kind, node = %node, op, error = %e, "resource store call failed");
    }
}

fn log_insufficient(kind: &str, node: &str, e: &PluginError) {
    if matches!(e, PluginError::InsufficientResource) {
        warn!(kind, node = %node, "insufficient resource");
    }
}
