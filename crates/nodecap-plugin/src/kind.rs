//! The per-kind half of a resource plugin.
//!
//! A [`ResourceKind`] is pure: it parses options and computes capacities,
//! plans and deltas from values handed to it. Reading and writing node state
//! is left to [`ResourcePlugin`](crate::ResourcePlugin).

use std::collections::BTreeMap;
use std::fmt::Debug;

use nodecap_core::{CoreResult, NodeResourceInfo, RawParams, ResourceArgs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PluginResult;

/// Marker for a node with no bound on a dimension.
pub const UNBOUNDED: usize = usize::MAX;

/// Bounds shared by every option and argument type a kind exchanges.
pub trait KindValue:
    Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> KindValue for T where
    T: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// How many more replicas one node could take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacityInfo {
    pub node_name: String,
    pub capacity: usize,
    /// Fraction of the node already in use.
    pub usage: f64,
    /// Fraction of the node one replica would take.
    pub rate: f64,
    pub weight: i64,
}

/// Deploy capacity over a set of nodes. Nodes that can take nothing are
/// left out; `total` saturates at [`UNBOUNDED`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployCapacity {
    pub nodes: BTreeMap<String, NodeCapacityInfo>,
    pub total: usize,
}

impl DeployCapacity {
    pub fn insert(&mut self, info: NodeCapacityInfo) {
        self.total = self.total.saturating_add(info.capacity);
        self.nodes.insert(info.node_name.clone(), info);
    }
}

/// Arguments for `count` new replicas, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deploy<E, W> {
    pub engine_args: Vec<E>,
    pub workload_args: Vec<W>,
}

/// Outcome of resizing one workload in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Realloc<E, A, W> {
    pub engine_args: E,
    /// Change to apply to the node usage.
    pub delta: A,
    /// The workload's record after the resize.
    pub workload_args: W,
}

/// Where a usage or capacity update takes its amount from, highest
/// priority first.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceUpdate<N, A, W> {
    NodeOpts(N),
    NodeArgs(A),
    Workloads(Vec<W>),
}

/// The most idle node and its priority, `round(rate * 100)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleNode {
    pub node_name: String,
    pub priority: i64,
}

pub type DeployOf<K> = Deploy<<K as ResourceKind>::EngineArgs, <K as ResourceKind>::WorkloadArgs>;

pub type ReallocOf<K> = Realloc<
    <K as ResourceKind>::EngineArgs,
    <K as ResourceKind>::Args,
    <K as ResourceKind>::WorkloadArgs,
>;

pub type UpdateOf<K> = ResourceUpdate<
    <K as ResourceKind>::NodeOpts,
    <K as ResourceKind>::Args,
    <K as ResourceKind>::WorkloadArgs,
>;

pub type InfoOf<K> = NodeResourceInfo<<K as ResourceKind>::Args>;

/// One resource dimension: its value types and its pure computations.
pub trait ResourceKind: Sized + Send + Sync + 'static {
    /// Store key segment and CLI name.
    const NAME: &'static str;

    type Args: ResourceArgs;
    type NodeOpts: KindValue;
    type WorkloadOpts: KindValue;
    type WorkloadArgs: KindValue;
    type EngineArgs: KindValue;

    fn parse_node_opts(&self, params: &RawParams) -> CoreResult<Self::NodeOpts>;

    fn parse_workload_opts(&self, params: &RawParams) -> CoreResult<Self::WorkloadOpts>;

    /// Capacity described by node opts alone.
    fn capacity_from_opts(&self, opts: &Self::NodeOpts) -> Self::Args;

    /// Fill dimensions the opts leave unset from `current`.
    fn fill_node_opts(&self, opts: &Self::NodeOpts, current: &Self::Args) -> Self::NodeOpts;

    fn normalize_opts(&self, opts: &mut Self::WorkloadOpts) -> CoreResult<()>;

    /// Node usage accounted to one workload.
    fn workload_usage(&self, args: &Self::WorkloadArgs) -> Self::Args;

    /// Replicas of `opts` this node could still take. `opts` is normalized.
    fn node_capacity(
        &self,
        node: &str,
        info: &InfoOf<Self>,
        opts: &Self::WorkloadOpts,
    ) -> NodeCapacityInfo;

    /// Arguments for exactly `count` replicas, or `InsufficientResource`.
    fn alloc(
        &self,
        info: &InfoOf<Self>,
        count: usize,
        opts: &Self::WorkloadOpts,
    ) -> PluginResult<DeployOf<Self>>;

    /// Resize `origin` by the delta `opts`. `opts` is not normalized; the
    /// merged result is.
    fn realloc(
        &self,
        info: &InfoOf<Self>,
        origin: &Self::WorkloadArgs,
        opts: &Self::WorkloadOpts,
    ) -> PluginResult<ReallocOf<Self>>;

    /// Engine args for workloads whose placement follows node state.
    fn remap(
        &self,
        _info: &InfoOf<Self>,
        _workloads: &BTreeMap<String, Self::WorkloadArgs>,
    ) -> BTreeMap<String, Self::EngineArgs> {
        BTreeMap::new()
    }

    /// Human-readable mismatches between recorded and expected usage.
    fn usage_diffs(&self, recorded: &Self::Args, expected: &Self::Args) -> Vec<String>;

    /// Fraction of the node in use, in `[0, 1]`. A node with nothing to
    /// offer counts as fully used.
    fn usage_rate(&self, info: &InfoOf<Self>) -> f64;
}

/// `part / whole`, or zero when there is nothing to divide by.
pub(crate) fn ratio(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole } else { 0.0 }
}

/// Like [`ratio`], but an empty whole reads as fully used.
pub(crate) fn used_ratio(used: f64, total: f64) -> f64 {
    if total > 0.0 { used / total } else { 1.0 }
}
