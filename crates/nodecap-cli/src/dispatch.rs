//! Typed execution of a parsed command for one resource kind.

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use nodecap_core::{NodecapConfig, RawParams};
use nodecap_plugin::{
    CpuMemKind, OpContext, ResourceKind, ResourcePlugin, ResourceUpdate, StorageKind, UpdateOf,
    VolumeKind,
};
use nodecap_store::{RedbStore, ResourceStore};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{Command, Kind, UpdateSource};

pub async fn dispatch(
    kind: Kind,
    command: Command,
    config: &NodecapConfig,
    store: RedbStore,
    ctx: &OpContext,
) -> anyhow::Result<Value> {
    let scheduler = config.scheduler.clone();
    match kind {
        Kind::Cpumem => {
            let plugin = ResourcePlugin::new(CpuMemKind::new(scheduler), store);
            execute(&plugin, command, ctx).await
        }
        Kind::Storage => {
            let plugin = ResourcePlugin::new(StorageKind::new(scheduler), store);
            execute(&plugin, command, ctx).await
        }
        Kind::Volume => {
            let plugin = ResourcePlugin::new(VolumeKind::new(scheduler), store);
            execute(&plugin, command, ctx).await
        }
    }
}

fn parse_json<T: DeserializeOwned>(what: &str, input: &str) -> anyhow::Result<T> {
    serde_json::from_str(input).with_context(|| format!("invalid {what}: {input}"))
}

fn node_opts<K: ResourceKind>(kind: &K, input: &str) -> anyhow::Result<K::NodeOpts> {
    Ok(kind.parse_node_opts(&RawParams::parse(input)?)?)
}

fn workload_opts<K: ResourceKind>(kind: &K, input: &str) -> anyhow::Result<K::WorkloadOpts> {
    Ok(kind.parse_workload_opts(&RawParams::parse(input)?)?)
}

fn update<K: ResourceKind>(kind: &K, source: &UpdateSource) -> anyhow::Result<UpdateOf<K>> {
    if let Some(opts) = &source.opts {
        return Ok(ResourceUpdate::NodeOpts(node_opts(kind, opts)?));
    }
    if let Some(args) = &source.args {
        return Ok(ResourceUpdate::NodeArgs(parse_json("resource args", args)?));
    }
    if let Some(workloads) = &source.workloads {
        return Ok(ResourceUpdate::Workloads(parse_json("workload args", workloads)?));
    }
    bail!("one of --opts, --args or --workloads is required")
}

async fn execute<K, S>(
    plugin: &ResourcePlugin<K, S>,
    command: Command,
    ctx: &OpContext,
) -> anyhow::Result<Value>
where
    K: ResourceKind,
    S: ResourceStore,
{
    let kind = plugin.kind();
    let output = match command {
        Command::AddNode { node, opts } => {
            let info = plugin.add_node(ctx, &node, &node_opts(kind, &opts)?).await?;
            json!({ "node": node, "info": info })
        }
        Command::RemoveNode { node } => {
            plugin.remove_node(ctx, &node).await?;
            json!({ "node": node, "removed": true })
        }
        Command::GetNode {
            node,
            workloads,
            fix,
        } => {
            let workloads: Vec<K::WorkloadArgs> = parse_json("workload args", &workloads)?;
            let (info, diffs) = plugin
                .get_node_resource_info(ctx, &node, &workloads, fix)
                .await?;
            json!({ "node": node, "info": info, "diffs": diffs })
        }
        Command::SetNode {
            node,
            capacity,
            usage,
        } => {
            let capacity: K::Args = parse_json("capacity", &capacity)?;
            let usage: K::Args = parse_json("usage", &usage)?;
            let info = plugin
                .set_node_resource_info(ctx, &node, capacity, usage)
                .await?;
            json!({ "node": node, "info": info })
        }
        Command::SetUsage { node, source } => {
            let update = update(kind, &source)?;
            let (before, after) = plugin
                .set_node_resource_usage(ctx, &node, &update, source.delta, !source.decr)
                .await?;
            json!({ "node": node, "before": before, "after": after })
        }
        Command::SetCapacity { node, source } => {
            let update = update(kind, &source)?;
            let (before, after) = plugin
                .set_node_resource_capacity(ctx, &node, &update, source.delta, !source.decr)
                .await?;
            json!({ "node": node, "before": before, "after": after })
        }
        Command::GetCapacity { nodes, opts } => {
            let opts = workload_opts(kind, &opts)?;
            let capacity = plugin.get_nodes_deploy_capacity(ctx, &nodes, &opts).await?;
            serde_json::to_value(capacity)?
        }
        Command::GetDeployArgs { node, count, opts } => {
            let opts = workload_opts(kind, &opts)?;
            let deploy = plugin.get_deploy_args(ctx, &node, count, &opts).await?;
            serde_json::to_value(deploy)?
        }
        Command::GetReallocArgs { node, origin, opts } => {
            let origin: K::WorkloadArgs = parse_json("origin", &origin)?;
            let opts = workload_opts(kind, &opts)?;
            let realloc = plugin.realloc(ctx, &node, &origin, &opts).await?;
            serde_json::to_value(realloc)?
        }
        Command::GetRemapArgs { node, workloads } => {
            let workloads: BTreeMap<String, K::WorkloadArgs> =
                parse_json("workload args", &workloads)?;
            let engine_args = plugin.remap(ctx, &node, &workloads).await?;
            json!({ "engine_args": engine_args })
        }
        Command::GetIdle { nodes } => match plugin.get_most_idle_node(ctx, &nodes).await? {
            Some(idle) => serde_json::to_value(idle)?,
            None => bail!("no nodes given"),
        },
    };
    Ok(output)
}
