//! CPU/memory plugin against an in-memory store.

use std::collections::BTreeMap;

use nodecap_core::cpumem::{CpuMap, CpuMemArgs, CpuMemWorkloadArgs, CpuMemWorkloadOpts};
use nodecap_core::units::GIB;
use nodecap_core::{RawParams, ResourceArgs, SchedulerConfig};
use nodecap_plugin::*;
use nodecap_store::RedbStore;

type Plugin = ResourcePlugin<CpuMemKind, RedbStore>;

fn plugin() -> Plugin {
    ResourcePlugin::new(
        CpuMemKind::new(SchedulerConfig::default()),
        RedbStore::open_in_memory().unwrap(),
    )
}

async fn add(plugin: &Plugin, node: &str, params: &str) -> InfoOf<CpuMemKind> {
    let opts = plugin
        .kind()
        .parse_node_opts(&RawParams::parse(params).unwrap())
        .unwrap();
    plugin.add_node(&OpContext::new(), node, &opts).await.unwrap()
}

fn bind(cpu: f64) -> CpuMemWorkloadOpts {
    CpuMemWorkloadOpts {
        cpu_bind: true,
        cpu_request: cpu,
        cpu_limit: cpu,
        ..Default::default()
    }
}

fn assert_consistent(info: &InfoOf<CpuMemKind>) {
    assert!(info.validate().is_ok(), "{info:?}");
    assert!(
        info.usage.cpu_map.keys().eq(info.capacity.cpu_map.keys()),
        "{info:?}"
    );
}

#[tokio::test]
async fn deploy_capacity_over_nodes() {
    let plugin = plugin();
    let ctx = OpContext::new();
    let mut nodes = Vec::new();
    for (i, cores) in [4, 14, 12, 18, 8].into_iter().enumerate() {
        let node = format!("node-{i}");
        add(&plugin, &node, &format!(r#"{{"cpu": "{cores}", "memory": "100G"}}"#)).await;
        nodes.push(node);
    }

    let capacity = plugin
        .get_nodes_deploy_capacity(&ctx, &nodes, &bind(1.7))
        .await
        .unwrap();
    assert_eq!(capacity.total, 28);
    assert_eq!(capacity.nodes["node-0"].capacity, 2);
    assert_eq!(capacity.nodes["node-3"].capacity, 9);
    assert_eq!(capacity.nodes["node-3"].weight, 100);
}

#[tokio::test]
async fn zero_capacity_nodes_are_left_out() {
    let plugin = plugin();
    add(&plugin, "small", r#"{"cpu": "1", "memory": "1G"}"#).await;
    add(&plugin, "big", r#"{"cpu": "4", "memory": "1G"}"#).await;

    let capacity = plugin
        .get_nodes_deploy_capacity(
            &OpContext::new(),
            &["small".to_string(), "big".to_string()],
            &bind(2.0),
        )
        .await
        .unwrap();
    assert_eq!(capacity.total, 2);
    assert!(!capacity.nodes.contains_key("small"));
}

#[tokio::test]
async fn committed_allocations_match_capacity() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "4", "memory": "4G"}"#).await;

    let mut opts = bind(1.2);
    opts.mem_request = GIB;
    let capacity = plugin
        .get_nodes_deploy_capacity(&ctx, &["n".to_string()], &opts)
        .await
        .unwrap();
    assert_eq!(capacity.total, 3);

    for _ in 0..capacity.total {
        let deploy = plugin.get_deploy_args(&ctx, "n", 1, &opts).await.unwrap();
        assert_eq!(deploy.workload_args[0].cpu_map.total_pieces(), 120);
        plugin
            .set_node_resource_usage(
                &ctx,
                "n",
                &ResourceUpdate::Workloads(deploy.workload_args),
                true,
                true,
            )
            .await
            .unwrap();
        let (info, diffs) = plugin
            .get_node_resource_info(&ctx, "n", &[], false)
            .await
            .unwrap();
        assert_consistent(&info);
        assert!(!diffs.is_empty());
    }

    let err = plugin.get_deploy_args(&ctx, "n", 1, &opts).await.unwrap_err();
    assert!(matches!(err, PluginError::InsufficientResource));
}

#[tokio::test]
async fn deploy_args_do_not_write() {
    let plugin = plugin();
    let ctx = OpContext::new();
    let before = add(&plugin, "n", r#"{"cpu": "2", "memory": "1G"}"#).await;

    plugin.get_deploy_args(&ctx, "n", 2, &bind(1.0)).await.unwrap();
    let (after, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn unbound_deploy_leaves_cpu_map_empty() {
    let plugin = plugin();
    add(&plugin, "n", r#"{"cpu": "2", "memory": "2G"}"#).await;
    let opts = CpuMemWorkloadOpts {
        cpu_request: 0.5,
        mem_request: GIB,
        ..Default::default()
    };
    let deploy = plugin
        .get_deploy_args(&OpContext::new(), "n", 2, &opts)
        .await
        .unwrap();
    assert_eq!(deploy.engine_args.len(), 2);
    assert!(deploy.engine_args[0].cpu_map.is_empty());
    assert_eq!(deploy.engine_args[0].cpu, 0.5);
    assert_eq!(deploy.workload_args[1].memory_request, GIB);
}

#[tokio::test]
async fn unbound_allocations_never_exceed_cpu_count() {
    let plugin = plugin();
    let ctx = OpContext::new();
    let nodes = ["n".to_string()];
    add(&plugin, "n", r#"{"cpu": "4", "memory": "10G"}"#).await;

    let mut opts = CpuMemWorkloadOpts {
        cpu_request: 3.0,
        mem_request: GIB,
        ..Default::default()
    };
    opts.normalize().unwrap();
    let capacity = plugin
        .get_nodes_deploy_capacity(&ctx, &nodes, &opts)
        .await
        .unwrap();
    assert_eq!(capacity.total, 1);

    let deploy = plugin.get_deploy_args(&ctx, "n", 1, &opts).await.unwrap();
    let (_, after) = plugin
        .set_node_resource_usage(
            &ctx,
            "n",
            &ResourceUpdate::Workloads(deploy.workload_args),
            true,
            true,
        )
        .await
        .unwrap();
    assert_eq!(after.cpu, 3.0);

    let err = plugin.get_deploy_args(&ctx, "n", 1, &opts).await.unwrap_err();
    assert!(matches!(err, PluginError::InsufficientResource));

    // whole free cores are not enough once the cpu count is spent
    let capacity = plugin
        .get_nodes_deploy_capacity(&ctx, &nodes, &bind(1.0))
        .await
        .unwrap();
    assert_eq!(capacity.total, 1);

    let oversold = CpuMemArgs {
        cpu: 2.0,
        ..Default::default()
    };
    let err = plugin
        .set_node_resource_usage(&ctx, "n", &ResourceUpdate::NodeArgs(oversold), true, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Core(_)));
    let (info, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert_eq!(info.usage.cpu, 3.0);
}

#[tokio::test]
async fn fix_replaces_usage_with_workload_sum() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "2", "memory": "2G"}"#).await;

    let workload = CpuMemWorkloadArgs {
        cpu_request: 1.0,
        cpu_limit: 1.0,
        memory_request: GIB,
        memory_limit: GIB,
        cpu_map: CpuMap::from_iter([("1", 100)]),
        ..Default::default()
    };
    let workloads = vec![workload];

    let (_, diffs) = plugin
        .get_node_resource_info(&ctx, "n", &workloads, true)
        .await
        .unwrap();
    assert!(diffs.iter().any(|d| d.starts_with("node.CPUMap[1]")));

    let (info, diffs) = plugin
        .get_node_resource_info(&ctx, "n", &workloads, false)
        .await
        .unwrap();
    assert!(diffs.is_empty(), "{diffs:?}");
    assert_eq!(info.usage.cpu_map.pieces("1"), 100);
    assert_eq!(info.usage.memory, GIB);
}

#[tokio::test]
async fn failed_fix_is_reported() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "1", "memory": "1G"}"#).await;

    let oversized = CpuMemWorkloadArgs {
        memory_request: 2 * GIB,
        ..Default::default()
    };
    let (info, diffs) = plugin
        .get_node_resource_info(&ctx, "n", &[oversized], true)
        .await
        .unwrap();
    assert_eq!(diffs.last().map(String::as_str), Some("fix failed"));
    assert_eq!(info.usage.memory, 0);
}

#[tokio::test]
async fn capacity_update_keeps_unset_dimensions() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "2", "memory": "2G"}"#).await;

    let opts = plugin
        .kind()
        .parse_node_opts(&RawParams::parse(r#"{"cpu": "4"}"#).unwrap())
        .unwrap();
    let (before, after) = plugin
        .set_node_resource_capacity(&ctx, "n", &ResourceUpdate::NodeOpts(opts), false, true)
        .await
        .unwrap();
    assert_eq!(before.cpu_map.len(), 2);
    assert_eq!(after.cpu_map.len(), 4);
    assert_eq!(after.cpu, 4.0);
    assert_eq!(after.memory, 2 * GIB);

    let (info, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert_consistent(&info);
}

#[tokio::test]
async fn capacity_delta_adds_and_prunes_cores() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "2", "memory": "2G"}"#).await;

    let more = CpuMemArgs {
        cpu_map: CpuMap::from_iter([("2", 100)]),
        memory: GIB,
        ..Default::default()
    };
    let (_, after) = plugin
        .set_node_resource_capacity(&ctx, "n", &ResourceUpdate::NodeArgs(more), true, true)
        .await
        .unwrap();
    assert_eq!(after.cpu_map.sorted_cores(), vec!["0", "1", "2"]);
    assert_eq!(after.memory, 3 * GIB);

    let less = CpuMemArgs {
        cpu_map: CpuMap::from_iter([("0", 100)]),
        ..Default::default()
    };
    let (_, after) = plugin
        .set_node_resource_capacity(&ctx, "n", &ResourceUpdate::NodeArgs(less), true, false)
        .await
        .unwrap();
    assert_eq!(after.cpu_map.sorted_cores(), vec!["1", "2"]);
    assert_eq!(after.cpu, 2.0);
}

#[tokio::test]
async fn usage_update_modes() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "2", "memory": "2G"}"#).await;

    let used = CpuMemArgs {
        cpu: 0.5,
        cpu_map: CpuMap::from_iter([("0", 50)]),
        memory: GIB,
        ..Default::default()
    };
    let update = ResourceUpdate::NodeArgs(used);

    let (_, after) = plugin
        .set_node_resource_usage(&ctx, "n", &update, true, true)
        .await
        .unwrap();
    assert_eq!(after.memory, GIB);

    let (_, after) = plugin
        .set_node_resource_usage(&ctx, "n", &update, true, true)
        .await
        .unwrap();
    assert_eq!(after.memory, 2 * GIB);
    assert_eq!(after.cpu_map.pieces("0"), 100);

    // Without delta the usage is replaced.
    let (before, after) = plugin
        .set_node_resource_usage(&ctx, "n", &update, false, true)
        .await
        .unwrap();
    assert_eq!(before.memory, 2 * GIB);
    assert_eq!(after.memory, GIB);
    assert_eq!(after.cpu_map.pieces("0"), 50);
    assert_eq!(after.cpu_map.pieces("1"), 0);

    plugin
        .set_node_resource_usage(&ctx, "n", &update, true, false)
        .await
        .unwrap();

    // Going below zero is rejected and nothing is written.
    let err = plugin
        .set_node_resource_usage(&ctx, "n", &update, true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Core(_)));
    let (info, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert!(info.usage.cpu_map.values().all(|p| *p == 0));
    assert_eq!(info.usage.memory, 0);
}

#[tokio::test]
async fn realloc_grows_bound_workload() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "n", r#"{"cpu": "4", "memory": "4G"}"#).await;

    let deploy = plugin.get_deploy_args(&ctx, "n", 1, &bind(1.5)).await.unwrap();
    let origin = deploy.workload_args[0].clone();
    plugin
        .set_node_resource_usage(
            &ctx,
            "n",
            &ResourceUpdate::Workloads(vec![origin.clone()]),
            true,
            true,
        )
        .await
        .unwrap();

    let result = plugin.realloc(&ctx, "n", &origin, &bind(0.5)).await.unwrap();
    assert_eq!(result.workload_args.cpu_request, 2.0);
    assert_eq!(result.workload_args.cpu_map.total_pieces(), 200);
    for core in origin.cpu_map.keys() {
        assert!(result.workload_args.cpu_map.pieces(core) > 0);
    }
    assert_eq!(result.engine_args.cpu, 2.0);

    let mut expected_usage = origin.usage();
    expected_usage.add(&result.delta);
    assert_eq!(
        expected_usage.cpu_map.total_pieces(),
        result.workload_args.usage().cpu_map.total_pieces()
    );

    let err = plugin.realloc(&ctx, "n", &origin, &bind(3.0)).await.unwrap_err();
    assert!(matches!(err, PluginError::InsufficientResource));
}

#[tokio::test]
async fn remap_and_idle_node() {
    let plugin = plugin();
    let ctx = OpContext::new();
    add(&plugin, "busy", r#"{"cpu": "2", "memory": "2G"}"#).await;
    add(&plugin, "idle", r#"{"cpu": "2", "memory": "2G"}"#).await;

    let used = CpuMemArgs {
        cpu: 1.0,
        cpu_map: CpuMap::from_iter([("0", 100)]),
        memory: GIB,
        ..Default::default()
    };
    plugin
        .set_node_resource_usage(&ctx, "busy", &ResourceUpdate::NodeArgs(used), true, true)
        .await
        .unwrap();

    let idle = plugin
        .get_most_idle_node(&ctx, &["busy".to_string(), "idle".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(idle.node_name, "idle");
    assert_eq!(idle.priority, 0);

    let workloads: BTreeMap<_, _> = [(
        "w".to_string(),
        CpuMemWorkloadArgs {
            cpu_limit: 1.0,
            memory_limit: GIB,
            ..Default::default()
        },
    )]
    .into_iter()
    .collect();
    let remapped = plugin.remap(&ctx, "busy", &workloads).await.unwrap();
    assert_eq!(remapped["w"].cpu_map, CpuMap::from_iter([("1", 100)]));
}
