//! Node lifecycle, persistence and cancellation.

use std::sync::Arc;
use std::time::Duration;

use nodecap_core::storage::{StorageArgs, StorageNodeOpts};
use nodecap_core::{NodeResourceInfo, SchedulerConfig};
use nodecap_plugin::*;
use nodecap_store::{RedbStore, ResourceStore, StoreFuture};
use tokio::sync::watch;

/// Delays reads so a caller can give up before the write.
struct SlowReads {
    inner: RedbStore,
    delay: Duration,
}

impl ResourceStore for SlowReads {
    fn get_one<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.get_one(key).await
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, ()> {
        self.inner.put(key, value)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.inner.delete(key)
    }
}

/// Fires cancellation as each write is handed to the store.
struct CancelOnPut {
    inner: RedbStore,
    cancel: watch::Sender<bool>,
}

impl ResourceStore for CancelOnPut {
    fn get_one<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        self.inner.get_one(key)
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, ()> {
        self.cancel.send_replace(true);
        self.inner.put(key, value)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.cancel.send_replace(true);
        self.inner.delete(key)
    }
}

fn storage(size: i64) -> StorageNodeOpts {
    StorageNodeOpts {
        storage: Some(size),
    }
}

#[tokio::test]
async fn add_remove_lifecycle() {
    let plugin = ResourcePlugin::new(StorageKind::default(), RedbStore::open_in_memory().unwrap());
    let ctx = OpContext::new();

    let info = plugin.add_node(&ctx, "n", &storage(100)).await.unwrap();
    assert_eq!(info.capacity.storage, 100);
    assert_eq!(info.usage.storage, 0);

    let err = plugin.add_node(&ctx, "n", &storage(100)).await.unwrap_err();
    assert!(matches!(err, PluginError::NodeExists(ref n) if n == "n"));

    plugin.remove_node(&ctx, "n").await.unwrap();
    let err = plugin.remove_node(&ctx, "n").await.unwrap_err();
    assert!(matches!(err, PluginError::NodeNotFound(_)));

    let err = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NodeNotFound(_)));

    let err = plugin
        .get_nodes_deploy_capacity(&ctx, &["n".to_string()], &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NodeNotFound(_)));

    plugin.add_node(&ctx, "n", &storage(5)).await.unwrap();
}

#[tokio::test]
async fn kinds_keep_separate_keys() {
    let store = Arc::new(RedbStore::open_in_memory().unwrap());
    let storage_plugin = ResourcePlugin::new(StorageKind::default(), Arc::clone(&store));
    let volume_plugin = ResourcePlugin::new(VolumeKind::default(), Arc::clone(&store));
    let ctx = OpContext::new();

    storage_plugin.add_node(&ctx, "n", &storage(10)).await.unwrap();
    let err = volume_plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NodeNotFound(_)));

    assert_eq!(
        ResourcePlugin::<StorageKind, RedbStore>::key("n"),
        "/resource/storage/n"
    );
    let raw = store.get_one("/resource/storage/n").await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["Capacity"]["storage"], 10);
    assert_eq!(json["Usage"]["storage"], 0);
}

#[tokio::test]
async fn stored_info_without_usage_reads_as_zero() {
    let store = RedbStore::open_in_memory().unwrap();
    store
        .put(
            "/resource/cpumem/n",
            br#"{"Capacity": {"cpu": 2, "cpu_map": {"0": 100, "1": 100}, "memory": 1024}}"#
                .to_vec(),
        )
        .await
        .unwrap();
    let plugin = ResourcePlugin::new(CpuMemKind::new(SchedulerConfig::default()), store);

    let (info, diffs) = plugin
        .get_node_resource_info(&OpContext::new(), "n", &[], false)
        .await
        .unwrap();
    assert!(diffs.is_empty());
    assert_eq!(info.usage.cpu_map.len(), 2);
    assert_eq!(info.usage.memory, 0);
}

#[tokio::test]
async fn invalid_info_is_never_written() {
    let plugin = ResourcePlugin::new(StorageKind::default(), RedbStore::open_in_memory().unwrap());
    let ctx = OpContext::new();
    plugin.add_node(&ctx, "n", &storage(100)).await.unwrap();

    let err = plugin
        .set_node_resource_info(
            &ctx,
            "n",
            StorageArgs { storage: 100 },
            StorageArgs { storage: 101 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Core(_)));

    let (info, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert_eq!(info, NodeResourceInfo::new(StorageArgs { storage: 100 }));
}

#[tokio::test]
async fn persisted_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resources.redb");
    let ctx = OpContext::new();

    {
        let plugin = ResourcePlugin::new(StorageKind::default(), RedbStore::open(&path).unwrap());
        plugin.add_node(&ctx, "n", &storage(42)).await.unwrap();
    }

    let plugin = ResourcePlugin::new(StorageKind::default(), RedbStore::open(&path).unwrap());
    let (info, _) = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap();
    assert_eq!(info.capacity.storage, 42);
}

#[tokio::test]
async fn timeout_aborts_before_write() {
    let store = Arc::new(SlowReads {
        inner: RedbStore::open_in_memory().unwrap(),
        delay: Duration::from_secs(30),
    });
    let plugin = ResourcePlugin::new(StorageKind::default(), Arc::clone(&store));

    let ctx = OpContext::new().with_timeout(Duration::from_millis(20));
    let err = plugin.add_node(&ctx, "n", &storage(10)).await.unwrap_err();
    assert!(matches!(err, PluginError::Timeout));

    assert!(store.inner.get_one("/resource/storage/n").await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_aborts_before_write() {
    let store = Arc::new(SlowReads {
        inner: RedbStore::open_in_memory().unwrap(),
        delay: Duration::from_secs(30),
    });
    let plugin = ResourcePlugin::new(StorageKind::default(), Arc::clone(&store));

    let (tx, rx) = watch::channel(false);
    let ctx = OpContext::new().with_cancel(rx);
    let opts = storage(10);
    let (result, _) = tokio::join!(plugin.add_node(&ctx, "n", &opts), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    });
    assert!(matches!(result, Err(PluginError::Cancelled)));
    assert!(store.inner.get_one("/resource/storage/n").await.unwrap().is_none());

    // A cancelled context refuses to start new work.
    let err = plugin
        .get_node_resource_info(&ctx, "n", &[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Cancelled));
}

#[tokio::test]
async fn cancellation_during_write_reports_the_commit() {
    let (tx, rx) = watch::channel(false);
    let store = Arc::new(CancelOnPut {
        inner: RedbStore::open_in_memory().unwrap(),
        cancel: tx,
    });
    let plugin = ResourcePlugin::new(StorageKind::default(), Arc::clone(&store));
    let ctx = OpContext::new().with_cancel(rx);

    let info = plugin.add_node(&ctx, "n", &storage(10)).await.unwrap();
    assert_eq!(info.capacity.storage, 10);
    assert!(ctx.is_cancelled());
    let raw = store.inner.get_one("/resource/storage/n").await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["Capacity"]["storage"], 10);

    let err = plugin.remove_node(&ctx, "n").await.unwrap_err();
    assert!(matches!(err, PluginError::Cancelled));
    assert!(store.inner.get_one("/resource/storage/n").await.unwrap().is_some());

    // A fresh context sees the committed node and can remove it.
    let fresh = OpContext::new();
    plugin.remove_node(&fresh, "n").await.unwrap();
    assert!(store.inner.get_one("/resource/storage/n").await.unwrap().is_none());
}

#[tokio::test]
async fn idle_node_prefers_lowest_rate() {
    let plugin = ResourcePlugin::new(StorageKind::default(), RedbStore::open_in_memory().unwrap());
    let ctx = OpContext::new();
    for (node, used) in [("a", 50), ("b", 10), ("c", 10)] {
        plugin.add_node(&ctx, node, &storage(100)).await.unwrap();
        plugin
            .set_node_resource_usage(
                &ctx,
                node,
                &ResourceUpdate::NodeArgs(StorageArgs { storage: used }),
                false,
                true,
            )
            .await
            .unwrap();
    }

    let nodes: Vec<String> = ["a", "b", "c"].iter().map(|n| n.to_string()).collect();
    let idle = plugin.get_most_idle_node(&ctx, &nodes).await.unwrap().unwrap();
    assert_eq!(idle, IdleNode { node_name: "b".into(), priority: 10 });

    assert!(plugin.get_most_idle_node(&ctx, &[]).await.unwrap().is_none());
}
