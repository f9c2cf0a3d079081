//! Top-view creation and release

use crate::integration::test_utils::{top_task, Cluster};
use std::sync::Arc;
use std::time::Duration;
use taskctx::config::FlowControlConfig;
use taskctx::error::{ContextError, ErrorCode};
use taskctx::transport::MessageKind;
use taskctx::types::{InstanceId, RegionTreeId};
use taskctx::views::InstanceManager;
use tokio::time::timeout;

fn manager(instance: u64, owner_space: u32) -> InstanceManager {
    InstanceManager {
        instance: InstanceId(instance),
        owner_space,
        tree_id: RegionTreeId(1),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_instance_view_is_built_once_by_its_owner() {
    let cluster = Cluster::new(2, FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let remote = manager(7, 1);

    let (a, b) = tokio::join!(
        top.create_instance_top_view(&remote),
        top.create_instance_top_view(&remote)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.owner_space, 1);
    assert_eq!(a.context, top.uid());
    assert_eq!(a.instance, InstanceId(7));

    assert_eq!(cluster.network.sent_count(MessageKind::TopViewRequest), 1);
    assert_eq!(cluster.node(1).views().constructed(), 1);
    assert_eq!(cluster.node(0).views().constructed(), 0);
    assert!(cluster.node(0).views().find(a.did).is_some());

    let again = top.create_instance_top_view(&remote).await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(cluster.network.sent_count(MessageKind::TopViewRequest), 1);
}

#[tokio::test]
async fn test_local_instance_view_is_cached() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let local = manager(3, 0);

    let first = top.create_instance_top_view(&local).await.unwrap();
    let second = top.create_instance_top_view(&local).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cluster.node(0).views().constructed(), 1);
    assert_eq!(cluster.network.total_sent(), 0);
    assert!(top.top_view(InstanceId(3)).is_some());
}

#[tokio::test]
async fn test_instance_deletion_releases_the_view() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();

    let view = top.create_instance_top_view(&manager(3, 0)).await.unwrap();
    top.notify_instance_deletion(InstanceId(3));
    assert!(top.top_view(InstanceId(3)).is_none());
    assert!(node.views().find(view.did).is_none());

    // A fresh view is built if the instance is used again.
    let rebuilt = top.create_instance_top_view(&manager(3, 0)).await.unwrap();
    assert_ne!(rebuilt.did, view.did);
    assert_eq!(node.views().constructed(), 2);
}

#[tokio::test]
async fn test_commit_releases_every_top_view() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    for instance in 1..=3 {
        top.create_instance_top_view(&manager(instance, 0))
            .await
            .unwrap();
    }
    assert_eq!(node.views().len(), 3);

    top.end_task(Vec::new()).unwrap().wait().await;
    top.commit().await.unwrap();
    assert!(node.views().is_empty());
    assert_eq!(top.stats().top_views, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_remote_top_view_reports_error() {
    let cluster = Cluster::new(2, FlowControlConfig::default());
    let node = cluster.node(1);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    // The owner space can no longer find the context.
    node.unregister_context(top.uid());

    let result = timeout(
        Duration::from_secs(2),
        top.create_instance_top_view(&manager(7, 0)),
    )
    .await
    .expect("failure reply arrives");
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        ContextError::RemoteRequestFailed {
            space: 0,
            code: ErrorCode::ContextNotFound,
            ..
        }
    ));
    assert_eq!(cluster.network.sent_count(MessageKind::TopViewResponse), 1);
    assert!(top.top_view(InstanceId(7)).is_none());
    assert_eq!(cluster.node(0).views().constructed(), 0);
}
