//! Child lifecycle tracking and once-only owner notifications

use crate::integration::test_utils::{root, top_task, Cluster, RecordingOwner};
use std::sync::Arc;
use taskctx::config::FlowControlConfig;
use taskctx::context::ChildStage;
use taskctx::error::{ContextError, ErrorCode};
use taskctx::types::{Coherence, FieldId, OpId, PrivilegeMode, RegionRequirement, TaskInfo};

fn leaf_task() -> TaskInfo {
    TaskInfo::new("leaf", 2, 1).with_region(RegionRequirement::region(
        root(),
        PrivilegeMode::READ_ONLY,
        Coherence::Exclusive,
        [FieldId(1)],
    ))
}

#[tokio::test]
async fn test_callbacks_fire_once_after_issuance_ends() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let owner = Arc::new(RecordingOwner::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();

    for id in 1..=2 {
        ctx.register_child(OpId(id)).await.unwrap();
        ctx.mark_executed(OpId(id)).unwrap();
        ctx.mark_complete(OpId(id)).unwrap();
    }
    // Still issuing: nothing is due yet.
    assert_eq!(owner.complete_calls(), 0);

    ctx.end_task(Vec::new()).unwrap().wait().await;
    assert_eq!(owner.complete_calls(), 1);
    assert_eq!(owner.commit_calls(), 0);

    ctx.mark_committed(OpId(1)).unwrap();
    assert_eq!(owner.commit_calls(), 0);
    ctx.mark_committed(OpId(2)).unwrap();
    assert_eq!(owner.commit_calls(), 1);
    assert_eq!(owner.complete_calls(), 1);
    assert_eq!(ctx.outstanding_children(), 0);
}

#[tokio::test]
async fn test_childless_task_reports_both_callbacks_at_end() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let owner = Arc::new(RecordingOwner::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();

    ctx.end_task(Vec::new()).unwrap().wait().await;
    assert_eq!(owner.complete_calls(), 1);
    assert_eq!(owner.commit_calls(), 1);
    assert!(owner.committed.has_triggered());
}

#[tokio::test]
async fn test_commit_callback_waits_for_complete_callback() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let owner = Arc::new(RecordingOwner::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();

    ctx.register_child(OpId(1)).await.unwrap();
    ctx.register_child(OpId(2)).await.unwrap();
    ctx.mark_executed(OpId(1)).unwrap();
    ctx.mark_complete(OpId(1)).unwrap();
    ctx.mark_committed(OpId(1)).unwrap();
    ctx.end_task(Vec::new()).unwrap().wait().await;

    // OpId(2) is still executing, so neither callback is due.
    assert_eq!(owner.complete_calls(), 0);
    assert_eq!(owner.commit_calls(), 0);

    ctx.mark_executed(OpId(2)).unwrap();
    ctx.mark_complete(OpId(2)).unwrap();
    assert_eq!(owner.complete_calls(), 1);
    assert_eq!(owner.commit_calls(), 0);

    ctx.mark_committed(OpId(2)).unwrap();
    assert_eq!(owner.commit_calls(), 1);
}

#[tokio::test]
async fn test_transitions_from_wrong_stage_are_rejected() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    ctx.register_child(OpId(1)).await.unwrap();

    let err = ctx.mark_complete(OpId(1)).unwrap_err();
    assert!(matches!(
        err,
        ContextError::UnexpectedChildState {
            expected: "executed",
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::UnexpectedChildState);

    let err = ctx.mark_committed(OpId(1)).unwrap_err();
    assert!(matches!(err, ContextError::UnexpectedChildState { .. }));

    let err = ctx.mark_executed(OpId(42)).unwrap_err();
    assert!(matches!(err, ContextError::UnexpectedChildState { .. }));

    ctx.mark_executed(OpId(1)).unwrap();
    assert!(ctx.mark_executed(OpId(1)).is_err());
    assert_eq!(ctx.unregister_child(OpId(1)).unwrap(), ChildStage::Executed);
    assert!(ctx.unregister_child(OpId(1)).is_err());
}

#[tokio::test]
async fn test_leaf_context_cannot_register_children() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let leaf = node.create_leaf_context(&top, leaf_task(), None).unwrap();

    let err = leaf.register_child(OpId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        ContextError::IllegalForVariant {
            variant: "leaf",
            operation: "register_child",
            ..
        }
    ));
    assert!(err.is_fatal());
    // Leaves are registered but never configured.
    assert!(node.find_local_context(leaf.uid()).is_some());
    assert!(leaf.config().is_none());
}

#[tokio::test]
async fn test_inline_context_cannot_register_children() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let inline = node.create_inline_context(&top, leaf_task(), None);

    let err = inline.register_child(OpId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        ContextError::IllegalForVariant {
            variant: "inline",
            ..
        }
    ));
    assert!(node.find_local_context(inline.uid()).is_none());
    assert_eq!(node.context_count(), 1);
}
