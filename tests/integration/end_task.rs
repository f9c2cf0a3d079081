//! End of task, commit and inline execution

use crate::integration::test_utils::{root, top_task, Cluster, RecordingOwner};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use taskctx::config::FlowControlConfig;
use taskctx::error::{ContextError, ErrorCode};
use taskctx::forest::ForestEvent;
use taskctx::types::{
    Coherence, FieldId, FieldSpace, IndexSpace, LogicalRegion, OpId, PrivilegeMode,
    RegionRequirement, RegionTreeId, TaskInfo, TraceId,
};

fn created_region() -> LogicalRegion {
    LogicalRegion::new(IndexSpace(50), FieldSpace(50), RegionTreeId(2))
}

fn field_req(privilege: PrivilegeMode, field: u32) -> RegionRequirement {
    RegionRequirement::region(root(), privilege, Coherence::Exclusive, [FieldId(field)])
}

fn child_task() -> TaskInfo {
    TaskInfo::new("child", 2, 1).with_region(field_req(PrivilegeMode::READ_WRITE, 1))
}

#[tokio::test]
async fn test_open_trace_blocks_end_of_task() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let owner = Arc::new(RecordingOwner::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();

    ctx.begin_trace(TraceId(4)).unwrap();
    let err = ctx.end_task(Vec::new()).unwrap_err();
    assert!(matches!(
        err,
        ContextError::IncompleteTrace {
            trace: TraceId(4),
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::IncompleteTrace);
    assert_eq!(owner.executions.load(Ordering::SeqCst), 0);

    ctx.end_trace(TraceId(4)).unwrap();
    ctx.end_task(Vec::new()).unwrap().wait().await;
    assert_eq!(owner.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_end_hands_off_result_and_unmaps() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let owner = Arc::new(RecordingOwner::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();
    ctx.register_inline_mapped_region(field_req(PrivilegeMode::READ_ONLY, 2));
    assert!(ctx.physical_regions()[0].mapped);

    ctx.end_task(b"done".to_vec()).unwrap().wait().await;

    assert_eq!(*owner.results.lock(), vec![b"done".to_vec()]);
    assert_eq!(owner.executions.load(Ordering::SeqCst), 1);
    assert!(ctx.inline_regions().is_empty());
    assert!(ctx.physical_regions().iter().all(|r| !r.mapped));
    assert_eq!(owner.complete_calls(), 1);
    assert_eq!(owner.commit_calls(), 1);
}

#[tokio::test]
async fn test_commit_requires_every_child_committed() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let ctx = node.create_top_level_context(top_task(), None).unwrap();
    ctx.register_child(OpId(1)).await.unwrap();
    ctx.end_task(Vec::new()).unwrap().wait().await;

    let err = ctx.commit().await.unwrap_err();
    assert!(matches!(
        err,
        ContextError::OutstandingChildren { count: 1, .. }
    ));
    assert_eq!(err.code(), ErrorCode::OutstandingChildren);
    assert_eq!(node.context_count(), 1);

    ctx.mark_executed(OpId(1)).unwrap();
    ctx.mark_complete(OpId(1)).unwrap();
    ctx.mark_committed(OpId(1)).unwrap();
    ctx.commit().await.unwrap();
    assert_eq!(node.context_count(), 0);
}

#[tokio::test]
async fn test_region_tree_state_is_set_up_and_torn_down() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let uid = ctx.uid();
    assert!(cluster.forest.events().contains(&ForestEvent::InitializePhysical {
        ctx: uid,
        region: root(),
        restricted: false,
    }));

    ctx.end_task(Vec::new()).unwrap().wait().await;
    ctx.commit().await.unwrap();
    let events = cluster.forest.events();
    assert!(events.contains(&ForestEvent::InvalidateVersions { ctx: uid, region: root() }));
    assert!(events.contains(&ForestEvent::InvalidateContext {
        ctx: uid,
        region: root(),
        users_only: false,
    }));
}

#[tokio::test]
async fn test_returned_regions_stay_in_the_outermost_context() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let child = node
        .create_inner_context(&top, child_task(), &[false], None)
        .unwrap();
    child.register_region_creation(created_region()).unwrap();
    child.end_task(Vec::new()).unwrap().wait().await;
    child.commit().await.unwrap();

    let events = cluster.forest.events();
    assert!(events.contains(&ForestEvent::InvalidateContext {
        ctx: top.uid(),
        region: created_region(),
        users_only: true,
    }));
    assert!(!events.contains(&ForestEvent::InvalidateContext {
        ctx: child.uid(),
        region: created_region(),
        users_only: false,
    }));
}

#[tokio::test]
async fn test_deleted_created_regions_are_invalidated_locally() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let child = node
        .create_inner_context(&top, child_task(), &[false], None)
        .unwrap();
    child.register_region_creation(created_region()).unwrap();
    child.register_region_deletion(created_region());
    child.end_task(Vec::new()).unwrap().wait().await;
    child.commit().await.unwrap();

    assert!(cluster.forest.events().contains(&ForestEvent::InvalidateContext {
        ctx: child.uid(),
        region: created_region(),
        users_only: false,
    }));
    assert!(!top.created_resources().regions.contains(&created_region()));
}

#[tokio::test]
async fn test_inline_child_runs_against_parent_regions() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let owner = Arc::new(RecordingOwner::default());
    let top = node
        .create_top_level_context(top_task(), Some(owner.clone()))
        .unwrap();
    top.register_child(OpId(1)).await.unwrap();
    assert!(top.unmap_region(0));

    let scratch = field_req(PrivilegeMode::READ_ONLY, 2);
    let mapped = scratch.clone();
    let outcome = top
        .inline_child_task(OpId(1), child_task(), Some(owner.clone()), |inline| async move {
            let err = inline.register_child(OpId(9)).await.unwrap_err();
            assert!(matches!(err, ContextError::IllegalForVariant { .. }));
            inline.check_privilege(&field_req(PrivilegeMode::READ_WRITE, 1))?;
            inline.register_inline_mapped_region(mapped);
            Ok(b"inline-result".to_vec())
        })
        .await
        .unwrap();

    assert_eq!(outcome.remapped, vec![0]);
    assert_eq!(outcome.unmapped, vec![scratch]);
    assert_eq!(outcome.result, b"inline-result".to_vec());
    assert_eq!(*owner.inline_results.lock(), vec![b"inline-result".to_vec()]);

    assert!(top.physical_regions()[0].mapped);
    assert!(top.inline_regions().is_empty());
    assert_eq!(top.outstanding_children(), 0);
    assert_eq!(node.context_count(), 1);
}

#[tokio::test]
async fn test_inline_child_must_be_registered() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let result = top
        .inline_child_task(OpId(3), child_task(), None, |_inline| async move {
            Ok(Vec::new())
        })
        .await;
    assert!(matches!(
        result,
        Err(ContextError::UnexpectedChildState { .. })
    ));
}
