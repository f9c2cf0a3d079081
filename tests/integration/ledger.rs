//! Resource ledger, privilege checks, restrictions, traces and conflicts

use crate::integration::test_utils::{root, top_task, Cluster};
use taskctx::config::FlowControlConfig;
use taskctx::context::{CompetingOp, ConflictSource, DeletionOutcome};
use taskctx::error::{ContextError, ErrorCode, PrivilegeError};
use taskctx::forest::ForestEvent;
use taskctx::types::{
    Coherence, FieldId, FieldSpace, IndexPartition, IndexSpace, LocalFieldInfo, LogicalRegion,
    PrivilegeMode, RegionRequirement, RegionTreeId, TaskInfo, TraceId,
};

fn created_region() -> LogicalRegion {
    LogicalRegion::new(IndexSpace(50), FieldSpace(50), RegionTreeId(2))
}

fn sub(space: u64) -> LogicalRegion {
    LogicalRegion::new(IndexSpace(space), FieldSpace(1), RegionTreeId(1))
}

fn on_root(privilege: PrivilegeMode, fields: &[u32]) -> RegionRequirement {
    RegionRequirement::region(
        root(),
        privilege,
        Coherence::Exclusive,
        fields.iter().map(|f| FieldId(*f)),
    )
}

fn child_task(privilege: PrivilegeMode) -> TaskInfo {
    TaskInfo::new("child", 2, 1).with_region(on_root(privilege, &[1]))
}

#[tokio::test]
async fn test_create_then_delete_finalizes_immediately() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();

    ctx.register_region_creation(created_region()).unwrap();
    assert!(ctx.created_resources().regions.contains(&created_region()));

    let outcome = ctx.register_region_deletion(created_region());
    assert_eq!(outcome, DeletionOutcome::Finalize);
    assert!(!ctx.created_resources().regions.contains(&created_region()));
    assert!(!ctx.deleted_resources().regions.contains(&created_region()));
    assert_eq!(
        cluster
            .forest
            .count_events(|e| *e == ForestEvent::RegionDestroyed(created_region())),
        1
    );
}

#[tokio::test]
async fn test_foreign_deletion_is_recorded_for_the_parent() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();

    let outcome = ctx.register_index_space_deletion(IndexSpace(9));
    assert_eq!(outcome, DeletionOutcome::PropagateToParent);
    assert!(ctx.deleted_resources().index_spaces.contains(&IndexSpace(9)));
    assert_eq!(
        cluster
            .forest
            .count_events(|e| matches!(e, ForestEvent::IndexSpaceDestroyed(_))),
        0
    );
}

#[tokio::test]
async fn test_duplicate_creation_is_rejected() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    ctx.register_index_partition_creation(IndexPartition(4)).unwrap();
    let err = ctx
        .register_index_partition_creation(IndexPartition(4))
        .unwrap_err();
    assert!(matches!(err, ContextError::DuplicateCreation { .. }));
    assert_eq!(err.code(), ErrorCode::DuplicateCreation);
}

#[tokio::test]
async fn test_field_space_deletion_drops_its_fields() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let space = FieldSpace(5);
    ctx.register_field_space_creation(space).unwrap();
    ctx.register_field_creations(&[(space, FieldId(1)), (space, FieldId(2))])
        .unwrap();
    ctx.register_field_creation(FieldSpace(6), FieldId(1)).unwrap();

    assert_eq!(ctx.register_field_space_deletion(space), DeletionOutcome::Finalize);
    let created = ctx.created_resources();
    assert!(created.field_spaces.is_empty());
    assert_eq!(created.fields.len(), 1);
    assert!(created.fields.contains(&(FieldSpace(6), FieldId(1))));
}

#[tokio::test]
async fn test_committed_child_returns_resources_to_parent() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let child = node
        .create_inner_context(&top, child_task(PrivilegeMode::READ_WRITE), &[false], None)
        .unwrap();

    child.register_region_creation(created_region()).unwrap();
    assert_eq!(
        child.register_field_deletion(FieldSpace(1), FieldId(2)),
        DeletionOutcome::PropagateToParent
    );
    child.end_task(Vec::new()).unwrap().wait().await;
    child.commit().await.unwrap();

    assert!(top.created_resources().regions.contains(&created_region()));
    assert!(top
        .deleted_resources()
        .fields
        .contains(&(FieldSpace(1), FieldId(2))));
    assert!(node.find_local_context(child.uid()).is_none());
    assert_eq!(node.context_count(), 1);
}

#[tokio::test]
async fn test_privilege_checks_report_the_failing_kind() {
    let cluster = Cluster::single(FlowControlConfig::default());
    cluster.forest.add_partition(
        IndexSpace(1),
        IndexPartition(10),
        true,
        &[IndexSpace(2), IndexSpace(3)],
    );
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();

    top.check_privilege(&on_root(PrivilegeMode::READ_ONLY, &[1, 2]))
        .unwrap();
    top.check_privilege(&RegionRequirement::child_of(
        sub(2),
        root(),
        PrivilegeMode::READ_WRITE,
        Coherence::Exclusive,
        [FieldId(1)],
    ))
    .unwrap();

    let err = top
        .check_privilege(&on_root(PrivilegeMode::READ_ONLY, &[7]))
        .unwrap_err();
    assert!(matches!(
        err,
        ContextError::Privilege {
            source: PrivilegeError::BadParentRegion { field: FieldId(7), .. },
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::BadParentRegion);

    let err = top
        .check_privilege(&RegionRequirement::child_of(
            sub(99),
            root(),
            PrivilegeMode::READ_ONLY,
            Coherence::Exclusive,
            [FieldId(1)],
        ))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRegionPath);

    let reader = node
        .create_inner_context(&top, child_task(PrivilegeMode::READ_ONLY), &[false], None)
        .unwrap();
    let err = reader
        .check_privilege(&on_root(PrivilegeMode::READ_WRITE, &[1]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRegionPrivileges);
}

#[tokio::test]
async fn test_created_regions_grant_full_privileges() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let child = node
        .create_inner_context(&top, child_task(PrivilegeMode::READ_WRITE), &[false], None)
        .unwrap();

    child.register_region_creation(created_region()).unwrap();
    let reqs = child.created_requirements();
    assert_eq!(reqs.len(), 1);
    assert!(reqs[0].1, "created region requirement must be returnable");
    assert_eq!(reqs[0].0.region_handle(), created_region());

    child
        .check_privilege(&RegionRequirement::region(
            created_region(),
            PrivilegeMode::READ_WRITE,
            Coherence::Exclusive,
            [FieldId(3)],
        ))
        .unwrap();
    // Returned state is analysed in the outermost local context.
    assert_eq!(child.find_parent_logical_context(1), top.uid());
    assert_eq!(child.find_parent_logical_context(0), child.uid());
    assert_eq!(child.find_parent_physical_context(0), child.uid());
}

#[tokio::test]
async fn test_created_fields_synthesize_a_root_requirement() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    top.register_field_creation(FieldSpace(1), FieldId(9)).unwrap();

    let req = on_root(PrivilegeMode::READ_WRITE, &[9]);
    top.check_privilege(&req).unwrap();
    assert_eq!(top.find_parent_region_req(&req, true), Some(1));

    let reqs = top.created_requirements();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].0.region_handle(), root());
    assert!(!reqs[0].1);
    assert_eq!(top.find_parent_privilege_mode(1), Some(PrivilegeMode::READ_WRITE));

    // A second request for the same field reuses the requirement.
    assert_eq!(top.find_parent_region_req(&req, true), Some(1));
    assert_eq!(top.created_requirements().len(), 1);
}

#[tokio::test]
async fn test_restriction_bookkeeping() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let req = on_root(PrivilegeMode::READ_WRITE, &[1]);

    let err = top.add_acquisition(&req).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnrestrictedAcquire);
    let err = top.remove_acquisition(&req).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnacquiredRelease);
    let err = top.remove_restriction(&req).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnattachedDetach);

    top.add_restriction(&req);
    top.add_acquisition(&req).unwrap();
    top.remove_acquisition(&req).unwrap();
    assert!(top.remove_acquisition(&req).is_err());
    top.remove_restriction(&req).unwrap();
    assert!(top.add_acquisition(&req).is_err());
}

#[tokio::test]
async fn test_simultaneous_regions_start_restricted() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let task = TaskInfo::new("simultaneous", 1, 0).with_region(RegionRequirement::region(
        root(),
        PrivilegeMode::READ_WRITE,
        Coherence::Simultaneous,
        [FieldId(1)],
    ));
    let top = cluster.node(0).create_top_level_context(task, None).unwrap();

    assert_eq!(
        cluster.forest.count_events(|e| matches!(
            e,
            ForestEvent::InitializePhysical { restricted: true, .. }
        )),
        1
    );
    top.add_acquisition(&on_root(PrivilegeMode::READ_WRITE, &[1]))
        .unwrap();
}

#[tokio::test]
async fn test_traces_do_not_nest() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let top = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();

    top.begin_trace(TraceId(1)).unwrap();
    let err = top.begin_trace(TraceId(2)).unwrap_err();
    assert!(matches!(
        err,
        ContextError::IllegalNestedTrace {
            current: TraceId(1),
            trace: TraceId(2),
            ..
        }
    ));
    let err = top.end_trace(TraceId(2)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnmatchedEndTrace);
    assert_eq!(top.current_trace(), Some(TraceId(1)));

    top.end_trace(TraceId(1)).unwrap();
    assert_eq!(top.current_trace(), None);
    assert!(top.end_trace(TraceId(1)).is_err());
}

#[tokio::test]
async fn test_mapped_regions_conflict_unless_disjoint_or_read_shared() {
    let cluster = Cluster::single(FlowControlConfig::default());
    cluster.forest.add_partition(
        IndexSpace(1),
        IndexPartition(10),
        true,
        &[IndexSpace(2), IndexSpace(3)],
    );
    let task = TaskInfo::new("mapper", 1, 0)
        .with_region(RegionRequirement::child_of(
            sub(2),
            root(),
            PrivilegeMode::READ_WRITE,
            Coherence::Exclusive,
            [FieldId(1)],
        ))
        .with_region(RegionRequirement::child_of(
            sub(3),
            root(),
            PrivilegeMode::READ_ONLY,
            Coherence::Exclusive,
            [FieldId(1)],
        ));
    let top = cluster.node(0).create_top_level_context(task, None).unwrap();
    let read = |space| {
        RegionRequirement::child_of(
            sub(space),
            root(),
            PrivilegeMode::READ_ONLY,
            Coherence::Exclusive,
            [FieldId(1)],
        )
    };
    let write = |space| {
        RegionRequirement::child_of(
            sub(space),
            root(),
            PrivilegeMode::READ_WRITE,
            Coherence::Exclusive,
            [FieldId(1)],
        )
    };

    assert_eq!(top.has_conflicting_regions(&read(2)), Some(ConflictSource::Parent(0)));
    // Read-only on both sides.
    assert_eq!(top.has_conflicting_regions(&read(3)), None);
    assert_eq!(top.has_conflicting_regions(&write(3)), Some(ConflictSource::Parent(1)));

    assert!(top.unmap_region(0));
    assert_eq!(top.has_conflicting_regions(&read(2)), None);

    top.register_inline_mapped_region(write(2));
    assert_eq!(top.has_conflicting_regions(&read(2)), Some(ConflictSource::Inline(0)));

    let src = [read(2)];
    let dst = [write(3)];
    let found = top.find_conflicting_regions(CompetingOp::Copy {
        src: &src,
        dst: &dst,
    });
    assert_eq!(found, vec![ConflictSource::Parent(1), ConflictSource::Inline(0)]);

    assert_eq!(top.unregister_inline_mapped_region(sub(2)), 1);
    assert!(top.inline_regions().is_empty());
}

#[tokio::test]
async fn test_local_fields_are_visible_to_descendants() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let top = node.create_top_level_context(top_task(), None).unwrap();
    let field = LocalFieldInfo {
        field_space: FieldSpace(1),
        field: FieldId(100),
        size: 8,
        serdez: 0,
    };
    top.add_local_field(field);
    let child = node
        .create_inner_context(&top, child_task(PrivilegeMode::READ_WRITE), &[false], None)
        .unwrap();

    assert_eq!(child.all_local_fields(), vec![field]);
    assert_eq!(
        cluster
            .forest
            .count_events(|e| *e == ForestEvent::LocalFieldAllocated(field)),
        1
    );
    assert_eq!(child.find_outermost_local_context().uid(), top.uid());
    assert_eq!(child.find_top_context().uid(), top.uid());
}
