//! Window admission, frame throttling and activation transitions

use crate::integration::test_utils::{top_task, window, Cluster};
use std::time::Duration;
use taskctx::config::FlowControlConfig;
use taskctx::types::OpId;
use tokio::time::timeout;

#[tokio::test(start_paused = true)]
async fn test_full_window_blocks_until_low_water_mark() {
    let cluster = Cluster::single(window(4, 50));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();

    for id in 1..=4 {
        ctx.register_child(OpId(id)).await.unwrap();
        ctx.mark_executed(OpId(id)).unwrap();
    }
    assert_eq!(ctx.outstanding_children(), 4);

    let blocked = ctx.clone();
    let mut fifth = tokio::spawn(async move { blocked.register_child(OpId(5)).await });
    assert!(timeout(Duration::from_millis(50), &mut fifth).await.is_err());
    // The blocked registrant is counted.
    assert_eq!(ctx.outstanding_children(), 5);

    // 5 -> 4 -> 3 stays above the low-water mark of 2.
    ctx.mark_complete(OpId(1)).unwrap();
    ctx.mark_complete(OpId(2)).unwrap();
    assert!(timeout(Duration::from_millis(50), &mut fifth).await.is_err());
    assert_eq!(ctx.outstanding_children(), 3);

    // 3 -> 2 reaches it and the fifth child keeps its slot.
    ctx.mark_complete(OpId(3)).unwrap();
    fifth.await.unwrap().unwrap();
    assert_eq!(ctx.outstanding_children(), 2);
    assert_eq!(ctx.total_children(), 5);
    ctx.mark_executed(OpId(5)).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_newcomers_queue_behind_blocked_registrant() {
    let cluster = Cluster::single(window(2, 0));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    ctx.register_child(OpId(1)).await.unwrap();
    ctx.register_child(OpId(2)).await.unwrap();

    let first = ctx.clone();
    let mut third = tokio::spawn(async move { first.register_child(OpId(3)).await });
    assert!(timeout(Duration::from_millis(20), &mut third).await.is_err());

    // With a low-water mark of zero the release waits until only the
    // blocked registrant is left.
    ctx.mark_executed(OpId(1)).unwrap();
    ctx.mark_complete(OpId(1)).unwrap();
    let second = ctx.clone();
    let mut fourth = tokio::spawn(async move { second.register_child(OpId(4)).await });
    assert!(timeout(Duration::from_millis(20), &mut fourth).await.is_err());
    // The queued newcomer holds no slot.
    assert_eq!(ctx.outstanding_children(), 2);

    ctx.mark_executed(OpId(2)).unwrap();
    ctx.mark_complete(OpId(2)).unwrap();
    third.await.unwrap().unwrap();
    fourth.await.unwrap().unwrap();
    assert_eq!(ctx.outstanding_children(), 2);
}

#[tokio::test]
async fn test_disabled_window_never_blocks() {
    let cluster = Cluster::single(window(0, 25));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    for id in 0..256 {
        ctx.register_child(OpId(id)).await.unwrap();
    }
    assert_eq!(ctx.outstanding_children(), 256);
}

#[tokio::test]
async fn test_unregistering_in_flight_child_frees_window_slot() {
    let cluster = Cluster::single(window(1, 0));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    ctx.register_child(OpId(1)).await.unwrap();
    ctx.unregister_child(OpId(1)).unwrap();
    assert_eq!(ctx.outstanding_children(), 0);
    ctx.register_child(OpId(2)).await.unwrap();
}

fn frames(max_outstanding_frames: usize) -> FlowControlConfig {
    FlowControlConfig {
        max_outstanding_frames,
        min_tasks_to_schedule: 0,
        min_frames_to_schedule: 1,
        ..FlowControlConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_frame_issue_waits_once_too_many_are_pending() {
    let cluster = Cluster::single(frames(2));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    for id in 1..=3 {
        ctx.issue_frame(OpId(id)).await.unwrap();
    }

    // Three pending: the fourth waits on frame 2 (index len - max).
    let issuer = ctx.clone();
    let mut fourth = tokio::spawn(async move { issuer.issue_frame(OpId(4)).await });
    assert!(timeout(Duration::from_millis(50), &mut fourth).await.is_err());

    ctx.finish_frame(OpId(1)).unwrap();
    assert!(timeout(Duration::from_millis(50), &mut fourth).await.is_err());

    ctx.finish_frame(OpId(2)).unwrap();
    fourth.await.unwrap().unwrap();
    ctx.finish_frame(OpId(3)).unwrap();
    ctx.finish_frame(OpId(4)).unwrap();
    assert_eq!(ctx.stats().pending_frames, 0);
}

#[tokio::test]
async fn test_frames_without_limit_are_not_throttled() {
    let config = FlowControlConfig {
        max_outstanding_frames: 0,
        ..FlowControlConfig::default()
    };
    let cluster = Cluster::single(config);
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    for id in 1..=3 {
        ctx.issue_frame(OpId(id)).await.unwrap();
    }
    assert_eq!(ctx.stats().pending_frames, 0);
    // Finishing out of order is fine when nothing is queued.
    ctx.finish_frame(OpId(3)).unwrap();
    ctx.finish_frame(OpId(1)).unwrap();
}

#[tokio::test]
async fn test_frames_disable_the_window() {
    let mut config = frames(4);
    config.max_window_size = 1;
    let cluster = Cluster::single(config);
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    for id in 0..8 {
        ctx.register_child(OpId(id)).await.unwrap();
    }
    assert_eq!(ctx.outstanding_children(), 8);
}

#[tokio::test]
async fn test_frame_transitions_follow_frame_count() {
    let cluster = Cluster::single(frames(4));
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let uid = ctx.uid();

    // Frames only gate scheduling while subtasks are outstanding.
    ctx.increment_outstanding().unwrap().wait().await;
    ctx.issue_frame(OpId(1)).await.unwrap();
    ctx.finish_frame(OpId(1)).unwrap().wait().await;
    assert_eq!(
        cluster.scheduler.transitions(),
        vec![(uid, true), (uid, false), (uid, true)]
    );
}

#[tokio::test]
async fn test_task_transitions_alternate() {
    let config = FlowControlConfig {
        min_tasks_to_schedule: 2,
        ..FlowControlConfig::default()
    };
    let cluster = Cluster::single(config);
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let uid = ctx.uid();

    ctx.increment_outstanding().unwrap().wait().await;
    ctx.increment_pending().unwrap().wait().await;
    ctx.increment_pending().unwrap().wait().await;
    ctx.decrement_pending().unwrap().wait().await;
    ctx.decrement_outstanding().unwrap().wait().await;

    assert_eq!(
        cluster.scheduler.transitions(),
        vec![(uid, true), (uid, false), (uid, true), (uid, false)]
    );
}
