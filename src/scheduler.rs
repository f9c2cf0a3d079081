//! Scheduler Interface
//!
//! Hooks the context fires at activation-gate transitions, and the deferred
//! meta-task primitive ("run this after event E at priority P") used for work
//! that must not run under a context lock or on a message dispatch loop.

use crate::event::{Event, UserEvent};
use crate::types::ContextUid;
use futures::future::BoxFuture;
use tracing::{debug, info};

/// Meta-task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Throughput = 0, // Background bookkeeping
    Deferred = 1,   // Work deferred off a lock or dispatch loop
    Latency = 2,    // Work on a waiter's critical path
    Resource = 3,   // Work releasing resources others are blocked on
}

pub trait Scheduler: Send + Sync {
    /// The context has fallen below its scheduling minimum and wants work.
    fn activate_context(&self, ctx: ContextUid);

    /// The context has enough queued work and may be descheduled.
    fn deactivate_context(&self, ctx: ContextUid);

    /// Run `work` once `precondition` triggers. The returned event triggers
    /// when `work` finishes.
    fn defer(
        &self,
        precondition: Event,
        priority: Priority,
        work: BoxFuture<'static, ()>,
    ) -> Event {
        spawn_meta_task(precondition, priority, work)
    }
}

/// Default `defer`: one tokio task per meta-task.
pub fn spawn_meta_task(
    precondition: Event,
    priority: Priority,
    work: BoxFuture<'static, ()>,
) -> Event {
    let done = UserEvent::new();
    let event = done.event();
    tokio::spawn(async move {
        precondition.wait().await;
        debug!(priority = ?priority, "Running meta-task");
        work.await;
        done.trigger();
    });
    event
}

/// Scheduler that only logs gate transitions.
#[derive(Debug, Default)]
pub struct TracingScheduler;

impl Scheduler for TracingScheduler {
    fn activate_context(&self, ctx: ContextUid) {
        info!(context = %ctx, "Context activated");
    }

    fn deactivate_context(&self, ctx: ContextUid) {
        info!(context = %ctx, "Context deactivated");
    }
}
