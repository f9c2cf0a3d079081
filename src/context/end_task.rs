//! End-of-task protocol
//!
//! A task's context goes through three steps after its body returns:
//! `end_task` checks for open traces and unmaps inline mappings, then defers
//! `post_end_task`, which hands off the return value, marks issuance finished
//! and fires any lifecycle callbacks now due. `commit` runs once every child
//! has committed: it invalidates the context's region-tree state, returns
//! created and deleted resources to the parent, releases mirrors and removes
//! the context from the runtime.

use super::ledger::ResourceGroup;
use super::{Context, ContextVariant, TaskOwner};
use crate::error::ContextError;
use crate::event::Event;
use crate::scheduler::Priority;
use crate::transport::ContextMessage;
use crate::types::{Coherence, LogicalRegion, OpId, RegionRequirement, TaskInfo};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// What inlining a child did to the parent's mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineOutcome {
    /// Parent physical regions that had to be remapped for the child.
    pub remapped: Vec<usize>,
    /// Inline mappings the child left behind, unmapped when it ended.
    pub unmapped: Vec<RegionRequirement>,
    pub result: Vec<u8>,
}

impl Context {
    /// Set up region-tree state for each original region: virtual regions
    /// start from the parent's version state, physical ones from scratch.
    pub fn initialize_region_tree_contexts(&self) {
        let forest = self.runtime.forest();
        for (idx, req) in self.task.regions.iter().enumerate() {
            if self.is_virtual_mapped(idx) {
                let info = self.version_infos.get(idx).cloned().unwrap_or_default();
                forest.initialize_virtual_context(self.uid, req, &info);
                continue;
            }
            let restricted =
                req.coherence == Coherence::Simultaneous || req.privilege.is_reduce();
            forest.initialize_physical_context(self.uid, req, restricted);
            if restricted {
                self.state.lock().ledger.add_restriction(req);
            }
        }
        debug!(
            context = %self.uid,
            regions = self.task.regions.len(),
            "Region tree contexts initialized"
        );
    }

    /// Tear down all region-tree state this context owns.
    pub fn invalidate_region_tree_contexts(&self) {
        let forest = self.runtime.forest();
        for (idx, req) in self.task.regions.iter().enumerate() {
            let region = req.region_handle();
            if !self.is_virtual_mapped(idx) {
                forest.invalidate_versions(self.uid, region);
            }
            forest.invalidate_context(self.uid, region, false);
        }

        let outermost = self.find_outermost_local_context().uid();
        let (created, views, used) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let created: Vec<(LogicalRegion, bool)> = state
                .ledger
                .created_requirements()
                .iter()
                .zip(state.ledger.returnable_privileges())
                .map(|(req, &returnable)| {
                    let returned =
                        returnable && !state.ledger.was_created_requirement_deleted(req);
                    (req.region_handle(), returned)
                })
                .collect();
            (created, state.top_views.drain(), state.owners.locally_used())
        };

        // Returned state lives on in the outermost local context; only our
        // users are removed there unless we are that context.
        for (region, returned) in created {
            if returned {
                forest.invalidate_context(outermost, region, outermost != self.uid);
            } else {
                forest.invalidate_context(self.uid, region, false);
            }
        }
        for view in &views {
            self.runtime.views().release(view.did);
        }
        for node in &used {
            forest.invalidate_version_state(self.uid, node);
        }
        debug!(
            context = %self.uid,
            top_views = views.len(),
            version_states = used.len(),
            "Region tree contexts invalidated"
        );
    }

    /// The task body has returned `result`. Returns the event that triggers
    /// once post-end work has run.
    pub fn end_task(self: &Arc<Self>, result: Vec<u8>) -> Result<Event, ContextError> {
        match &self.variant {
            ContextVariant::Inline { .. } => {
                debug!(context = %self.uid, "Inline task ended");
                if let Some(owner) = &self.owner {
                    owner.end_inline_task(self.uid, &result);
                }
                return Ok(Event::no_event());
            }
            ContextVariant::Remote(_) => return Err(self.illegal("end_task")),
            _ => {}
        }
        let (trace, unmapped) = {
            let mut state = self.state.lock();
            match state.current_trace {
                Some(trace) => (Some(trace), Vec::new()),
                None => (None, state.ledger.clear_inline_regions()),
            }
        };
        if let Some(trace) = trace {
            return Err(ContextError::IncompleteTrace {
                task: self.task.name.clone(),
                trace,
            });
        }
        debug!(context = %self.uid, inline_unmapped = unmapped.len(), "Task body ended");
        let this = self.clone();
        Ok(self.runtime.scheduler().defer(
            Event::no_event(),
            Priority::Latency,
            async move { this.post_end_task(result) }.boxed(),
        ))
    }

    pub fn post_end_task(&self, result: Vec<u8>) {
        if let Some(owner) = &self.owner {
            owner.handle_future(self.uid, &result);
        }
        let due = {
            let mut state = self.state.lock();
            for region in state.ledger.physical_regions_mut() {
                region.mapped = false;
            }
            state.children.finish_issuing()
        };
        if let Some(owner) = &self.owner {
            owner.complete_execution(self.uid);
        }
        info!(context = %self.uid, task = %self.task.name, "Task execution complete");
        self.fire_callbacks(due);
    }

    /// Final teardown once every child has committed.
    pub async fn commit(self: &Arc<Self>) -> Result<(), ContextError> {
        if matches!(
            self.variant,
            ContextVariant::Inline { .. } | ContextVariant::Remote(_)
        ) {
            return Err(self.illegal("commit"));
        }
        let outstanding = self.state.lock().children.outstanding();
        if outstanding > 0 {
            return Err(ContextError::OutstandingChildren {
                context: self.uid,
                count: outstanding,
            });
        }

        self.invalidate_region_tree_contexts();

        let (created, deleted) = self.state.lock().ledger.take_returned();
        if !created.is_empty() || !deleted.is_empty() {
            match &self.parent {
                Some(parent) => parent.return_resources(created, deleted).await?,
                None => debug!(context = %self.uid, "No parent to return resources to"),
            }
        }

        self.release_remote_instances().await?;
        self.runtime.unregister_context(self.uid);
        info!(context = %self.uid, task = %self.task.name, "Context committed");
        Ok(())
    }

    /// Accept resources returned by a committed child, forwarding them home
    /// if this is a mirror.
    pub(crate) async fn return_resources(
        &self,
        created: ResourceGroup,
        deleted: ResourceGroup,
    ) -> Result<(), ContextError> {
        let ctx = self.dispatch_target();
        if ctx.variant.is_remote() {
            debug!(context = %ctx.uid, home = ctx.uid.home, "Forwarding returned resources");
            let message = ContextMessage::ReturnResources {
                context: ctx.uid,
                created,
                deleted,
            };
            ctx.runtime.transport().send(ctx.uid.home, message).await?;
            return Ok(());
        }
        ctx.apply_returned(&created, &deleted)
    }

    async fn release_remote_instances(&self) -> Result<(), ContextError> {
        let instances = std::mem::take(&mut self.state.lock().remote_instances);
        if instances.is_empty() {
            return Ok(());
        }
        let message = ContextMessage::FreeRemoteContext { context: self.uid };
        let transport = self.runtime.transport();
        if self.is_top_level() {
            transport.broadcast(message).await?;
        } else {
            for target in &instances {
                transport.send(*target, message.clone()).await?;
            }
        }
        debug!(context = %self.uid, mirrors = instances.len(), "Remote mirrors released");
        Ok(())
    }

    /// Run registered child `child` inline: it executes in an inline context
    /// inside this one, seeing this context's regions directly.
    pub async fn inline_child_task<F, Fut>(
        self: &Arc<Self>,
        child: OpId,
        task: TaskInfo,
        owner: Option<Arc<dyn TaskOwner>>,
        body: F,
    ) -> Result<InlineOutcome, ContextError>
    where
        F: FnOnce(Arc<Context>) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, ContextError>>,
    {
        self.unregister_child(child)?;

        let mut remapped = Vec::new();
        for req in &task.regions {
            self.check_privilege(req)?;
            let Some(idx) = self.find_parent_region(req.parent) else {
                continue;
            };
            let unmapped = self
                .physical_regions()
                .get(idx)
                .is_some_and(|region| !region.mapped && !region.virtual_mapped);
            if unmapped && self.remap_region(idx) {
                remapped.push(idx);
            }
        }

        let inline_before = self.inline_regions().len();
        let inline = self.runtime.create_inline_context(self, task, owner);
        debug!(context = %self.uid, child = %child, inline = %inline.uid(), "Inlining child task");
        let result = body(inline.clone()).await?;
        inline.end_task(result.clone())?;

        let unmapped = self
            .take_inline_regions_after(inline_before)
            .into_iter()
            .map(|region| region.requirement)
            .collect();
        Ok(InlineOutcome {
            remapped,
            unmapped,
            result,
        })
    }
}
