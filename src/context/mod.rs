//! Task Execution Context
//!
//! The per-task-invocation control block. A `Context` owns the resource
//! ledger, the flow-control gates, the child lifecycle tracker, and the
//! distributed ownership and top-view caches of one running task. All mutable
//! state sits behind one lock held only for short critical sections and never
//! across an `.await`; every blocking point is a wait on a one-shot event.

pub mod children;
pub mod conflict;
pub mod end_task;
pub mod flow;
pub mod ledger;
pub mod mirror;
pub mod ownership;
mod regions;
pub mod top_view;
pub mod variant;

pub use children::{ChildStage, DueCallbacks};
pub use conflict::{CompetingOp, ConflictSource};
pub use end_task::InlineOutcome;
pub use ledger::{DeletionOutcome, PhysicalRegion, Resource, ResourceGroup};
pub use mirror::{PackedVersionInfo, RemoteContextPayload};
pub use ownership::OwnershipRecord;
pub use variant::{ContextVariant, RemoteState};

use crate::config::FlowControlConfig;
use crate::error::ContextError;
use crate::event::Event;
use crate::runtime::Runtime;
use crate::scheduler::Priority;
use crate::types::{AddressSpaceId, ContextUid, OpId, TaskInfo, TraceId, VersionInfo};
use children::ChildTracker;
use flow::{ActivationGate, Admission, FrameQueue, GateTransition, WindowGate};
use futures::FutureExt;
use ledger::Ledger;
use ownership::OwnershipCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use top_view::TopViewCache;
use tracing::{debug, info, trace};

/// The task that owns a context. Receives the once-only lifecycle
/// notifications.
pub trait TaskOwner: Send + Sync {
    fn children_complete(&self, ctx: ContextUid);

    fn children_committed(&self, ctx: ContextUid);

    /// The task body has returned and post-end work is done.
    fn complete_execution(&self, _ctx: ContextUid) {}

    /// Receives the task's return value.
    fn handle_future(&self, _ctx: ContextUid, _result: &[u8]) {}

    /// An inlined task ended; `result` is its return value.
    fn end_inline_task(&self, _ctx: ContextUid, _result: &[u8]) {}
}

/// How a context's regions relate to its parent's.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegionMapping {
    pub parent_req_indexes: Vec<usize>,
    pub virtual_mapped: Vec<bool>,
    pub version_infos: Vec<VersionInfo>,
    /// Context whose region-tree state backs each region.
    pub physical_contexts: Vec<ContextUid>,
}

impl RegionMapping {
    /// Every region physically mapped and backed by `uid` itself.
    pub(crate) fn standalone(uid: ContextUid, task: &TaskInfo) -> Self {
        let count = task.regions.len();
        Self {
            parent_req_indexes: (0..count).collect(),
            virtual_mapped: vec![false; count],
            version_infos: vec![VersionInfo::default(); count],
            physical_contexts: vec![uid; count],
        }
    }
}

struct ContextState {
    ledger: Ledger,
    window: WindowGate,
    frames: FrameQueue,
    activation: ActivationGate,
    children: ChildTracker,
    owners: OwnershipCache,
    top_views: TopViewCache,
    /// Address spaces holding a mirror of this context.
    remote_instances: BTreeSet<AddressSpaceId>,
    current_trace: Option<TraceId>,
}

pub struct Context {
    uid: ContextUid,
    runtime: Arc<Runtime>,
    task: TaskInfo,
    variant: ContextVariant,
    parent: Option<Arc<Context>>,
    owner: Option<Arc<dyn TaskOwner>>,
    config: OnceLock<FlowControlConfig>,
    outstanding_children: AtomicUsize,
    total_children: AtomicU64,
    parent_req_indexes: Vec<usize>,
    virtual_mapped: Vec<bool>,
    version_infos: Vec<VersionInfo>,
    physical_contexts: Vec<ContextUid>,
    state: Mutex<ContextState>,
}

/// Point-in-time counters for one context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub uid: String,
    pub variant: &'static str,
    pub outstanding_children: usize,
    pub total_children: u64,
    pub executing: usize,
    pub executed: usize,
    pub complete: usize,
    pub pending_frames: usize,
    pub created_regions: usize,
    pub ownership_records: usize,
    pub top_views: usize,
    pub remote_instances: usize,
    pub active: bool,
}

impl Context {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        uid: ContextUid,
        task: TaskInfo,
        variant: ContextVariant,
        parent: Option<Arc<Context>>,
        owner: Option<Arc<dyn TaskOwner>>,
        mapping: RegionMapping,
    ) -> Arc<Self> {
        let ledger = Ledger::new(&task.regions, &mapping.virtual_mapped);
        let local_space = runtime.local_space();
        Arc::new(Self {
            uid,
            runtime,
            task,
            variant,
            parent,
            owner,
            config: OnceLock::new(),
            outstanding_children: AtomicUsize::new(0),
            total_children: AtomicU64::new(0),
            parent_req_indexes: mapping.parent_req_indexes,
            virtual_mapped: mapping.virtual_mapped,
            version_infos: mapping.version_infos,
            physical_contexts: mapping.physical_contexts,
            state: Mutex::new(ContextState {
                ledger,
                window: WindowGate::default(),
                frames: FrameQueue::default(),
                activation: ActivationGate::default(),
                children: ChildTracker::new(uid),
                owners: OwnershipCache::new(uid, local_space),
                top_views: TopViewCache::default(),
                remote_instances: BTreeSet::new(),
                current_trace: None,
            }),
        })
    }

    pub fn uid(&self) -> ContextUid {
        self.uid
    }

    pub fn task(&self) -> &TaskInfo {
        &self.task
    }

    pub fn variant(&self) -> &ContextVariant {
        &self.variant
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Local parent, if any. Mirrors and inline contexts have none.
    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.task.depth
    }

    pub fn parent_req_indexes(&self) -> &[usize] {
        &self.parent_req_indexes
    }

    pub fn is_virtual_mapped(&self, index: usize) -> bool {
        self.virtual_mapped.get(index).copied().unwrap_or(false)
    }

    // Configuration

    /// Ask the mapper for this context's flow-control configuration and fix
    /// it. Must happen before any child registers.
    pub fn configure_context(&self) -> Result<FlowControlConfig, ContextError> {
        let mapper = self.runtime.mapper();
        let mut config = mapper.invoke_configure_context(&self.task);
        config
            .resolve()
            .map_err(|reason| ContextError::InvalidConfiguration {
                mapper: mapper.mapper_name().to_string(),
                task: self.task.name.clone(),
                reason,
            })?;
        self.install_config(config)?;
        info!(
            context = %self.uid,
            task = %self.task.name,
            max_window_size = config.max_window_size,
            hysteresis = config.hysteresis_percentage,
            frames_mode = config.frames_mode(),
            "Context configured"
        );
        Ok(config)
    }

    pub(crate) fn install_config(&self, config: FlowControlConfig) -> Result<(), ContextError> {
        self.config
            .set(config)
            .map_err(|_| ContextError::AlreadyConfigured(self.uid))
    }

    pub fn config(&self) -> Option<FlowControlConfig> {
        self.config.get().copied()
    }

    fn require_config(&self) -> Result<FlowControlConfig, ContextError> {
        self.config().ok_or(ContextError::NotConfigured(self.uid))
    }

    // Child lifecycle

    /// Register a child operation, waiting for window admission if the
    /// window is full.
    pub async fn register_child(&self, op: OpId) -> Result<(), ContextError> {
        self.check_registration("register_child")?;
        let config = self.require_config()?;
        loop {
            let blocked = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                state.children.check_unregistered(op)?;
                match state.window.try_admit(&self.outstanding_children, &config) {
                    Admission::Admitted { outstanding } => {
                        state.children.insert_executing(op)?;
                        trace!(context = %self.uid, op = %op, outstanding, "Child admitted");
                        None
                    }
                    Admission::Blocked { event, holds_slot } => Some((event, holds_slot)),
                }
            };
            let Some((event, holds_slot)) = blocked else {
                break;
            };
            debug!(
                context = %self.uid,
                op = %op,
                window = config.max_window_size,
                holds_slot,
                "Registration blocked on full window"
            );
            event.wait().await;
            if holds_slot {
                self.admit_reserved(op, &config)?;
                break;
            }
        }
        self.total_children.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Admit a registrant that waited while holding its window slot. If the
    /// op was registered meanwhile, the slot is given back.
    fn admit_reserved(&self, op: OpId, config: &FlowControlConfig) -> Result<(), ContextError> {
        let (result, wake) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.children.insert_executing(op) {
                Ok(()) => (Ok(()), None),
                Err(err) => (
                    Err(err),
                    state.window.retire(&self.outstanding_children, config),
                ),
            }
        };
        if let Some(wake) = wake {
            wake.trigger();
        }
        if result.is_ok() {
            trace!(
                context = %self.uid,
                op = %op,
                outstanding = self.outstanding_children.load(Ordering::Acquire),
                "Child admitted after window release"
            );
        }
        result
    }

    pub fn mark_executed(&self, op: OpId) -> Result<(), ContextError> {
        self.state.lock().children.mark_executed(op)
    }

    pub fn mark_complete(&self, op: OpId) -> Result<(), ContextError> {
        let (due, wake) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let due = state.children.mark_complete(op)?;
            let wake = self
                .config
                .get()
                .and_then(|config| state.window.retire(&self.outstanding_children, config));
            (due, wake)
        };
        if let Some(wake) = wake {
            debug!(
                context = %self.uid,
                outstanding = self.outstanding_children.load(Ordering::Acquire),
                "Window released"
            );
            wake.trigger();
        }
        self.fire_callbacks(due);
        Ok(())
    }

    pub fn mark_committed(&self, op: OpId) -> Result<(), ContextError> {
        let due = self.state.lock().children.mark_committed(op)?;
        self.fire_callbacks(due);
        Ok(())
    }

    /// Remove a child in any stage, e.g. one that is about to be inlined.
    pub fn unregister_child(&self, op: OpId) -> Result<ChildStage, ContextError> {
        let (stage, due, wake) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (stage, due) = state.children.unregister(op)?;
            let wake = match self.config.get() {
                Some(config) if stage.is_in_flight() => {
                    state.window.retire(&self.outstanding_children, config)
                }
                _ => None,
            };
            (stage, due, wake)
        };
        trace!(context = %self.uid, op = %op, stage = ?stage, "Child unregistered");
        if let Some(wake) = wake {
            wake.trigger();
        }
        self.fire_callbacks(due);
        Ok(stage)
    }

    pub(crate) fn fire_callbacks(&self, due: DueCallbacks) {
        if due.complete {
            info!(context = %self.uid, "All children complete");
            if let Some(owner) = &self.owner {
                owner.children_complete(self.uid);
            }
        }
        if due.commit {
            info!(context = %self.uid, "All children committed");
            if let Some(owner) = &self.owner {
                owner.children_committed(self.uid);
            }
        }
    }

    // Frames

    /// Issue a frame, waiting while more than `max_outstanding_frames` are
    /// pending.
    pub async fn issue_frame(&self, frame: OpId) -> Result<(), ContextError> {
        let config = self.require_config()?;
        let (wait_on, transition) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let wait_on = state.frames.issue(frame, &config);
            (wait_on, state.activation.increment_frames(&config))
        };
        self.launch_transition(transition);
        if let Some(event) = wait_on {
            debug!(context = %self.uid, frame = %frame, "Frame issue waiting");
            event.wait().await;
        }
        trace!(context = %self.uid, frame = %frame, "Frame issued");
        Ok(())
    }

    /// Finish the oldest frame, which must be `frame`. Without a frame limit
    /// nothing is queued and only the activation gate is updated.
    pub fn finish_frame(&self, frame: OpId) -> Result<Event, ContextError> {
        let config = self.require_config()?;
        let (marker, transition) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if config.max_outstanding_frames == 0 {
                (None, state.activation.decrement_frames(&config))
            } else {
                match state.frames.finish(frame) {
                    Some(marker) => (Some(marker), state.activation.decrement_frames(&config)),
                    None => {
                        return Err(ContextError::FrameOrderViolation {
                            context: self.uid,
                            op: frame,
                        })
                    }
                }
            }
        };
        if let Some(marker) = marker {
            marker.trigger();
        }
        trace!(context = %self.uid, frame = %frame, "Frame finished");
        Ok(self.launch_transition(transition))
    }

    // Scheduling activation

    pub fn increment_outstanding(&self) -> Result<Event, ContextError> {
        self.gate(ActivationGate::increment_outstanding)
    }

    pub fn decrement_outstanding(&self) -> Result<Event, ContextError> {
        self.gate(ActivationGate::decrement_outstanding)
    }

    pub fn increment_pending(&self) -> Result<Event, ContextError> {
        self.gate(ActivationGate::increment_pending)
    }

    pub fn decrement_pending(&self) -> Result<Event, ContextError> {
        self.gate(ActivationGate::decrement_pending)
    }

    fn gate(
        &self,
        step: impl FnOnce(&mut ActivationGate, &FlowControlConfig) -> Option<GateTransition>,
    ) -> Result<Event, ContextError> {
        let config = self.require_config()?;
        let transition = step(&mut self.state.lock().activation, &config);
        Ok(self.launch_transition(transition))
    }

    /// Run a gate transition once the previous one has finished. The
    /// returned event triggers after the scheduler hook ran.
    fn launch_transition(&self, transition: Option<GateTransition>) -> Event {
        let Some(GateTransition {
            activate,
            wait_on,
            done,
        }) = transition
        else {
            return Event::no_event();
        };
        let finished = done.event();
        let scheduler = self.runtime.scheduler().clone();
        let uid = self.uid;
        let run = move || {
            debug!(context = %uid, activate, "Activation transition");
            if activate {
                scheduler.activate_context(uid);
            } else {
                scheduler.deactivate_context(uid);
            }
            done.trigger();
        };
        if wait_on.has_triggered() {
            run();
        } else {
            let _ = self.runtime.scheduler().defer(
                wait_on,
                Priority::Latency,
                async move { run() }.boxed(),
            );
        }
        finished
    }

    // Introspection

    pub fn outstanding_children(&self) -> usize {
        self.outstanding_children.load(Ordering::Acquire)
    }

    pub fn total_children(&self) -> u64 {
        self.total_children.load(Ordering::Relaxed)
    }

    pub fn remote_instances(&self) -> Vec<AddressSpaceId> {
        self.state.lock().remote_instances.iter().copied().collect()
    }

    pub fn stats(&self) -> ContextStats {
        let state = self.state.lock();
        let (executing, executed, complete) = state.children.counts();
        ContextStats {
            uid: self.uid.to_string(),
            variant: self.variant.name(),
            outstanding_children: self.outstanding_children.load(Ordering::Acquire),
            total_children: self.total_children.load(Ordering::Relaxed),
            executing,
            executed,
            complete,
            pending_frames: state.frames.len(),
            created_regions: state.ledger.created().regions.len(),
            ownership_records: state.owners.len(),
            top_views: state.top_views.len(),
            remote_instances: state.remote_instances.len(),
            active: state.activation.is_active(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("uid", &self.uid)
            .field("variant", &self.variant.name())
            .field("task", &self.task.name)
            .finish()
    }
}
