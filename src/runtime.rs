//! Node Runtime
//!
//! One `Runtime` per address space. It owns the collaborators every context
//! talks to (region forest, transport, scheduler, mapper, view arena), the
//! registry of live contexts and mirrors, and the dispatch of inbound context
//! messages. Mirror fetches are deduplicated per context and top-view
//! requests are matched to their replies by request id.

use crate::context::{Context, ContextVariant, RegionMapping, RemoteContextPayload, TaskOwner};
use crate::error::{ContextError, ErrorCode, PrivilegeError};
use crate::event::{Event, UserEvent};
use crate::forest::RegionForest;
use crate::mapper::MapperManager;
use crate::scheduler::{Priority, Scheduler};
use crate::transport::{ContextMessage, MessageHandler, Transport};
use crate::types::{AddressSpaceId, ContextUid, FieldId, RegionTreeNode, TaskInfo};
use crate::views::{InstanceManager, InstanceView, ViewArena};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

pub struct Runtime {
    local_space: AddressSpaceId,
    forest: Arc<dyn RegionForest>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    mapper: MapperManager,
    views: ViewArena,
    next_serial: AtomicU64,
    next_request: AtomicU64,
    contexts: RwLock<HashMap<ContextUid, Arc<Context>>>,
    /// Mirror fetches in flight, one per remote context.
    pending_mirrors: Mutex<HashMap<ContextUid, UserEvent>>,
    top_view_replies: Mutex<HashMap<u64, oneshot::Sender<Result<InstanceView, ErrorCode>>>>,
}

impl Runtime {
    pub fn new(
        local_space: AddressSpaceId,
        forest: Arc<dyn RegionForest>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        mapper: MapperManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_space,
            forest,
            transport,
            scheduler,
            mapper,
            views: ViewArena::new(local_space),
            next_serial: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            contexts: RwLock::new(HashMap::new()),
            pending_mirrors: Mutex::new(HashMap::new()),
            top_view_replies: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_space(&self) -> AddressSpaceId {
        self.local_space
    }

    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.forest
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn mapper(&self) -> &MapperManager {
        &self.mapper
    }

    pub fn views(&self) -> &ViewArena {
        &self.views
    }

    fn allocate_uid(&self) -> ContextUid {
        ContextUid::new(self.local_space, self.next_serial.fetch_add(1, Ordering::Relaxed))
    }

    // Context creation

    /// Create the root context of a task tree. The context is configured
    /// through the mapper before it is returned.
    pub fn create_top_level_context(
        self: &Arc<Self>,
        task: TaskInfo,
        owner: Option<Arc<dyn TaskOwner>>,
    ) -> Result<Arc<Context>, ContextError> {
        let uid = self.allocate_uid();
        let mapping = RegionMapping::standalone(uid, &task);
        let ctx = Context::new(
            self.clone(),
            uid,
            task,
            ContextVariant::TopLevel,
            None,
            owner,
            mapping,
        );
        self.install(ctx, true)
    }

    /// Create the context of a child task that may itself launch children.
    /// `virtual_mapped[i]` marks region `i` as virtually mapped.
    pub fn create_inner_context(
        self: &Arc<Self>,
        parent: &Arc<Context>,
        task: TaskInfo,
        virtual_mapped: &[bool],
        owner: Option<Arc<dyn TaskOwner>>,
    ) -> Result<Arc<Context>, ContextError> {
        let uid = self.allocate_uid();
        let mapping = self.child_mapping(uid, parent, &task, virtual_mapped)?;
        let ctx = Context::new(
            self.clone(),
            uid,
            task,
            ContextVariant::Inner,
            Some(parent.clone()),
            owner,
            mapping,
        );
        self.install(ctx, true)
    }

    /// Create the context of a child task that launches no children.
    pub fn create_leaf_context(
        self: &Arc<Self>,
        parent: &Arc<Context>,
        task: TaskInfo,
        owner: Option<Arc<dyn TaskOwner>>,
    ) -> Result<Arc<Context>, ContextError> {
        let uid = self.allocate_uid();
        let virtual_mapped = vec![false; task.regions.len()];
        let mapping = self.child_mapping(uid, parent, &task, &virtual_mapped)?;
        let ctx = Context::new(
            self.clone(),
            uid,
            task,
            ContextVariant::Leaf,
            Some(parent.clone()),
            owner,
            mapping,
        );
        self.install(ctx, false)
    }

    /// Context for a child running inline in `enclosing`. Inline contexts
    /// are transient and never registered.
    pub fn create_inline_context(
        self: &Arc<Self>,
        enclosing: &Arc<Context>,
        task: TaskInfo,
        owner: Option<Arc<dyn TaskOwner>>,
    ) -> Arc<Context> {
        let uid = self.allocate_uid();
        let physical_contexts = task
            .regions
            .iter()
            .map(|req| match enclosing.find_parent_region(req.parent) {
                Some(idx) => enclosing.find_parent_physical_context(idx),
                None => enclosing.uid(),
            })
            .collect();
        let mapping = RegionMapping {
            physical_contexts,
            ..RegionMapping::standalone(uid, &task)
        };
        let variant = ContextVariant::Inline {
            enclosing: enclosing.clone(),
        };
        debug!(
            context = %uid,
            enclosing = %enclosing.uid(),
            task = %task.name,
            "Inline context created"
        );
        Context::new(self.clone(), uid, task, variant, None, owner, mapping)
    }

    fn child_mapping(
        &self,
        uid: ContextUid,
        parent: &Context,
        task: &TaskInfo,
        virtual_mapped: &[bool],
    ) -> Result<RegionMapping, ContextError> {
        let mut mapping = RegionMapping::default();
        for (idx, req) in task.regions.iter().enumerate() {
            parent.check_privilege(req)?;
            let parent_idx = parent.find_parent_region_req(req, false).ok_or_else(|| {
                ContextError::Privilege {
                    context: parent.uid(),
                    task: parent.task().name.clone(),
                    source: PrivilegeError::BadParentRegion {
                        parent: req.parent,
                        field: req.privilege_fields.iter().next().copied().unwrap_or(FieldId(0)),
                    },
                }
            })?;
            let is_virtual = virtual_mapped.get(idx).copied().unwrap_or(false);
            mapping.parent_req_indexes.push(parent_idx);
            mapping.virtual_mapped.push(is_virtual);
            mapping
                .version_infos
                .push(self.forest.capture_version_info(parent.uid(), req));
            mapping.physical_contexts.push(if is_virtual {
                parent.find_parent_physical_context(parent_idx)
            } else {
                uid
            });
        }
        Ok(mapping)
    }

    fn install(&self, ctx: Arc<Context>, configure: bool) -> Result<Arc<Context>, ContextError> {
        if configure {
            ctx.configure_context()?;
            ctx.initialize_region_tree_contexts();
        }
        self.contexts.write().insert(ctx.uid(), ctx.clone());
        info!(
            context = %ctx.uid(),
            variant = ctx.variant().name(),
            task = %ctx.task().name,
            "Context created"
        );
        Ok(ctx)
    }

    // Registry

    pub fn find_local_context(&self, uid: ContextUid) -> Option<Arc<Context>> {
        self.contexts.read().get(&uid).cloned()
    }

    /// Find a context, fetching a mirror from its home if it lives
    /// elsewhere. Concurrent lookups of the same context share one fetch.
    pub async fn find_context(&self, uid: ContextUid) -> Result<Arc<Context>, ContextError> {
        if let Some(ctx) = self.find_local_context(uid) {
            return Ok(ctx);
        }
        if uid.home == self.local_space {
            return Err(ContextError::ContextNotFound(uid));
        }
        let (event, request) = {
            let mut pending = self.pending_mirrors.lock();
            // A response may have landed since the first check.
            if let Some(ctx) = self.find_local_context(uid) {
                return Ok(ctx);
            }
            match pending.get(&uid) {
                Some(waiters) => (waiters.event(), false),
                None => {
                    let waiters = UserEvent::new();
                    let event = waiters.event();
                    pending.insert(uid, waiters);
                    (event, true)
                }
            }
        };
        if request {
            debug!(context = %uid, home = uid.home, "Requesting context mirror");
            let message = ContextMessage::RemoteContextRequest { context: uid };
            if let Err(err) = self.transport.send(uid.home, message).await {
                self.finish_mirror_fetch(uid);
                return Err(err.into());
            }
        }
        event.wait().await;
        self.find_local_context(uid)
            .ok_or(ContextError::ContextNotFound(uid))
    }

    fn finish_mirror_fetch(&self, uid: ContextUid) {
        let waiters = self.pending_mirrors.lock().remove(&uid);
        if let Some(waiters) = waiters {
            waiters.trigger();
        }
    }

    pub fn unregister_context(&self, uid: ContextUid) -> Option<Arc<Context>> {
        let removed = self.contexts.write().remove(&uid);
        if removed.is_some() {
            debug!(context = %uid, "Context unregistered");
        }
        removed
    }

    pub fn context_count(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        let mut contexts: Vec<_> = self.contexts.read().values().cloned().collect();
        contexts.sort_by_key(|ctx| ctx.uid());
        contexts
    }

    /// Ask the instance's owner space to construct the top view of
    /// `manager` for `context`. One hop; the owner never forwards.
    pub async fn request_top_view(
        &self,
        context: ContextUid,
        manager: InstanceManager,
    ) -> Result<Arc<InstanceView>, ContextError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.top_view_replies.lock().insert(request_id, tx);
        let message = ContextMessage::TopViewRequest {
            request_id,
            context,
            manager,
        };
        if let Err(err) = self.transport.send(manager.owner_space, message).await {
            self.top_view_replies.lock().remove(&request_id);
            return Err(err.into());
        }
        match rx.await {
            Ok(Ok(view)) => Ok(self.views.find_or_register(view)),
            Ok(Err(code)) => Err(ContextError::RemoteRequestFailed {
                context,
                space: manager.owner_space,
                code,
            }),
            Err(_) => Err(ContextError::ContextNotFound(context)),
        }
    }

    // Inbound requests

    /// Answer a version-owner query. A failure is reported back to the
    /// requester before it is returned here for logging.
    async fn answer_version_owner(
        &self,
        context: ContextUid,
        node: RegionTreeNode,
        requester: AddressSpaceId,
    ) -> Result<(), ContextError> {
        let outcome = async {
            let ctx = self.find_context(context).await?;
            ctx.get_version_owner(node, requester).await
        }
        .await;
        let message = ContextMessage::VersionOwnerResponse {
            context,
            node,
            owner: outcome.as_ref().copied().map_err(ContextError::code),
        };
        self.transport.send(requester, message).await?;
        outcome.map(|_| ())
    }

    async fn answer_top_view(
        &self,
        request_id: u64,
        context: ContextUid,
        manager: InstanceManager,
        requester: AddressSpaceId,
    ) -> Result<(), ContextError> {
        let outcome = async {
            let ctx = self.find_context(context).await?;
            ctx.create_instance_top_view(&manager).await
        }
        .await;
        let message = ContextMessage::TopViewResponse {
            request_id,
            view: outcome
                .as_ref()
                .map(|view| view.as_ref().clone())
                .map_err(ContextError::code),
        };
        self.transport.send(requester, message).await?;
        outcome.map(|_| ())
    }

    async fn answer_mirror_request(
        &self,
        context: ContextUid,
        requester: AddressSpaceId,
    ) -> Result<(), ContextError> {
        let payload = match self.find_local_context(context) {
            Some(ctx) => Some(ctx.pack_remote_context(requester)?.encode()?),
            None => {
                warn!(context = %context, requester, "Mirror requested for unknown context");
                None
            }
        };
        let message = ContextMessage::RemoteContextResponse { context, payload };
        self.transport.send(requester, message).await?;
        Ok(())
    }

    fn install_mirror(
        self: &Arc<Self>,
        context: ContextUid,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ContextError> {
        let result = match payload {
            Some(bytes) => RemoteContextPayload::decode(&bytes)
                .and_then(|payload| Context::unpack_remote_context(self.clone(), payload))
                .map(|mirror| {
                    self.contexts.write().entry(context).or_insert(mirror);
                }),
            None => Ok(()),
        };
        self.finish_mirror_fetch(context);
        result
    }

    fn free_mirror(&self, context: ContextUid) {
        let mut contexts = self.contexts.write();
        let is_mirror = contexts
            .get(&context)
            .is_some_and(|ctx| ctx.variant().is_remote());
        let removed = if is_mirror { contexts.remove(&context) } else { None };
        drop(contexts);
        if let Some(mirror) = removed {
            mirror.release_mirror();
        }
    }

    /// Run inbound work that may block off the dispatch loop, which must
    /// keep draining replies.
    fn defer_request<F>(&self, work: F)
    where
        F: Future<Output = Result<(), ContextError>> + Send + 'static,
    {
        let _ = self.scheduler.defer(
            Event::no_event(),
            Priority::Deferred,
            async move {
                if let Err(err) = work.await {
                    error!(error = %err, code = err.code().as_i32(), "Context request failed");
                }
            }
            .boxed(),
        );
    }
}

#[async_trait]
impl MessageHandler for Runtime {
    async fn handle_message(self: Arc<Self>, source: AddressSpaceId, message: ContextMessage) {
        trace!(space = self.local_space, source, kind = ?message.kind(), "Handling message");
        let result = match message {
            ContextMessage::VersionOwnerRequest {
                context,
                node,
                source: requester,
            } => {
                let runtime = self.clone();
                self.defer_request(async move {
                    runtime.answer_version_owner(context, node, requester).await
                });
                Ok(())
            }
            ContextMessage::VersionOwnerResponse {
                context,
                node,
                owner,
            } => match self.find_local_context(context) {
                Some(ctx) => ctx.process_version_owner_response(node, source, owner),
                None => Err(ContextError::ContextNotFound(context)),
            },
            ContextMessage::TopViewRequest {
                request_id,
                context,
                manager,
            } => {
                let runtime = self.clone();
                self.defer_request(async move {
                    runtime
                        .answer_top_view(request_id, context, manager, source)
                        .await
                });
                Ok(())
            }
            ContextMessage::TopViewResponse { request_id, view } => {
                let reply = self.top_view_replies.lock().remove(&request_id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(view);
                    }
                    None => warn!(request_id, "Top view response without a request"),
                }
                Ok(())
            }
            ContextMessage::RemoteContextRequest { context } => {
                self.answer_mirror_request(context, source).await
            }
            ContextMessage::RemoteContextResponse { context, payload } => {
                self.install_mirror(context, payload)
            }
            ContextMessage::ReturnResources {
                context,
                created,
                deleted,
            } => match self.find_local_context(context) {
                Some(ctx) => ctx.apply_returned(&created, &deleted),
                None => Err(ContextError::ContextNotFound(context)),
            },
            ContextMessage::FreeRemoteContext { context } => {
                self.free_mirror(context);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(
                space = self.local_space,
                source,
                error = %err,
                code = err.code().as_i32(),
                "Message handling failed"
            );
        }
    }
}
