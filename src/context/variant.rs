//! Context Variant Dispatch
//!
//! The closed set of context kinds and the operations whose behavior depends
//! on the kind: child registration, parent lookup, version-owner resolution,
//! top-view creation and packing for transfer.
//!
//! - `TopLevel` is authoritative for the region-tree nodes its own address
//!   space owns and asks the owner space for the rest.
//! - `Inner` is authoritative for every node.
//! - `Leaf` cannot have children.
//! - `Remote` is a mirror on another address space. It forwards ownership
//!   queries to its home (or to the node's owner space for a top-level
//!   mirror) and never claims authority of its own.
//! - `Inline` runs a child inside its parent and forwards everything to the
//!   context it is inlined into.

use super::mirror::{virtual_indices, PackedVersionInfo, RemoteContextPayload};
use super::ownership::{OwnerLookup, OwnershipRecord};
use super::top_view::TopViewLookup;
use super::{Context, RegionMapping};
use crate::error::{ContextError, ErrorCode};
use crate::runtime::Runtime;
use crate::transport::ContextMessage;
use crate::types::{AddressSpaceId, ContextUid, InstanceId, RegionTreeNode};
use crate::views::{InstanceManager, InstanceView};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteState {
    /// Mirror of a top-level context.
    pub top_level: bool,
    pub parent: Option<ContextUid>,
}

#[derive(Clone)]
pub enum ContextVariant {
    TopLevel,
    Inner,
    Leaf,
    Remote(RemoteState),
    Inline { enclosing: Arc<Context> },
}

impl ContextVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ContextVariant::TopLevel => "top-level",
            ContextVariant::Inner => "inner",
            ContextVariant::Leaf => "leaf",
            ContextVariant::Remote(_) => "remote",
            ContextVariant::Inline { .. } => "inline",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ContextVariant::Remote(_))
    }
}

impl fmt::Debug for ContextVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextVariant::Remote(state) => f.debug_tuple("Remote").field(state).finish(),
            ContextVariant::Inline { enclosing } => f
                .debug_struct("Inline")
                .field("enclosing", &enclosing.uid())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl Context {
    pub(crate) fn illegal(&self, operation: &'static str) -> ContextError {
        ContextError::IllegalForVariant {
            context: self.uid,
            variant: self.variant.name(),
            operation,
        }
    }

    pub(crate) fn check_registration(&self, operation: &'static str) -> Result<(), ContextError> {
        match self.variant {
            ContextVariant::Leaf | ContextVariant::Inline { .. } => Err(self.illegal(operation)),
            _ => Ok(()),
        }
    }

    /// Skip inline layers.
    pub(super) fn dispatch_target(&self) -> &Context {
        let mut ctx = self;
        while let ContextVariant::Inline { enclosing } = &ctx.variant {
            ctx = enclosing.as_ref();
        }
        ctx
    }

    pub fn is_top_level(&self) -> bool {
        match &self.dispatch_target().variant {
            ContextVariant::TopLevel => true,
            ContextVariant::Remote(state) => state.top_level,
            _ => false,
        }
    }

    /// The parent context, mirrored locally if it lives elsewhere.
    pub async fn find_parent_context(&self) -> Result<Option<Arc<Context>>, ContextError> {
        let ctx = self.dispatch_target();
        match &ctx.variant {
            ContextVariant::Remote(RemoteState {
                parent: Some(parent),
                ..
            }) => Ok(Some(ctx.runtime.find_context(*parent).await?)),
            ContextVariant::Remote(_) | ContextVariant::TopLevel => Ok(None),
            _ => Ok(ctx.parent.clone()),
        }
    }

    // Version ownership

    /// Address space owning the version state of `node` in this context.
    /// `source` is the address space asking.
    pub async fn get_version_owner(
        &self,
        node: RegionTreeNode,
        source: AddressSpaceId,
    ) -> Result<AddressSpaceId, ContextError> {
        let ctx = self.dispatch_target();
        let local = ctx.runtime.local_space();
        let node_owner = ctx.runtime.forest().owner_space(&node);
        match &ctx.variant {
            ContextVariant::Leaf | ContextVariant::Inline { .. } => {
                Err(ctx.illegal("get_version_owner"))
            }
            ContextVariant::Inner => Ok(ctx.resolve_version_owner(node, source)),
            ContextVariant::TopLevel if node_owner == local => {
                Ok(ctx.resolve_version_owner(node, source))
            }
            ContextVariant::TopLevel => ctx.request_version_owner(node, node_owner).await,
            ContextVariant::Remote(state) if state.top_level && node_owner == local => {
                Ok(ctx.resolve_version_owner(node, source))
            }
            ContextVariant::Remote(state) => {
                let target = if state.top_level {
                    node_owner
                } else {
                    ctx.uid.home
                };
                ctx.request_version_owner(node, target).await
            }
        }
    }

    fn resolve_version_owner(
        &self,
        node: RegionTreeNode,
        source: AddressSpaceId,
    ) -> AddressSpaceId {
        let owner = self.state.lock().owners.resolve_authoritative(node, source);
        trace!(context = %self.uid, node = ?node, source, owner, "Version owner resolved");
        owner
    }

    async fn request_version_owner(
        &self,
        node: RegionTreeNode,
        target: AddressSpaceId,
    ) -> Result<AddressSpaceId, ContextError> {
        loop {
            let lookup = self.state.lock().owners.lookup(node);
            match lookup {
                OwnerLookup::Resolved(owner) => return Ok(owner),
                OwnerLookup::Wait(event) => event.wait().await,
                OwnerLookup::Request(event) => {
                    debug!(context = %self.uid, node = ?node, target, "Requesting version owner");
                    let message = ContextMessage::VersionOwnerRequest {
                        context: self.uid,
                        node,
                        source: self.runtime.local_space(),
                    };
                    if let Err(err) = self.runtime.transport().send(target, message).await {
                        let abandoned = self.state.lock().owners.abandon(node);
                        if let Some(waiters) = abandoned {
                            waiters.trigger();
                        }
                        return Err(err.into());
                    }
                    event.wait().await;
                    let failure = self.state.lock().owners.take_failure(node);
                    if let Some(code) = failure {
                        return Err(ContextError::RemoteRequestFailed {
                            context: self.uid,
                            space: target,
                            code,
                        });
                    }
                }
            }
        }
    }

    /// Cache the owner space's answer, or drop the pending request on a
    /// failure reply. Either way every waiter wakes.
    pub(crate) fn process_version_owner_response(
        &self,
        node: RegionTreeNode,
        source: AddressSpaceId,
        owner: Result<AddressSpaceId, ErrorCode>,
    ) -> Result<(), ContextError> {
        let recorded = {
            let mut state = self.state.lock();
            match owner {
                Ok(owner) => state.owners.record_response(node, owner),
                Err(code) => Ok(state.owners.record_failure(node, code)),
            }
        };
        match owner {
            Ok(owner) => debug!(context = %self.uid, node = ?node, owner, "Version owner response"),
            Err(code) => warn!(
                context = %self.uid,
                node = ?node,
                source,
                code = code.as_i32(),
                "Version owner request failed"
            ),
        }
        if let Some(waiters) = recorded? {
            waiters.trigger();
        }
        Ok(())
    }

    pub fn version_owner(&self, node: &RegionTreeNode) -> Option<OwnershipRecord> {
        self.dispatch_target().state.lock().owners.get(node)
    }

    // Top views

    /// The canonical view of `manager`'s instance in this context. Only the
    /// instance's owner space constructs views; other spaces ask it once.
    pub async fn create_instance_top_view(
        &self,
        manager: &InstanceManager,
    ) -> Result<Arc<InstanceView>, ContextError> {
        let ctx = self.dispatch_target();
        let instance = manager.instance;
        loop {
            let lookup = ctx.state.lock().top_views.lookup(instance);
            match lookup {
                TopViewLookup::Ready(view) => return Ok(view),
                TopViewLookup::Wait(event) => event.wait().await,
                TopViewLookup::Create => {
                    let created = if manager.owner_space == ctx.runtime.local_space() {
                        Ok(ctx.runtime.views().create_view(manager, ctx.uid))
                    } else {
                        debug!(
                            context = %ctx.uid,
                            instance = ?instance,
                            owner = manager.owner_space,
                            "Delegating top view creation"
                        );
                        ctx.runtime.request_top_view(ctx.uid, *manager).await
                    };
                    return match created {
                        Ok(view) => {
                            let (canonical, waiters) =
                                ctx.state.lock().top_views.complete(instance, view);
                            if let Some(waiters) = waiters {
                                waiters.trigger();
                            }
                            Ok(canonical)
                        }
                        Err(err) => {
                            let waiters = ctx.state.lock().top_views.abandon(instance);
                            if let Some(waiters) = waiters {
                                waiters.trigger();
                            }
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    pub fn top_view(&self, instance: InstanceId) -> Option<Arc<InstanceView>> {
        self.dispatch_target().state.lock().top_views.get(instance)
    }

    /// The instance is gone: drop and release its view.
    pub fn notify_instance_deletion(&self, instance: InstanceId) {
        let ctx = self.dispatch_target();
        let removed = ctx.state.lock().top_views.remove(instance);
        if let Some(view) = removed {
            ctx.runtime.views().release(view.did);
            debug!(context = %ctx.uid, instance = ?instance, "Top view released");
        }
    }

    // Mirroring

    /// Pack this context for a mirror on `target` and remember that `target`
    /// holds one.
    pub fn pack_remote_context(
        &self,
        target: AddressSpaceId,
    ) -> Result<RemoteContextPayload, ContextError> {
        let ctx = self.dispatch_target();
        let parent = match &ctx.variant {
            ContextVariant::Leaf => return Err(ctx.illegal("pack_remote_context")),
            ContextVariant::Remote(state) => state.parent,
            _ => ctx.parent.as_ref().map(|p| p.uid),
        };
        ctx.state.lock().remote_instances.insert(target);

        let versions = (0..ctx.task.regions.len())
            .map(|idx| {
                let info = ctx.version_infos.get(idx).cloned().unwrap_or_default();
                PackedVersionInfo::pack(&info, ctx.is_virtual_mapped(idx))
            })
            .collect();
        let payload = RemoteContextPayload {
            uid: ctx.uid,
            top_level: ctx.is_top_level(),
            task: ctx.task.clone(),
            parent_req_indexes: ctx.parent_req_indexes.clone(),
            virtual_mapped: virtual_indices(&ctx.virtual_mapped),
            versions,
            local_fields: ctx.all_local_fields(),
            parent,
            config: ctx.config(),
            physical_contexts: ctx.physical_contexts.clone(),
        };
        info!(
            context = %ctx.uid,
            target,
            regions = payload.task.regions.len(),
            "Packed context mirror"
        );
        Ok(payload)
    }

    /// Push a mirror of this context to `target` ahead of running a child
    /// there.
    pub async fn send_remote_context(&self, target: AddressSpaceId) -> Result<(), ContextError> {
        let payload = self.pack_remote_context(target)?;
        let message = ContextMessage::RemoteContextResponse {
            context: payload.uid,
            payload: Some(payload.encode()?),
        };
        self.runtime.transport().send(target, message).await?;
        Ok(())
    }

    /// Build a mirror from a payload received from the context's home.
    pub(crate) fn unpack_remote_context(
        runtime: Arc<Runtime>,
        payload: RemoteContextPayload,
    ) -> Result<Arc<Context>, ContextError> {
        let virtual_mapped = payload.virtual_flags();
        let mapping = RegionMapping {
            parent_req_indexes: payload.parent_req_indexes,
            virtual_mapped,
            version_infos: payload
                .versions
                .into_iter()
                .map(PackedVersionInfo::unpack)
                .collect(),
            physical_contexts: payload.physical_contexts,
        };
        let variant = ContextVariant::Remote(RemoteState {
            top_level: payload.top_level,
            parent: payload.parent,
        });
        let ctx = Context::new(runtime, payload.uid, payload.task, variant, None, None, mapping);
        if let Some(config) = payload.config {
            ctx.install_config(config)?;
        }
        ctx.add_local_fields(payload.local_fields);
        info!(context = %ctx.uid, "Unpacked context mirror");
        Ok(ctx)
    }

    /// Drop a mirror's views when its home releases it.
    pub(crate) fn release_mirror(&self) {
        let views = self.state.lock().top_views.drain();
        for view in views {
            self.runtime.views().release(view.did);
        }
        debug!(context = %self.uid, "Mirror released");
    }
}
