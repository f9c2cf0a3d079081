//! Context Messages and Transport
//!
//! Point-to-point request/response messages exchanged between address spaces
//! on behalf of contexts, the `Transport` interface that carries them, and an
//! in-process network used by the binary and the tests. The in-process
//! network serializes every message with bincode before delivery so that only
//! state that survives the wire crosses address spaces, and it preserves
//! per-channel ordering by dispatching each inbox sequentially.

use crate::context::ledger::ResourceGroup;
use crate::error::{ErrorCode, TransportError};
use crate::types::{AddressSpaceId, ContextUid, RegionTreeNode};
use crate::views::{InstanceManager, InstanceView};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContextMessage {
    /// Ask the authoritative context for the version owner of `node`.
    VersionOwnerRequest {
        context: ContextUid,
        node: RegionTreeNode,
        source: AddressSpaceId,
    },
    /// `owner` carries the error code when the owner space could not answer.
    VersionOwnerResponse {
        context: ContextUid,
        node: RegionTreeNode,
        owner: Result<AddressSpaceId, ErrorCode>,
    },
    /// Ask the instance owner to construct (or find) the context's top view.
    TopViewRequest {
        request_id: u64,
        context: ContextUid,
        manager: InstanceManager,
    },
    TopViewResponse {
        request_id: u64,
        view: Result<InstanceView, ErrorCode>,
    },
    /// Ask a context's home for a mirror payload.
    RemoteContextRequest { context: ContextUid },
    /// `payload` is `None` when the home has no such context.
    RemoteContextResponse {
        context: ContextUid,
        payload: Option<Vec<u8>>,
    },
    /// Created and deleted resources returned by a committed child.
    ReturnResources {
        context: ContextUid,
        created: ResourceGroup,
        deleted: ResourceGroup,
    },
    /// The home context is gone; drop the mirror.
    FreeRemoteContext { context: ContextUid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    VersionOwnerRequest,
    VersionOwnerResponse,
    TopViewRequest,
    TopViewResponse,
    RemoteContextRequest,
    RemoteContextResponse,
    ReturnResources,
    FreeRemoteContext,
}

impl ContextMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ContextMessage::VersionOwnerRequest { .. } => MessageKind::VersionOwnerRequest,
            ContextMessage::VersionOwnerResponse { .. } => MessageKind::VersionOwnerResponse,
            ContextMessage::TopViewRequest { .. } => MessageKind::TopViewRequest,
            ContextMessage::TopViewResponse { .. } => MessageKind::TopViewResponse,
            ContextMessage::RemoteContextRequest { .. } => MessageKind::RemoteContextRequest,
            ContextMessage::RemoteContextResponse { .. } => MessageKind::RemoteContextResponse,
            ContextMessage::ReturnResources { .. } => MessageKind::ReturnResources,
            ContextMessage::FreeRemoteContext { .. } => MessageKind::FreeRemoteContext,
        }
    }
}

/// Reliable, per-channel-ordered delivery between address spaces.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_space(&self) -> AddressSpaceId;

    fn address_spaces(&self) -> Vec<AddressSpaceId>;

    async fn send(
        &self,
        target: AddressSpaceId,
        message: ContextMessage,
    ) -> Result<(), TransportError>;

    /// Send `message` to every other address space.
    async fn broadcast(&self, message: ContextMessage) -> Result<(), TransportError> {
        let local = self.local_space();
        for target in self.address_spaces() {
            if target != local {
                self.send(target, message.clone()).await?;
            }
        }
        Ok(())
    }
}

/// Receiver side of a transport.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(self: Arc<Self>, source: AddressSpaceId, message: ContextMessage);
}

type Inbox = mpsc::UnboundedSender<(AddressSpaceId, ContextMessage)>;

/// Hub connecting in-process address spaces.
#[derive(Default)]
pub struct InProcessNetwork {
    inboxes: RwLock<HashMap<AddressSpaceId, Inbox>>,
    sent: Mutex<HashMap<MessageKind, usize>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport handle for `local`.
    pub fn endpoint(self: &Arc<Self>, local: AddressSpaceId) -> Arc<NetworkEndpoint> {
        Arc::new(NetworkEndpoint {
            network: self.clone(),
            local,
        })
    }

    /// Start delivering messages for `space` to `handler`. The dispatch
    /// loop holds the handler weakly and stops once it is dropped.
    pub fn attach<H: MessageHandler>(&self, space: AddressSpaceId, handler: &Arc<H>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(AddressSpaceId, ContextMessage)>();
        self.inboxes.write().insert(space, tx);
        let weak: Weak<H> = Arc::downgrade(handler);
        tokio::spawn(async move {
            while let Some((source, message)) = rx.recv().await {
                let Some(handler) = weak.upgrade() else {
                    break;
                };
                handler.handle_message(source, message).await;
            }
            debug!(space, "Dispatch loop stopped");
        });
    }

    pub fn detach(&self, space: AddressSpaceId) {
        self.inboxes.write().remove(&space);
    }

    pub fn address_spaces(&self) -> Vec<AddressSpaceId> {
        let mut spaces: Vec<_> = self.inboxes.read().keys().copied().collect();
        spaces.sort_unstable();
        spaces
    }

    /// Messages of `kind` sent so far.
    pub fn sent_count(&self, kind: MessageKind) -> usize {
        self.sent.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().values().sum()
    }

    fn deliver(
        &self,
        source: AddressSpaceId,
        target: AddressSpaceId,
        message: ContextMessage,
    ) -> Result<(), TransportError> {
        let bytes = bincode::serialize(&message)?;
        let decoded: ContextMessage = bincode::deserialize(&bytes)?;
        let inbox = self
            .inboxes
            .read()
            .get(&target)
            .cloned()
            .ok_or(TransportError::UnknownAddressSpace(target))?;
        *self.sent.lock().entry(message.kind()).or_insert(0) += 1;
        trace!(source, target, kind = ?message.kind(), bytes = bytes.len(), "Delivering message");
        inbox
            .send((source, decoded))
            .map_err(|_| TransportError::ChannelClosed(target))
    }
}

pub struct NetworkEndpoint {
    network: Arc<InProcessNetwork>,
    local: AddressSpaceId,
}

impl NetworkEndpoint {
    pub fn network(&self) -> &Arc<InProcessNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for NetworkEndpoint {
    fn local_space(&self) -> AddressSpaceId {
        self.local
    }

    fn address_spaces(&self) -> Vec<AddressSpaceId> {
        self.network.address_spaces()
    }

    async fn send(
        &self,
        target: AddressSpaceId,
        message: ContextMessage,
    ) -> Result<(), TransportError> {
        self.network.deliver(self.local, target, message)
    }
}
