//! Version-owner cache.
//!
//! Maps region-tree nodes to the address space holding the authoritative
//! version state for them within one context. The context on the node's owner
//! space hands ownership to whichever space asks first; every other context
//! caches the authoritative answer after at most one request per node.

use crate::error::{ContextError, ErrorCode};
use crate::event::{Event, UserEvent};
use crate::types::{AddressSpaceId, ContextUid, RegionTreeNode};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub owner: AddressSpaceId,
    /// Only remote spaces have used this node so far.
    pub remote_only: bool,
}

/// Outcome of a non-authoritative lookup.
#[derive(Debug)]
pub enum OwnerLookup {
    Resolved(AddressSpaceId),
    /// A request is in flight; wait and look again.
    Wait(Event),
    /// This caller must send the request, then wait and look again.
    Request(Event),
}

#[derive(Debug)]
pub struct OwnershipCache {
    context: ContextUid,
    local_space: AddressSpaceId,
    records: HashMap<RegionTreeNode, OwnershipRecord>,
    pending: HashMap<RegionTreeNode, UserEvent>,
    /// Failure replies not yet seen by the requester.
    failures: HashMap<RegionTreeNode, ErrorCode>,
}

impl OwnershipCache {
    pub fn new(context: ContextUid, local_space: AddressSpaceId) -> Self {
        Self {
            context,
            local_space,
            records: HashMap::new(),
            pending: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Authoritative answer for a query from `source`. The first querier
    /// becomes the owner; a later local query clears the remote-only bit.
    pub fn resolve_authoritative(
        &mut self,
        node: RegionTreeNode,
        source: AddressSpaceId,
    ) -> AddressSpaceId {
        match self.records.entry(node) {
            Entry::Occupied(mut entry) => {
                if source == self.local_space {
                    entry.get_mut().remote_only = false;
                }
                entry.get().owner
            }
            Entry::Vacant(entry) => {
                entry.insert(OwnershipRecord {
                    owner: source,
                    remote_only: source != self.local_space,
                });
                source
            }
        }
    }

    pub fn lookup(&mut self, node: RegionTreeNode) -> OwnerLookup {
        if let Some(record) = self.records.get(&node) {
            return OwnerLookup::Resolved(record.owner);
        }
        match self.pending.entry(node) {
            Entry::Occupied(entry) => OwnerLookup::Wait(entry.get().event()),
            Entry::Vacant(entry) => OwnerLookup::Request(entry.insert(UserEvent::new()).event()),
        }
    }

    /// Cache a response. Returns the pending event to trigger.
    pub fn record_response(
        &mut self,
        node: RegionTreeNode,
        owner: AddressSpaceId,
    ) -> Result<Option<UserEvent>, ContextError> {
        match self.records.entry(node) {
            Entry::Occupied(_) => Err(ContextError::DuplicateOwnershipResponse {
                context: self.context,
                node,
            }),
            Entry::Vacant(entry) => {
                entry.insert(OwnershipRecord {
                    owner,
                    remote_only: false,
                });
                Ok(self.pending.remove(&node))
            }
        }
    }

    /// The owner space could not answer. The pending request is dropped so
    /// later queries ask again; the requester picks up `code`.
    pub fn record_failure(&mut self, node: RegionTreeNode, code: ErrorCode) -> Option<UserEvent> {
        self.failures.insert(node, code);
        self.pending.remove(&node)
    }

    pub fn take_failure(&mut self, node: RegionTreeNode) -> Option<ErrorCode> {
        self.failures.remove(&node)
    }

    /// Drop a pending request that could not be sent so waiters retry.
    pub fn abandon(&mut self, node: RegionTreeNode) -> Option<UserEvent> {
        self.pending.remove(&node)
    }

    pub fn get(&self, node: &RegionTreeNode) -> Option<OwnershipRecord> {
        self.records.get(node).copied()
    }

    /// Nodes with version state on this space, for teardown.
    pub fn locally_used(&self) -> Vec<RegionTreeNode> {
        self.records
            .iter()
            .filter(|(_, record)| !record.remote_only)
            .map(|(node, _)| *node)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
