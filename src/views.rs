//! Instance Views
//!
//! Arena of per-context view objects over physical instances. Views are
//! owned by the arena and addressed by `DistributedId`; contexts hold shared
//! handles in their top-view caches and release them from the arena at
//! teardown.

use crate::types::{AddressSpaceId, ContextUid, DistributedId, InstanceId, RegionTreeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Descriptor of a physical instance and the address space that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceManager {
    pub instance: InstanceId,
    pub owner_space: AddressSpaceId,
    pub tree_id: RegionTreeId,
}

/// Canonical view of one instance within one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    pub did: DistributedId,
    pub instance: InstanceId,
    pub context: ContextUid,
    pub owner_space: AddressSpaceId,
}

const SPACE_SHIFT: u32 = 48;

pub struct ViewArena {
    local_space: AddressSpaceId,
    next_did: AtomicU64,
    constructed: AtomicUsize,
    views: RwLock<HashMap<DistributedId, Arc<InstanceView>>>,
}

impl ViewArena {
    pub fn new(local_space: AddressSpaceId) -> Self {
        Self {
            local_space,
            next_did: AtomicU64::new(1),
            constructed: AtomicUsize::new(0),
            views: RwLock::new(HashMap::new()),
        }
    }

    fn allocate_did(&self) -> DistributedId {
        let serial = self.next_did.fetch_add(1, Ordering::Relaxed);
        DistributedId((u64::from(self.local_space) << SPACE_SHIFT) | serial)
    }

    /// Construct a new view owned by this address space.
    pub fn create_view(&self, manager: &InstanceManager, context: ContextUid) -> Arc<InstanceView> {
        let view = Arc::new(InstanceView {
            did: self.allocate_did(),
            instance: manager.instance,
            context,
            owner_space: self.local_space,
        });
        self.constructed.fetch_add(1, Ordering::Relaxed);
        self.views.write().insert(view.did, view.clone());
        debug!(
            did = %view.did,
            instance = ?manager.instance,
            context = %context,
            "Constructed instance view"
        );
        view
    }

    /// Register a view constructed elsewhere, or return the existing handle.
    pub fn find_or_register(&self, view: InstanceView) -> Arc<InstanceView> {
        let mut views = self.views.write();
        views
            .entry(view.did)
            .or_insert_with(|| Arc::new(view))
            .clone()
    }

    pub fn find(&self, did: DistributedId) -> Option<Arc<InstanceView>> {
        self.views.read().get(&did).cloned()
    }

    pub fn release(&self, did: DistributedId) -> bool {
        self.views.write().remove(&did).is_some()
    }

    /// Number of views this address space has constructed.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.views.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.read().is_empty()
    }
}
