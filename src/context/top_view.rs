//! Top-view cache.
//!
//! One canonical view per physical instance per context. The first caller to
//! miss becomes the creator; concurrent callers wait on a shared event that is
//! created lazily, then read the cache again.

use crate::event::{Event, UserEvent};
use crate::types::InstanceId;
use crate::views::InstanceView;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub enum TopViewLookup {
    Ready(Arc<InstanceView>),
    Wait(Event),
    /// Caller must construct (or request) the view and call `complete`.
    Create,
}

#[derive(Debug, Default)]
pub struct TopViewCache {
    views: HashMap<InstanceId, Arc<InstanceView>>,
    pending: HashMap<InstanceId, Option<UserEvent>>,
}

impl TopViewCache {
    pub fn lookup(&mut self, instance: InstanceId) -> TopViewLookup {
        if let Some(view) = self.views.get(&instance) {
            return TopViewLookup::Ready(view.clone());
        }
        match self.pending.entry(instance) {
            Entry::Occupied(mut entry) => {
                let event = entry.get_mut().get_or_insert_with(UserEvent::new).event();
                TopViewLookup::Wait(event)
            }
            Entry::Vacant(entry) => {
                entry.insert(None);
                TopViewLookup::Create
            }
        }
    }

    /// Store the constructed view. Returns the canonical handle and the event
    /// to trigger for waiters, if any.
    pub fn complete(
        &mut self,
        instance: InstanceId,
        view: Arc<InstanceView>,
    ) -> (Arc<InstanceView>, Option<UserEvent>) {
        let canonical = self.views.entry(instance).or_insert(view).clone();
        let waiters = self.pending.remove(&instance).flatten();
        (canonical, waiters)
    }

    /// Give up on a creation so that waiters retry.
    pub fn abandon(&mut self, instance: InstanceId) -> Option<UserEvent> {
        self.pending.remove(&instance).flatten()
    }

    pub fn get(&self, instance: InstanceId) -> Option<Arc<InstanceView>> {
        self.views.get(&instance).cloned()
    }

    pub fn remove(&mut self, instance: InstanceId) -> Option<Arc<InstanceView>> {
        self.views.remove(&instance)
    }

    pub fn drain(&mut self) -> Vec<Arc<InstanceView>> {
        self.views.drain().map(|(_, view)| view).collect()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}
