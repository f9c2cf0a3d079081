//! Ledger operations on a context: resource creation and deletion, privilege
//! checks, parent lookups, coherence restrictions, traces, mapped regions and
//! local fields. Inline contexts forward all of these to the context they are
//! inlined into.

use super::conflict::{self, CompetingOp, ConflictSource};
use super::ledger::{DeletionOutcome, PhysicalRegion, Resource, ResourceGroup};
use super::{Context, ContextVariant};
use crate::error::{ContextError, PrivilegeError};
use crate::types::{
    ContextUid, FieldId, FieldSpace, IndexPartition, IndexSpace, IndexSpaceRequirement,
    LocalFieldInfo, LogicalRegion, PrivilegeMode, RegionRequirement, TraceId, VersionInfo,
};
use tracing::{debug, trace};

impl Context {
    /// The context that owns ledger state for this one.
    fn ledger_owner(&self) -> &Context {
        let mut ctx = self;
        while let ContextVariant::Inline { enclosing } = &ctx.variant {
            ctx = enclosing.as_ref();
        }
        ctx
    }

    fn privilege_error(&self, source: PrivilegeError) -> ContextError {
        ContextError::Privilege {
            context: self.uid,
            task: self.task.name.clone(),
            source,
        }
    }

    // Creation and deletion

    pub fn register_creation(&self, resource: Resource) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let inserted = {
            let mut guard = ctx.state.lock();
            let state = &mut *guard;
            let inserted = state.ledger.register_creation(resource);
            if inserted {
                if let Resource::Region(region) = resource {
                    let task_executed = state.children.task_executed();
                    state.ledger.add_created_region(region, task_executed);
                }
            }
            inserted
        };
        if !inserted {
            return Err(ContextError::DuplicateCreation {
                context: ctx.uid,
                resource: resource.to_string(),
            });
        }
        trace!(context = %ctx.uid, resource = %resource, "Resource created");
        Ok(())
    }

    /// Delete a resource. Resources created here are finalized now; any
    /// other deletion is recorded for the parent.
    pub fn register_deletion(&self, resource: Resource) -> DeletionOutcome {
        let ctx = self.ledger_owner();
        let outcome = ctx.state.lock().ledger.register_deletion(resource);
        if outcome == DeletionOutcome::Finalize {
            let forest = ctx.runtime.forest();
            match resource {
                Resource::Region(region) => forest.finalize_region_destroy(region),
                Resource::Field(space, field) => forest.finalize_field_destroy(space, field),
                Resource::FieldSpace(space) => forest.finalize_field_space_destroy(space),
                Resource::IndexSpace(space) => forest.finalize_index_space_destroy(space),
                Resource::IndexPartition(partition) => {
                    forest.finalize_index_partition_destroy(partition)
                }
            }
        }
        debug!(context = %ctx.uid, resource = %resource, outcome = ?outcome, "Resource deleted");
        outcome
    }

    pub fn register_creations(
        &self,
        resources: impl IntoIterator<Item = Resource>,
    ) -> Result<(), ContextError> {
        resources
            .into_iter()
            .try_for_each(|resource| self.register_creation(resource))
    }

    pub fn register_deletions(&self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            self.register_deletion(resource);
        }
    }

    pub fn register_region_creation(&self, region: LogicalRegion) -> Result<(), ContextError> {
        self.register_creation(Resource::Region(region))
    }

    pub fn register_region_deletion(&self, region: LogicalRegion) -> DeletionOutcome {
        self.register_deletion(Resource::Region(region))
    }

    pub fn register_field_creation(
        &self,
        space: FieldSpace,
        field: FieldId,
    ) -> Result<(), ContextError> {
        self.register_creation(Resource::Field(space, field))
    }

    pub fn register_field_deletion(&self, space: FieldSpace, field: FieldId) -> DeletionOutcome {
        self.register_deletion(Resource::Field(space, field))
    }

    pub fn register_field_space_creation(&self, space: FieldSpace) -> Result<(), ContextError> {
        self.register_creation(Resource::FieldSpace(space))
    }

    pub fn register_field_space_deletion(&self, space: FieldSpace) -> DeletionOutcome {
        self.register_deletion(Resource::FieldSpace(space))
    }

    pub fn register_index_space_creation(&self, space: IndexSpace) -> Result<(), ContextError> {
        self.register_creation(Resource::IndexSpace(space))
    }

    pub fn register_index_space_deletion(&self, space: IndexSpace) -> DeletionOutcome {
        self.register_deletion(Resource::IndexSpace(space))
    }

    pub fn register_index_partition_creation(
        &self,
        partition: IndexPartition,
    ) -> Result<(), ContextError> {
        self.register_creation(Resource::IndexPartition(partition))
    }

    pub fn register_index_partition_deletion(&self, partition: IndexPartition) -> DeletionOutcome {
        self.register_deletion(Resource::IndexPartition(partition))
    }

    pub fn register_region_creations(&self, regions: &[LogicalRegion]) -> Result<(), ContextError> {
        self.register_creations(regions.iter().map(|r| Resource::Region(*r)))
    }

    pub fn register_region_deletions(&self, regions: &[LogicalRegion]) {
        self.register_deletions(regions.iter().map(|r| Resource::Region(*r)))
    }

    pub fn register_field_creations(
        &self,
        fields: &[(FieldSpace, FieldId)],
    ) -> Result<(), ContextError> {
        self.register_creations(fields.iter().map(|(s, f)| Resource::Field(*s, *f)))
    }

    pub fn register_field_deletions(&self, fields: &[(FieldSpace, FieldId)]) {
        self.register_deletions(fields.iter().map(|(s, f)| Resource::Field(*s, *f)))
    }

    pub fn register_field_space_creations(
        &self,
        spaces: &[FieldSpace],
    ) -> Result<(), ContextError> {
        self.register_creations(spaces.iter().map(|s| Resource::FieldSpace(*s)))
    }

    pub fn register_field_space_deletions(&self, spaces: &[FieldSpace]) {
        self.register_deletions(spaces.iter().map(|s| Resource::FieldSpace(*s)))
    }

    pub fn register_index_space_creations(
        &self,
        spaces: &[IndexSpace],
    ) -> Result<(), ContextError> {
        self.register_creations(spaces.iter().map(|s| Resource::IndexSpace(*s)))
    }

    pub fn register_index_space_deletions(&self, spaces: &[IndexSpace]) {
        self.register_deletions(spaces.iter().map(|s| Resource::IndexSpace(*s)))
    }

    pub fn register_index_partition_creations(
        &self,
        partitions: &[IndexPartition],
    ) -> Result<(), ContextError> {
        self.register_creations(partitions.iter().map(|p| Resource::IndexPartition(*p)))
    }

    pub fn register_index_partition_deletions(&self, partitions: &[IndexPartition]) {
        self.register_deletions(partitions.iter().map(|p| Resource::IndexPartition(*p)))
    }

    /// Apply resources returned by a committed child: creations first, then
    /// deletions.
    pub(crate) fn apply_returned(
        &self,
        created: &ResourceGroup,
        deleted: &ResourceGroup,
    ) -> Result<(), ContextError> {
        self.register_creations(created.resources())?;
        self.register_deletions(deleted.resources());
        Ok(())
    }

    pub fn created_resources(&self) -> ResourceGroup {
        self.ledger_owner().state.lock().ledger.created().clone()
    }

    pub fn deleted_resources(&self) -> ResourceGroup {
        self.ledger_owner().state.lock().ledger.deleted().clone()
    }

    pub fn created_requirements(&self) -> Vec<(RegionRequirement, bool)> {
        let state = self.ledger_owner().state.lock();
        state
            .ledger
            .created_requirements()
            .iter()
            .cloned()
            .zip(state.ledger.returnable_privileges().iter().copied())
            .collect()
    }

    // Privileges

    pub fn check_privilege(&self, req: &RegionRequirement) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let result = ctx.state.lock().ledger.check_privilege(
            &ctx.task.regions,
            req,
            ctx.runtime.forest().as_ref(),
        );
        result.map_err(|source| ctx.privilege_error(source))
    }

    pub fn check_index_privilege(&self, req: &IndexSpaceRequirement) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let result = ctx.state.lock().ledger.check_index_privilege(
            &ctx.task.indexes,
            req,
            ctx.runtime.forest().as_ref(),
        );
        result.map_err(|source| ctx.privilege_error(source))
    }

    /// Index of the requirement `req` derives its privileges from, widening
    /// or synthesizing created requirements as needed.
    pub fn find_parent_region_req(
        &self,
        req: &RegionRequirement,
        check_privilege: bool,
    ) -> Option<usize> {
        let ctx = self.ledger_owner();
        ctx.state.lock().ledger.find_parent_region_req(
            &ctx.task.regions,
            req,
            check_privilege,
            ctx.runtime.forest().as_ref(),
        )
    }

    pub fn find_parent_region(&self, parent: LogicalRegion) -> Option<usize> {
        let ctx = self.ledger_owner();
        ctx.state.lock().ledger.find_parent_region(&ctx.task.regions, parent)
    }

    pub fn find_parent_index_region(&self, parent: IndexSpace) -> Option<usize> {
        self.ledger_owner()
            .task
            .indexes
            .iter()
            .position(|req| req.handle == parent)
    }

    pub fn clone_requirement(&self, index: usize) -> Option<RegionRequirement> {
        let ctx = self.ledger_owner();
        let state = ctx.state.lock();
        state.ledger.requirement(&ctx.task.regions, index).cloned()
    }

    pub fn find_logical_region(&self, index: usize) -> Option<LogicalRegion> {
        self.clone_requirement(index).map(|req| req.region_handle())
    }

    pub fn find_parent_privilege_mode(&self, index: usize) -> Option<PrivilegeMode> {
        self.clone_requirement(index).map(|req| req.privilege)
    }

    /// Context in whose region tree the logical analysis for requirement
    /// `index` runs.
    pub fn find_parent_logical_context(&self, index: usize) -> ContextUid {
        let ctx = self.ledger_owner();
        let original = ctx.task.regions.len();
        if index >= original && ctx.state.lock().ledger.is_returnable(original, index) {
            return ctx.find_outermost_local_context().uid;
        }
        ctx.uid
    }

    /// Context whose region tree holds the physical state for requirement
    /// `index`.
    pub fn find_parent_physical_context(&self, index: usize) -> ContextUid {
        let ctx = self.ledger_owner();
        match ctx.physical_contexts.get(index) {
            Some(uid) => *uid,
            None => ctx.find_outermost_local_context().uid,
        }
    }

    pub fn find_parent_version_info(&self, index: usize) -> VersionInfo {
        self.ledger_owner()
            .version_infos
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Furthest ancestor reachable without leaving this address space.
    pub fn find_outermost_local_context(&self) -> &Context {
        let mut ctx = self.ledger_owner();
        while let Some(parent) = &ctx.parent {
            ctx = parent.ledger_owner();
        }
        ctx
    }

    /// Root of the local context chain. A mirror stands in for its own
    /// ancestors.
    pub fn find_top_context(&self) -> &Context {
        self.find_outermost_local_context()
    }

    // Coherence restrictions

    /// Attach: the region's fields become restricted.
    pub fn add_restriction(&self, req: &RegionRequirement) {
        self.ledger_owner().state.lock().ledger.add_restriction(req);
    }

    /// Detach.
    pub fn remove_restriction(&self, req: &RegionRequirement) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let removed = ctx.state.lock().ledger.remove_restriction(req);
        if !removed {
            return Err(ContextError::UnattachedDetach {
                task: ctx.task.name.clone(),
                region: req.region_handle(),
            });
        }
        Ok(())
    }

    pub fn add_acquisition(&self, req: &RegionRequirement) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let acquired = ctx.state.lock().ledger.add_acquisition(req);
        if !acquired {
            return Err(ContextError::UnrestrictedAcquire {
                task: ctx.task.name.clone(),
                region: req.region_handle(),
            });
        }
        Ok(())
    }

    pub fn remove_acquisition(&self, req: &RegionRequirement) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let released = ctx.state.lock().ledger.remove_acquisition(req);
        if !released {
            return Err(ContextError::UnacquiredRelease {
                task: ctx.task.name.clone(),
                region: req.region_handle(),
            });
        }
        Ok(())
    }

    // Traces

    pub fn begin_trace(&self, trace: TraceId) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let current = {
            let mut state = ctx.state.lock();
            match state.current_trace {
                Some(current) => Some(current),
                None => {
                    state.current_trace = Some(trace);
                    None
                }
            }
        };
        if let Some(current) = current {
            return Err(ContextError::IllegalNestedTrace {
                task: ctx.task.name.clone(),
                current,
                trace,
            });
        }
        debug!(context = %ctx.uid, trace = ?trace, "Trace begun");
        Ok(())
    }

    pub fn end_trace(&self, trace: TraceId) -> Result<(), ContextError> {
        let ctx = self.ledger_owner();
        let matched = {
            let mut state = ctx.state.lock();
            let matched = state.current_trace == Some(trace);
            if matched {
                state.current_trace = None;
            }
            matched
        };
        if !matched {
            return Err(ContextError::UnmatchedEndTrace {
                task: ctx.task.name.clone(),
                trace,
            });
        }
        debug!(context = %ctx.uid, trace = ?trace, "Trace ended");
        Ok(())
    }

    pub fn current_trace(&self) -> Option<TraceId> {
        self.ledger_owner().state.lock().current_trace
    }

    // Mapped regions

    /// Mark physical region `index` mapped. False if there is none.
    pub fn remap_region(&self, index: usize) -> bool {
        self.set_mapped(index, true)
    }

    pub fn unmap_region(&self, index: usize) -> bool {
        self.set_mapped(index, false)
    }

    fn set_mapped(&self, index: usize, mapped: bool) -> bool {
        let mut state = self.ledger_owner().state.lock();
        match state.ledger.physical_regions_mut().get_mut(index) {
            Some(region) => {
                region.mapped = mapped;
                true
            }
            None => false,
        }
    }

    pub fn physical_regions(&self) -> Vec<PhysicalRegion> {
        self.ledger_owner().state.lock().ledger.physical_regions().to_vec()
    }

    pub fn register_inline_mapped_region(&self, req: RegionRequirement) {
        let ctx = self.ledger_owner();
        trace!(context = %ctx.uid, region = ?req.region_handle(), "Inline mapping registered");
        ctx.state
            .lock()
            .ledger
            .register_inline_region(PhysicalRegion::mapped(req));
    }

    pub fn unregister_inline_mapped_region(&self, region: LogicalRegion) -> usize {
        self.ledger_owner()
            .state
            .lock()
            .ledger
            .unregister_inline_region(region)
    }

    pub fn inline_regions(&self) -> Vec<PhysicalRegion> {
        self.ledger_owner().state.lock().ledger.inline_regions().to_vec()
    }

    pub(super) fn take_inline_regions_after(&self, len: usize) -> Vec<PhysicalRegion> {
        self.ledger_owner()
            .state
            .lock()
            .ledger
            .split_inline_regions(len)
    }

    /// First mapped region `req` must wait to be unmapped for.
    pub fn has_conflicting_regions(&self, req: &RegionRequirement) -> Option<ConflictSource> {
        let ctx = self.ledger_owner();
        let state = ctx.state.lock();
        conflict::has_conflicting_regions(
            ctx.runtime.forest().as_ref(),
            state.ledger.physical_regions(),
            state.ledger.inline_regions(),
            req,
        )
    }

    pub fn find_conflicting_regions(&self, op: CompetingOp<'_>) -> Vec<ConflictSource> {
        let ctx = self.ledger_owner();
        let state = ctx.state.lock();
        conflict::find_conflicting_regions(
            ctx.runtime.forest().as_ref(),
            state.ledger.physical_regions(),
            state.ledger.inline_regions(),
            op,
        )
    }

    // Local fields

    pub fn add_local_field(&self, info: LocalFieldInfo) {
        let ctx = self.ledger_owner();
        ctx.state.lock().ledger.add_local_field(info);
        ctx.runtime.forest().allocate_local_field(&info);
    }

    pub fn add_local_fields(&self, fields: impl IntoIterator<Item = LocalFieldInfo>) {
        for info in fields {
            self.add_local_field(info);
        }
    }

    /// Local fields of this context and every enclosing local context.
    pub fn all_local_fields(&self) -> Vec<LocalFieldInfo> {
        let mut fields = Vec::new();
        let mut next: Option<&Context> = Some(self.ledger_owner());
        while let Some(ctx) = next {
            fields.extend_from_slice(ctx.state.lock().ledger.local_fields());
            next = ctx.parent.as_ref().map(|p| p.ledger_owner());
        }
        fields
    }
}

