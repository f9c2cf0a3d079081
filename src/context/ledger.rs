//! Region/Privilege Ledger
//!
//! Resources a context has created or deleted, the region requirements it
//! holds (inherited and created), its mapped physical regions, and the
//! privilege checks children are validated against. The ledger is plain data
//! guarded by the context lock; it never calls out except for structural
//! forest queries.

use crate::error::PrivilegeError;
use crate::forest::RegionForest;
use crate::types::{
    Coherence, FieldId, FieldSpace, IndexPartition, IndexSpace, IndexSpaceRequirement,
    LocalFieldInfo, LogicalRegion, PrivilegeMode, RegionRequirement, RequirementHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One dynamically created (or deleted) resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Region(LogicalRegion),
    Field(FieldSpace, FieldId),
    FieldSpace(FieldSpace),
    IndexSpace(IndexSpace),
    IndexPartition(IndexPartition),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Region(r) => write!(f, "region {:?}", r),
            Resource::Field(s, fid) => write!(f, "field {:?}/{:?}", s, fid),
            Resource::FieldSpace(s) => write!(f, "field space {:?}", s),
            Resource::IndexSpace(s) => write!(f, "index space {:?}", s),
            Resource::IndexPartition(p) => write!(f, "index partition {:?}", p),
        }
    }
}

/// A set of resources of every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub regions: BTreeSet<LogicalRegion>,
    pub fields: BTreeSet<(FieldSpace, FieldId)>,
    pub field_spaces: BTreeSet<FieldSpace>,
    pub index_spaces: BTreeSet<IndexSpace>,
    pub index_partitions: BTreeSet<IndexPartition>,
}

impl ResourceGroup {
    pub fn insert(&mut self, resource: Resource) -> bool {
        match resource {
            Resource::Region(r) => self.regions.insert(r),
            Resource::Field(s, f) => self.fields.insert((s, f)),
            Resource::FieldSpace(s) => self.field_spaces.insert(s),
            Resource::IndexSpace(s) => self.index_spaces.insert(s),
            Resource::IndexPartition(p) => self.index_partitions.insert(p),
        }
    }

    pub fn remove(&mut self, resource: Resource) -> bool {
        match resource {
            Resource::Region(r) => self.regions.remove(&r),
            Resource::Field(s, f) => self.fields.remove(&(s, f)),
            Resource::FieldSpace(s) => self.field_spaces.remove(&s),
            Resource::IndexSpace(s) => self.index_spaces.remove(&s),
            Resource::IndexPartition(p) => self.index_partitions.remove(&p),
        }
    }

    pub fn contains(&self, resource: Resource) -> bool {
        match resource {
            Resource::Region(r) => self.regions.contains(&r),
            Resource::Field(s, f) => self.fields.contains(&(s, f)),
            Resource::FieldSpace(s) => self.field_spaces.contains(&s),
            Resource::IndexSpace(s) => self.index_spaces.contains(&s),
            Resource::IndexPartition(p) => self.index_partitions.contains(&p),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
            && self.fields.is_empty()
            && self.field_spaces.is_empty()
            && self.index_spaces.is_empty()
            && self.index_partitions.is_empty()
    }

    /// Every resource in the group, in kind order.
    pub fn resources(&self) -> Vec<Resource> {
        let mut out = Vec::new();
        out.extend(self.regions.iter().map(|r| Resource::Region(*r)));
        out.extend(self.fields.iter().map(|(s, f)| Resource::Field(*s, *f)));
        out.extend(self.field_spaces.iter().map(|s| Resource::FieldSpace(*s)));
        out.extend(self.index_spaces.iter().map(|s| Resource::IndexSpace(*s)));
        out.extend(self.index_partitions.iter().map(|p| Resource::IndexPartition(*p)));
        out
    }
}

/// What a deletion did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Created here: erased, and the forest must finalize it.
    Finalize,
    /// Not ours: recorded for the parent to finalize.
    PropagateToParent,
}

/// A mapped (or mappable) physical region of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRegion {
    pub requirement: RegionRequirement,
    pub mapped: bool,
    pub virtual_mapped: bool,
}

impl PhysicalRegion {
    pub fn mapped(requirement: RegionRequirement) -> Self {
        Self {
            requirement,
            mapped: true,
            virtual_mapped: false,
        }
    }

    pub fn unmapped(requirement: RegionRequirement) -> Self {
        Self {
            requirement,
            mapped: false,
            virtual_mapped: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Restriction {
    region: LogicalRegion,
    fields: BTreeSet<FieldId>,
    acquired: BTreeSet<FieldId>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    created: ResourceGroup,
    deleted: ResourceGroup,
    created_requirements: Vec<RegionRequirement>,
    /// Positionally parallel to `created_requirements`.
    returnable_privileges: Vec<bool>,
    physical_regions: Vec<PhysicalRegion>,
    inline_regions: Vec<PhysicalRegion>,
    local_fields: Vec<LocalFieldInfo>,
    restrictions: Vec<Restriction>,
}

impl Ledger {
    /// Ledger for a context whose original requirements are `regions`.
    pub fn new(regions: &[RegionRequirement], virtual_mapped: &[bool]) -> Self {
        let physical_regions = regions
            .iter()
            .enumerate()
            .map(|(idx, req)| {
                let is_virtual = virtual_mapped.get(idx).copied().unwrap_or(false);
                PhysicalRegion {
                    requirement: req.clone(),
                    mapped: !is_virtual,
                    virtual_mapped: is_virtual,
                }
            })
            .collect();
        Self {
            physical_regions,
            ..Self::default()
        }
    }

    pub fn created(&self) -> &ResourceGroup {
        &self.created
    }

    pub fn deleted(&self) -> &ResourceGroup {
        &self.deleted
    }

    /// Insert a newly created resource. False if it was already present.
    pub fn register_creation(&mut self, resource: Resource) -> bool {
        self.created.insert(resource)
    }

    /// Full-access, returnable requirement on a created region, plus an
    /// unmapped physical region for later remapping while the task runs.
    pub fn add_created_region(&mut self, region: LogicalRegion, task_executed: bool) {
        let req = RegionRequirement::region(
            region,
            PrivilegeMode::READ_WRITE,
            Coherence::Exclusive,
            std::iter::empty(),
        );
        self.created_requirements.push(req.clone());
        self.returnable_privileges.push(true);
        if !task_executed {
            self.physical_regions.push(PhysicalRegion::unmapped(req));
        }
    }

    pub fn register_deletion(&mut self, resource: Resource) -> DeletionOutcome {
        if let Resource::FieldSpace(space) = resource {
            self.created.fields.retain(|(s, _)| *s != space);
        }
        if self.created.remove(resource) {
            DeletionOutcome::Finalize
        } else {
            self.deleted.insert(resource);
            DeletionOutcome::PropagateToParent
        }
    }

    pub fn created_requirements(&self) -> &[RegionRequirement] {
        &self.created_requirements
    }

    pub fn returnable_privileges(&self) -> &[bool] {
        &self.returnable_privileges
    }

    pub fn physical_regions(&self) -> &[PhysicalRegion] {
        &self.physical_regions
    }

    pub fn physical_regions_mut(&mut self) -> &mut [PhysicalRegion] {
        &mut self.physical_regions
    }

    pub fn inline_regions(&self) -> &[PhysicalRegion] {
        &self.inline_regions
    }

    pub fn register_inline_region(&mut self, region: PhysicalRegion) {
        self.inline_regions.push(region);
    }

    /// Drop inline mappings of `region`. Returns how many were removed.
    pub fn unregister_inline_region(&mut self, region: LogicalRegion) -> usize {
        let before = self.inline_regions.len();
        self.inline_regions
            .retain(|r| r.requirement.region_handle() != region);
        before - self.inline_regions.len()
    }

    pub fn clear_inline_regions(&mut self) -> Vec<PhysicalRegion> {
        std::mem::take(&mut self.inline_regions)
    }

    /// Remove and return inline mappings registered after the first `len`.
    pub fn split_inline_regions(&mut self, len: usize) -> Vec<PhysicalRegion> {
        if len >= self.inline_regions.len() {
            return Vec::new();
        }
        self.inline_regions.split_off(len)
    }

    pub fn add_local_field(&mut self, info: LocalFieldInfo) {
        self.local_fields.push(info);
    }

    pub fn local_fields(&self) -> &[LocalFieldInfo] {
        &self.local_fields
    }

    /// True when a created requirement no longer names live resources.
    pub fn was_created_requirement_deleted(&self, req: &RegionRequirement) -> bool {
        let region = req.region_handle();
        if self.created.regions.contains(&region) {
            return false;
        }
        let mut fields = req.privilege_fields.iter();
        match (fields.next(), fields.next()) {
            (Some(field), None) => !self.created.fields.contains(&(region.field_space, *field)),
            _ => true,
        }
    }

    /// Hand every still-live created resource and every propagated deletion
    /// to the caller, leaving both sets empty.
    pub fn take_returned(&mut self) -> (ResourceGroup, ResourceGroup) {
        (
            std::mem::take(&mut self.created),
            std::mem::take(&mut self.deleted),
        )
    }

    /// Validate `req` against the original requirements, then the created
    /// requirements, then the set of self-created fields.
    pub fn check_privilege(
        &self,
        original: &[RegionRequirement],
        req: &RegionRequirement,
        forest: &dyn RegionForest,
    ) -> Result<(), PrivilegeError> {
        if req.verified {
            return Ok(());
        }
        let mut remaining = req.privilege_fields.clone();
        for ours in original {
            match check_against(req, ours, &mut remaining, forest) {
                Ok(()) => return Ok(()),
                Err(PrivilegeError::BadParentRegion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        for (ours, returnable) in self
            .created_requirements
            .iter()
            .zip(&self.returnable_privileges)
        {
            match check_against(req, ours, &mut remaining, forest) {
                Ok(()) => return Ok(()),
                // Returnable privileges are still owned here; any field on
                // that region can be granted.
                Err(PrivilegeError::BadParentRegion { .. })
                    if *returnable && ours.region_handle() == req.parent =>
                {
                    return Ok(())
                }
                Err(PrivilegeError::BadParentRegion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        let space = req.parent.field_space;
        match remaining
            .iter()
            .find(|f| !self.created.fields.contains(&(space, **f)))
        {
            Some(field) => Err(PrivilegeError::BadParentRegion {
                parent: req.parent,
                field: *field,
            }),
            None => Ok(()),
        }
    }

    pub fn check_index_privilege(
        &self,
        original: &[IndexSpaceRequirement],
        req: &IndexSpaceRequirement,
        forest: &dyn RegionForest,
    ) -> Result<(), PrivilegeError> {
        if req.verified {
            return Ok(());
        }
        let path_error = PrivilegeError::BadIndexPath {
            parent: req.parent,
            handle: req.handle,
        };
        if let Some(ours) = original.iter().find(|ours| ours.handle == req.parent) {
            if !forest.has_index_path(req.parent, req.handle) {
                return Err(path_error);
            }
            if !ours.privilege.covers(req.privilege) {
                return Err(PrivilegeError::BadIndexPrivileges { parent: req.parent });
            }
            return Ok(());
        }
        // Created index spaces carry every privilege.
        if self.created.index_spaces.contains(&req.parent) {
            if !forest.has_index_path(req.parent, req.handle) {
                return Err(path_error);
            }
            return Ok(());
        }
        Err(PrivilegeError::BadParentIndex { parent: req.parent })
    }

    /// Index of the requirement `req` derives its privileges from: original
    /// requirements first, then created ones (offset by `original.len()`).
    ///
    /// Matching a returnable created requirement widens its fields. If no
    /// requirement matches but every requested field was created here, a new
    /// non-returnable requirement on the tree root is synthesized.
    pub fn find_parent_region_req(
        &mut self,
        original: &[RegionRequirement],
        req: &RegionRequirement,
        check_privilege: bool,
        forest: &dyn RegionForest,
    ) -> Option<usize> {
        let privilege_ok =
            |ours: &RegionRequirement| !check_privilege || ours.privilege.covers(req.privilege);
        for (idx, ours) in original.iter().enumerate() {
            if ours.region_handle() != req.parent || !privilege_ok(ours) {
                continue;
            }
            if req.privilege_fields.is_subset(&ours.privilege_fields) {
                return Some(idx);
            }
        }

        let space = req.parent.field_space;
        for idx in 0..self.created_requirements.len() {
            let ours = &self.created_requirements[idx];
            if ours.region_handle() != req.parent || !privilege_ok(ours) {
                continue;
            }
            if self.returnable_privileges[idx] {
                self.created_requirements[idx]
                    .privilege_fields
                    .extend(req.privilege_fields.iter().copied());
                return Some(original.len() + idx);
            }
            let missing: Vec<FieldId> = req
                .privilege_fields
                .difference(&ours.privilege_fields)
                .copied()
                .collect();
            if missing
                .iter()
                .all(|f| self.created.fields.contains(&(space, *f)))
            {
                self.created_requirements[idx]
                    .privilege_fields
                    .extend(missing);
                return Some(original.len() + idx);
            }
        }

        if req.privilege_fields.is_empty()
            || !req
                .privilege_fields
                .iter()
                .all(|f| self.created.fields.contains(&(space, *f)))
        {
            return None;
        }
        let root = forest.tree_root(req.parent.tree_id).unwrap_or(req.parent);
        let synthesized = RegionRequirement::region(
            root,
            PrivilegeMode::READ_WRITE,
            Coherence::Exclusive,
            req.privilege_fields.iter().copied(),
        );
        self.created_requirements.push(synthesized);
        // The fields themselves are already returned with the created set.
        self.returnable_privileges.push(false);
        Some(original.len() + self.created_requirements.len() - 1)
    }

    /// Index of the first requirement (original, then created) on `parent`.
    pub fn find_parent_region(
        &self,
        original: &[RegionRequirement],
        parent: LogicalRegion,
    ) -> Option<usize> {
        original
            .iter()
            .position(|r| r.region_handle() == parent)
            .or_else(|| {
                self.created_requirements
                    .iter()
                    .position(|r| r.region_handle() == parent)
                    .map(|idx| original.len() + idx)
            })
    }

    /// Requirement at a combined index.
    pub fn requirement<'a>(
        &'a self,
        original: &'a [RegionRequirement],
        index: usize,
    ) -> Option<&'a RegionRequirement> {
        original
            .get(index)
            .or_else(|| self.created_requirements.get(index.checked_sub(original.len())?))
    }

    /// Whether the created requirement at combined `index` is returnable.
    pub fn is_returnable(&self, original_len: usize, index: usize) -> bool {
        index
            .checked_sub(original_len)
            .and_then(|i| self.returnable_privileges.get(i))
            .copied()
            .unwrap_or(false)
    }

    pub fn add_restriction(&mut self, req: &RegionRequirement) {
        self.restrictions.push(Restriction {
            region: req.region_handle(),
            fields: req.privilege_fields.clone(),
            acquired: BTreeSet::new(),
        });
    }

    /// Remove the restriction created by an attach. False if none matches.
    pub fn remove_restriction(&mut self, req: &RegionRequirement) -> bool {
        let region = req.region_handle();
        match self
            .restrictions
            .iter()
            .position(|r| r.region == region && req.privilege_fields.is_subset(&r.fields))
        {
            Some(idx) => {
                self.restrictions.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Acquire restricted fields. False if `req` names nothing restricted.
    pub fn add_acquisition(&mut self, req: &RegionRequirement) -> bool {
        let region = req.region_handle();
        match self
            .restrictions
            .iter_mut()
            .find(|r| r.region == region && req.privilege_fields.is_subset(&r.fields))
        {
            Some(restriction) => {
                restriction
                    .acquired
                    .extend(req.privilege_fields.iter().copied());
                true
            }
            None => false,
        }
    }

    /// Release acquired fields. False if they were not acquired.
    pub fn remove_acquisition(&mut self, req: &RegionRequirement) -> bool {
        let region = req.region_handle();
        match self
            .restrictions
            .iter_mut()
            .find(|r| r.region == region && req.privilege_fields.is_subset(&r.acquired))
        {
            Some(restriction) => {
                for field in &req.privilege_fields {
                    restriction.acquired.remove(field);
                }
                true
            }
            None => false,
        }
    }

    pub fn has_restrictions(&self) -> bool {
        !self.restrictions.is_empty()
    }
}

/// Check `req` against one of our requirements, removing every field it
/// grants from `remaining`.
fn check_against(
    req: &RegionRequirement,
    ours: &RegionRequirement,
    remaining: &mut BTreeSet<FieldId>,
    forest: &dyn RegionForest,
) -> Result<(), PrivilegeError> {
    let parent = req.parent;
    if ours.region_handle() != parent {
        return Err(bad_parent(parent, remaining));
    }
    match req.handle {
        RequirementHandle::Region(region) => {
            if !forest.has_index_path(parent.index_space, region.index_space) {
                return Err(PrivilegeError::BadRegionPath { parent });
            }
        }
        RequirementHandle::Partition(partition) => {
            if !forest.has_partition_path(parent.index_space, partition.index_partition) {
                return Err(PrivilegeError::BadPartitionPath { parent });
            }
        }
    }
    let granted: Vec<FieldId> = remaining
        .intersection(&ours.privilege_fields)
        .copied()
        .collect();
    // WRITE_DISCARD on the parent is only a hint and grants anything.
    let privileged =
        ours.privilege.covers(req.privilege) || ours.privilege == PrivilegeMode::WRITE_DISCARD;
    if let (Some(field), false) = (granted.first(), privileged) {
        return Err(if req.handle.is_partition() {
            PrivilegeError::BadPartitionPrivileges {
                parent,
                field: *field,
            }
        } else {
            PrivilegeError::BadRegionPrivileges {
                parent,
                field: *field,
            }
        });
    }
    for field in &granted {
        remaining.remove(field);
    }
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(bad_parent(parent, remaining))
    }
}

fn bad_parent(parent: LogicalRegion, remaining: &BTreeSet<FieldId>) -> PrivilegeError {
    PrivilegeError::BadParentRegion {
        parent,
        field: remaining.iter().next().copied().unwrap_or(FieldId(0)),
    }
}
