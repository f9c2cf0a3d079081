//! Core Types
//!
//! Identifiers, region handles, privileges and requirements shared by every
//! context component. All of them are plain data and serialize with serde so
//! they can cross address spaces inside wire messages.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of one node (address space) in the cluster.
pub type AddressSpaceId = u32;

/// Cluster-unique context identifier: the home address space plus a serial
/// assigned by that space's runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextUid {
    pub home: AddressSpaceId,
    pub serial: u64,
}

impl ContextUid {
    pub fn new(home: AddressSpaceId, serial: u64) -> Self {
        Self { home, serial }
    }
}

impl fmt::Display for ContextUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}.{}", self.home, self.serial)
    }
}

/// Identifier of an externally owned child operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionTreeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexSpace(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexPartition(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldSpace(pub u64);

/// Trace identifier used by `begin_trace` / `end_trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub u32);

/// Physical instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

/// Identifier of an arena-owned distributed object (views).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributedId(pub u64);

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalRegion {
    pub index_space: IndexSpace,
    pub field_space: FieldSpace,
    pub tree_id: RegionTreeId,
}

impl LogicalRegion {
    pub fn new(index_space: IndexSpace, field_space: FieldSpace, tree_id: RegionTreeId) -> Self {
        Self {
            index_space,
            field_space,
            tree_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalPartition {
    pub index_partition: IndexPartition,
    pub field_space: FieldSpace,
    pub tree_id: RegionTreeId,
}

/// Index-space-tree node: what disjointness and path queries operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexNode {
    Space(IndexSpace),
    Partition(IndexPartition),
}

/// A node in a region tree. Keys of the version-owner cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegionTreeNode {
    Region(LogicalRegion),
    Partition(LogicalPartition),
}

impl RegionTreeNode {
    pub fn tree_id(&self) -> RegionTreeId {
        match self {
            RegionTreeNode::Region(r) => r.tree_id,
            RegionTreeNode::Partition(p) => p.tree_id,
        }
    }

    pub fn index_node(&self) -> IndexNode {
        match self {
            RegionTreeNode::Region(r) => IndexNode::Space(r.index_space),
            RegionTreeNode::Partition(p) => IndexNode::Partition(p.index_partition),
        }
    }
}

impl From<LogicalRegion> for RegionTreeNode {
    fn from(region: LogicalRegion) -> Self {
        RegionTreeNode::Region(region)
    }
}

impl From<LogicalPartition> for RegionTreeNode {
    fn from(partition: LogicalPartition) -> Self {
        RegionTreeNode::Partition(partition)
    }
}

/// Access privilege bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrivilegeMode(u8);

impl PrivilegeMode {
    pub const NO_ACCESS: PrivilegeMode = PrivilegeMode(0);
    pub const READ_ONLY: PrivilegeMode = PrivilegeMode(0x1);
    pub const WRITE_ONLY: PrivilegeMode = PrivilegeMode(0x2);
    pub const REDUCE: PrivilegeMode = PrivilegeMode(0x4);
    pub const READ_WRITE: PrivilegeMode = PrivilegeMode(0x7);
    pub const WRITE_DISCARD: PrivilegeMode = PrivilegeMode(0xF);

    const DISCARD: u8 = 0x8;

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every access right of `other` is also held by `self`.
    pub fn covers(self, other: PrivilegeMode) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn is_read_only(self) -> bool {
        self == Self::READ_ONLY
    }

    pub fn is_reduce(self) -> bool {
        self == Self::REDUCE
    }

    pub fn is_discard(self) -> bool {
        self.0 & Self::DISCARD != 0
    }
}

impl fmt::Debug for PrivilegeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NO_ACCESS => "NO_ACCESS",
            Self::READ_ONLY => "READ_ONLY",
            Self::WRITE_ONLY => "WRITE_ONLY",
            Self::REDUCE => "REDUCE",
            Self::READ_WRITE => "READ_WRITE",
            Self::WRITE_DISCARD => "WRITE_DISCARD",
            _ => return write!(f, "PrivilegeMode({:#x})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coherence {
    Exclusive,
    Atomic,
    Simultaneous,
    Relaxed,
}

/// What a requirement names: a single region or a partition of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequirementHandle {
    Region(LogicalRegion),
    Partition(LogicalPartition),
}

impl RequirementHandle {
    pub fn tree_id(&self) -> RegionTreeId {
        match self {
            RequirementHandle::Region(r) => r.tree_id,
            RequirementHandle::Partition(p) => p.tree_id,
        }
    }

    pub fn index_node(&self) -> IndexNode {
        match self {
            RequirementHandle::Region(r) => IndexNode::Space(r.index_space),
            RequirementHandle::Partition(p) => IndexNode::Partition(p.index_partition),
        }
    }

    pub fn is_partition(&self) -> bool {
        matches!(self, RequirementHandle::Partition(_))
    }
}

/// A (region-or-partition, privilege, coherence, fields) binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRequirement {
    pub handle: RequirementHandle,
    pub parent: LogicalRegion,
    pub privilege: PrivilegeMode,
    pub coherence: Coherence,
    pub redop: u32,
    pub privilege_fields: BTreeSet<FieldId>,
    /// Set once the runtime has verified privileges for this requirement.
    pub verified: bool,
}

impl RegionRequirement {
    /// Requirement on `region` itself (its own parent).
    pub fn region(
        region: LogicalRegion,
        privilege: PrivilegeMode,
        coherence: Coherence,
        fields: impl IntoIterator<Item = FieldId>,
    ) -> Self {
        Self::child_of(region, region, privilege, coherence, fields)
    }

    /// Requirement on `region` using privileges derived from `parent`.
    pub fn child_of(
        region: LogicalRegion,
        parent: LogicalRegion,
        privilege: PrivilegeMode,
        coherence: Coherence,
        fields: impl IntoIterator<Item = FieldId>,
    ) -> Self {
        Self {
            handle: RequirementHandle::Region(region),
            parent,
            privilege,
            coherence,
            redop: 0,
            privilege_fields: fields.into_iter().collect(),
            verified: false,
        }
    }

    /// Requirement on a partition using privileges derived from `parent`.
    pub fn partition(
        partition: LogicalPartition,
        parent: LogicalRegion,
        privilege: PrivilegeMode,
        coherence: Coherence,
        fields: impl IntoIterator<Item = FieldId>,
    ) -> Self {
        Self {
            handle: RequirementHandle::Partition(partition),
            parent,
            privilege,
            coherence,
            redop: 0,
            privilege_fields: fields.into_iter().collect(),
            verified: false,
        }
    }

    pub fn with_redop(mut self, redop: u32) -> Self {
        self.redop = redop;
        self
    }

    /// The logical region named by this requirement; partitions resolve to
    /// their parent region.
    pub fn region_handle(&self) -> LogicalRegion {
        match self.handle {
            RequirementHandle::Region(r) => r,
            RequirementHandle::Partition(_) => self.parent,
        }
    }

    pub fn tree_id(&self) -> RegionTreeId {
        self.handle.tree_id()
    }
}

/// Requirement on an index space (allocation privileges).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpaceRequirement {
    pub handle: IndexSpace,
    pub parent: IndexSpace,
    pub privilege: PrivilegeMode,
    pub verified: bool,
}

impl IndexSpaceRequirement {
    pub fn new(handle: IndexSpace, parent: IndexSpace, privilege: PrivilegeMode) -> Self {
        Self {
            handle,
            parent,
            privilege,
            verified: false,
        }
    }
}

/// Task metadata carried by every context and shipped with mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub unique_id: u64,
    pub depth: u32,
    pub regions: Vec<RegionRequirement>,
    pub indexes: Vec<IndexSpaceRequirement>,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, unique_id: u64, depth: u32) -> Self {
        Self {
            name: name.into(),
            unique_id,
            depth,
            regions: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_region(mut self, req: RegionRequirement) -> Self {
        self.regions.push(req);
        self
    }

    pub fn with_index(mut self, req: IndexSpaceRequirement) -> Self {
        self.indexes.push(req);
        self
    }
}

pub type VersionNumber = u64;

/// Version state of one region as seen by a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub numbers: BTreeMap<FieldId, VersionNumber>,
    /// Version-state objects backing each field; only shipped for virtually
    /// mapped regions.
    pub states: BTreeMap<FieldId, DistributedId>,
}

/// A field allocated locally by a context (not returned to its parent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalFieldInfo {
    pub field_space: FieldSpace,
    pub field: FieldId,
    pub size: usize,
    pub serdez: u32,
}

/// Dependence between two accesses to overlapping data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependenceType {
    None,
    True,
    Anti,
    Atomic,
    Simultaneous,
}

/// Classify the dependence of `next` on `prev`.
pub fn check_dependence_type(prev: &RegionRequirement, next: &RegionRequirement) -> DependenceType {
    if prev.privilege.is_read_only() && next.privilege.is_read_only() {
        return DependenceType::None;
    }
    if prev.privilege.is_reduce() && next.privilege.is_reduce() {
        return if prev.redop == next.redop {
            DependenceType::None
        } else {
            DependenceType::True
        };
    }
    let either = |c: Coherence| prev.coherence == c || next.coherence == c;
    if either(Coherence::Exclusive) {
        return if prev.privilege.is_read_only() {
            DependenceType::Anti
        } else {
            DependenceType::True
        };
    }
    if either(Coherence::Atomic) {
        if prev.coherence == Coherence::Atomic && next.coherence == Coherence::Atomic {
            return DependenceType::Atomic;
        }
        return if prev.privilege.is_read_only() {
            DependenceType::Anti
        } else {
            DependenceType::True
        };
    }
    DependenceType::Simultaneous
}
