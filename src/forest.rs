//! Region Forest Interface
//!
//! The dependence/versioning engine is an external collaborator. Contexts
//! reach it only through `RegionForest`: structural queries (paths,
//! disjointness, tree roots, owners) and mutations (context initialization and
//! invalidation, resource finalization, local field allocation).
//!
//! `InMemoryForest` is a small structural model of index trees that records
//! every mutation it receives. The binary and the test suites drive contexts
//! with it.

use crate::types::{
    AddressSpaceId, ContextUid, FieldId, FieldSpace, IndexNode, IndexPartition, IndexSpace,
    LocalFieldInfo, LogicalRegion, RegionRequirement, RegionTreeId, RegionTreeNode, VersionInfo,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub trait RegionForest: Send + Sync {
    /// True if `child` is reachable from `parent` through the index tree.
    fn has_index_path(&self, parent: IndexSpace, child: IndexSpace) -> bool;

    /// True if `child` is a partition reachable from `parent`.
    fn has_partition_path(&self, parent: IndexSpace, child: IndexPartition) -> bool;

    /// True if the two index-tree nodes can never alias.
    fn are_disjoint(&self, a: IndexNode, b: IndexNode) -> bool;

    fn tree_root(&self, tree: RegionTreeId) -> Option<LogicalRegion>;

    /// Address space that structurally owns a region-tree node.
    fn owner_space(&self, node: &RegionTreeNode) -> AddressSpaceId;

    fn initialize_physical_context(
        &self,
        ctx: ContextUid,
        req: &RegionRequirement,
        restricted: bool,
    );

    fn initialize_virtual_context(
        &self,
        ctx: ContextUid,
        req: &RegionRequirement,
        info: &VersionInfo,
    );

    fn invalidate_context(&self, ctx: ContextUid, region: LogicalRegion, users_only: bool);

    fn invalidate_versions(&self, ctx: ContextUid, region: LogicalRegion);

    fn invalidate_version_state(&self, ctx: ContextUid, node: &RegionTreeNode);

    /// Snapshot the version state of `req` as seen from `ctx`.
    fn capture_version_info(&self, ctx: ContextUid, req: &RegionRequirement) -> VersionInfo;

    fn finalize_region_destroy(&self, region: LogicalRegion);

    fn finalize_field_destroy(&self, space: FieldSpace, field: FieldId);

    fn finalize_field_space_destroy(&self, space: FieldSpace);

    fn finalize_index_space_destroy(&self, space: IndexSpace);

    fn finalize_index_partition_destroy(&self, partition: IndexPartition);

    fn allocate_local_field(&self, info: &LocalFieldInfo);
}

/// Mutations received by an `InMemoryForest`, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForestEvent {
    InitializePhysical { ctx: ContextUid, region: LogicalRegion, restricted: bool },
    InitializeVirtual { ctx: ContextUid, region: LogicalRegion },
    InvalidateContext { ctx: ContextUid, region: LogicalRegion, users_only: bool },
    InvalidateVersions { ctx: ContextUid, region: LogicalRegion },
    InvalidateVersionState { ctx: ContextUid, node: RegionTreeNode },
    RegionDestroyed(LogicalRegion),
    FieldDestroyed(FieldSpace, FieldId),
    FieldSpaceDestroyed(FieldSpace),
    IndexSpaceDestroyed(IndexSpace),
    IndexPartitionDestroyed(IndexPartition),
    LocalFieldAllocated(LocalFieldInfo),
}

#[derive(Default)]
struct ForestState {
    space_parent: HashMap<IndexSpace, IndexPartition>,
    partition_parent: HashMap<IndexPartition, IndexSpace>,
    disjoint: HashMap<IndexPartition, bool>,
    roots: HashMap<RegionTreeId, LogicalRegion>,
    owners: HashMap<RegionTreeId, AddressSpaceId>,
    versions: BTreeMap<(LogicalRegion, FieldId), u64>,
    events: Vec<ForestEvent>,
}

/// In-memory index-tree model.
#[derive(Default)]
pub struct InMemoryForest {
    state: RwLock<ForestState>,
}

impl InMemoryForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region tree rooted at `root`, owned by `owner`.
    pub fn add_tree(&self, root: LogicalRegion, owner: AddressSpaceId) {
        let mut state = self.state.write();
        state.roots.insert(root.tree_id, root);
        state.owners.insert(root.tree_id, owner);
    }

    /// Partition `parent` into `subspaces`.
    pub fn add_partition(
        &self,
        parent: IndexSpace,
        partition: IndexPartition,
        disjoint: bool,
        subspaces: &[IndexSpace],
    ) {
        let mut state = self.state.write();
        state.partition_parent.insert(partition, parent);
        state.disjoint.insert(partition, disjoint);
        for space in subspaces {
            state.space_parent.insert(*space, partition);
        }
    }

    pub fn set_version(&self, region: LogicalRegion, field: FieldId, version: u64) {
        self.state.write().versions.insert((region, field), version);
    }

    pub fn events(&self) -> Vec<ForestEvent> {
        self.state.read().events.clone()
    }

    pub fn count_events(&self, predicate: impl Fn(&ForestEvent) -> bool) -> usize {
        self.state.read().events.iter().filter(|e| predicate(e)).count()
    }

    fn record(&self, event: ForestEvent) {
        self.state.write().events.push(event);
    }

    /// Chain from `node` up to its index-tree root, starting with `node`.
    fn ancestry(state: &ForestState, node: IndexNode) -> Vec<IndexNode> {
        let mut chain = vec![node];
        let mut current = node;
        loop {
            let next = match current {
                IndexNode::Space(s) => state.space_parent.get(&s).map(|p| IndexNode::Partition(*p)),
                IndexNode::Partition(p) => {
                    state.partition_parent.get(&p).map(|s| IndexNode::Space(*s))
                }
            };
            match next {
                Some(parent) => {
                    chain.push(parent);
                    current = parent;
                }
                None => return chain,
            }
        }
    }
}

impl RegionForest for InMemoryForest {
    fn has_index_path(&self, parent: IndexSpace, child: IndexSpace) -> bool {
        let state = self.state.read();
        Self::ancestry(&state, IndexNode::Space(child)).contains(&IndexNode::Space(parent))
    }

    fn has_partition_path(&self, parent: IndexSpace, child: IndexPartition) -> bool {
        let state = self.state.read();
        Self::ancestry(&state, IndexNode::Partition(child)).contains(&IndexNode::Space(parent))
    }

    fn are_disjoint(&self, a: IndexNode, b: IndexNode) -> bool {
        let state = self.state.read();
        let chain_a = Self::ancestry(&state, a);
        let chain_b = Self::ancestry(&state, b);
        if chain_a.contains(&b) || chain_b.contains(&a) {
            return false;
        }
        // Lowest common ancestor; distinct children below a disjoint
        // partition never alias.
        for (depth, node) in chain_a.iter().enumerate() {
            if let Some(depth_b) = chain_b.iter().position(|n| n == node) {
                return match node {
                    IndexNode::Partition(p) => {
                        depth > 0 && depth_b > 0 && state.disjoint.get(p).copied().unwrap_or(false)
                    }
                    IndexNode::Space(_) => false,
                };
            }
        }
        // Different index trees.
        true
    }

    fn tree_root(&self, tree: RegionTreeId) -> Option<LogicalRegion> {
        self.state.read().roots.get(&tree).copied()
    }

    fn owner_space(&self, node: &RegionTreeNode) -> AddressSpaceId {
        self.state
            .read()
            .owners
            .get(&node.tree_id())
            .copied()
            .unwrap_or(0)
    }

    fn initialize_physical_context(
        &self,
        ctx: ContextUid,
        req: &RegionRequirement,
        restricted: bool,
    ) {
        self.record(ForestEvent::InitializePhysical {
            ctx,
            region: req.region_handle(),
            restricted,
        });
    }

    fn initialize_virtual_context(
        &self,
        ctx: ContextUid,
        req: &RegionRequirement,
        _info: &VersionInfo,
    ) {
        self.record(ForestEvent::InitializeVirtual {
            ctx,
            region: req.region_handle(),
        });
    }

    fn invalidate_context(&self, ctx: ContextUid, region: LogicalRegion, users_only: bool) {
        self.record(ForestEvent::InvalidateContext {
            ctx,
            region,
            users_only,
        });
    }

    fn invalidate_versions(&self, ctx: ContextUid, region: LogicalRegion) {
        self.record(ForestEvent::InvalidateVersions { ctx, region });
    }

    fn invalidate_version_state(&self, ctx: ContextUid, node: &RegionTreeNode) {
        self.record(ForestEvent::InvalidateVersionState { ctx, node: *node });
    }

    fn capture_version_info(&self, _ctx: ContextUid, req: &RegionRequirement) -> VersionInfo {
        let state = self.state.read();
        let region = req.region_handle();
        let mut info = VersionInfo::default();
        for field in &req.privilege_fields {
            let number = state.versions.get(&(region, *field)).copied().unwrap_or(0);
            info.numbers.insert(*field, number);
        }
        info
    }

    fn finalize_region_destroy(&self, region: LogicalRegion) {
        self.record(ForestEvent::RegionDestroyed(region));
    }

    fn finalize_field_destroy(&self, space: FieldSpace, field: FieldId) {
        self.record(ForestEvent::FieldDestroyed(space, field));
    }

    fn finalize_field_space_destroy(&self, space: FieldSpace) {
        self.record(ForestEvent::FieldSpaceDestroyed(space));
    }

    fn finalize_index_space_destroy(&self, space: IndexSpace) {
        self.record(ForestEvent::IndexSpaceDestroyed(space));
    }

    fn finalize_index_partition_destroy(&self, partition: IndexPartition) {
        self.record(ForestEvent::IndexPartitionDestroyed(partition));
    }

    fn allocate_local_field(&self, info: &LocalFieldInfo) {
        self.record(ForestEvent::LocalFieldAllocated(*info));
    }
}
