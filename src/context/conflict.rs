//! Mapped-region conflict detection.
//!
//! An operation that maps regions while its parent task is running (inline
//! mappings, copies, acquires, releases, fills, dependent partitions) must not
//! touch data the task itself currently has mapped. These checks find which of
//! the context's mapped regions interfere with a competing operation.

use crate::context::ledger::PhysicalRegion;
use crate::forest::RegionForest;
use crate::types::{check_dependence_type, DependenceType, IndexNode, RegionRequirement};

/// An operation whose requirements compete with the task's mapped regions.
#[derive(Debug, Clone, Copy)]
pub enum CompetingOp<'a> {
    Map(&'a RegionRequirement),
    Task(&'a [RegionRequirement]),
    Copy {
        src: &'a [RegionRequirement],
        dst: &'a [RegionRequirement],
    },
    Acquire(&'a RegionRequirement),
    Release(&'a RegionRequirement),
    Fill(&'a RegionRequirement),
    DependentPartition(&'a RegionRequirement),
}

impl<'a> CompetingOp<'a> {
    pub fn requirements(&self) -> Vec<&'a RegionRequirement> {
        match *self {
            CompetingOp::Map(req)
            | CompetingOp::Acquire(req)
            | CompetingOp::Release(req)
            | CompetingOp::Fill(req)
            | CompetingOp::DependentPartition(req) => vec![req],
            CompetingOp::Task(reqs) => reqs.iter().collect(),
            CompetingOp::Copy { src, dst } => src.iter().chain(dst.iter()).collect(),
        }
    }
}

/// Where a conflicting mapped region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSource {
    /// Index into the context's physical regions.
    Parent(usize),
    /// Index into the context's inline mappings.
    Inline(usize),
}

/// True if `req` must wait for the mapped region `ours` to be unmapped.
pub fn check_region_dependence(
    forest: &dyn RegionForest,
    ours: &RegionRequirement,
    req: &RegionRequirement,
) -> bool {
    if ours.tree_id() != req.tree_id() {
        return false;
    }
    let our_node = IndexNode::Space(ours.region_handle().index_space);
    if forest.are_disjoint(our_node, req.handle.index_node()) {
        return false;
    }
    if ours
        .privilege_fields
        .intersection(&req.privilege_fields)
        .next()
        .is_none()
    {
        return false;
    }
    !matches!(
        check_dependence_type(ours, req),
        DependenceType::None | DependenceType::Simultaneous
    )
}

/// First mapped region (parent regions before inline mappings) that
/// conflicts with `req`.
pub fn has_conflicting_regions(
    forest: &dyn RegionForest,
    physical: &[PhysicalRegion],
    inline: &[PhysicalRegion],
    req: &RegionRequirement,
) -> Option<ConflictSource> {
    let conflicts = |regions: &[PhysicalRegion]| {
        regions
            .iter()
            .position(|r| r.mapped && check_region_dependence(forest, &r.requirement, req))
    };
    conflicts(physical)
        .map(ConflictSource::Parent)
        .or_else(|| conflicts(inline).map(ConflictSource::Inline))
}

/// Every mapped region that conflicts with any requirement of `op`.
pub fn find_conflicting_regions(
    forest: &dyn RegionForest,
    physical: &[PhysicalRegion],
    inline: &[PhysicalRegion],
    op: CompetingOp<'_>,
) -> Vec<ConflictSource> {
    let requirements = op.requirements();
    let mut found = Vec::new();
    let mut scan = |regions: &[PhysicalRegion], wrap: fn(usize) -> ConflictSource| {
        for (idx, region) in regions.iter().enumerate() {
            if !region.mapped {
                continue;
            }
            // One conflict is enough to unmap this region.
            if requirements
                .iter()
                .any(|req| check_region_dependence(forest, &region.requirement, req))
            {
                found.push(wrap(idx));
            }
        }
    };
    scan(physical, ConflictSource::Parent);
    scan(inline, ConflictSource::Inline);
    found
}
