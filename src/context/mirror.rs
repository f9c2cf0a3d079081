//! Context mirroring payload.
//!
//! Everything a remote address space needs to build a mirror of a context:
//! task metadata, which parent requirement each region came from, which
//! regions are virtually mapped, version state per region and the local
//! fields of every enclosing context. Virtually mapped regions ship full
//! version information so the mirror can re-derive state; physically mapped
//! regions only ship version numbers.

use crate::config::FlowControlConfig;
use crate::error::ContextError;
use crate::types::{ContextUid, FieldId, LocalFieldInfo, TaskInfo, VersionInfo, VersionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackedVersionInfo {
    Full(VersionInfo),
    Numbers(BTreeMap<FieldId, VersionNumber>),
}

impl PackedVersionInfo {
    pub fn pack(info: &VersionInfo, virtual_mapped: bool) -> Self {
        if virtual_mapped {
            PackedVersionInfo::Full(info.clone())
        } else {
            PackedVersionInfo::Numbers(info.numbers.clone())
        }
    }

    pub fn unpack(self) -> VersionInfo {
        match self {
            PackedVersionInfo::Full(info) => info,
            PackedVersionInfo::Numbers(numbers) => VersionInfo {
                numbers,
                states: BTreeMap::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteContextPayload {
    pub uid: ContextUid,
    pub top_level: bool,
    pub task: TaskInfo,
    pub parent_req_indexes: Vec<usize>,
    /// Indices of virtually mapped regions.
    pub virtual_mapped: Vec<usize>,
    pub versions: Vec<PackedVersionInfo>,
    /// Local fields of this context and all enclosing contexts.
    pub local_fields: Vec<LocalFieldInfo>,
    pub parent: Option<ContextUid>,
    pub config: Option<FlowControlConfig>,
    /// Physical context for each region, resolved at the home.
    pub physical_contexts: Vec<ContextUid>,
}

impl RemoteContextPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ContextError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContextError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Per-region virtual-mapping flags.
    pub fn virtual_flags(&self) -> Vec<bool> {
        let mut flags = vec![false; self.task.regions.len()];
        for &idx in &self.virtual_mapped {
            if let Some(flag) = flags.get_mut(idx) {
                *flag = true;
            }
        }
        flags
    }
}

/// Indices of set flags.
pub fn virtual_indices(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter_map(|(idx, &is_virtual)| is_virtual.then_some(idx))
        .collect()
}
