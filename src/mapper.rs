//! Mapper Interface
//!
//! The placement policy is external. Contexts consult it once, through
//! `MapperManager::invoke_configure_context`, to obtain their flow-control
//! configuration. An optional observer sees every configuration output; it is
//! never consulted by the protocol.

use crate::config::FlowControlConfig;
use crate::types::TaskInfo;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub trait Mapper: Send + Sync {
    fn name(&self) -> &str;

    /// Fill in `config` for the context of `task`. `config` starts out holding
    /// the runtime defaults.
    fn configure_context(&self, task: &TaskInfo, config: &mut FlowControlConfig);
}

/// Passive observer of mapper calls.
pub trait MapperObserver: Send + Sync {
    fn on_configure_context(&self, mapper: &str, task: &TaskInfo, output: &FlowControlConfig);
}

/// Mapper that leaves the runtime defaults untouched.
#[derive(Debug, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn name(&self) -> &str {
        "default"
    }

    fn configure_context(&self, _task: &TaskInfo, _config: &mut FlowControlConfig) {}
}

/// Mapper that always hands out one fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticMapper {
    name: String,
    config: FlowControlConfig,
}

impl StaticMapper {
    pub fn new(name: impl Into<String>, config: FlowControlConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

impl Mapper for StaticMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_context(&self, _task: &TaskInfo, config: &mut FlowControlConfig) {
        *config = self.config;
    }
}

pub struct MapperManager {
    mapper: Arc<dyn Mapper>,
    defaults: FlowControlConfig,
    observer: RwLock<Option<Arc<dyn MapperObserver>>>,
}

impl MapperManager {
    pub fn new(mapper: Arc<dyn Mapper>, defaults: FlowControlConfig) -> Self {
        Self {
            mapper,
            defaults,
            observer: RwLock::new(None),
        }
    }

    pub fn mapper_name(&self) -> &str {
        self.mapper.name()
    }

    pub fn attach_observer(&self, observer: Arc<dyn MapperObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn detach_observer(&self) {
        *self.observer.write() = None;
    }

    /// Raw mapper output for `task`; validation happens in the context.
    pub fn invoke_configure_context(&self, task: &TaskInfo) -> FlowControlConfig {
        let mut config = self.defaults;
        self.mapper.configure_context(task, &mut config);
        debug!(
            mapper = self.mapper.name(),
            task = %task.name,
            max_window_size = config.max_window_size,
            min_tasks = config.min_tasks_to_schedule,
            min_frames = config.min_frames_to_schedule,
            "Mapper configured context"
        );
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_configure_context(self.mapper.name(), task, &config);
        }
        config
    }
}
