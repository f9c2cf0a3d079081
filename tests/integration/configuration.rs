//! Context configuration through the mapper and the layered config files

use crate::integration::test_utils::{top_task, Cluster};
use parking_lot::Mutex;
use std::sync::Arc;
use taskctx::config::{ConfigLoader, FlowControlConfig, RuntimeConfig, ValidationError};
use taskctx::error::{ContextError, ErrorCode, SetupError};
use taskctx::mapper::MapperObserver;
use taskctx::types::TaskInfo;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingObserver {
    outputs: Mutex<Vec<(String, String, FlowControlConfig)>>,
}

impl MapperObserver for RecordingObserver {
    fn on_configure_context(&self, mapper: &str, task: &TaskInfo, output: &FlowControlConfig) {
        self.outputs
            .lock()
            .push((mapper.to_string(), task.name.clone(), *output));
    }
}

#[tokio::test]
async fn test_no_scheduling_discipline_is_rejected() {
    let cluster = Cluster::single(FlowControlConfig {
        min_tasks_to_schedule: 0,
        min_frames_to_schedule: 0,
        ..FlowControlConfig::default()
    });
    let node = cluster.node(0);

    let err = node.create_top_level_context(top_task(), None).unwrap_err();
    match &err {
        ContextError::InvalidConfiguration { mapper, task, .. } => {
            assert_eq!(mapper, "static");
            assert_eq!(task, "top");
        }
        other => panic!("expected InvalidConfiguration, got {:?}", other),
    }
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    assert!(err.is_fatal());
    assert_eq!(node.context_count(), 0);
}

#[tokio::test]
async fn test_frames_win_when_both_minimums_are_set() {
    let cluster = Cluster::single(FlowControlConfig {
        min_tasks_to_schedule: 8,
        min_frames_to_schedule: 2,
        ..FlowControlConfig::default()
    });
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let config = ctx.config().unwrap();
    assert!(config.frames_mode());
    assert_eq!(config.min_tasks_to_schedule, 0);
    assert!(!config.window_enabled());
}

#[tokio::test]
async fn test_excessive_hysteresis_is_rejected() {
    let cluster = Cluster::single(FlowControlConfig {
        hysteresis_percentage: 150,
        ..FlowControlConfig::default()
    });
    let err = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidConfiguration { .. }));
}

#[tokio::test]
async fn test_observer_sees_every_configuration() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let node = cluster.node(0);
    let observer = Arc::new(RecordingObserver::default());
    node.mapper().attach_observer(observer.clone());

    let top = node.create_top_level_context(top_task(), None).unwrap();
    let outputs = observer.outputs.lock().clone();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0, "static");
    assert_eq!(outputs[0].1, "top");
    assert_eq!(Some(outputs[0].2), top.config());

    node.mapper().detach_observer();
    node.create_top_level_context(top_task(), None).unwrap();
    assert_eq!(observer.outputs.lock().len(), 1);
}

#[tokio::test]
async fn test_contexts_are_configured_once() {
    let cluster = Cluster::single(FlowControlConfig::default());
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let err = ctx.configure_context().unwrap_err();
    assert!(matches!(err, ContextError::AlreadyConfigured(uid) if uid == ctx.uid()));
}

#[tokio::test]
async fn test_file_config_reaches_contexts() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("taskctx.toml");
    std::fs::write(
        &path,
        "[context]\nmax_window_size = 6\nhysteresis_percentage = 50\nmin_tasks_to_schedule = 4\n",
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    assert!(config.validate().is_ok());
    let cluster = Cluster::single(config.context);
    let ctx = cluster
        .node(0)
        .create_top_level_context(top_task(), None)
        .unwrap();
    let resolved = ctx.config().unwrap();
    assert_eq!(resolved.max_window_size, 6);
    assert_eq!(resolved.low_water_mark(), 3);
    assert_eq!(resolved.min_tasks_to_schedule, 4);
}

#[test]
fn test_malformed_file_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[context\nmax_window_size = ").unwrap();
    let err = ConfigLoader::load_from_file(&path).unwrap_err();
    assert!(matches!(err, SetupError::Config(_)));
}

#[test]
fn test_validation_collects_every_problem() {
    let mut config = RuntimeConfig::default();
    config.node.address_spaces = 0;
    config.logging.level = "loud".to_string();
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Node(_))));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ValidationError::Logging(_))));

    let toml = RuntimeConfig::default().to_toml().unwrap();
    assert!(toml.contains("max_window_size"));
}
