//! Configuration System
//!
//! Layered runtime configuration: built-in defaults, the user file, the
//! workspace file and `TASKCTX_` environment overrides. The `context` section
//! holds the flow-control defaults a mapper starts from when it configures a
//! context.

use crate::error::SetupError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;
mod sources;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Flow-control defaults handed to mappers
    #[serde(default)]
    pub context: FlowControlConfig,

    /// Node-level settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-context admission and scheduling thresholds.
///
/// Exactly one scheduling discipline is active once resolved: task-count
/// based (`min_tasks_to_schedule > 0`) or frame based
/// (`min_frames_to_schedule > 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// Maximum outstanding children before registration blocks (0 disables)
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,

    /// Percentage of the window the count must drain to before release
    #[serde(default = "default_hysteresis_percentage")]
    pub hysteresis_percentage: usize,

    #[serde(default = "default_max_outstanding_frames")]
    pub max_outstanding_frames: usize,

    #[serde(default = "default_min_tasks_to_schedule")]
    pub min_tasks_to_schedule: usize,

    #[serde(default)]
    pub min_frames_to_schedule: usize,
}

fn default_max_window_size() -> usize {
    1024
}

fn default_hysteresis_percentage() -> usize {
    25
}

fn default_max_outstanding_frames() -> usize {
    2
}

fn default_min_tasks_to_schedule() -> usize {
    32
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_window_size: default_max_window_size(),
            hysteresis_percentage: default_hysteresis_percentage(),
            max_outstanding_frames: default_max_outstanding_frames(),
            min_tasks_to_schedule: default_min_tasks_to_schedule(),
            min_frames_to_schedule: 0,
        }
    }
}

impl FlowControlConfig {
    /// Frame discipline selected.
    pub fn frames_mode(&self) -> bool {
        self.min_frames_to_schedule > 0
    }

    /// Window admission applies only outside frame mode.
    pub fn window_enabled(&self) -> bool {
        !self.frames_mode() && self.max_window_size > 0
    }

    /// Release threshold for blocked registrants (floor).
    pub fn low_water_mark(&self) -> usize {
        self.hysteresis_percentage * self.max_window_size / 100
    }

    /// Normalize a mapper's output into exactly one discipline.
    pub fn resolve(&mut self) -> Result<(), String> {
        if self.min_tasks_to_schedule == 0 && self.min_frames_to_schedule == 0 {
            return Err(
                "one of min_tasks_to_schedule or min_frames_to_schedule must be non-zero"
                    .to_string(),
            );
        }
        if self.hysteresis_percentage > 100 {
            return Err(format!(
                "hysteresis_percentage {} exceeds 100",
                self.hysteresis_percentage
            ));
        }
        if self.frames_mode() {
            if self.max_outstanding_frames == 0 {
                return Err("frame scheduling requires max_outstanding_frames > 0".to_string());
            }
            self.min_tasks_to_schedule = 0;
        }
        Ok(())
    }
}

/// Node-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of address spaces in the cluster
    #[serde(default = "default_address_spaces")]
    pub address_spaces: u32,
}

fn default_address_spaces() -> u32 {
    1
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address_spaces: default_address_spaces(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Context(String),
    Node(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Context(msg) => write!(f, "Context: {}", msg),
            ValidationError::Node(msg) => write!(f, "Node: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl RuntimeConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let mut context = self.context;
        if let Err(e) = context.resolve() {
            errors.push(ValidationError::Context(e));
        }

        if self.node.address_spaces == 0 {
            errors.push(ValidationError::Node(
                "address_spaces must be at least 1".to_string(),
            ));
        }

        const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError::Logging(format!(
                "unknown level '{}'",
                self.logging.level
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String, SetupError> {
        toml::to_string_pretty(self).map_err(|e| SetupError::Config(e.to_string()))
    }
}

/// Loads `RuntimeConfig` from layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, user file, workspace
    /// `config/config.toml`, workspace `config/{TASKCTX_ENV}.toml`,
    /// `TASKCTX_*` environment variables (`__` separates sections).
    pub fn load(workspace_root: &Path) -> Result<RuntimeConfig, SetupError> {
        let builder = defaults::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(
            config::Environment::with_prefix("TASKCTX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let config = builder.build()?.try_deserialize::<RuntimeConfig>()?;
        Ok(config)
    }

    /// Load configuration from one explicit TOML file.
    pub fn load_from_file(path: &Path) -> Result<RuntimeConfig, SetupError> {
        let config = defaults::builder_with_defaults()?
            .add_source(config::File::from(path).required(true))
            .build()?
            .try_deserialize::<RuntimeConfig>()?;
        Ok(config)
    }

    /// Load and validate, folding validation errors into one message.
    pub fn load_validated(workspace_root: &Path) -> Result<RuntimeConfig, SetupError> {
        let config = Self::load(workspace_root)?;
        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            SetupError::Validation(msgs.join("\n"))
        })?;
        Ok(config)
    }
}
