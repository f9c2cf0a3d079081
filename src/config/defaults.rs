//! Built-in defaults applied beneath every other configuration source.
//!
//! The values come from `RuntimeConfig::default()`, so the serde field
//! defaults stay the only place a default is written down.

use super::RuntimeConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder seeded with the runtime defaults.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = Config::try_from(&RuntimeConfig::default())?;
    Ok(Config::builder().add_source(defaults))
}
