//! taskctx: Task Execution Contexts
//!
//! The per-task control block of a distributed task-parallel runtime. Each
//! running task gets a context that tracks which regions it may touch and
//! what it created or deleted, throttles how many child operations it may
//! have in flight, follows every child through execute/complete/commit, and
//! keeps the per-context ownership and view caches consistent across address
//! spaces.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod forest;
pub mod logging;
pub mod mapper;
pub mod runtime;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod views;

pub use config::{FlowControlConfig, RuntimeConfig};
pub use context::{Context, ContextVariant, TaskOwner};
pub use error::{ContextError, ErrorClass, ErrorCode};
pub use runtime::Runtime;
