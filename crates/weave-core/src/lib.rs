pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod failure;
pub mod hooks;
pub mod traits;
pub mod types;

pub use config::WeaveConfig;
pub use context::RunContext;
pub use error::{MultiError, Result, WeaveError};
pub use event::EventBus;
pub use failure::{ErrorCode, ErrorEventData, RecoveryAction, Severity};
pub use hooks::{CallbackArgs, CallbackRegistry, HookPoint};
pub use traits::{handler_fn, AgentHandler};
pub use types::*;
