pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AgentConfig, AppConfig};
pub use context::{agent_logic, AgentContext, AgentLogic};
pub use error::{Result, WeaveError};
pub use event::{EventBus, WeaveEvent};
pub use types::*;
