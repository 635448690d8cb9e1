pub mod config;
pub mod domain;
pub mod errors;

pub use chrono;

pub use domain::history::{ChatTurn, HistoryMessage, Role};
pub use domain::memory::{EntityAction, EntityMemory, PendingAction};
pub use domain::session::{AdminId, SessionId, SessionRecord, SessionStatus};
pub use domain::turn::{
    ActionResult, ActionStatus, ExecutionPatch, RetrievedContext, SourceType, ToolCallRequest,
    TurnPatch, TurnState,
};
pub use errors::AgentError;
