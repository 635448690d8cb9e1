//! Conversation runtime for the Leadline CRM assistant.
//!
//! This crate is the orchestration layer between the HTTP shell and the
//! record store: it classifies each utterance, loads session memory,
//! fetches matching CRM records, optionally drives the completion service's
//! function calling through a confirmation protocol for destructive
//! actions, and renders the final reply.
//!
//! # Architecture
//!
//! One turn runs through a fixed node graph:
//! 1. **Classification** (`conversation`) - keyword routing to a source
//!    type, plus the history-skip heuristic
//! 2. **Reference resolution** (`reference`) - "the first one" resolved
//!    against the previous rendered list
//! 3. **Retrieval / formatting** (`formatters`) - deterministic routes that
//!    bypass the model entirely
//! 4. **Tool execution** (`tools`, `actions`) - validated, confirmation-
//!    gated record-store mutations
//! 5. **Orchestration** (`runtime`) - the graph itself
//!
//! # Safety principle
//!
//! The completion service is strictly a translator and phrasing engine. It
//! never decides what executed: success comes only from the record store's
//! returned rows, and destructive calls require an explicit human
//! confirmation turn.

pub mod actions;
pub mod conversation;
pub mod email;
pub mod formatters;
pub mod llm;
pub mod reference;
pub mod runtime;
pub mod tools;

pub use email::{EmailTransport, RecordingEmailTransport, SmtpEmailTransport};
pub use llm::{CompletionClient, HttpCompletionClient, ScriptedCompletionClient};
pub use runtime::{ConversationRuntime, RuntimeOptions};
pub use tools::ToolRegistry;
