use thiserror::Error;

/// Failure taxonomy for one orchestrated turn.
///
/// Every graph node catches its own failures and converts them to a
/// user-facing response string through [`AgentError::user_message`];
/// internal detail is logged at the failure site and never crosses a node
/// boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    /// Missing or malformed tool arguments. The message names the exact
    /// field so it can be surfaced verbatim; never silently defaulted.
    #[error("validation failed: {0}")]
    Validation(String),
    /// An entity lookup by id or name returned nothing.
    #[error("not found: {0}")]
    NotFound(String),
    /// The record store or completion service failed. The detail string is
    /// for logs only.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// The per-turn deadline elapsed.
    #[error("turn deadline exceeded after {0}s")]
    Timeout(u64),
}

impl AgentError {
    /// What the end user sees. Upstream detail is deliberately withheld.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(detail) => format!("I need a bit more information: {detail}"),
            Self::NotFound(what) => {
                format!("I couldn't find {what}. Please check the name or ID and try again.")
            }
            Self::Upstream(_) => {
                "I'm sorry, something went wrong while processing your request. Please try again."
                    .to_string()
            }
            Self::Timeout(_) => {
                "I apologize, but your request is taking longer than expected. Please try again \
                 with a simpler query."
                    .to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AgentError;

    #[test]
    fn validation_message_names_the_missing_field() {
        let message = AgentError::Validation("missing required parameter: lead_id".to_string())
            .user_message();
        assert!(message.contains("lead_id"));
    }

    #[test]
    fn upstream_detail_never_reaches_the_user() {
        let message =
            AgentError::Upstream("connection refused to 10.0.0.5:5432".to_string()).user_message();
        assert!(!message.contains("10.0.0.5"));
        assert!(message.contains("try again"));
    }

    #[test]
    fn timeout_suggests_retry() {
        let message = AgentError::Timeout(30).user_message();
        assert!(message.contains("try again"));
    }
}
