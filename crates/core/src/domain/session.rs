use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Client-generated placeholder ids (`temp-...`) are never looked up;
    /// the server always mints a fresh session for them.
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("temp-")
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminId(pub String);

impl AdminId {
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }
}

impl std::fmt::Display for AdminId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub admin_id: AdminId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn anonymous() -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::generate(),
            admin_id: AdminId::anonymous(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionId, SessionRecord, SessionStatus};

    #[test]
    fn placeholder_sessions_are_detected() {
        assert!(SessionId("temp-12345".to_string()).is_placeholder());
        assert!(!SessionId("b0f6e6d2".to_string()).is_placeholder());
    }

    #[test]
    fn anonymous_session_starts_active() {
        let session = SessionRecord::anonymous();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.admin_id.0, "anonymous");
        assert!(!session.session_id.0.is_empty());
    }

    #[test]
    fn status_round_trips_through_str() {
        assert_eq!(SessionStatus::parse("active"), Some(SessionStatus::Active));
        assert_eq!(SessionStatus::parse(SessionStatus::Closed.as_str()), Some(SessionStatus::Closed));
        assert_eq!(SessionStatus::parse("archived"), None);
    }
}
