use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Role attached to a validated session. Owned by the Auth collaborator;
/// the core only consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Developer,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "developer" => Ok(Role::Developer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A validated session as returned by the Auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: HashSet<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Admin endpoints require the admin role or an explicit `admin` grant.
    pub fn is_admin(&self) -> bool {
        self.role.is_admin() || self.permissions.contains("admin")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The single local-development identity used when auth is bypassed.
    pub fn local_dev_default() -> Self {
        Self {
            session_id: "local-dev".to_string(),
            user_id: "default".to_string(),
            role: Role::Admin,
            permissions: HashSet::new(),
            expires_at: Utc::now() + chrono::Duration::days(365),
        }
    }
}

/// Conversational context an episode is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Chat,
    Development,
    Planning,
    General,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Chat => "chat",
            ContextType::Development => "development",
            ContextType::Planning => "planning",
            ContextType::General => "general",
        }
    }
}

impl FromStr for ContextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ContextType::Chat),
            "development" => Ok(ContextType::Development),
            "planning" => Ok(ContextType::Planning),
            "general" => Ok(ContextType::General),
            other => Err(format!("unknown context type '{other}'")),
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit per-turn context threaded through every call that touches user
/// data. Replaces any ambient "current user" state; nothing here is global.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    pub session: Session,
    /// Wall-clock deadline for the whole turn.
    pub deadline: Instant,
    /// Correlation id stamped on log lines and the error envelope.
    pub correlation_id: String,
    /// Cooperative cancellation: cancelled when the client disconnects.
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(session: Session, budget: Duration) -> Self {
        Self {
            user_id: session.user_id.clone(),
            session,
            deadline: Instant::now() + budget,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Time left before the turn deadline, zero when already past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_type_round_trips() {
        for ct in [
            ContextType::Chat,
            ContextType::Development,
            ContextType::Planning,
            ContextType::General,
        ] {
            assert_eq!(ct.as_str().parse::<ContextType>().unwrap(), ct);
        }
    }

    #[test]
    fn admin_permission_grants_admin() {
        let mut s = Session::local_dev_default();
        s.role = Role::User;
        assert!(!s.is_admin());
        s.permissions.insert("admin".to_string());
        assert!(s.is_admin());
    }

    #[test]
    fn remaining_is_zero_past_deadline() {
        let mut ctx = TurnContext::new(Session::local_dev_default(), Duration::from_secs(1));
        ctx.deadline = Instant::now() - Duration::from_secs(1);
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
