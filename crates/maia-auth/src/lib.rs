//! Session/authorization shim: a thin adapter over the Auth collaborator.
//!
//! `validate()` turns an `X-Session-ID` token into a `(user_id, role,
//! permissions)` session. Validated sessions are cached until they expire
//! (capped) so the hot path avoids a network round-trip per message.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use maia_core::error::ErrorKind;
use maia_core::types::{Role, Session};
use maia_outbound::{Method, OutboundClient, Service};

/// Cached entries live at most this long, even for long-lived sessions.
const CACHE_TTL_SECS: i64 = 300;
/// Bounded cache: when full it is simply cleared, since re-validation costs
/// one auth call.
const CACHE_MAX: usize = 1024;

pub struct SessionShim {
    outbound: Arc<OutboundClient>,
    local_dev_mode: bool,
    cache: DashMap<String, (Session, DateTime<Utc>)>,
}

impl SessionShim {
    pub fn new(outbound: Arc<OutboundClient>, local_dev_mode: bool) -> Self {
        Self {
            outbound,
            local_dev_mode,
            cache: DashMap::new(),
        }
    }

    /// Resolve a session token. A missing or invalid token yields
    /// `Unauthorized` in production and the single `default` user in
    /// local-dev mode.
    pub async fn validate(&self, token: Option<&str>) -> Result<Session, ErrorKind> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            if self.local_dev_mode {
                debug!("no session token; local-dev fallback user");
                return Ok(Session::local_dev_default());
            }
            return Err(ErrorKind::Unauthorized("missing X-Session-ID".to_string()));
        };

        let now = Utc::now();
        if let Some(entry) = self.cache.get(token) {
            let (session, cached_at) = entry.value();
            let fresh = now - *cached_at < Duration::seconds(CACHE_TTL_SECS);
            if fresh && !session.is_expired(now) {
                return Ok(session.clone());
            }
        }
        self.cache.remove(token);

        match self.fetch_session(token).await {
            Ok(session) => {
                if self.cache.len() >= CACHE_MAX {
                    self.cache.clear();
                }
                self.cache.insert(token.to_string(), (session.clone(), now));
                Ok(session)
            }
            Err(e) if self.local_dev_mode => {
                info!(err = %e, "auth unavailable; local-dev fallback user");
                Ok(Session::local_dev_default())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_session(&self, token: &str) -> Result<Session, ErrorKind> {
        let headers = vec![("X-Session-ID".to_string(), token.to_string())];
        let body = self
            .outbound
            .call(Service::Auth, Method::Get, "/api/auth/user", None, &headers, None)
            .await?;

        let user_id = body
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                warn!("auth response missing user_id");
                ErrorKind::Unauthorized("invalid session".to_string())
            })?
            .to_string();

        let role = body
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(|r| Role::from_str(r).ok())
            .unwrap_or(Role::User);

        let permissions: HashSet<String> = body
            .get("permissions")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let expires_at = body
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + Duration::hours(1));

        Ok(Session {
            session_id: token.to_string(),
            user_id,
            role,
            permissions,
            expires_at,
        })
    }

    /// Gate for admin-only endpoints: role admin or an `admin` grant.
    pub fn require_admin(session: &Session) -> Result<(), ErrorKind> {
        if session.is_admin() {
            Ok(())
        } else {
            Err(ErrorKind::Forbidden("admin role required".to_string()))
        }
    }
}
