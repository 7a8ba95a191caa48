//! Login finalization.
//!
//! Every login path (password, magic link, email verification, federated) ends at
//! `/auth/callback`. The [`RoleRouter`] state machine turns whatever credential the request
//! carries into a verified session and a hard navigation to the user's role home:
//!
//! ```text
//! Init ─► SessionObtained ─► UserObtained ─► RoleResolved ─► Verified ─► Done
//!  │             │                 │               │
//!  └─ no_session └─ user_fetch_error └─ invalid_role └─ no_session ─► Failed ─► Done
//! ```
//!
//! No transition retries. Every failure ends in a redirect carrying an `error` flag.

use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::{
    auth::{
        cookies::StoredSession,
        roles::Role,
    },
    config::Config,
    identity::{
        IdentityService,
        models::{Session, User},
    },
};

/// Credentials a callback request may carry. Sources are tried in field order.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    /// Authorization code from email verification or a federated provider
    pub code: Option<String>,
    /// PKCE verifier stored when the flow was started
    pub code_verifier: Option<String>,
    /// Token pair in the URL. Only honoured when the environment allows it.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Session already present in the cookie jar
    pub cookie_session: Option<StoredSession>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    NoSession,
    UserFetchError,
    InvalidRole,
}

impl CallbackFailure {
    /// Value of the `error` query parameter on the failure redirect
    pub fn flag(&self) -> &'static str {
        match self {
            CallbackFailure::NoSession => "no_session",
            CallbackFailure::UserFetchError => "user_fetch_error",
            CallbackFailure::InvalidRole => "invalid_role",
        }
    }
}

/// Where the callback sends the browser, and the cookies to write on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub location: Url,
    pub set_cookies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackState {
    Init,
    SessionObtained(Session),
    UserObtained(Session, User),
    RoleResolved(Session, User, Role),
    Verified(Session, Role),
    Failed(CallbackFailure),
    Done(CallbackOutcome),
}

impl CallbackState {
    fn name(&self) -> &'static str {
        match self {
            CallbackState::Init => "init",
            CallbackState::SessionObtained(..) => "session_obtained",
            CallbackState::UserObtained(..) => "user_obtained",
            CallbackState::RoleResolved(..) => "role_resolved",
            CallbackState::Verified(..) => "verified",
            CallbackState::Failed(..) => "failed",
            CallbackState::Done(..) => "done",
        }
    }
}

pub struct RoleRouter<'a> {
    identity: &'a dyn IdentityService,
    config: &'a Config,
    settle_delay: Duration,
}

impl<'a> RoleRouter<'a> {
    pub fn new(identity: &'a dyn IdentityService, config: &'a Config) -> Self {
        Self {
            identity,
            config,
            settle_delay: config.callback.settle_delay,
        }
    }

    /// Drive the machine from `Init` to `Done`
    #[instrument(skip_all)]
    pub async fn run(&self, params: &CallbackParams) -> CallbackOutcome {
        let mut state = CallbackState::Init;
        loop {
            let from = state.name();
            state = self.step(state, params).await;
            debug!(from, to = state.name(), "Callback transition");
            if let CallbackState::Done(outcome) = state {
                return outcome;
            }
        }
    }

    /// Perform one transition. `Done` is terminal and maps to itself.
    pub async fn step(&self, state: CallbackState, params: &CallbackParams) -> CallbackState {
        match state {
            CallbackState::Init => match self.obtain_session(params).await {
                Some(session) => CallbackState::SessionObtained(session),
                None => CallbackState::Failed(CallbackFailure::NoSession),
            },

            CallbackState::SessionObtained(session) => match self.identity.get_user(&session.access_token).await {
                Ok(user) => CallbackState::UserObtained(session, user),
                Err(e) => {
                    warn!("Failed to fetch user for fresh session: {e}");
                    CallbackState::Failed(CallbackFailure::UserFetchError)
                }
            },

            CallbackState::UserObtained(session, user) => {
                let role = user.role();
                if role.is_valid() {
                    CallbackState::RoleResolved(session, user, role)
                } else {
                    warn!(user_id = %user.id, %role, "User has no routable role");
                    CallbackState::Failed(CallbackFailure::InvalidRole)
                }
            }

            CallbackState::RoleResolved(session, user, role) => match self.verify(&session, &user).await {
                Some(verified) => CallbackState::Verified(verified, role),
                None => CallbackState::Failed(CallbackFailure::NoSession),
            },

            CallbackState::Verified(session, role) => {
                let policy = self.config.cookie_policy();
                let session_cookie = match policy.session_cookie(&session) {
                    Ok(cookie) => cookie,
                    Err(e) => {
                        error!("Could not persist verified session: {e}");
                        return CallbackState::Failed(CallbackFailure::NoSession);
                    }
                };

                // Cross-subdomain cookie writes can land after the next navigation starts
                if !self.settle_delay.is_zero() {
                    tokio::time::sleep(self.settle_delay).await;
                }

                let location = self.home_url(&role);
                info!(user_id = ?session.user_id(), %role, %location, "Callback complete");
                CallbackState::Done(CallbackOutcome {
                    location,
                    set_cookies: vec![session_cookie, policy.marker_cookie()],
                })
            }

            CallbackState::Failed(failure) => CallbackState::Done(self.failure_outcome(failure)),

            done @ CallbackState::Done(_) => done,
        }
    }

    async fn obtain_session(&self, params: &CallbackParams) -> Option<Session> {
        if let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) {
            return match self.identity.exchange_code_for_session(code, params.code_verifier.as_deref()).await {
                Ok(session) => Some(session),
                Err(e) => {
                    info!("Authorization code exchange failed: {e}");
                    None
                }
            };
        }

        if let (true, Some(access), Some(refresh)) = (
            self.config.allows_url_tokens(),
            params.access_token.as_deref(),
            params.refresh_token.as_deref(),
        ) {
            return match self.identity.set_session(access, refresh).await {
                Ok(session) => Some(session),
                Err(e) => {
                    info!("URL tokens rejected: {e}");
                    None
                }
            };
        }

        let stored = params.cookie_session.as_ref()?;
        match self.identity.set_session(&stored.access_token, &stored.refresh_token).await {
            Ok(session) => Some(session),
            Err(e) => {
                info!("Cookie session rejected: {e}");
                None
            }
        }
    }

    /// Force a refresh, then re-read the user through the new token
    async fn verify(&self, session: &Session, user: &User) -> Option<Session> {
        let refreshed = match self.identity.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(user_id = %user.id, "Session refresh during verification failed: {e}");
                return None;
            }
        };

        match self.identity.get_user(&refreshed.access_token).await {
            Ok(verified) if verified.id == user.id => Some(Session {
                user: Some(verified),
                ..refreshed
            }),
            Ok(other) => {
                error!(expected = %user.id, got = %other.id, "Refreshed session belongs to another user");
                None
            }
            Err(e) => {
                warn!(user_id = %user.id, "Session verification failed: {e}");
                None
            }
        }
    }

    fn home_url(&self, role: &Role) -> Url {
        role_home_url(self.config, role)
    }

    fn failure_outcome(&self, failure: CallbackFailure) -> CallbackOutcome {
        let policy = self.config.cookie_policy();
        match failure {
            CallbackFailure::InvalidRole => {
                let mut location = self.home_url(&Role::Unknown(None));
                location.query_pairs_mut().append_pair("error", failure.flag());
                CallbackOutcome {
                    location,
                    set_cookies: vec![],
                }
            }
            CallbackFailure::NoSession | CallbackFailure::UserFetchError => {
                let mut location = self.config.login_url();
                location.query_pairs_mut().append_pair("error", failure.flag());
                CallbackOutcome {
                    location,
                    set_cookies: vec![policy.removal_cookie()],
                }
            }
        }
    }
}

/// Where a role's users land, as an absolute URL. Exposed for the pages that redirect a user
/// who wandered into another role's section.
///
/// The home path is appended to the dashboard URL, so a dashboard mounted under a path prefix
/// keeps it.
pub fn role_home_url(config: &Config, role: &Role) -> Url {
    let mut url = config.dashboard_url();
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}{}", role.home_path()));
    url
}
