use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::{
    AppState,
    auth::{
        cookies::{CookiePolicy, MARKER_COOKIE_NAME, StoredSession, append_set_cookies, cookie_value},
        current_user::{AuthenticatedUser, PostAuthNavigation},
    },
    config::GuardMode,
    errors::Error,
    identity::{IdentityService, models::Session},
};

/// Login finalization owns the session cookie on its own responses
const CALLBACK_PATH: &str = "/auth/callback";

const PUBLIC_PREFIXES: &[&str] = &[
    CALLBACK_PATH,
    "/error-auth",
    "/healthz",
    "/authentication/",
    "/api-docs/",
    "/_next/",
    "/static/",
    "/assets/",
    "/favicon.ico",
];

const STATIC_EXTENSIONS: &[&str] = &[
    ".svg", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".ico", ".css", ".js", ".map", ".woff", ".woff2", ".ttf", ".txt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Public,
    Protected,
}

/// Classify a request path. Everything not explicitly public is protected.
pub fn classify_path(path: &str, extra_public: &[String]) -> PathClass {
    let lower = path.to_ascii_lowercase();
    let is_public = PUBLIC_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
        || STATIC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        || extra_public.iter().any(|prefix| path.starts_with(prefix.as_str()));

    if is_public { PathClass::Public } else { PathClass::Protected }
}

/// True when the query carries both halves of a token pair, i.e. a session is being established
/// client-side and must not be interrupted by a redirect.
pub fn has_transitional_tokens(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return false;
    };
    let (mut access, mut refresh) = (false, false);
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "access_token" if !value.is_empty() => access = true,
            "refresh_token" if !value.is_empty() => refresh = true,
            _ => {}
        }
    }
    access && refresh
}

/// Outcome of reading the session cookie: who the request belongs to, plus any cookie writes
/// that must ride along on the response.
#[derive(Debug, Default)]
pub struct SessionResolution {
    pub authenticated: Option<AuthenticatedUser>,
    pub set_cookies: Vec<String>,
}

/// Whether an error means the stored credentials are dead (as opposed to the identity service
/// being unreachable)
fn is_credential_rejection(error: &Error) -> bool {
    match error {
        Error::Unauthenticated { .. } => true,
        Error::Identity { status, .. } => (400..500).contains(status) && *status != 429,
        _ => false,
    }
}

/// Resolve the session from the request cookies, refreshing it if the access token is stale.
///
/// Never fails: every error is "no session". Rejected credentials also clear the cookie.
#[instrument(skip_all)]
pub async fn resolve_session(
    identity: &dyn IdentityService,
    policy: &CookiePolicy,
    headers: &HeaderMap,
    leeway: chrono::Duration,
) -> SessionResolution {
    let Some(stored) = policy.read_session(headers) else {
        if cookie_value(headers, &policy.name).is_some() {
            debug!("Undecodable session cookie, clearing it");
            return SessionResolution {
                authenticated: None,
                set_cookies: vec![policy.removal_cookie()],
            };
        }
        return SessionResolution::default();
    };

    match load_stored_session(identity, policy, &stored, leeway).await {
        Ok(resolution) => resolution,
        Err(e) => {
            let rejected = is_credential_rejection(&e);
            debug!(rejected, "Session resolution failed: {e}");
            if !rejected {
                warn!("Identity service unavailable while resolving session: {e}");
            }
            SessionResolution {
                authenticated: None,
                set_cookies: if rejected { vec![policy.removal_cookie()] } else { vec![] },
            }
        }
    }
}

async fn load_stored_session(
    identity: &dyn IdentityService,
    policy: &CookiePolicy,
    stored: &StoredSession,
    leeway: chrono::Duration,
) -> Result<SessionResolution, Error> {
    if stored.expires_at <= Utc::now() + leeway {
        debug!("Access token stale, refreshing");
        let session = identity.refresh_session(&stored.refresh_token).await?;
        let user = match &session.user {
            Some(user) => user.clone(),
            None => identity.get_user(&session.access_token).await?,
        };
        let cookie = policy.session_cookie(&session)?;
        return Ok(SessionResolution {
            authenticated: Some(AuthenticatedUser::new(user, session)),
            set_cookies: vec![cookie],
        });
    }

    let user = identity.get_user(&stored.access_token).await?;
    let session = Session {
        access_token: stored.access_token.clone(),
        refresh_token: stored.refresh_token.clone(),
        token_type: "bearer".to_string(),
        expires_at: stored.expires_at,
        user: Some(user.clone()),
    };
    Ok(SessionResolution {
        authenticated: Some(AuthenticatedUser::new(user, session)),
        set_cookies: vec![],
    })
}

/// Route guard applied to every request.
///
/// Fails closed: a protected request is only forwarded when a session was positively resolved.
/// Requests carrying a transitional token pair, and requests to the login callback, are passed
/// through untouched.
pub async fn session_guard(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if has_transitional_tokens(request.uri().query()) {
        debug!(path = request.uri().path(), "Token pair in query, letting session establish");
        return next.run(request).await;
    }

    if request.uri().path() == CALLBACK_PATH {
        return next.run(request).await;
    }

    let config = &state.config;
    let class = classify_path(request.uri().path(), &config.guard.public_paths);
    let policy = config.cookie_policy();
    let leeway = chrono::Duration::from_std(config.session.expiry_leeway).unwrap_or_else(|_| chrono::Duration::seconds(60));

    let resolution = resolve_session(state.identity.as_ref(), &policy, request.headers(), leeway).await;
    let mut set_cookies = resolution.set_cookies;

    if cookie_value(request.headers(), MARKER_COOKIE_NAME).is_some() {
        request.extensions_mut().insert(PostAuthNavigation);
        set_cookies.push(policy.marker_removal_cookie());
    }

    let mut response = match resolution.authenticated {
        Some(authenticated) => {
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        None if class == PathClass::Protected && config.guard.mode == GuardMode::Dashboard => {
            info!(path = request.uri().path(), "No session for protected path, redirecting to login");
            Redirect::temporary(config.login_url().as_str()).into_response()
        }
        None => next.run(request).await,
    };

    append_set_cookies(response.headers_mut(), &set_cookies);
    response
}
