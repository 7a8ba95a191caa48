//! Cookie policy shared by the dashboard and public guards.
//!
//! The session is persisted as a single cookie holding the token pair and access token expiry,
//! encoded as URL-safe base64 JSON. Development cookies are host-only and not `Secure`;
//! production cookies are scoped to the parent domain so every Kitions subdomain sees the same
//! session.

use axum::http::{HeaderMap, HeaderValue, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{
    errors::{Error, Result},
    identity::models::Session,
};

/// Set by the callback right before the hard navigation to the role home.
pub const MARKER_COOKIE_NAME: &str = "kitions_post_auth_redirect";
pub const MARKER_COOKIE_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => write!(f, "Strict"),
            SameSite::Lax => write!(f, "Lax"),
            SameSite::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePolicy {
    pub name: String,
    /// `None` means host-only
    pub domain: Option<String>,
    pub path: String,
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

/// What actually lives in the session cookie. The user record is never stored client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        Self {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at: session.expires_at,
        }
    }
}

impl StoredSession {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Internal {
            operation: format!("encode session cookie: {e}"),
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(value: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl CookiePolicy {
    pub fn development(name: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: None,
            path: "/".to_string(),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }

    pub fn production(name: &str, parent_domain: &str) -> Self {
        Self {
            domain: Some(parent_domain.to_string()),
            secure: true,
            ..Self::development(name)
        }
    }

    fn scope_attributes(&self) -> String {
        let mut attrs = format!("Path={}", self.path);
        if let Some(domain) = &self.domain {
            attrs.push_str(&format!("; Domain={domain}"));
        }
        attrs
    }

    /// `Set-Cookie` value persisting `session`
    pub fn session_cookie(&self, session: &Session) -> Result<String> {
        let value = StoredSession::from(session).encode()?;
        let mut cookie = format!(
            "{}={}; {}; Max-Age={}; SameSite={}",
            self.name,
            value,
            self.scope_attributes(),
            self.max_age.as_secs(),
            self.same_site
        );
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        Ok(cookie)
    }

    /// `Set-Cookie` value that expires the session cookie
    pub fn removal_cookie(&self) -> String {
        let mut cookie = format!("{}=; {}; Max-Age=0; SameSite={}", self.name, self.scope_attributes(), self.same_site);
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// The advisory "just authenticated" marker. Scoped like the session cookie so the
    /// destination subdomain receives it.
    pub fn marker_cookie(&self) -> String {
        self.marker_with_max_age("true", MARKER_COOKIE_MAX_AGE.as_secs())
    }

    pub fn marker_removal_cookie(&self) -> String {
        self.marker_with_max_age("", 0)
    }

    fn marker_with_max_age(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{MARKER_COOKIE_NAME}={value}; {}; Max-Age={max_age}; SameSite=Strict",
            self.scope_attributes()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Read the stored session from request headers. Undecodable values count as absent.
    pub fn read_session(&self, headers: &HeaderMap) -> Option<StoredSession> {
        cookie_value(headers, &self.name).and_then(|value| StoredSession::decode(&value))
    }
}

/// Append `Set-Cookie` headers. Values that are not valid header text are dropped.
pub fn append_set_cookies(headers: &mut HeaderMap, cookies: &[String]) {
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!("Dropping invalid Set-Cookie value: {e}"),
        }
    }
}

/// Find a cookie by name across all `Cookie` headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(cookie_name, value)| *cookie_name == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
