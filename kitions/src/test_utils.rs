//! Test utilities (available with `test-utils` feature).
//!
//! [`MemoryIdentity`] is an in-process stand-in for the hosted identity service. It implements
//! both [`IdentityService`] and [`ProfileStore`] and exposes knobs for the failure modes the
//! session flow has to survive: revoked tokens, failing tables, an unreachable service and slow
//! responses.

use async_trait::async_trait;
use axum_test::TestServer;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    AppState,
    auth::cookies::StoredSession,
    config::{CallbackConfig, Config, IdentityConfig},
    errors::{Error, Result},
    identity::{
        IdentityService, ProfileStore,
        models::{AuthEvent, Session, User, UserMetadata},
    },
};

const ACCESS_TOKEN_LIFETIME: i64 = 60 * 60;

#[derive(Debug, Clone)]
struct AccessGrant {
    user_id: Uuid,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, (User, String)>,
    access_tokens: HashMap<String, AccessGrant>,
    refresh_tokens: HashMap<String, Uuid>,
    codes: HashMap<String, Uuid>,
    rows: HashMap<String, Vec<Value>>,
    failing_tables: HashSet<String>,
    refresh_count: usize,
    latency: Option<Duration>,
    unavailable: bool,
    issued: u64,
}

impl Inner {
    fn next_token(&mut self, kind: &str) -> String {
        self.issued += 1;
        format!("{kind}-{}-{}", self.issued, Uuid::new_v4().simple())
    }

    fn issue(&mut self, user_id: Uuid, expires_at: DateTime<Utc>) -> Session {
        let access_token = self.next_token("access");
        let refresh_token = self.next_token("refresh");
        self.access_tokens.insert(
            access_token.clone(),
            AccessGrant {
                user_id,
                refresh_token: refresh_token.clone(),
                expires_at,
            },
        );
        self.refresh_tokens.insert(refresh_token.clone(), user_id);

        Session {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_at,
            user: self.users.get(&user_id).map(|(user, _)| user.clone()),
        }
    }

    fn find_by_email(&self, email: &str) -> Option<&(User, String)> {
        self.users.values().find(|(user, _)| user.email.eq_ignore_ascii_case(email))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Identity {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn invalid_token() -> Error {
    Error::Identity {
        status: 401,
        message: "invalid JWT: token is expired or revoked".to_string(),
    }
}

pub struct MemoryIdentity {
    inner: Mutex<Inner>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory identity lock poisoned")
    }

    fn publish(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Register a user directly, bypassing sign-up
    pub fn create_user(&self, email: &str, password: &str, role: Option<&str>) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            user_metadata: UserMetadata {
                role: role.map(str::to_string),
                ..Default::default()
            },
        };
        self.lock().users.insert(user.id, (user.clone(), password.to_string()));
        user
    }

    pub fn user_exists(&self, email: &str) -> bool {
        self.lock().find_by_email(email).is_some()
    }

    /// A session valid for an hour
    pub fn issue_session(&self, user_id: Uuid) -> Session {
        self.lock().issue(user_id, Utc::now() + ChronoDuration::seconds(ACCESS_TOKEN_LIFETIME))
    }

    /// A session whose access token has expired but whose refresh token still works
    pub fn issue_expired_session(&self, user_id: Uuid) -> Session {
        self.lock().issue(user_id, Utc::now() - ChronoDuration::minutes(1))
    }

    /// A one-time authorization code for `user_id`
    pub fn create_code(&self, user_id: Uuid) -> String {
        let mut inner = self.lock();
        let code = inner.next_token("code");
        inner.codes.insert(code.clone(), user_id);
        code
    }

    /// Make every insert into `table` fail
    pub fn fail_table(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().rows.get(table).cloned().unwrap_or_default()
    }

    pub fn refresh_count(&self) -> usize {
        self.lock().refresh_count
    }

    /// Delay every identity call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Fail every identity call with a 503
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Invalidate an access token and the refresh token issued with it
    pub fn revoke(&self, access_token: &str) {
        let mut inner = self.lock();
        if let Some(grant) = inner.access_tokens.remove(access_token) {
            inner.refresh_tokens.remove(&grant.refresh_token);
        }
    }

    /// Push a session change notification to subscribers
    pub fn emit(&self, event: AuthEvent) {
        self.publish(event);
    }
}

#[async_trait]
impl IdentityService for MemoryIdentity {
    async fn sign_up(&self, email: &str, password: &str, metadata: &UserMetadata) -> Result<User> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.check_available()?;
        if inner.find_by_email(email).is_some() {
            return Err(Error::Identity {
                status: 422,
                message: "User already registered".to_string(),
            });
        }
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            user_metadata: metadata.clone(),
        };
        inner.users.insert(user.id, (user.clone(), password.to_string()));
        Ok(user)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        self.simulate_latency().await;
        let session = {
            let mut inner = self.lock();
            inner.check_available()?;
            let user_id = match inner.find_by_email(email) {
                Some((user, stored)) if stored == password => user.id,
                _ => {
                    return Err(Error::Identity {
                        status: 400,
                        message: "Invalid login credentials".to_string(),
                    });
                }
            };
            inner.issue(user_id, Utc::now() + ChronoDuration::seconds(ACCESS_TOKEN_LIFETIME))
        };
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        self.simulate_latency().await;
        {
            let inner = self.lock();
            inner.check_available()?;
        }
        self.revoke(access_token);
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<User> {
        self.simulate_latency().await;
        let inner = self.lock();
        inner.check_available()?;
        let grant = inner.access_tokens.get(access_token).ok_or_else(invalid_token)?;
        if grant.expires_at <= Utc::now() {
            return Err(invalid_token());
        }
        inner
            .users
            .get(&grant.user_id)
            .map(|(user, _)| user.clone())
            .ok_or(Error::Identity {
                status: 404,
                message: "User not found".to_string(),
            })
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        self.simulate_latency().await;
        let session = {
            let mut inner = self.lock();
            inner.check_available()?;
            let user_id = inner.refresh_tokens.remove(refresh_token).ok_or(Error::Identity {
                status: 400,
                message: "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            })?;
            inner.refresh_count += 1;
            inner.issue(user_id, Utc::now() + ChronoDuration::seconds(ACCESS_TOKEN_LIFETIME))
        };
        self.publish(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn exchange_code_for_session(&self, auth_code: &str, _code_verifier: Option<&str>) -> Result<Session> {
        self.simulate_latency().await;
        let session = {
            let mut inner = self.lock();
            inner.check_available()?;
            let user_id = inner.codes.remove(auth_code).ok_or(Error::Identity {
                status: 404,
                message: "invalid flow state, no valid flow state found".to_string(),
            })?;
            inner.issue(user_id, Utc::now() + ChronoDuration::seconds(ACCESS_TOKEN_LIFETIME))
        };
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session> {
        let current = {
            let inner = self.lock();
            inner.check_available()?;
            inner
                .access_tokens
                .get(access_token)
                .filter(|grant| grant.expires_at > Utc::now())
                .map(|grant| (grant.user_id, grant.expires_at))
        };

        match current {
            Some((user_id, expires_at)) => {
                let user = self.lock().users.get(&user_id).map(|(user, _)| user.clone());
                let session = Session {
                    access_token: access_token.to_string(),
                    refresh_token: refresh_token.to_string(),
                    token_type: "bearer".to_string(),
                    expires_at,
                    user,
                };
                self.publish(AuthEvent::SignedIn(session.clone()));
                Ok(session)
            }
            None => self.refresh_session(refresh_token).await,
        }
    }

    async fn invite_user(&self, email: &str, metadata: &UserMetadata) -> Result<User> {
        self.sign_up(email, &Uuid::new_v4().to_string(), metadata).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ProfileStore for MemoryIdentity {
    async fn insert_row(&self, _access_token: Option<&str>, table: &str, row: Value) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_tables.contains(table) {
            return Err(Error::Storage {
                table: table.to_string(),
                message: "insert rejected".to_string(),
            });
        }
        inner.rows.entry(table.to_string()).or_default().push(row);
        Ok(())
    }
}

pub fn create_test_config() -> Config {
    Config {
        identity: IdentityConfig {
            anon_key: "test-anon-key".to_string(),
            ..Default::default()
        },
        callback: CallbackConfig {
            settle_delay: Duration::ZERO,
        },
        ..Default::default()
    }
}

pub fn create_test_state(identity: Arc<MemoryIdentity>, config: Config) -> AppState {
    AppState::builder()
        .config(config)
        .identity(identity.clone())
        .profiles(identity)
        .build()
}

pub fn create_test_server(identity: Arc<MemoryIdentity>, config: Config) -> TestServer {
    crate::Application::from_state(create_test_state(identity, config))
        .expect("Failed to build test application")
        .into_test_server()
}

/// `Cookie` header value carrying `session` under the configured cookie name
pub fn session_cookie_header(config: &Config, session: &Session) -> String {
    let value = StoredSession::from(session).encode().expect("encode session cookie");
    format!("{}={}", config.cookies.name, value)
}
