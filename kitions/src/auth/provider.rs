//! Long-lived session context.
//!
//! [`AuthProvider`] keeps an in-memory mirror of the current session for a client that outlives a
//! single request (a desktop shell, a CLI, an integration worker). It is constructed explicitly
//! and handed to whoever needs it; nothing about it is global.
//!
//! Lifecycle:
//!
//! ```text
//! new ──► start ──► init (one session fetch)
//!                    ├─ subscribe to AuthEvents
//!                    ├─ refresh every session.refresh_interval
//!                    ▼
//!                 ProviderHandle::shutdown ──► cancel + join
//! ```
//!
//! State changes from notifications and from the timer are both full-session projections, so
//! applying them last-write-wins is correct. Once the provider is shut down no further state is
//! published, even by identity calls that were in flight at the time.

use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    auth::accounts,
    config::Config,
    errors::{Error, Result},
    identity::{
        IdentityService, ProfileStore,
        models::{AuthEvent, Session, SignUpProfile, User},
    },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthSnapshot {
    pub user: Option<User>,
    pub session: Option<Session>,
    /// True until the initial session fetch has completed
    pub loading: bool,
}

impl AuthSnapshot {
    fn signed_out() -> Self {
        Self::default()
    }

    fn from_session(session: Session, user: User) -> Self {
        Self {
            user: Some(user),
            session: Some(session),
            loading: false,
        }
    }
}

/// What the caller should do after a sign-in or sign-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// Reload everything derived from the previous session
    Reload,
    /// Leave the application entirely, discarding all in-memory state
    Hard(Url),
}

pub struct AuthProvider {
    identity: Arc<dyn IdentityService>,
    profiles: Arc<dyn ProfileStore>,
    login_url: Url,
    refresh_interval: Duration,
    state: watch::Sender<AuthSnapshot>,
    shutdown: CancellationToken,
}

impl AuthProvider {
    /// Create a provider. `initial` seeds the state (e.g. a session restored from disk); without
    /// it the provider reports `loading` until [`start`](Self::start) has fetched a session.
    pub fn new(
        identity: Arc<dyn IdentityService>,
        profiles: Arc<dyn ProfileStore>,
        config: &Config,
        initial: Option<Session>,
    ) -> Arc<Self> {
        let snapshot = match initial {
            Some(session) => AuthSnapshot {
                user: session.user.clone(),
                session: Some(session),
                loading: false,
            },
            None => AuthSnapshot {
                loading: true,
                ..Default::default()
            },
        };
        let (state, _) = watch::channel(snapshot);

        Arc::new(Self {
            identity,
            profiles,
            login_url: config.login_url(),
            refresh_interval: config.session.refresh_interval,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<AuthSnapshot> {
        self.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `call` unless the provider is torn down first
    async fn cancellable<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Internal {
                operation: "complete identity call: provider shut down".to_string(),
            }),
            result = call => result,
        }
    }

    fn publish(&self, snapshot: AuthSnapshot) {
        if self.shutdown.is_cancelled() {
            debug!("Provider shut down, dropping state update");
            return;
        }
        self.state.send_replace(snapshot);
    }

    /// Create an account and its profile rows. Does not sign in.
    pub async fn sign_up(&self, email: &str, password: &str, profile: &SignUpProfile) -> Result<User> {
        self.cancellable(accounts::sign_up(
            self.identity.as_ref(),
            self.profiles.as_ref(),
            email,
            password,
            profile,
        ))
        .await
    }

    #[instrument(skip(self, password), err)]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Navigation> {
        let session = self.cancellable(self.identity.sign_in_with_password(email, password)).await?;
        let user = match &session.user {
            Some(user) => user.clone(),
            None => self.cancellable(self.identity.get_user(&session.access_token)).await?,
        };
        info!(user_id = %user.id, "Signed in");
        self.publish(AuthSnapshot::from_session(session, user));
        Ok(Navigation::Reload)
    }

    /// Invalidate the session with the identity service and clear local state.
    ///
    /// Local state is cleared even if the identity service call fails; the error is still
    /// returned.
    #[instrument(skip(self), err)]
    pub async fn sign_out(&self) -> Result<Navigation> {
        let access_token = self.snapshot().session.map(|s| s.access_token);
        let result = match access_token {
            Some(token) => self.cancellable(self.identity.sign_out(&token)).await,
            None => Ok(()),
        };
        self.publish(AuthSnapshot::signed_out());
        result.map(|()| Navigation::Hard(self.login_url.clone()))
    }

    /// Re-fetch the current session, rotating the token pair.
    ///
    /// With no session this is a no-op returning the signed-out snapshot. A rejected refresh
    /// token signs the provider out.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<AuthSnapshot> {
        let Some(current) = self.snapshot().session else {
            let snapshot = AuthSnapshot::signed_out();
            self.publish(snapshot.clone());
            return Ok(snapshot);
        };

        match self.cancellable(self.load(&current.refresh_token)).await {
            Ok(snapshot) => {
                self.publish(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                if matches!(e, Error::Identity { status, .. } if (400..500).contains(&status) && status != 429) {
                    warn!("Refresh token rejected, signing out: {e}");
                    self.publish(AuthSnapshot::signed_out());
                }
                Err(e)
            }
        }
    }

    async fn load(&self, refresh_token: &str) -> Result<AuthSnapshot> {
        let session = self.identity.refresh_session(refresh_token).await?;
        let user = match &session.user {
            Some(user) => user.clone(),
            None => self.identity.get_user(&session.access_token).await?,
        };
        Ok(AuthSnapshot::from_session(session, user))
    }

    /// Initial fetch: validate the seeded session, refreshing it if the access token is stale
    async fn init(&self) {
        let snapshot = self.snapshot();
        let Some(session) = snapshot.session else {
            self.publish(AuthSnapshot::signed_out());
            return;
        };

        let result = self
            .cancellable(async {
                match self.identity.get_user(&session.access_token).await {
                    Ok(user) if !session.is_expired(chrono::Utc::now(), chrono::Duration::zero()) => {
                        Ok(AuthSnapshot::from_session(session.clone(), user))
                    }
                    _ => self.load(&session.refresh_token).await,
                }
            })
            .await;

        match result {
            Ok(snapshot) => self.publish(snapshot),
            Err(e) => {
                debug!("No session on startup: {e}");
                self.publish(AuthSnapshot::signed_out());
            }
        }
    }

    async fn apply_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
                // Only follow events for the user we are tracking, or adopt one if signed out
                let tracked = self.snapshot().user.map(|u| u.id);
                let user = match &session.user {
                    Some(user) => Ok(user.clone()),
                    None => self.cancellable(self.identity.get_user(&session.access_token)).await,
                };
                match user {
                    Ok(user) if tracked.is_none() || tracked == Some(user.id) => {
                        self.publish(AuthSnapshot::from_session(session, user));
                    }
                    Ok(user) => debug!(user_id = %user.id, "Ignoring session event for another user"),
                    Err(e) => debug!("Could not resolve user for session event: {e}"),
                }
            }
            AuthEvent::SignedOut => self.publish(AuthSnapshot::signed_out()),
        }
    }

    /// Start the background lifecycle. Call [`ProviderHandle::shutdown`] to stop it.
    pub fn start(self: &Arc<Self>) -> ProviderHandle {
        let provider = Arc::clone(self);
        let mut events = provider.identity.subscribe();

        let task = tokio::spawn(async move {
            provider.init().await;

            let mut ticker = interval_at(tokio::time::Instant::now() + provider.refresh_interval, provider.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut subscribed = true;
            loop {
                tokio::select! {
                    _ = provider.shutdown.cancelled() => {
                        debug!("Auth provider shutting down");
                        break;
                    }
                    event = events.recv(), if subscribed => match event {
                        Ok(event) => provider.apply_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events are covered by re-reading the full session
                            warn!(skipped, "Auth event subscriber lagged, refreshing");
                            if let Err(e) = provider.refresh().await {
                                debug!("Refresh after lag failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Identity event channel closed, relying on periodic refresh");
                            subscribed = false;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = provider.refresh().await {
                            warn!("Periodic session refresh failed: {e}");
                        }
                    }
                }
            }
        });

        ProviderHandle {
            shutdown: self.shutdown.clone(),
            task,
        }
    }
}

/// Owner of a started provider's background task
pub struct ProviderHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProviderHandle {
    /// Cancel the background task and any in-flight identity call, then wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Auth provider task ended abnormally: {e}");
        }
    }
}
