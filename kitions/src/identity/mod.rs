//! Hosted identity service boundary.
//!
//! Everything that talks to the backend-as-a-service goes through two traits:
//!
//! - [`IdentityService`]: sessions, users, sign-up/in/out, invites, code exchange and
//!   session-change notifications
//! - [`ProfileStore`]: inserts into the profile tables mirrored alongside each identity record
//!
//! [`http::HttpIdentityClient`] implements both against a GoTrue/PostgREST API. Tests swap in
//! an in-memory implementation.

pub mod http;
pub mod jwt;
pub mod models;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::Result;
use models::{AuthEvent, Session, User, UserMetadata};

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Create an identity record. No session is returned; callers sign in separately.
    async fn sign_up(&self, email: &str, password: &str, metadata: &UserMetadata) -> Result<User>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    /// Invalidate the session behind `access_token`
    async fn sign_out(&self, access_token: &str) -> Result<()>;

    async fn get_user(&self, access_token: &str) -> Result<User>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session>;

    /// Exchange an authorization code (email verification / federated login) for a session
    async fn exchange_code_for_session(&self, auth_code: &str, code_verifier: Option<&str>) -> Result<Session>;

    /// Adopt an externally supplied token pair, refreshing it if the access token is stale
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session>;

    /// Admin invite; requires a service credential
    async fn invite_user(&self, email: &str, metadata: &UserMetadata) -> Result<User>;

    /// Session change notifications for the lifetime of the receiver
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Insert one row into `table`, authorized as the holder of `access_token` when given
    async fn insert_row(&self, access_token: Option<&str>, table: &str, row: serde_json::Value) -> Result<()>;
}
