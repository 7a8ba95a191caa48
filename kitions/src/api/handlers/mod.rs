//! Axum route handlers.
//!
//! - [`auth`]: registration, login, logout, invites, the login callback and the session endpoint
//! - [`pages`]: role homes, the auth error page and the health probe
//!
//! Handlers that need a signed-in user take an
//! [`AuthenticatedUser`](crate::auth::current_user::AuthenticatedUser), which only exists on
//! requests the [session guard](crate::auth::middleware::session_guard) resolved a session for.

pub mod auth;
pub mod pages;
