//! Session handling and role routing.
//!
//! # Flow
//!
//! ```text
//! browser ──► session_guard ──► handler
//!               │  reads/refreshes the session cookie
//!               │  redirects protected requests without a session to the login URL
//!               ▼
//!          /auth/callback ──► RoleRouter FSM ──► 303 to <dashboard>/<role>/home
//! ```
//!
//! - [`cookies`]: cookie policy (development vs production profile), marker cookie
//! - [`middleware`]: the route guard
//! - [`current_user`]: extractor for the user the guard resolved
//! - [`callback`]: login finalization state machine
//! - [`provider`]: in-memory session context with background refresh, for long-lived clients
//! - [`accounts`]: sign-up shared by the HTTP routes and the provider
//! - [`roles`]: the closed role type and its home routes

pub mod accounts;
pub mod callback;
pub mod cookies;
pub mod current_user;
pub mod middleware;
pub mod provider;
pub mod roles;
