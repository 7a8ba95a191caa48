//! HTTP surface.
//!
//! - **[`handlers`]**: axum route handlers
//! - **[`models`]**: request/response bodies
//!
//! # Routes
//!
//! - **Accounts** (`/authentication/*`): register, login, logout, invite
//! - **Callback** (`/auth/callback`): login finalization and role routing
//! - **Session** (`/api/session`): the current user and role
//! - **Pages** (`/retailer/home`, `/distributor/home`, `/error-auth`): role homes and the auth error page
//!
//! The OpenAPI document is served at `/api-docs/openapi.json`.

pub mod handlers;
pub mod models;
