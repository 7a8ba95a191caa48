use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::request::Parts,
};
use std::convert::Infallible;

use crate::{
    auth::roles::Role,
    errors::Error,
    identity::models::{Session, User},
};

/// The session the guard resolved for this request.
///
/// Only present on requests that went through [`session_guard`](super::middleware::session_guard)
/// with a valid session; extracting it anywhere else is an `Unauthenticated` error.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub role: Role,
    pub session: Session,
}

impl AuthenticatedUser {
    pub fn new(user: User, session: Session) -> Self {
        Self {
            role: user.role(),
            user,
            session,
        }
    }
}

/// Present when the request carried the post-auth marker cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostAuthNavigation;

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or(Error::Unauthenticated { message: None })
    }
}

impl<S> OptionalFromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthenticatedUser>().cloned())
    }
}
