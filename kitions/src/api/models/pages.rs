use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{auth::roles::Role, identity::models::User};

/// Minimal role home document. The dashboard front end renders the actual page.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoleHomeResponse {
    #[schema(value_type = String)]
    pub role: Role,
    pub user: User,
    /// True on the first navigation after a completed login
    pub just_authenticated: bool,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ErrorAuthQuery {
    /// Failure flag set by the callback (`no_session`, `user_fetch_error`, `invalid_role`)
    pub error: Option<String>,
}

/// User-facing explanation of an authentication failure. Never carries raw error text.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorAuthPage {
    pub title: String,
    pub message: String,
    /// Likely causes, most specific first
    pub causes: Vec<String>,
    /// Where to start over
    pub login_url: String,
}
