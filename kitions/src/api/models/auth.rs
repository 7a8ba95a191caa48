use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::{cookies::append_set_cookies, roles::Role},
    identity::models::{SignUpProfile, User},
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub profile: SignUpProfile,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct InviteRequest {
    pub email: String,
    #[schema(value_type = String, example = "distributor")]
    pub role: Role,
    #[serde(default)]
    pub business_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthResponse {
    pub user: User,
    #[schema(value_type = Option<String>)]
    pub role: Role,
    pub message: String,
}

/// The session the guard resolved for this request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionResponse {
    pub user: User,
    #[schema(value_type = Option<String>)]
    pub role: Role,
    /// Path of the user's role home, or the error page for unroutable roles
    pub home: String,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters accepted by `/auth/callback`
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    /// Authorization code from email verification or a federated provider
    pub code: Option<String>,
    /// Development only
    pub access_token: Option<String>,
    /// Development only
    pub refresh_token: Option<String>,
}

pub struct RegisterResponse {
    pub auth_response: AuthResponse,
}

impl IntoResponse for RegisterResponse {
    fn into_response(self) -> Response {
        (StatusCode::CREATED, Json(self.auth_response)).into_response()
    }
}

pub struct LoginResponse {
    pub auth_response: AuthResponse,
    pub cookie: String,
}

impl IntoResponse for LoginResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.auth_response).into_response();
        append_set_cookies(response.headers_mut(), &[self.cookie]);
        response
    }
}

/// A hard navigation with cookie writes attached
pub struct RedirectWithCookies {
    pub location: String,
    pub cookies: Vec<String>,
}

impl IntoResponse for RedirectWithCookies {
    fn into_response(self) -> Response {
        let mut response = Redirect::to(&self.location).into_response();
        append_set_cookies(response.headers_mut(), &self.cookies);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn test_register_request_flattens_profile() {
        let request: RegisterRequest = serde_json::from_value(serde_json::json!({
            "email": "shop@example.com",
            "password": "hunter22",
            "role": "retailer",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "business_name": "Corner Shop",
            "role_fields": { "store_count": 2 }
        }))
        .unwrap();

        assert_eq!(request.profile.role, Role::Retailer);
        assert_eq!(request.profile.business_name, "Corner Shop");
        assert_eq!(request.profile.role_fields["store_count"], 2);
    }

    #[test]
    fn test_redirect_with_cookies() {
        let response = RedirectWithCookies {
            location: "https://app.kitions.com/retailer/home".to_string(),
            cookies: vec!["a=1; Path=/".to_string(), "b=2; Path=/".to_string()],
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "https://app.kitions.com/retailer/home");
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
