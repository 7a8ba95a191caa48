use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
};

use crate::{
    AppState,
    api::models::auth::{
        AuthResponse, CallbackQuery, InviteRequest, LoginRequest, LoginResponse, RedirectWithCookies, RegisterRequest, RegisterResponse,
        SessionResponse,
    },
    auth::{
        accounts,
        callback::{CallbackParams, RoleRouter},
        cookies::cookie_value,
        current_user::AuthenticatedUser,
    },
    errors::Error,
    identity::models::UserMetadata,
};

/// Register a new account
#[utoipa::path(
    post,
    path = "/authentication/register",
    request_body = RegisterRequest,
    tag = "authentication",
    responses(
        (status = 201, description = "Account created. Sign in separately.", body = AuthResponse),
        (status = 400, description = "Invalid input or email already registered"),
        (status = 500, description = "Account created but profile setup is incomplete"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(State(state): State<AppState>, Json(request): Json<RegisterRequest>) -> Result<RegisterResponse, Error> {
    let user = accounts::sign_up(
        state.identity.as_ref(),
        state.profiles.as_ref(),
        &request.email,
        &request.password,
        &request.profile,
    )
    .await?;

    Ok(RegisterResponse {
        auth_response: AuthResponse {
            role: user.role(),
            user,
            message: "Registration successful".to_string(),
        },
    })
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/authentication/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful, session cookie set", body = AuthResponse),
        (status = 400, description = "Invalid credentials"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Result<LoginResponse, Error> {
    let session = state.identity.sign_in_with_password(request.email.trim(), &request.password).await?;
    let user = match &session.user {
        Some(user) => user.clone(),
        None => state.identity.get_user(&session.access_token).await?,
    };

    let cookie = state.config.cookie_policy().session_cookie(&session)?;

    Ok(LoginResponse {
        auth_response: AuthResponse {
            role: user.role(),
            user,
            message: "Login successful".to_string(),
        },
        cookie,
    })
}

/// Logout (clear session)
///
/// Always clears the cookie and sends the browser to the login page. Revoking the session with
/// the identity service is best effort.
#[utoipa::path(
    post,
    path = "/authentication/logout",
    tag = "authentication",
    responses(
        (status = 303, description = "Session cleared, redirect to the login page"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, current_user: Option<AuthenticatedUser>) -> RedirectWithCookies {
    if let Some(current_user) = current_user {
        if let Err(e) = state.identity.sign_out(&current_user.session.access_token).await {
            tracing::warn!(user_id = %current_user.user.id, "Identity sign-out failed: {e}");
        }
    }

    RedirectWithCookies {
        location: state.config.login_url().to_string(),
        cookies: vec![state.config.cookie_policy().removal_cookie()],
    }
}

/// Invite a new user by email
#[utoipa::path(
    post,
    path = "/authentication/invite",
    request_body = InviteRequest,
    tag = "authentication",
    responses(
        (status = 201, description = "Invite sent", body = AuthResponse),
        (status = 400, description = "Invites disabled or invalid role"),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Caller has no valid role"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn invite(
    State(state): State<AppState>,
    current_user: AuthenticatedUser,
    Json(request): Json<InviteRequest>,
) -> Result<RegisterResponse, Error> {
    if state.config.identity.service_key.is_none() {
        return Err(Error::BadRequest {
            message: "Invites are not enabled".to_string(),
        });
    }
    if !current_user.role.is_valid() {
        return Err(Error::InvalidRole {
            role: Some(current_user.role.to_string()),
        });
    }
    if !request.role.is_valid() {
        return Err(Error::BadRequest {
            message: "Role must be either retailer or distributor".to_string(),
        });
    }

    let metadata = UserMetadata {
        role: Some(request.role.as_str().to_string()),
        business_name: request.business_name,
        ..Default::default()
    };
    let user = state.identity.invite_user(request.email.trim(), &metadata).await?;
    tracing::info!(invited_by = %current_user.user.id, user_id = %user.id, "User invited");

    Ok(RegisterResponse {
        auth_response: AuthResponse {
            role: user.role(),
            user,
            message: "Invite sent".to_string(),
        },
    })
}

/// Finish a login flow and route the user to their role home
#[utoipa::path(
    get,
    path = "/auth/callback",
    tag = "authentication",
    params(CallbackQuery),
    responses(
        (status = 303, description = "Role home on success; login page or error page with an `error` flag otherwise"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>, headers: HeaderMap) -> RedirectWithCookies {
    let policy = state.config.cookie_policy();
    let params = CallbackParams {
        code: query.code,
        code_verifier: cookie_value(&headers, &format!("{}-code-verifier", policy.name)),
        access_token: query.access_token,
        refresh_token: query.refresh_token,
        cookie_session: policy.read_session(&headers),
    };

    let outcome = RoleRouter::new(state.identity.as_ref(), &state.config).run(&params).await;

    RedirectWithCookies {
        location: outcome.location.to_string(),
        cookies: outcome.set_cookies,
    }
}

/// Get the current session
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    responses(
        (status = 200, description = "Current user and role", body = SessionResponse),
        (status = 307, description = "No session, redirect to the login page"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_session(current_user: AuthenticatedUser) -> Json<SessionResponse> {
    Json(SessionResponse {
        home: current_user.role.home_path().to_string(),
        expires_at: current_user.session.expires_at,
        role: current_user.role,
        user: current_user.user,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        auth::cookies::{MARKER_COOKIE_NAME, StoredSession},
        config::Environment,
        identity::IdentityService,
        test_utils::{MemoryIdentity, create_test_config, create_test_server, session_cookie_header},
    };
    use axum::http::{StatusCode, header};
    use serde_json::json;
    use std::sync::Arc;

    fn register_body(email: &str, role: &str) -> serde_json::Value {
        json!({
            "email": email,
            "password": "hunter22",
            "role": role,
            "first_name": "Ada",
            "last_name": "Lovelace",
            "business_name": "Corner Shop"
        })
    }

    fn set_cookies(response: &axum_test::TestResponse) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_register_success() {
        let identity = Arc::new(MemoryIdentity::new());
        let server = create_test_server(identity.clone(), create_test_config());

        let response = server
            .post("/authentication/register")
            .json(&register_body("shop@example.com", "retailer"))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["user"]["email"], "shop@example.com");
        assert_eq!(body["role"], "retailer");
        assert_eq!(identity.rows("retailers").len(), 1);
        // Registration does not sign in
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_register_partial_failure_hides_details() {
        let identity = Arc::new(MemoryIdentity::new());
        identity.fail_table("distributors");
        let server = create_test_server(identity.clone(), create_test_config());

        let response = server
            .post("/authentication/register")
            .json(&register_body("dist@example.com", "distributor"))
            .await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.text().contains("distributors"));
        assert!(identity.user_exists("dist@example.com"));
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_role() {
        let identity = Arc::new(MemoryIdentity::new());
        let server = create_test_server(identity.clone(), create_test_config());

        let response = server
            .post("/authentication/register")
            .json(&register_body("shop@example.com", "admin"))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(!identity.user_exists("shop@example.com"));
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let identity = Arc::new(MemoryIdentity::new());
        identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let server = create_test_server(identity, create_test_config());

        let response = server
            .post("/authentication/login")
            .json(&json!({ "email": "shop@example.com", "password": "hunter22" }))
            .await;

        response.assert_status_ok();
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("kitions-auth-token="));
        assert!(cookies[0].contains("HttpOnly"));

        let body: serde_json::Value = response.json();
        assert_eq!(body["role"], "retailer");
    }

    #[tokio::test]
    async fn test_login_invalid_credentials() {
        let identity = Arc::new(MemoryIdentity::new());
        identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let server = create_test_server(identity, create_test_config());

        let response = server
            .post("/authentication/login")
            .json(&json!({ "email": "shop@example.com", "password": "nope" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_logout_revokes_and_redirects() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity.clone(), config.clone());

        let response = server
            .post("/authentication/logout")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .await;

        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3000/login");
        assert!(set_cookies(&response).iter().any(|c| c.starts_with("kitions-auth-token=;") && c.contains("Max-Age=0")));

        assert!(identity.get_user(&session.access_token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_without_session() {
        let identity = Arc::new(MemoryIdentity::new());
        let server = create_test_server(identity, create_test_config());

        let response = server.post("/authentication/logout").await;
        response.assert_status(StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn test_invite_requires_service_key_and_session() {
        let identity = Arc::new(MemoryIdentity::new());
        let mut config = create_test_config();
        let user = identity.create_user("dist@example.com", "hunter22", Some("distributor"));
        let session = identity.issue_session(user.id);
        let body = json!({ "email": "new@example.com", "role": "retailer" });

        let server = create_test_server(identity.clone(), config.clone());
        let response = server
            .post("/authentication/invite")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .json(&body)
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        config.identity.service_key = Some("service".to_string());
        let server = create_test_server(identity.clone(), config.clone());

        server
            .post("/authentication/invite")
            .json(&body)
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/authentication/invite")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .json(&body)
            .await;
        response.assert_status(StatusCode::CREATED);
        assert!(identity.user_exists("new@example.com"));
    }

    #[tokio::test]
    async fn test_callback_sets_cookies_and_navigates() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let code = identity.create_code(user.id);
        let server = create_test_server(identity, config);

        let response = server.get(&format!("/auth/callback?code={code}")).await;

        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3001/retailer/home");
        let cookies = set_cookies(&response);
        assert!(cookies.iter().any(|c| c.starts_with("kitions-auth-token=") && !c.contains("Max-Age=0")));
        assert!(cookies.iter().any(|c| c.starts_with(&format!("{MARKER_COOKIE_NAME}=true"))));
    }

    /// Session cookies written by a response, decoded. Removal cookies are skipped.
    fn written_sessions(response: &axum_test::TestResponse) -> Vec<StoredSession> {
        set_cookies(response)
            .iter()
            .filter(|c| !c.contains("Max-Age=0"))
            .filter_map(|c| c.strip_prefix("kitions-auth-token="))
            .filter_map(|c| c.split(';').next())
            .filter_map(StoredSession::decode)
            .collect()
    }

    #[tokio::test]
    async fn test_callback_code_login_replaces_another_users_stale_cookie() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let previous = identity.create_user("a@example.com", "hunter22", Some("retailer"));
        let stale = identity.issue_expired_session(previous.id);
        let user = identity.create_user("b@example.com", "hunter22", Some("distributor"));
        let code = identity.create_code(user.id);
        let server = create_test_server(identity.clone(), config.clone());

        let response = server
            .get(&format!("/auth/callback?code={code}"))
            .add_header(header::COOKIE, session_cookie_header(&config, &stale))
            .await;

        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3001/distributor/home");

        let sessions = written_sessions(&response);
        assert_eq!(sessions.len(), 1);
        let owner = identity.get_user(&sessions[0].access_token).await.unwrap();
        assert_eq!(owner.email, "b@example.com");
        // Only the verification refresh ran; the stale cookie was left alone
        assert_eq!(identity.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_callback_with_stale_cookie_routes_home() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let stale = identity.issue_expired_session(user.id);
        let server = create_test_server(identity.clone(), config.clone());

        let response = server
            .get("/auth/callback")
            .add_header(header::COOKIE, session_cookie_header(&config, &stale))
            .await;

        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3001/retailer/home");
        assert!(!set_cookies(&response).iter().any(|c| c.contains("Max-Age=0")));

        let sessions = written_sessions(&response);
        assert_eq!(sessions.len(), 1);
        let owner = identity.get_user(&sessions[0].access_token).await.unwrap();
        assert_eq!(owner.id, user.id);
        assert!(identity.refresh_session(&sessions[0].refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_callback_ignores_url_tokens_in_production() {
        let identity = Arc::new(MemoryIdentity::new());
        let mut config = create_test_config();
        config.environment = Environment::Production;
        let user = identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity, config);

        let response = server
            .get(&format!(
                "/auth/callback?access_token={}&refresh_token={}",
                session.access_token, session.refresh_token
            ))
            .await;

        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://www.kitions.com/login?error=no_session"
        );
    }

    #[tokio::test]
    async fn test_session_endpoint() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("dist@example.com", "hunter22", Some("distributor"));
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity, config.clone());

        let response = server
            .get("/api/session")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["role"], "distributor");
        assert_eq!(body["home"], "/distributor/home");
    }
}
