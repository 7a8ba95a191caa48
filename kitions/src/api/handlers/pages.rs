use axum::{
    Extension, Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};

use crate::{
    AppState,
    api::models::pages::{ErrorAuthPage, ErrorAuthQuery, RoleHomeResponse},
    auth::{
        callback::{CallbackFailure, role_home_url},
        current_user::{AuthenticatedUser, PostAuthNavigation},
        roles::Role,
    },
};

/// Serve a role home to users of that role; everyone else is sent to their own home
fn role_home(state: &AppState, expected: Role, current_user: AuthenticatedUser, navigation: Option<Extension<PostAuthNavigation>>) -> Response {
    if current_user.role != expected {
        tracing::debug!(user_id = %current_user.user.id, role = %current_user.role, %expected, "Role home mismatch, redirecting");
        return Redirect::temporary(role_home_url(&state.config, &current_user.role).as_str()).into_response();
    }

    Json(RoleHomeResponse {
        role: current_user.role,
        user: current_user.user,
        just_authenticated: navigation.is_some(),
    })
    .into_response()
}

/// Retailer home
#[utoipa::path(
    get,
    path = "/retailer/home",
    tag = "pages",
    responses(
        (status = 200, description = "Retailer home", body = RoleHomeResponse),
        (status = 307, description = "Not signed in, or signed in with another role"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn retailer_home(
    State(state): State<AppState>,
    current_user: AuthenticatedUser,
    navigation: Option<Extension<PostAuthNavigation>>,
) -> Response {
    role_home(&state, Role::Retailer, current_user, navigation)
}

/// Distributor home
#[utoipa::path(
    get,
    path = "/distributor/home",
    tag = "pages",
    responses(
        (status = 200, description = "Distributor home", body = RoleHomeResponse),
        (status = 307, description = "Not signed in, or signed in with another role"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn distributor_home(
    State(state): State<AppState>,
    current_user: AuthenticatedUser,
    navigation: Option<Extension<PostAuthNavigation>>,
) -> Response {
    role_home(&state, Role::Distributor, current_user, navigation)
}

/// Explain an authentication failure
#[utoipa::path(
    get,
    path = "/error-auth",
    tag = "pages",
    params(ErrorAuthQuery),
    responses(
        (status = 200, description = "Explanation of likely causes", body = ErrorAuthPage),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn error_auth(State(state): State<AppState>, Query(query): Query<ErrorAuthQuery>) -> Json<ErrorAuthPage> {
    let failure = match query.error.as_deref() {
        Some("no_session") => Some(CallbackFailure::NoSession),
        Some("user_fetch_error") => Some(CallbackFailure::UserFetchError),
        Some("invalid_role") => Some(CallbackFailure::InvalidRole),
        _ => None,
    };

    let (message, mut causes) = match failure {
        Some(CallbackFailure::InvalidRole) => (
            "Your account is not set up as a retailer or distributor yet.",
            vec!["Your account has no role assigned".to_string()],
        ),
        Some(CallbackFailure::NoSession) => (
            "We could not find an active session for you.",
            vec!["Your session expired or the sign-in link was already used".to_string()],
        ),
        Some(CallbackFailure::UserFetchError) => (
            "We could not load your account details.",
            vec!["Your account could not be loaded right now".to_string()],
        ),
        None => ("Something went wrong while signing you in.", vec![]),
    };

    for general in [
        "Your account has no role assigned",
        "Your session expired",
        "Your account setup was not completed",
    ] {
        if !causes.iter().any(|c| c.starts_with(general)) {
            causes.push(general.to_string());
        }
    }

    Json(ErrorAuthPage {
        title: "We couldn't sign you in".to_string(),
        message: message.to_string(),
        causes,
        login_url: state.config.login_url().to_string(),
    })
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    responses(
        (status = 200, description = "Service is up", body = String),
    )
)]
pub async fn healthz() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{MemoryIdentity, create_test_config, create_test_server, session_cookie_header};
    use axum::http::{StatusCode, header};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_role_home_for_matching_role() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("dist@example.com", "hunter22", Some("distributor"));
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity, config.clone());

        let response = server
            .get("/distributor/home")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["role"], "distributor");
        assert_eq!(body["just_authenticated"], false);
    }

    #[tokio::test]
    async fn test_role_home_mismatch_redirects_to_own_home() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("shop@example.com", "hunter22", Some("retailer"));
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity, config.clone());

        let response = server
            .get("/distributor/home")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .await;

        response.assert_status(StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3001/retailer/home");
    }

    #[tokio::test]
    async fn test_role_home_without_role_redirects_to_error_page() {
        let identity = Arc::new(MemoryIdentity::new());
        let config = create_test_config();
        let user = identity.create_user("shop@example.com", "hunter22", None);
        let session = identity.issue_session(user.id);
        let server = create_test_server(identity, config.clone());

        let response = server
            .get("/retailer/home")
            .add_header(header::COOKIE, session_cookie_header(&config, &session))
            .await;

        response.assert_status(StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "http://localhost:3001/error-auth");
    }

    #[tokio::test]
    async fn test_error_page_never_leaks_raw_errors() {
        let identity = Arc::new(MemoryIdentity::new());
        let server = create_test_server(identity, create_test_config());

        let response = server.get("/error-auth?error=invalid_role").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["login_url"], "http://localhost:3000/login");
        let causes = body["causes"].as_array().unwrap();
        assert_eq!(causes.len(), 3);
        assert!(causes[0].as_str().unwrap().contains("no role"));

        let response = server.get("/error-auth?error=%3Cscript%3Ealert(1)%3C%2Fscript%3E").await;
        response.assert_status_ok();
        assert!(!response.text().contains("script"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let identity = Arc::new(MemoryIdentity::new());
        let server = create_test_server(identity, create_test_config());
        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }
}
