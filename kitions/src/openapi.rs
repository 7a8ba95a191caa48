//! OpenAPI document for the gateway's own routes, served at `/api-docs/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api::{
    handlers,
    models::{
        auth::{AuthResponse, InviteRequest, LoginRequest, RegisterRequest, SessionResponse},
        pages::{ErrorAuthPage, RoleHomeResponse},
    },
};
use crate::identity::models::{SignUpProfile, User, UserMetadata};

/// Session cookie security scheme. The cookie name is the default; deployments may rename it.
struct SessionCookieAddon;

impl Modify for SessionCookieAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "SessionCookie".to_string(),
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                    "kitions-auth-token",
                    "Session cookie set by login or the auth callback",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::logout,
        handlers::auth::invite,
        handlers::auth::callback,
        handlers::auth::get_session,
        handlers::pages::retailer_home,
        handlers::pages::distributor_home,
        handlers::pages::error_auth,
        handlers::pages::healthz,
    ),
    components(schemas(
        RegisterRequest,
        LoginRequest,
        InviteRequest,
        AuthResponse,
        SessionResponse,
        RoleHomeResponse,
        ErrorAuthPage,
        SignUpProfile,
        User,
        UserMetadata,
    )),
    modifiers(&SessionCookieAddon),
    tags(
        (name = "authentication", description = "Sign-up, sign-in, sign-out and login finalization"),
        (name = "session", description = "The current session"),
        (name = "pages", description = "Role homes and the authentication error page"),
        (name = "health", description = "Liveness"),
    ),
    info(
        title = "Kitions session gateway",
        description = "Cookie sessions, route guarding and role routing for the Kitions dashboard",
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in ["/authentication/register", "/auth/callback", "/api/session", "/error-auth"] {
            assert!(doc.paths.paths.contains_key(path), "{path}");
        }
        let components = doc.components.unwrap();
        assert!(components.security_schemes.contains_key("SessionCookie"));
    }
}
