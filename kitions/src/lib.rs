//! # kitions: session gateway for the Kitions dashboard
//!
//! `kitions` sits in front of the Kitions dashboard and owns everything between "the browser has
//! some credential" and "the user is looking at the right home screen". Retailers and
//! distributors sign in on the marketing site; the gateway turns that into a cookie session that
//! every Kitions subdomain shares, keeps it fresh, and routes each user to the home of their role.
//!
//! ## Request Flow
//!
//! Every request passes through [`auth::middleware::session_guard`] before routing:
//!
//! 1. The session cookie is decoded and validated against the hosted identity service, refreshing
//!    the token pair if the access token is about to expire. A refreshed session is written back
//!    as a new cookie on whatever response goes out.
//! 2. Requests for protected paths without a valid session are redirected to the external login
//!    page. Failures never let a request through.
//! 3. Requests carrying a token pair in the query string are passed through untouched, since a
//!    session is being established client-side.
//!
//! Logins finish at `/auth/callback`, where [`auth::callback::RoleRouter`] runs a small state
//! machine: obtain a session, fetch the user, resolve the role, force a refresh as verification,
//! then set the session and "just authenticated" marker cookies and hard-navigate to the role home.
//!
//! ## Core Components
//!
//! - [`identity`]: the boundary to the hosted identity service and its profile tables
//! - [`auth`]: cookie policy, the route guard, the callback state machine, sign-up and a
//!   long-lived [`auth::provider::AuthProvider`] for clients that hold a session in memory
//! - [`api`]: HTTP handlers and bodies
//! - [`config`]: YAML + environment configuration with development/production profiles
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use kitions::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = kitions::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     kitions::telemetry::init_telemetry()?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod identity;
mod openapi;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::{
    Json, Router,
    http::{self, HeaderValue, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;

pub use config::Config;

use crate::{
    api::handlers::{auth as auth_handlers, pages},
    auth::middleware::session_guard,
    config::CorsOrigin,
    identity::{IdentityService, ProfileStore, http::HttpIdentityClient},
    openapi::ApiDoc,
};

/// Shared state handed to every handler and to the session guard.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .identity(client.clone())
///     .profiles(client)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub identity: Arc<dyn IdentityService>,
    pub profiles: Arc<dyn ProfileStore>,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_credentials(config.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router.
///
/// The session guard wraps every route and the fallback, so unknown paths are guarded like any
/// other protected path. CORS and tracing sit outside the guard.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let cors_layer = create_cors_layer(&state.config)?;

    let router = Router::new()
        // Accounts
        .route("/authentication/register", post(auth_handlers::register))
        .route("/authentication/login", post(auth_handlers::login))
        .route("/authentication/logout", post(auth_handlers::logout))
        .route("/authentication/invite", post(auth_handlers::invite))
        // Login finalization
        .route("/auth/callback", get(auth_handlers::callback))
        // Session
        .route("/api/session", get(auth_handlers::get_session))
        // Pages
        .route("/retailer/home", get(pages::retailer_home))
        .route("/distributor/home", get(pages::distributor_home))
        .route("/error-auth", get(pages::error_auth))
        .route("/healthz", get(pages::healthz))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(from_fn_with_state(state.clone(), session_guard))
        .with_state(state);

    let router = router.layer(cors_layer).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create an application backed by the hosted identity service
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting session gateway with configuration: {:#?}", config);

        let client = Arc::new(HttpIdentityClient::new(&config.identity)?);
        let state = AppState::builder()
            .config(config)
            .identity(client.clone())
            .profiles(client)
            .build();

        Self::from_state(state)
    }

    /// Create an application from prebuilt state (custom identity backends, tests)
    pub fn from_state(state: AppState) -> anyhow::Result<Self> {
        let config = state.config.clone();
        let router = build_router(state)?;
        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(any(test, feature = "test-utils"))]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            environment = ?self.config.environment,
            login_url = %self.config.login_url(),
            "Session gateway listening on http://{}",
            bind_addr
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Session gateway stopped");
        Ok(())
    }
}
