//! GoTrue/PostgREST client.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{RequestBuilder, Response, header};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    IdentityService, ProfileStore, jwt,
    models::{AuthEvent, Session, User, UserMetadata},
};
use crate::{
    config::IdentityConfig,
    errors::{Error, Result},
};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Token endpoint payload. `expires_at` is only sent by newer servers, so fall back to
/// `expires_in`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<User>,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| self.expires_in.map(|secs| now + Duration::seconds(secs)))
            .or_else(|| jwt::unverified_expiry(&self.access_token))
            .unwrap_or(now);

        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: self.user,
        }
    }
}

/// Sign-up answers with a session when email confirmation is off, otherwise just the user
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(User),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.error_description.or(self.msg).or(self.message).or(self.error)
    }
}

pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
    service_key: Option<String>,
    jwt_secret: Option<String>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpIdentityClient {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        // Already installed is fine; main installs it first
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let http = reqwest::Client::builder().timeout(config.timeout).build().map_err(|e| Error::Internal {
            operation: format!("build identity HTTP client: {e}"),
        })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            base_url: config.url.clone(),
            anon_key: config.anon_key.clone(),
            service_key: config.service_key.clone(),
            jwt_secret: config.jwt_secret.clone(),
            events,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::Internal {
            operation: format!("build identity URL for {path}: {e}"),
        })
    }

    fn token_endpoint(&self, grant_type: &str) -> Result<Url> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).header("apikey", &self.anon_key)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(ErrorBody::into_message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
        Err(Error::Identity {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = Self::check(response).await?;
        response.json::<T>().await.map_err(|e| Error::Identity {
            status: 502,
            message: format!("unexpected identity response: {e}"),
        })
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session> {
        let response = self
            .request(reqwest::Method::POST, self.token_endpoint(grant_type)?)
            .json(&body)
            .send()
            .await?;
        let token: TokenResponse = Self::json(response).await?;
        Ok(token.into_session(Utc::now()))
    }

    fn publish(&self, event: AuthEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    #[instrument(skip(self, password, metadata))]
    async fn sign_up(&self, email: &str, password: &str, metadata: &UserMetadata) -> Result<User> {
        let response = self
            .request(reqwest::Method::POST, self.endpoint("auth/v1/signup")?)
            .json(&json!({ "email": email, "password": password, "data": metadata }))
            .send()
            .await?;

        match Self::json::<SignUpResponse>(response).await? {
            SignUpResponse::User(user) => Ok(user),
            SignUpResponse::Session(token) => {
                let session = token.into_session(Utc::now());
                let user = session.user.clone().ok_or_else(|| Error::Identity {
                    status: 502,
                    message: "sign-up session without user".to_string(),
                })?;
                self.publish(AuthEvent::SignedIn(session));
                Ok(user)
            }
        }
    }

    #[instrument(skip(self, password))]
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        debug!(user_id = ?session.user_id(), "Signed in");
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, self.endpoint("auth/v1/logout")?)
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::check(response).await?;
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    #[instrument(skip_all)]
    async fn get_user(&self, access_token: &str) -> Result<User> {
        if let Some(secret) = &self.jwt_secret {
            return jwt::verify_access_token(access_token, secret).map(User::from);
        }

        let response = self
            .request(reqwest::Method::GET, self.endpoint("auth/v1/user")?)
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::json(response).await
    }

    #[instrument(skip_all)]
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        let session = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        self.publish(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn exchange_code_for_session(&self, auth_code: &str, code_verifier: Option<&str>) -> Result<Session> {
        let session = self
            .token_grant("pkce", json!({ "auth_code": auth_code, "code_verifier": code_verifier }))
            .await?;
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session> {
        let now = Utc::now();
        let fresh = jwt::unverified_expiry(access_token).filter(|exp| *exp > now);

        let Some(expires_at) = fresh else {
            return self.refresh_session(refresh_token).await;
        };

        let user = self.get_user(access_token).await?;
        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            token_type: "bearer".to_string(),
            expires_at,
            user: Some(user),
        };
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    #[instrument(skip(self, metadata))]
    async fn invite_user(&self, email: &str, metadata: &UserMetadata) -> Result<User> {
        let service_key = self.service_key.as_deref().ok_or_else(|| Error::Internal {
            operation: "invite user: identity.service_key is not configured".to_string(),
        })?;

        let response = self
            .http
            .post(self.endpoint("auth/v1/invite")?)
            .header("apikey", service_key)
            .bearer_auth(service_key)
            .json(&json!({ "email": email, "data": metadata }))
            .send()
            .await?;
        Self::json(response).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ProfileStore for HttpIdentityClient {
    #[instrument(skip(self, access_token, row))]
    async fn insert_row(&self, access_token: Option<&str>, table: &str, row: serde_json::Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, self.endpoint(&format!("rest/v1/{table}"))?)
            .bearer_auth(access_token.unwrap_or(&self.anon_key))
            .header(header::CONTENT_TYPE, "application/json")
            .header("Prefer", "return=minimal")
            .body(row.to_string())
            .send()
            .await
            .map_err(|e| Error::Storage {
                table: table.to_string(),
                message: e.to_string(),
            })?;

        Self::check(response).await.map(|_| ()).map_err(|e| {
            warn!(table, "Profile row insert rejected: {e}");
            Error::Storage {
                table: table.to_string(),
                message: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpIdentityClient {
        HttpIdentityClient::new(&IdentityConfig {
            url: Url::parse(&server.uri()).unwrap(),
            anon_key: "anon-key".to_string(),
            service_key: Some("service-key".to_string()),
            jwt_secret: None,
            timeout: StdDuration::from_secs(5),
        })
        .unwrap()
    }

    fn user_json(id: Uuid, role: &str) -> serde_json::Value {
        json!({ "id": id, "email": "shop@example.com", "user_metadata": { "role": role } })
    }

    fn token_json(id: Uuid) -> serde_json::Value {
        json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1_900_000_000,
            "user": user_json(id, "retailer")
        })
    }

    #[tokio::test]
    async fn test_sign_in_with_password() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_partial_json(json!({ "email": "shop@example.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(id)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let mut events = client.subscribe();
        let session = client.sign_in_with_password("shop@example.com", "hunter22").await.unwrap();

        assert_eq!(session.access_token, "access-1");
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);
        assert_eq!(session.user_id(), Some(id));
        assert!(matches!(events.try_recv().unwrap(), AuthEvent::SignedIn(_)));
    }

    #[tokio::test]
    async fn test_sign_in_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" })),
            )
            .mount(&server)
            .await;

        let err = client(&server).sign_in_with_password("shop@example.com", "wrong").await.unwrap_err();
        match err {
            Error::Identity { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid login credentials");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sign_up_without_session_returns_user() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .and(body_partial_json(json!({ "data": { "role": "distributor" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json(id, "distributor")))
            .mount(&server)
            .await;

        let metadata = UserMetadata {
            role: Some("distributor".to_string()),
            ..Default::default()
        };
        let user = client(&server).sign_up("shop@example.com", "hunter22", &metadata).await.unwrap();
        assert_eq!(user.id, id);
    }

    #[tokio::test]
    async fn test_get_user_uses_bearer_token() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json(id, "retailer")))
            .mount(&server)
            .await;

        let user = client(&server).get_user("access-1").await.unwrap();
        assert_eq!(user.id, id);
    }

    #[tokio::test]
    async fn test_refresh_publishes_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_partial_json(json!({ "refresh_token": "refresh-0" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(Uuid::new_v4())))
            .mount(&server)
            .await;

        let client = client(&server);
        let mut events = client.subscribe();
        client.refresh_session("refresh-0").await.unwrap();
        assert!(matches!(events.try_recv().unwrap(), AuthEvent::TokenRefreshed(_)));
    }

    #[tokio::test]
    async fn test_set_session_refreshes_opaque_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(Uuid::new_v4())))
            .expect(1)
            .mount(&server)
            .await;

        let session = client(&server).set_session("not-a-jwt", "refresh-0").await.unwrap();
        assert_eq!(session.access_token, "access-1");
    }

    #[tokio::test]
    async fn test_sign_out_publishes_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let mut events = client.subscribe();
        client.sign_out("access-1").await.unwrap();
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedOut);
    }

    #[tokio::test]
    async fn test_invite_uses_service_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/invite"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json(Uuid::new_v4(), "retailer")))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .invite_user("new@example.com", &UserMetadata::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_row_failure_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/retailers"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "duplicate key value" })))
            .mount(&server)
            .await;

        let err = client(&server)
            .insert_row(Some("access-1"), "retailers", json!({ "id": Uuid::new_v4() }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage { ref table, .. } if table == "retailers"));
    }
}
