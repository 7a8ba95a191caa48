//! Session and user records exchanged with the identity service.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::roles::Role;

pub type UserId = Uuid;

/// Credential bundle issued by the identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Whether the access token is expired, or will be within `leeway`
    pub fn is_expired(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        self.expires_at <= now + leeway
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user.as_ref().map(|u| u.id)
    }
}

/// Profile fields mirrored into the identity record's metadata at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct User {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl User {
    pub fn role(&self) -> Role {
        Role::from_metadata(self.user_metadata.role.as_deref())
    }
}

/// Everything needed to create an account and its dependent profile rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SignUpProfile {
    #[schema(value_type = String, example = "retailer")]
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub business_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Role-specific columns, written verbatim to the role's table
    #[serde(default)]
    #[schema(value_type = Object)]
    pub role_fields: serde_json::Map<String, serde_json::Value>,
}

impl SignUpProfile {
    pub fn metadata(&self) -> UserMetadata {
        UserMetadata {
            role: Some(self.role.as_str().to_string()),
            first_name: Some(self.first_name.clone()),
            last_name: Some(self.last_name.clone()),
            business_name: Some(self.business_name.clone()),
            phone: self.phone.clone(),
        }
    }
}

/// Session change notification published by an identity client.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthEvent {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => Some(session),
            AuthEvent::SignedOut => None,
        }
    }
}
