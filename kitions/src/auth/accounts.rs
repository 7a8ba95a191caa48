//! Account creation.
//!
//! An account is an identity record plus three dependent rows: the base profile, a verification
//! status row and the role-specific profile. The identity service and the tables are separate
//! systems, so creation is not atomic. A failure after the identity record exists is reported as
//! [`Error::SignUpPartialFailure`] and the identity record is kept for reconciliation.

use serde_json::{Value, json};
use tracing::{error, info, instrument};

use crate::{
    errors::{Error, Result},
    identity::{
        IdentityService, ProfileStore,
        models::{SignUpProfile, User},
    },
};

pub const PROFILES_TABLE: &str = "profiles";
pub const VERIFICATION_TABLE: &str = "verification_status";
pub const MIN_PASSWORD_LENGTH: usize = 6;

fn validate(email: &str, password: &str, profile: &SignUpProfile) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(Error::BadRequest {
            message: "A valid email address is required".to_string(),
        });
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::BadRequest {
            message: format!("Password must be at least {MIN_PASSWORD_LENGTH} characters"),
        });
    }
    if !profile.role.is_valid() {
        return Err(Error::BadRequest {
            message: "Role must be either retailer or distributor".to_string(),
        });
    }
    if profile.business_name.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "Business name is required".to_string(),
        });
    }
    Ok(())
}

/// The dependent rows for a freshly created user, as `(table, row)` pairs in insert order
fn dependent_rows(user: &User, profile: &SignUpProfile) -> Vec<(&'static str, Value)> {
    let mut rows = vec![
        (
            PROFILES_TABLE,
            json!({
                "id": user.id,
                "email": user.email,
                "role": profile.role,
                "first_name": profile.first_name,
                "last_name": profile.last_name,
                "business_name": profile.business_name,
                "phone": profile.phone,
            }),
        ),
        (
            VERIFICATION_TABLE,
            json!({
                "user_id": user.id,
                "status": "pending",
            }),
        ),
    ];

    if let Some(table) = profile.role.profile_table() {
        let mut row = profile.role_fields.clone();
        row.insert("user_id".to_string(), json!(user.id));
        row.entry("business_name").or_insert_with(|| json!(profile.business_name));
        rows.push((table, Value::Object(row)));
    }

    rows
}

/// Create an identity record, then its dependent rows.
///
/// Every dependent row is attempted even if an earlier one fails, so the failure report names
/// every missing table.
#[instrument(skip(identity, profiles, password, profile), fields(role = %profile.role), err)]
pub async fn sign_up(
    identity: &dyn IdentityService,
    profiles: &dyn ProfileStore,
    email: &str,
    password: &str,
    profile: &SignUpProfile,
) -> Result<User> {
    validate(email, password, profile)?;

    let user = identity.sign_up(email.trim(), password, &profile.metadata()).await?;

    let mut failed_tables = Vec::new();
    for (table, row) in dependent_rows(&user, profile) {
        if let Err(e) = profiles.insert_row(None, table, row).await {
            error!(user_id = %user.id, table, "Failed to create profile row: {e}");
            failed_tables.push(table.to_string());
        }
    }

    if !failed_tables.is_empty() {
        return Err(Error::SignUpPartialFailure {
            user_id: user.id,
            failed_tables,
        });
    }

    info!(user_id = %user.id, "Account created");
    Ok(user)
}
