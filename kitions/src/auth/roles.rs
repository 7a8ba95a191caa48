//! User roles and the role-to-home-route mapping.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Path every unroutable role is sent to.
pub const ERROR_AUTH_PATH: &str = "/error-auth";

/// Business role of a Kitions account.
///
/// The role is stored as a free-form string in the identity service's user
/// metadata. Anything other than the two known values lands in `Unknown`, which
/// keeps the raw value around for logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Retailer,
    Distributor,
    Unknown(Option<String>),
}

impl Role {
    pub fn from_metadata(role: Option<&str>) -> Self {
        match role {
            Some("retailer") => Role::Retailer,
            Some("distributor") => Role::Distributor,
            other => Role::Unknown(other.map(str::to_string)),
        }
    }

    /// Home route for this role. Unknown roles map to [`ERROR_AUTH_PATH`].
    pub fn home_path(&self) -> &'static str {
        match self {
            Role::Retailer => "/retailer/home",
            Role::Distributor => "/distributor/home",
            Role::Unknown(_) => ERROR_AUTH_PATH,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Role::Unknown(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Retailer => "retailer",
            Role::Distributor => "distributor",
            Role::Unknown(Some(raw)) => raw,
            Role::Unknown(None) => "",
        }
    }

    /// Table holding the role-specific profile row, if the role has one
    pub fn profile_table(&self) -> Option<&'static str> {
        match self {
            Role::Retailer => Some("retailers"),
            Role::Distributor => Some("distributors"),
            Role::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unknown(None) => write!(f, "<none>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Role::Unknown(None) => serializer.serialize_none(),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Role::from_metadata(raw.as_deref()))
    }
}
