//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `KITIONS_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `KITIONS_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `KITIONS_IDENTITY__ANON_KEY=...` sets the `identity.anon_key` field.
//!
//! ## Environment Profiles
//!
//! `environment` selects the defaults for everything that differs between local development and
//! the deployed platform:
//!
//! | | development | production |
//! |---|---|---|
//! | login URL | `http://localhost:3000/login` | `https://www.kitions.com/login` |
//! | dashboard URL | `http://localhost:3001` | `https://app.kitions.com` |
//! | cookie domain | host-only | `.kitions.com` |
//! | cookie `Secure` | no | yes |
//! | URL tokens on callback | honoured | ignored |
//!
//! Any of these can still be overridden explicitly.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! KITIONS_ENVIRONMENT=production
//! KITIONS_IDENTITY__URL=https://abcd.supabase.co
//! KITIONS_IDENTITY__ANON_KEY=eyJhbGciOi...
//! KITIONS_CALLBACK__SETTLE_DELAY=750ms
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use url::Url;

use crate::auth::cookies::{CookiePolicy, SameSite};
use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "KITIONS_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Deployment profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Deployment profile, drives URL and cookie defaults
    pub environment: Environment,
    /// Absolute URL of the marketing site's login page. Every unauthenticated redirect lands here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<Url>,
    /// Base URL of the dashboard application; role homes are resolved against it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<Url>,
    /// Hosted identity service connection
    pub identity: IdentityConfig,
    /// Session cookie overrides
    pub cookies: CookieConfig,
    /// Session lifetime handling
    pub session: SessionConfig,
    /// Auth callback behaviour
    pub callback: CallbackConfig,
    /// Route guard behaviour
    pub guard: GuardConfig,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
}

/// Identity service (GoTrue-compatible auth + PostgREST tables) configuration.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Project base URL, e.g. `https://abcd.supabase.co`
    pub url: Url,
    /// Public (anon) API key sent as `apikey` on every request
    pub anon_key: String,
    /// Service role key, only needed for admin invites
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_key: Option<String>,
    /// When set, access tokens are verified locally (HS256) before touching the network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("url", &self.url.as_str())
            .field("anon_key", &self.anon_key)
            .field("service_key", &self.service_key.as_ref().map(|_| "<redacted>"))
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Session cookie configuration. Unset fields come from the environment profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CookieConfig {
    /// Cookie name for the session bundle
    pub name: String,
    /// Parent domain the cookie is shared across (production default: `.kitions.com`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub path: String,
    /// Cookie lifetime
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Set Secure flag on cookies (HTTPS only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    /// SameSite cookie attribute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<SameSite>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How often an active [`AuthProvider`](crate::auth::provider::AuthProvider) re-fetches its session
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Access tokens expiring within this window are treated as expired and refreshed
    #[serde(with = "humantime_serde")]
    pub expiry_leeway: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallbackConfig {
    /// Pause between writing the session cookies and redirecting to the role home.
    ///
    /// Cross-subdomain cookie writes were observed to occasionally land after the next
    /// navigation started; 500ms covered every case seen in practice.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

/// Whether the guard protects routes or only maintains the session cookie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Dashboard: redirect unauthenticated requests to the login URL
    #[default]
    Dashboard,
    /// Marketing site: refresh cookies, never redirect
    Public,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub mode: GuardMode,
    /// Extra path prefixes that never require a session
    pub public_paths: Vec<String>,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Allow credentials (cookies) in CORS requests
    pub allow_credentials: bool,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// Allowed CORS origin.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://www.kitions.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            environment: Environment::default(),
            login_url: None,
            dashboard_url: None,
            identity: IdentityConfig::default(),
            cookies: CookieConfig::default(),
            session: SessionConfig::default(),
            callback: CallbackConfig::default(),
            guard: GuardConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://localhost:54321").expect("static URL"),
            anon_key: String::new(),
            service_key: None,
            jwt_secret: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "kitions-auth-token".to_string(),
            domain: None,
            path: "/".to_string(),
            max_age: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            secure: None,
            same_site: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10 * 60),
            expiry_leeway: Duration::from_secs(60),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::default(),
            public_paths: vec![],
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Url(Url::parse("http://localhost:3000").expect("static URL"))],
            allow_credentials: true,
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("KITIONS_").split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.identity.anon_key.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: identity.anon_key is required. \
                     Set KITIONS_IDENTITY__ANON_KEY or add identity.anon_key to the config file."
                    .to_string(),
            });
        }

        if self.cookies.name.is_empty() || self.cookies.name.contains([';', '=', ' ', ',']) {
            return Err(Error::Internal {
                operation: format!("Config validation: invalid cookie name '{}'", self.cookies.name),
            });
        }

        if self.session.refresh_interval < Duration::from_secs(1) {
            return Err(Error::Internal {
                operation: "Config validation: session.refresh_interval must be at least 1s".to_string(),
            });
        }

        if self.callback.settle_delay > Duration::from_secs(10) {
            return Err(Error::Internal {
                operation: "Config validation: callback.settle_delay is too long (maximum 10s)".to_string(),
            });
        }

        // SameSite=None is rejected by browsers unless Secure is also set
        let policy = self.cookie_policy();
        if policy.same_site == SameSite::None && !policy.secure {
            return Err(Error::Internal {
                operation: "Config validation: cookies.same_site=none requires secure cookies".to_string(),
            });
        }

        if self.environment == Environment::Production && !policy.secure {
            return Err(Error::Internal {
                operation: "Config validation: production cookies must be secure".to_string(),
            });
        }

        let has_wildcard = self.cors.allowed_origins.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard));
        if has_wildcard && self.cors.allow_credentials {
            return Err(Error::Internal {
                operation: "Config validation: CORS cannot use wildcard origin '*' with allow_credentials=true. Specify explicit origins."
                    .to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn login_url(&self) -> Url {
        self.login_url.clone().unwrap_or_else(|| {
            let default = match self.environment {
                Environment::Development => "http://localhost:3000/login",
                Environment::Production => "https://www.kitions.com/login",
            };
            Url::parse(default).expect("static URL")
        })
    }

    pub fn dashboard_url(&self) -> Url {
        self.dashboard_url.clone().unwrap_or_else(|| {
            let default = match self.environment {
                Environment::Development => "http://localhost:3001",
                Environment::Production => "https://app.kitions.com",
            };
            Url::parse(default).expect("static URL")
        })
    }

    /// The active cookie policy: profile defaults with explicit overrides applied.
    pub fn cookie_policy(&self) -> CookiePolicy {
        let base = match self.environment {
            Environment::Development => CookiePolicy::development(&self.cookies.name),
            Environment::Production => CookiePolicy::production(&self.cookies.name, self.cookies.domain.as_deref().unwrap_or(".kitions.com")),
        };

        CookiePolicy {
            domain: self.cookies.domain.clone().or(base.domain),
            path: self.cookies.path.clone(),
            max_age: self.cookies.max_age,
            secure: self.cookies.secure.unwrap_or(base.secure),
            same_site: self.cookies.same_site.unwrap_or(base.same_site),
            ..base
        }
    }

    /// URL tokens on the callback are a development convenience only
    pub fn allows_url_tokens(&self) -> bool {
        self.environment == Environment::Development
    }
}
