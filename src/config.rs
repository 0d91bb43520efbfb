use std::env;

/// Runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `VELLUM_BIND`, e.g. `0.0.0.0:3000`.
    pub bind_addr: String,
    /// `DATABASE_URL`; a `sqlite:` URL selects the SQLite store, unset
    /// selects the in-memory store.
    pub database_url: Option<String>,
    /// `VELLUM_EXPIRATION_SECONDS`: idle seconds before documents expire.
    /// 0 keeps the 24h default, -1 disables expiry.
    pub expiration_seconds: i64,
    /// `VELLUM_JWT_KEY`: enables self-describing signed tokens.
    pub jwt_key: Option<String>,
    /// `VELLUM_JWT_KEY_BASE64`: the key above is base64-encoded.
    pub jwt_key_is_base64: bool,
    /// `VELLUM_SECRET_USER` / `VELLUM_SECRET_PASSWORD`: basic-auth identity
    /// for the management API and outgoing webhooks.
    pub secret_user: String,
    pub secret_password: String,
    /// `VELLUM_WEBHOOK_URL`: receives idle-session events when set.
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_url: None,
            expiration_seconds: 0,
            jwt_key: None,
            jwt_key_is_base64: false,
            secret_user: String::new(),
            secret_password: String::new(),
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: var("VELLUM_BIND").unwrap_or(defaults.bind_addr),
            database_url: var("DATABASE_URL"),
            expiration_seconds: var("VELLUM_EXPIRATION_SECONDS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            jwt_key: var("VELLUM_JWT_KEY"),
            jwt_key_is_base64: var("VELLUM_JWT_KEY_BASE64")
                .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            secret_user: var("VELLUM_SECRET_USER").unwrap_or_default(),
            secret_password: var("VELLUM_SECRET_PASSWORD").unwrap_or_default(),
            webhook_url: var("VELLUM_WEBHOOK_URL"),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}
