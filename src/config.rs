use anyhow::{anyhow, bail, Result};

const DEFAULT_SUBSCRIPTION_DAYS: i64 = 30;

/// Runtime configuration, read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: String,
    pub jwt_secret: String,
    /// Where unauthenticated browsers are sent.
    pub auth_redirect_path: String,
    /// Link shown on the entitlement-required notice.
    pub purchase_url: String,
    pub internal_auth_file: String,
    pub subscription_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let jwt_secret =
            dotenvy::var("JWT_SECRET").map_err(|_| anyhow!("JWT_SECRET must be set"))?;

        let subscription_days = match dotenvy::var("SUBSCRIPTION_DAYS") {
            Ok(raw) => raw
                .parse::<i64>()
                .map_err(|e| anyhow!("invalid SUBSCRIPTION_DAYS {raw:?}: {e}"))?,
            Err(_) => DEFAULT_SUBSCRIPTION_DAYS,
        };
        if subscription_days <= 0 || subscription_days.checked_mul(24 * 60 * 60).is_none() {
            bail!("SUBSCRIPTION_DAYS out of range: {subscription_days}");
        }

        Ok(Self {
            bind_addr: dotenvy::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            db_path: dotenvy::var("DB_PATH").unwrap_or_else(|_| "gatedb".to_string()),
            jwt_secret,
            auth_redirect_path: dotenvy::var("AUTH_REDIRECT_PATH")
                .unwrap_or_else(|_| "/login".to_string()),
            purchase_url: dotenvy::var("PURCHASE_URL").unwrap_or_else(|_| "/pricing".to_string()),
            internal_auth_file: dotenvy::var("INTERNAL_AUTH_FILE")
                .unwrap_or_else(|_| "internal_admin_auth.json".to_string()),
            subscription_days,
        })
    }

    /// Configuration with fixed values, for tests and embedding.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: "gatedb".to_string(),
            jwt_secret: jwt_secret.into(),
            auth_redirect_path: "/login".to_string(),
            purchase_url: "/pricing".to_string(),
            internal_auth_file: "internal_admin_auth.json".to_string(),
            subscription_days: DEFAULT_SUBSCRIPTION_DAYS,
        }
    }

    pub fn subscription_secs(&self) -> i64 {
        self.subscription_days.saturating_mul(24 * 60 * 60)
    }
}
