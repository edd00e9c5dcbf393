//! API server configuration, loaded once at startup.

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Bearer token for the `/admin` surface.
    pub admin_api_token: String,
    /// Optional shared secret for the inbound messaging webhook.
    pub messaging_webhook_secret: Option<String>,
    /// Per-source request budget per minute on the webhook endpoints.
    pub webhook_rate_limit: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .map_err(|_| anyhow::anyhow!("ADMIN_API_TOKEN must be set"))?;
        if admin_api_token.len() < 16 {
            anyhow::bail!("ADMIN_API_TOKEN must be at least 16 characters");
        }

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            admin_api_token,
            messaging_webhook_secret: std::env::var("MESSAGING_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.is_empty()),
            webhook_rate_limit: std::env::var("WEBHOOK_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        })
    }
}
