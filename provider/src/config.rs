use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub bind_addr: String,
    /// Base url devices reach the provider at; signed urls are checked against it.
    pub public_url: String,
    pub code: String,
    pub name: String,
    pub support_email: String,
    pub logo_url: Option<String>,
    pub authorization_ttl_secs: i64,
    pub log_level: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl ProviderConfig {
    pub fn from_env() -> Result<ProviderConfig> {
        let bind_addr = var_or("PROVIDER_BIND_ADDR", "127.0.0.1:3000");
        let public_url = env::var("PROVIDER_PUBLIC_URL").unwrap_or_else(|_| format!("http://{}", bind_addr));
        let authorization_ttl_secs = var_or("PROVIDER_AUTHORIZATION_TTL_SECS", "300")
            .parse()
            .context("PROVIDER_AUTHORIZATION_TTL_SECS must be a number of seconds")?;

        Ok(ProviderConfig {
            bind_addr,
            public_url: public_url.trim_end_matches('/').to_string(),
            code: var_or("PROVIDER_CODE", "demobank"),
            name: var_or("PROVIDER_NAME", "Demo Bank"),
            support_email: var_or("PROVIDER_SUPPORT_EMAIL", "support@demobank.test"),
            logo_url: env::var("PROVIDER_LOGO_URL").ok(),
            authorization_ttl_secs,
            log_level: var_or("PROVIDER_LOG_LEVEL", "info"),
        })
    }

    pub fn for_public_url(public_url: &str) -> ProviderConfig {
        ProviderConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            code: "demobank".to_string(),
            name: "Demo Bank".to_string(),
            support_email: "support@demobank.test".to_string(),
            logo_url: None,
            authorization_ttl_secs: 300,
            log_level: "info".to_string(),
        }
    }
}
