//! Process configuration, loaded once from the environment at startup.

use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub public_bind_addr: String,
    pub internal_bind_addr: String,
    pub auth_jwks_url: String,
    pub auth_issuer: Option<String>,
    pub auth_revocation_url: Option<String>,
    pub production_recipe_source_url: Option<String>,
    pub classifier_cache_ttl: Duration,
    pub balance_cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        load_env();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./inventory.db".to_string());

        let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());

        let public_bind_addr = std::env::var("PUBLIC_BIND_ADDR")
            .unwrap_or_else(|_| format!("0.0.0.0:{port}"));

        let internal_bind_addr = std::env::var("INTERNAL_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string());

        let auth_jwks_url = std::env::var("AUTH_JWKS_URL")
            .unwrap_or_else(|_| "http://localhost:4000/.well-known/jwks.json".to_string());

        let auth_issuer = std::env::var("AUTH_ISSUER").ok();
        let auth_revocation_url = std::env::var("AUTH_REVOCATION_URL").ok();
        let production_recipe_source_url = std::env::var("PRODUCTION_RECIPE_SOURCE_URL").ok();

        let classifier_cache_ttl = Duration::from_secs(
            std::env::var("CLASSIFIER_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86_400),
        );

        let balance_cache_ttl = Duration::from_secs(
            std::env::var("BALANCE_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3_600),
        );

        Ok(Self {
            database_path,
            public_bind_addr,
            internal_bind_addr,
            auth_jwks_url,
            auth_issuer,
            auth_revocation_url,
            production_recipe_source_url,
            classifier_cache_ttl,
            balance_cache_ttl,
        })
    }
}

/// Loads a `.env` file from the current directory, falling back to one
/// alongside the crate manifest (useful when running via `cargo test` from
/// a workspace subdirectory).
pub fn load_env() {
    if dotenv::dotenv().is_err() {
        let fallback = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenv::from_path(fallback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_when_env_unset() {
        std::env::remove_var("DATABASE_PATH");
        std::env::remove_var("PORT");
        let cfg = Config::from_env().unwrap();
        assert!(!cfg.database_path.is_empty());
        assert!(cfg.public_bind_addr.contains(':'));
        assert_eq!(cfg.classifier_cache_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.balance_cache_ttl, Duration::from_secs(3_600));
    }
}
